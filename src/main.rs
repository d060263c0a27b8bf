use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod camera;
mod convention;
mod demo;
mod error;
mod math;
mod parser;
mod scheduler;
mod sort;
mod splat;

use camera::Camera;
use math::Vec3;
use scheduler::SortScheduler;
use error::SplatError;
use parser::SourceFormat;
use sort::{depth_key, CountingSort, SortOutcome, SortStrategy, SorterConfig, ViewProjection};
use splat::SplatBuffer;

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

const DEMO_SPLAT_COUNT: usize = 30_000;

#[derive(Debug, Parser)]
#[command(name = "splatsort", version, about = "Gaussian splat loading and back-to-front depth sorting")]
struct Cli {
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print splat count, bounds and the first rows of a scene
    Inspect {
        input: PathBuf,
        #[arg(long, value_enum, help = "Override the format implied by the extension")]
        format: Option<SourceFormat>,
        #[arg(long, value_name = "N", default_value_t = 5)]
        rows: usize,
    },
    /// Convert a .ply, .splat or .splatbuf scene to the canonical .splatbuf layout
    Convert {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, value_enum, help = "Override the format implied by the extension")]
        format: Option<SourceFormat>,
    },
    /// Sort a scene once for a camera orbiting its center
    Sort {
        input: PathBuf,
        #[arg(long, value_enum, default_value_t = SortStrategy::Packed)]
        strategy: SortStrategy,
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true, help = "Orbit angle in degrees")]
        yaw: f32,
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true, help = "Elevation in degrees")]
        pitch: f32,
        #[arg(long, help = "Distance from the scene center (default: 1.5x the bounds diagonal)")]
        distance: Option<f32>,
        #[arg(long, value_name = "N", default_value_t = 10)]
        show: usize,
        #[arg(long, help = "Sort a raw .splat file as 16-float instance transforms")]
        instances: bool,
    },
    /// Drive the background sorter with a simulated orbiting camera
    Orbit {
        /// Scene to load (runs the demo scene if omitted)
        input: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = SortStrategy::Packed)]
        strategy: SortStrategy,
        #[arg(long, value_name = "N", default_value_t = 240)]
        frames: u32,
        #[arg(long, value_name = "F", default_value_t = 60.0)]
        fps: f32,
        #[arg(long, value_name = "T", default_value_t = sort::packed::DEFAULT_SKIP_THRESHOLD)]
        skip_threshold: f32,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Orbit target and a radius that keeps the whole scene in front of the camera.
fn frame_scene(splats: &SplatBuffer) -> (Vec3, f32) {
    let (min, max) = splats.bounds();
    let center = (min + max) * 0.5;
    let radius = ((max - min).length() * 1.5).max(1.0);
    (center, radius)
}

fn load(input: &Path, format: Option<SourceFormat>) -> AppResult<SplatBuffer> {
    let splats = match format {
        Some(format) => parser::load_file_as(input, format)?,
        None => parser::load_file(input)?,
    };
    Ok(splats)
}

fn inspect(input: &Path, format: Option<SourceFormat>, rows: usize) -> AppResult<()> {
    let splats = load(input, format)?;
    let (min, max) = splats.bounds();
    println!("{}: {} splats, {} bytes", input.display(), splats.vertex_count(), splats.byte_len());
    println!("bounds: {:?} .. {:?}", min.to_array(), max.to_array());
    for (i, r) in splats.records().take(rows).enumerate() {
        println!(
            "#{i:<6} center {:>9.4?} scale {:>9.4?} rot {:>7.4?} rgba {:?}",
            r.center.to_array(),
            r.scale.to_array(),
            r.rotation,
            r.color
        );
    }
    Ok(())
}

fn convert(input: &Path, output: &Path, format: Option<SourceFormat>) -> AppResult<()> {
    let splats = load(input, format)?;
    if output.extension().and_then(|e| e.to_str()) != Some(parser::canonical::EXTENSION) {
        warn!(
            output = %output.display(),
            "output does not use the .{} extension and will not be recognised on load",
            parser::canonical::EXTENSION
        );
    }
    parser::canonical::save_file(output, &splats)?;
    Ok(())
}

fn sort_once(
    input: &Path,
    strategy: SortStrategy,
    yaw: f32,
    pitch: f32,
    distance: Option<f32>,
    show: usize,
    instances: bool,
) -> AppResult<()> {
    let splats = parser::load_file(input)?;
    let (center, radius) = frame_scene(&splats);
    let distance = distance.unwrap_or(radius);
    let pitch = pitch.to_radians();
    let mut camera = Camera::new(center, 0.0, 0.0);
    camera::orbit(&mut camera, center, distance * pitch.cos(), yaw.to_radians(), distance * pitch.sin());
    let view = camera.view_projection(16.0 / 9.0);
    if instances {
        return sort_instances(input, &view, show);
    }

    let mut sorter = SorterConfig {
        strategy,
        ..SorterConfig::default()
    }
    .build();
    let started = Instant::now();
    let frame = match sorter.sort(&splats, &view) {
        SortOutcome::Sorted(frame) => frame,
        SortOutcome::Unchanged => return Err("sorter skipped the first view".into()),
    };
    info!(
        sorter = sorter.name(),
        splats = frame.instance_count(),
        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
        "sorted"
    );

    let axis = view.depth_axis();
    let instances = frame.center_covariance();
    println!("camera at {:?}, looking along {:?}", camera.position.to_array(), camera.forward.to_array());
    for (rank, (&i, row)) in frame.order.iter().zip(instances.chunks_exact(9)).take(show).enumerate() {
        println!(
            "{rank:>4}: splat {i:<8} key {:>10.4} cov {:.5?}",
            depth_key(axis, splats.center(i as usize)),
            &row[3..]
        );
    }
    Ok(())
}

fn sort_instances(input: &Path, view: &ViewProjection, show: usize) -> AppResult<()> {
    if SourceFormat::from_path(input)? != SourceFormat::RawSplat {
        return Err(format!("--instances needs a raw .splat file, got '{}'", input.display()).into());
    }
    let bytes = std::fs::read(input).map_err(|e| SplatError::from(e).with_path(input))?;
    let transforms = parser::dot_splat::decode_instance_transforms(&bytes)?;
    let sorted = CountingSort::new().sort_instance_transforms(&transforms, view);
    for (rank, m) in sorted.chunks_exact(16).take(show).enumerate() {
        println!("{rank:>4}: translation {:>9.4?} rgba {:.3?}", &m[12..15], [m[3], m[7], m[11], m[15]]);
    }
    Ok(())
}

fn orbit(
    input: Option<&Path>,
    strategy: SortStrategy,
    frames: u32,
    fps: f32,
    skip_threshold: f32,
) -> AppResult<()> {
    let splats = match input {
        Some(path) => parser::load_file(path)?,
        None => {
            info!(splats = DEMO_SPLAT_COUNT, "no input, generating demo scene");
            demo::generate_demo_buffer(DEMO_SPLAT_COUNT)?
        }
    };
    let (center, radius) = frame_scene(&splats);
    let scheduler = SortScheduler::spawn(SorterConfig {
        strategy,
        skip_threshold,
    })?;
    scheduler.load(splats)?;

    let frame_time = Duration::from_secs_f32(1.0 / fps.max(1.0));
    let mut camera = Camera::new(center, 0.0, 0.0);
    let step = std::f32::consts::TAU / frames.max(1) as f32;
    let mut angle = 0.0_f32;
    let mut received = 0u32;
    let mut reused = 0u32;
    let mut sort_time = Duration::ZERO;
    let started = Instant::now();

    for frame in 0..frames {
        let tick = Instant::now();
        // Pause a quarter of the time so the packed sorter has views to skip.
        if frame % 40 < 30 {
            angle += step;
        }
        camera::orbit(&mut camera, center, radius, angle, radius * 0.25);
        scheduler.request_sort(camera.view_projection(16.0 / 9.0))?;

        match scheduler.poll_frame()? {
            Some(result) => {
                received += 1;
                sort_time += result.elapsed;
            }
            None => reused += 1,
        }
        if let Some(rest) = frame_time.checked_sub(tick.elapsed()) {
            std::thread::sleep(rest);
        }
    }
    if let Some(result) = scheduler.wait_frame(Duration::from_secs(1))? {
        received += 1;
        sort_time += result.elapsed;
    }

    let stats = scheduler.stats()?;
    info!(
        frames,
        received,
        reused,
        requested = stats.requested,
        coalesced = stats.coalesced,
        completed = stats.completed,
        skipped = stats.skipped,
        avg_sort_ms = sort_time.as_secs_f64() * 1000.0 / f64::from(received.max(1)),
        elapsed_s = started.elapsed().as_secs_f64(),
        "orbit finished"
    );
    Ok(())
}

fn main() -> AppResult<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Inspect { input, format, rows } => inspect(&input, format, rows),
        Command::Convert {
            input,
            output,
            format,
        } => convert(&input, &output, format),
        Command::Sort {
            input,
            strategy,
            yaw,
            pitch,
            distance,
            show,
            instances,
        } => sort_once(&input, strategy, yaw, pitch, distance, show, instances),
        Command::Orbit {
            input,
            strategy,
            frames,
            fps,
            skip_threshold,
        } => orbit(input.as_deref(), strategy, frames, fps, skip_threshold),
    }
}
