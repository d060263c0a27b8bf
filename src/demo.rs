use rand::Rng;
use std::f32::consts::TAU;

use crate::error::SplatResult;
use crate::math::{clamp_u8, hsv_to_rgb, quat_normalize, Vec3};
use crate::splat::{SplatBuffer, SplatRecord};

// --- Demo splat generators ---

fn random_sphere_point(rng: &mut impl Rng) -> Vec3 {
    let z = rng.random_range(-1.0_f32..1.0_f32);
    let theta = rng.random_range(0.0_f32..TAU);
    let r = (1.0 - z * z).sqrt();
    Vec3::new(r * theta.cos(), z, r * theta.sin())
}

fn random_rotation(rng: &mut impl Rng) -> [f32; 4] {
    quat_normalize([
        rng.random_range(-1.0_f32..1.0),
        rng.random_range(-1.0_f32..1.0),
        rng.random_range(-1.0_f32..1.0),
        rng.random_range(-1.0_f32..1.0),
    ])
}

fn opacity_byte(rng: &mut impl Rng, lo: f32, hi: f32) -> u8 {
    clamp_u8(rng.random_range(lo..hi) * 255.0)
}

fn torus_knot_splats(rng: &mut impl Rng, count: usize) -> Vec<SplatRecord> {
    let p = 2.0;
    let q = 3.0;
    let major = 1.4;
    let minor = 0.38;

    (0..count)
        .map(|i| {
            let t = i as f32 / count.max(1) as f32 * TAU * 2.0;
            let base = Vec3::new(
                (major + minor * (q * t).cos()) * (p * t).cos(),
                minor * (q * t).sin(),
                (major + minor * (q * t).cos()) * (p * t).sin(),
            );
            let jitter = Vec3::new(
                rng.random_range(-0.04_f32..0.04_f32),
                rng.random_range(-0.04_f32..0.04_f32),
                rng.random_range(-0.04_f32..0.04_f32),
            );

            let hue = ((q * t).sin() * 0.5 + 0.5) * 360.0;
            let [r, g, b] = hsv_to_rgb(hue, 0.80, 0.95);
            let scale = rng.random_range(0.018_f32..0.042_f32);
            SplatRecord {
                center: base + jitter,
                scale: Vec3::new(scale, scale * rng.random_range(0.9_f32..1.2), scale),
                rotation: random_rotation(rng),
                color: [r, g, b, opacity_byte(rng, 0.68, 0.95)],
            }
        })
        .collect()
}

fn sphere_cluster_splats(rng: &mut impl Rng, count: usize) -> Vec<SplatRecord> {
    let centers = [
        Vec3::new(1.8, 0.3, 0.4),
        Vec3::new(-1.6, -0.2, 0.8),
        Vec3::new(0.3, 1.2, -1.6),
        Vec3::new(-0.5, -1.0, -1.4),
    ];
    let palette = [
        [255, 120, 80],
        [100, 210, 255],
        [160, 255, 130],
        [255, 220, 90],
    ];

    (0..count)
        .map(|i| {
            let cluster = i % centers.len();
            let dir = random_sphere_point(rng);
            let radius = rng.random::<f32>().cbrt() * rng.random_range(0.5_f32..1.4_f32);
            let base_color: [u8; 3] = palette[cluster];
            let color = base_color.map(|c| clamp_u8(c as f32 + rng.random_range(-25.0_f32..25.0_f32)));
            let scale = rng.random_range(0.02_f32..0.06_f32);
            SplatRecord {
                center: centers[cluster] + dir * radius,
                scale: Vec3::new(scale, scale * rng.random_range(0.8_f32..1.3), scale),
                rotation: random_rotation(rng),
                color: [color[0], color[1], color[2], opacity_byte(rng, 0.60, 0.95)],
            }
        })
        .collect()
}

/// Torus knot plus four sphere clusters, two thirds / one third of `count`.
pub fn generate_demo_records(rng: &mut impl Rng, count: usize) -> Vec<SplatRecord> {
    let knot = count * 2 / 3;
    let mut records = torus_knot_splats(rng, knot);
    records.extend(sphere_cluster_splats(rng, count - knot));
    records
}

pub fn generate_demo_buffer(count: usize) -> SplatResult<SplatBuffer> {
    SplatBuffer::from_records(&generate_demo_records(&mut rand::rng(), count))
}
