pub mod canonical;
pub mod dot_splat;
pub mod ply;

use std::fs;
use std::path::Path;
use std::time::Instant;

use tracing::info;

use crate::error::{FormatError, SplatError, SplatResult};
use crate::splat::SplatBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SourceFormat {
    /// 32-byte rows, `.splat`
    RawSplat,
    /// Binary little-endian PLY, `.ply`
    Ply,
    /// 44-byte canonical rows, `.splatbuf`
    Canonical,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> SplatResult<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "splat" => Ok(Self::RawSplat),
            "ply" => Ok(Self::Ply),
            canonical::EXTENSION => Ok(Self::Canonical),
            _ => Err(FormatError::UnsupportedExtension(ext).into()),
        }
    }
}

/// Decodes a complete in-memory payload.
pub fn decode(format: SourceFormat, data: Vec<u8>) -> SplatResult<SplatBuffer> {
    match format {
        SourceFormat::RawSplat => dot_splat::decode_splat_bytes(&data),
        SourceFormat::Ply => ply::decode_ply_bytes(&data),
        SourceFormat::Canonical => canonical::decode_canonical_bytes(data),
    }
}

pub fn load_file(path: &Path) -> SplatResult<SplatBuffer> {
    let format = SourceFormat::from_path(path).map_err(|e| e.with_path(path))?;
    load_file_as(path, format)
}

pub fn load_file_as(path: &Path, format: SourceFormat) -> SplatResult<SplatBuffer> {
    let started = Instant::now();
    let data = fs::read(path).map_err(|e| SplatError::from(e).with_path(path))?;
    let bytes = data.len();
    let buffer = decode(format, data).map_err(|e| e.with_path(path))?;
    info!(
        path = %path.display(),
        ?format,
        bytes,
        vertices = buffer.vertex_count(),
        elapsed = ?started.elapsed(),
        "loaded splats"
    );
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn format_follows_extension() {
        assert_eq!(SourceFormat::from_path(Path::new("a/b.PLY")).unwrap(), SourceFormat::Ply);
        assert_eq!(
            SourceFormat::from_path(Path::new("train.splat")).unwrap(),
            SourceFormat::RawSplat
        );
        assert_eq!(
            SourceFormat::from_path(Path::new("x.splatbuf")).unwrap(),
            SourceFormat::Canonical
        );
        assert!(matches!(
            SourceFormat::from_path(Path::new("scene.obj")),
            Err(SplatError::Format(FormatError::UnsupportedExtension(ext))) if ext == "obj"
        ));
    }

    #[test]
    fn load_errors_identify_the_file() {
        let path = PathBuf::from("definitely/missing/scene.ply");
        let err = load_file(&path).unwrap_err();
        assert!(err.to_string().contains("definitely/missing/scene.ply"), "{err}");

        let err = load_file(Path::new("scene.gltf")).unwrap_err();
        match err {
            SplatError::Load { path, source } => {
                assert_eq!(path, PathBuf::from("scene.gltf"));
                assert!(matches!(*source, SplatError::Format(FormatError::UnsupportedExtension(_))));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_truncated_raw_rows() {
        let err = decode(SourceFormat::RawSplat, vec![0u8; 40]).unwrap_err();
        assert!(err.to_string().contains("32-byte"), "{err}");
    }
}
