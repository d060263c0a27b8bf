use std::path::PathBuf;

use thiserror::Error;

/// The source bytes are not in a format the decoders understand.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("PLY header has no end_header line within the first {scanned} bytes")]
    MissingEndHeader { scanned: usize },
    #[error("unsupported file extension '{0}' (expected .ply, .splat or .splatbuf)")]
    UnsupportedExtension(String),
    #[error("unsupported PLY encoding '{0}', only binary_little_endian is supported")]
    UnsupportedEncoding(String),
    #[error("invalid PLY header: {0}")]
    InvalidHeader(String),
    #[error("unsupported PLY property type '{0}'")]
    UnsupportedPropertyType(String),
}

/// The format was recognised but the payload violates a size invariant.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("buffer length {len} is not a multiple of the {stride}-byte row stride")]
    RowStride { len: usize, stride: usize },
    #[error("buffer contains no splats")]
    Empty,
    #[error("vertex block truncated (need {needed} bytes, have {have})")]
    Truncated { needed: usize, have: usize },
}

#[derive(Debug, Error)]
pub enum SplatError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("sort worker unavailable: {0}")]
    Transfer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("could not load '{}': {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: Box<SplatError>,
    },
}

impl SplatError {
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            already @ Self::Load { .. } => already,
            other => Self::Load {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }
}

pub type SplatResult<T> = Result<T, SplatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_names_the_file() {
        let err = SplatError::from(DataError::Empty).with_path("scenes/empty.splat");
        let msg = err.to_string();
        assert!(msg.contains("scenes/empty.splat"), "{msg}");
        assert!(msg.contains("no splats"), "{msg}");
    }

    #[test]
    fn with_path_does_not_nest() {
        let err = SplatError::from(DataError::Empty)
            .with_path("a.ply")
            .with_path("b.ply");
        match err {
            SplatError::Load { path, .. } => assert_eq!(path, PathBuf::from("a.ply")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
