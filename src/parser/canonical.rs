use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use tracing::info;

use crate::error::{SplatError, SplatResult};
use crate::splat::SplatBuffer;

pub const EXTENSION: &str = "splatbuf";

pub fn decode_canonical_bytes(data: Vec<u8>) -> SplatResult<SplatBuffer> {
    SplatBuffer::from_bytes(data)
}

pub fn save_file(path: &Path, buffer: &SplatBuffer) -> SplatResult<()> {
    let file = File::create(path).map_err(|e| SplatError::from(e).with_path(path))?;
    buffer
        .write_to(BufWriter::new(file))
        .map_err(|e| SplatError::from(e).with_path(path))?;
    info!(path = %path.display(), vertices = buffer.vertex_count(), "saved canonical buffer");
    Ok(())
}
