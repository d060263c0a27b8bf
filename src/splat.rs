use std::io::Write;

use rayon::prelude::*;

use crate::error::{DataError, SplatResult};
use crate::math::{mat3_mul, mat3_transpose, quat_normalize, quat_to_rotation_matrix, Vec3};

pub const ROW_SIZE_BYTES: usize = 44;
pub const SCALE_ROW_OFFSET_BYTES: usize = 12;
pub const COLOR_ROW_OFFSET_BYTES: usize = 24;
pub const ROTATION_ROW_OFFSET_BYTES: usize = 28;
pub const CENTER_SIZE_FLOATS: usize = 3;
pub const COVARIANCE_SIZE_FLOATS: usize = 6;
pub const COLOR_SIZE_FLOATS: usize = 4;

/// One Gaussian in canonical space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatRecord {
    pub center: Vec3,
    pub scale: Vec3,
    /// Unit quaternion, (w, x, y, z).
    pub rotation: [f32; 4],
    pub color: [u8; 4],
}

impl SplatRecord {
    pub fn write_to(&self, row: &mut [u8]) {
        debug_assert_eq!(row.len(), ROW_SIZE_BYTES);
        write_vec3(&mut row[0..12], self.center);
        write_vec3(&mut row[SCALE_ROW_OFFSET_BYTES..COLOR_ROW_OFFSET_BYTES], self.scale);
        row[COLOR_ROW_OFFSET_BYTES..ROTATION_ROW_OFFSET_BYTES].copy_from_slice(&self.color);
        for (k, v) in self.rotation.iter().enumerate() {
            let at = ROTATION_ROW_OFFSET_BYTES + k * 4;
            row[at..at + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn read_from(row: &[u8]) -> Self {
        debug_assert_eq!(row.len(), ROW_SIZE_BYTES);
        let mut color = [0u8; 4];
        color.copy_from_slice(&row[COLOR_ROW_OFFSET_BYTES..ROTATION_ROW_OFFSET_BYTES]);
        Self {
            center: read_vec3(row, 0),
            scale: read_vec3(row, SCALE_ROW_OFFSET_BYTES),
            rotation: [
                read_f32(row, ROTATION_ROW_OFFSET_BYTES),
                read_f32(row, ROTATION_ROW_OFFSET_BYTES + 4),
                read_f32(row, ROTATION_ROW_OFFSET_BYTES + 8),
                read_f32(row, ROTATION_ROW_OFFSET_BYTES + 12),
            ],
            color,
        }
    }
}

pub(crate) fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

pub(crate) fn read_vec3(bytes: &[u8], offset: usize) -> Vec3 {
    Vec3::new(
        read_f32(bytes, offset),
        read_f32(bytes, offset + 4),
        read_f32(bytes, offset + 8),
    )
}

fn write_vec3(out: &mut [u8], v: Vec3) {
    out[0..4].copy_from_slice(&v.x.to_le_bytes());
    out[4..8].copy_from_slice(&v.y.to_le_bytes());
    out[8..12].copy_from_slice(&v.z.to_le_bytes());
}

/// Upper triangle of Σ = (R·S)(R·S)ᵀ as [Σ00, Σ01, Σ02, Σ11, Σ12, Σ22].
pub fn compute_3d_covariance(scale: Vec3, rotation: [f32; 4]) -> [f32; 6] {
    let r = quat_to_rotation_matrix(quat_normalize(rotation));
    let s = [[scale.x, 0.0, 0.0], [0.0, scale.y, 0.0], [0.0, 0.0, scale.z]];
    let m = mat3_mul(r, s);
    let cov = mat3_mul(m, mat3_transpose(m));
    [cov[0][0], cov[0][1], cov[0][2], cov[1][1], cov[1][2], cov[2][2]]
}

/// N splats in the canonical 44-byte row layout plus the covariance and
/// normalized color buffers derived from them.
///
/// The derived buffers are built once by the constructors and never touched
/// again. The type is move-only: handing it to the sort worker gives up access.
#[derive(Debug)]
pub struct SplatBuffer {
    data: Vec<u8>,
    covariances: Vec<f32>,
    colors: Vec<f32>,
}

impl SplatBuffer {
    pub fn from_bytes(data: Vec<u8>) -> SplatResult<Self> {
        if data.len() % ROW_SIZE_BYTES != 0 {
            return Err(DataError::RowStride {
                len: data.len(),
                stride: ROW_SIZE_BYTES,
            }
            .into());
        }
        if data.is_empty() {
            return Err(DataError::Empty.into());
        }
        let (covariances, colors) = build_precomputed_buffers(&data);
        Ok(Self {
            data,
            covariances,
            colors,
        })
    }

    pub fn from_records(records: &[SplatRecord]) -> SplatResult<Self> {
        let mut data = vec![0u8; records.len() * ROW_SIZE_BYTES];
        data.par_chunks_exact_mut(ROW_SIZE_BYTES)
            .zip(records.par_iter())
            .for_each(|(row, record)| record.write_to(row));
        Self::from_bytes(data)
    }

    pub fn vertex_count(&self) -> usize {
        self.data.len() / ROW_SIZE_BYTES
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn record(&self, index: usize) -> SplatRecord {
        SplatRecord::read_from(self.row(index))
    }

    pub fn records(&self) -> impl Iterator<Item = SplatRecord> + '_ {
        (0..self.vertex_count()).map(|i| self.record(i))
    }

    pub fn center(&self, index: usize) -> Vec3 {
        read_vec3(self.row(index), 0)
    }

    pub fn covariances(&self) -> &[f32] {
        &self.covariances
    }

    pub fn colors(&self) -> &[f32] {
        &self.colors
    }

    pub fn bounds(&self) -> (Vec3, Vec3) {
        let init = (
            Vec3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY),
            Vec3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
        );
        (0..self.vertex_count()).fold(init, |(lo, hi), i| {
            let c = self.center(i);
            (lo.min(c), hi.max(c))
        })
    }

    /// Canonical export: the row buffer verbatim.
    pub fn write_to<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(self.as_bytes())?;
        writer.flush()
    }

    fn row(&self, index: usize) -> &[u8] {
        let start = index * ROW_SIZE_BYTES;
        &self.data[start..start + ROW_SIZE_BYTES]
    }
}

fn build_precomputed_buffers(data: &[u8]) -> (Vec<f32>, Vec<f32>) {
    let count = data.len() / ROW_SIZE_BYTES;
    let mut covariances = vec![0.0_f32; count * COVARIANCE_SIZE_FLOATS];
    let mut colors = vec![0.0_f32; count * COLOR_SIZE_FLOATS];

    covariances
        .par_chunks_exact_mut(COVARIANCE_SIZE_FLOATS)
        .zip(colors.par_chunks_exact_mut(COLOR_SIZE_FLOATS))
        .zip(data.par_chunks_exact(ROW_SIZE_BYTES))
        .for_each(|((cov, color), row)| {
            let record = SplatRecord::read_from(row);
            cov.copy_from_slice(&compute_3d_covariance(record.scale, record.rotation));
            for (dst, src) in color.iter_mut().zip(record.color) {
                *dst = f32::from(src) / 255.0;
            }
        });

    (covariances, colors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(center: Vec3, scale: Vec3, rotation: [f32; 4], color: [u8; 4]) -> SplatRecord {
        SplatRecord {
            center,
            scale,
            rotation,
            color,
        }
    }

    #[test]
    fn row_layout_matches_offsets() {
        let r = record(
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(0.5, 0.25, 0.125),
            [1.0, 0.0, 0.0, 0.0],
            [10, 20, 30, 40],
        );
        let mut row = [0u8; ROW_SIZE_BYTES];
        r.write_to(&mut row);
        assert_eq!(read_f32(&row, 8), 3.0);
        assert_eq!(read_f32(&row, 12), 0.5);
        assert_eq!(&row[24..28], &[10, 20, 30, 40]);
        assert_eq!(read_f32(&row, 28), 1.0);
        assert_eq!(SplatRecord::read_from(&row), r);
    }

    #[test]
    fn stride_invariant_holds() {
        let records = vec![
            record(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0), [1.0, 0.0, 0.0, 0.0], [0; 4]);
            7
        ];
        let buffer = SplatBuffer::from_records(&records).unwrap();
        assert_eq!(buffer.byte_len() % ROW_SIZE_BYTES, 0);
        assert_eq!(buffer.vertex_count(), buffer.byte_len() / ROW_SIZE_BYTES);
        assert_eq!(buffer.vertex_count(), 7);
        assert_eq!(buffer.covariances().len(), 7 * COVARIANCE_SIZE_FLOATS);
        assert_eq!(buffer.colors().len(), 7 * COLOR_SIZE_FLOATS);
    }

    #[test]
    fn rejects_partial_rows_and_empty_buffers() {
        let err = SplatBuffer::from_bytes(vec![0u8; 45]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::SplatError::Data(DataError::RowStride { len: 45, stride: 44 })
        ));
        let err = SplatBuffer::from_bytes(Vec::new()).unwrap_err();
        assert!(matches!(err, crate::error::SplatError::Data(DataError::Empty)));
    }

    #[test]
    fn axis_aligned_covariance_is_diagonal_scale_squared() {
        let cov = compute_3d_covariance(Vec3::new(2.0, 3.0, 4.0), [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(cov, [4.0, 0.0, 0.0, 9.0, 0.0, 16.0]);
    }

    #[test]
    fn rotated_covariance_swaps_axes() {
        // 90 degrees about z maps the x extent onto y.
        let h = std::f32::consts::FRAC_1_SQRT_2;
        let cov = compute_3d_covariance(Vec3::new(2.0, 1.0, 1.0), [h, 0.0, 0.0, h]);
        assert!((cov[0] - 1.0).abs() < 1e-5);
        assert!((cov[3] - 4.0).abs() < 1e-5);
        assert!(cov[1].abs() < 1e-5);
        assert!((cov[5] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn derived_colors_are_normalized() {
        let buffer = SplatBuffer::from_records(&[record(
            Vec3::ZERO,
            Vec3::new(1.0, 1.0, 1.0),
            [1.0, 0.0, 0.0, 0.0],
            [255, 0, 51, 255],
        )])
        .unwrap();
        assert_eq!(buffer.colors(), &[1.0, 0.0, 0.2, 1.0]);
    }

    #[test]
    fn canonical_export_is_verbatim() {
        let records: Vec<SplatRecord> = (0..5)
            .map(|i| {
                record(
                    Vec3::new(i as f32, -(i as f32), 0.5),
                    Vec3::new(0.1, 0.2, 0.3),
                    [1.0, 0.0, 0.0, 0.0],
                    [i as u8, 1, 2, 3],
                )
            })
            .collect();
        let buffer = SplatBuffer::from_records(&records).unwrap();
        let mut out = Vec::new();
        buffer.write_to(&mut out).unwrap();
        assert_eq!(out, buffer.as_bytes());
        let reloaded = SplatBuffer::from_bytes(out).unwrap();
        assert_eq!(reloaded.records().collect::<Vec<_>>(), records);
    }
}
