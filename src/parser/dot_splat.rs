use rayon::prelude::*;
use tracing::debug;

use crate::convention::RAW_SPLAT;
use crate::error::{DataError, SplatResult};
use crate::splat::{compute_3d_covariance, read_vec3, SplatBuffer, SplatRecord};

pub const RECORD_SIZE: usize = 32;
pub const INSTANCE_TRANSFORM_FLOATS: usize = 16;

fn decode_quat_byte(b: u8) -> f32 {
    (f32::from(b) - 128.0) / 128.0
}

fn check_rows(data: &[u8]) -> SplatResult<usize> {
    if data.len() % RECORD_SIZE != 0 {
        return Err(DataError::RowStride {
            len: data.len(),
            stride: RECORD_SIZE,
        }
        .into());
    }
    if data.is_empty() {
        return Err(DataError::Empty.into());
    }
    Ok(data.len() / RECORD_SIZE)
}

pub fn decode_record(chunk: &[u8]) -> SplatRecord {
    let rotation = RAW_SPLAT.apply_rotation([
        decode_quat_byte(chunk[28]),
        decode_quat_byte(chunk[29]),
        decode_quat_byte(chunk[30]),
        decode_quat_byte(chunk[31]),
    ]);
    SplatRecord {
        center: RAW_SPLAT.apply_position(read_vec3(chunk, 0)),
        scale: read_vec3(chunk, 12),
        rotation,
        color: [chunk[24], chunk[25], chunk[26], chunk[27]],
    }
}

pub fn decode_splat_bytes(data: &[u8]) -> SplatResult<SplatBuffer> {
    let count = check_rows(data)?;
    let records: Vec<SplatRecord> = data
        .par_chunks_exact(RECORD_SIZE)
        .map(decode_record)
        .collect();
    debug!(count, "decoded raw splat rows");
    SplatBuffer::from_records(&records)
}

/// Column-major 4x4 per splat for instanced-transform consumers: covariance in
/// the upper-left 3x3, center in the translation column and RGBA / 255 in the
/// otherwise unused bottom row.
///
/// The upper 3x3 is the covariance `Σ = (RS)(RS)ᵀ`, not the linear map `R·S`.
pub fn decode_instance_transforms(data: &[u8]) -> SplatResult<Vec<f32>> {
    let count = check_rows(data)?;
    let mut transforms = vec![0.0_f32; count * INSTANCE_TRANSFORM_FLOATS];
    transforms
        .par_chunks_exact_mut(INSTANCE_TRANSFORM_FLOATS)
        .zip(data.par_chunks_exact(RECORD_SIZE))
        .for_each(|(m, chunk)| {
            let record = decode_record(chunk);
            let [c00, c01, c02, c11, c12, c22] =
                compute_3d_covariance(record.scale, record.rotation);
            m[0] = c00;
            m[1] = c01;
            m[2] = c02;
            m[4] = c01;
            m[5] = c11;
            m[6] = c12;
            m[8] = c02;
            m[9] = c12;
            m[10] = c22;
            m[12] = record.center.x;
            m[13] = record.center.y;
            m[14] = record.center.z;
            for (k, c) in record.color.iter().enumerate() {
                m[k * 4 + 3] = f32::from(*c) / 255.0;
            }
        });
    Ok(transforms)
}

#[cfg(test)]
pub(crate) fn encode_record(position: [f32; 3], scale: [f32; 3], rgba: [u8; 4], quat: [u8; 4]) -> [u8; RECORD_SIZE] {
    let mut row = [0u8; RECORD_SIZE];
    for (k, v) in position.iter().chain(scale.iter()).enumerate() {
        row[k * 4..k * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    row[24..28].copy_from_slice(&rgba);
    row[28..32].copy_from_slice(&quat);
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SplatError;
    use crate::math::Vec3;

    #[test]
    fn decodes_axis_convention() {
        // w = 1, z = 0.5 before normalization.
        let row = encode_record([1.0, 2.0, 3.0], [0.1, 0.2, 0.3], [9, 8, 7, 6], [255, 128, 128, 192]);
        let buffer = decode_splat_bytes(&row).unwrap();
        let r = buffer.record(0);
        assert_eq!(r.center, Vec3::new(1.0, 2.0, -3.0));
        assert_eq!(r.scale, Vec3::new(0.1, 0.2, 0.3));
        assert_eq!(r.color, [9, 8, 7, 6]);
        assert!(r.rotation[0] > 0.0);
        assert!(r.rotation[3] < 0.0, "z component must be negated: {:?}", r.rotation);
        assert_eq!(r.rotation[1], 0.0);
    }

    #[test]
    fn every_rotation_has_unit_norm() {
        let mut data = Vec::new();
        for b in [0u8, 17, 90, 128, 200, 255] {
            data.extend_from_slice(&encode_record([0.0; 3], [1.0; 3], [0; 4], [b, 255 - b, b / 2, 77]));
        }
        let buffer = decode_splat_bytes(&data).unwrap();
        for r in buffer.records() {
            let n = r.rotation.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((n - 1.0).abs() < 1e-5, "norm {n}");
        }
    }

    #[test]
    fn all_zero_quaternion_bytes_decode_to_identity() {
        let row = encode_record([0.0; 3], [1.0; 3], [0; 4], [128, 128, 128, 128]);
        let buffer = decode_splat_bytes(&row).unwrap();
        assert_eq!(buffer.record(0).rotation, [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(matches!(
            decode_splat_bytes(&[0u8; 33]),
            Err(SplatError::Data(DataError::RowStride { len: 33, stride: 32 }))
        ));
        assert!(matches!(
            decode_splat_bytes(&[]),
            Err(SplatError::Data(DataError::Empty))
        ));
    }

    #[test]
    fn instance_transform_layout() {
        let row = encode_record([1.0, 2.0, 3.0], [2.0, 3.0, 4.0], [255, 0, 0, 255], [255, 128, 128, 128]);
        let m = decode_instance_transforms(&row).unwrap();
        assert_eq!(m.len(), 16);
        assert_eq!(&m[12..15], &[1.0, 2.0, -3.0]);
        assert_eq!([m[3], m[7], m[11], m[15]], [1.0, 0.0, 0.0, 1.0]);
        assert!((m[0] - 4.0).abs() < 1e-5);
        assert!((m[5] - 9.0).abs() < 1e-5);
        assert!((m[10] - 16.0).abs() < 1e-5);
    }
}
