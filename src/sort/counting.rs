use crate::math::Vec3;
use crate::parser::dot_splat::INSTANCE_TRANSFORM_FLOATS;
use crate::splat::SplatBuffer;

use super::{depth_key, gather_rows, DepthSorter, SortOutcome, SortedFrame, ViewProjection};

pub const BUCKET_COUNT: usize = 1 << 16;

/// Single-pass 16-bit counting sort, run in full on every call.
#[derive(Debug)]
pub struct CountingSort {
    counts: Vec<u32>,
    buckets: Vec<u16>,
}

impl Default for CountingSort {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingSort {
    pub fn new() -> Self {
        Self {
            counts: vec![0; BUCKET_COUNT],
            buckets: Vec::new(),
        }
    }

    /// Permutation of `0..keys.len()` ordering `keys` ascending at 16-bit resolution.
    /// Equal buckets keep their input order.
    ///
    /// The bucket range spans the finite keys only. `-inf` lands in the first
    /// bucket, `+inf` and NaN in the last, so NaN sorts last as it does in the
    /// packed sorter.
    pub fn order_by_keys(&mut self, keys: &[f32]) -> Vec<u32> {
        let n = keys.len();
        if n < 2 {
            return (0..n as u32).collect();
        }
        let (min, max) = keys
            .iter()
            .filter(|k| k.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &k| {
                (lo.min(f64::from(k)), hi.max(f64::from(k)))
            });
        let range = max - min;
        let last = (BUCKET_COUNT - 1) as f64;
        let depth_inv = if range > 0.0 { last / range } else { 0.0 };

        self.counts.fill(0);
        self.buckets.clear();
        self.buckets.reserve(n);
        for &k in keys {
            let bucket = if k.is_finite() {
                ((f64::from(k) - min) * depth_inv).clamp(0.0, last) as u16
            } else if k == f32::NEG_INFINITY {
                0
            } else {
                (BUCKET_COUNT - 1) as u16
            };
            self.buckets.push(bucket);
            self.counts[bucket as usize] += 1;
        }

        // Exclusive prefix sum turns counts into start offsets.
        let mut start = 0u32;
        for count in self.counts.iter_mut() {
            let c = *count;
            *count = start;
            start += c;
        }

        let mut order = vec![0u32; n];
        for (i, &bucket) in self.buckets.iter().enumerate() {
            let slot = &mut self.counts[bucket as usize];
            order[*slot as usize] = i as u32;
            *slot += 1;
        }
        order
    }

    pub fn order_by_depth(&mut self, splats: &SplatBuffer, axis: Vec3) -> Vec<u32> {
        let keys: Vec<f32> = (0..splats.vertex_count())
            .map(|i| depth_key(axis, splats.center(i)))
            .collect();
        self.order_by_keys(&keys)
    }

    /// Reorders 16-float instance transforms (translation in elements 12..14)
    /// back-to-front for `view`.
    pub fn sort_instance_transforms(&mut self, transforms: &[f32], view: &ViewProjection) -> Vec<f32> {
        let axis = view.depth_axis();
        let keys: Vec<f32> = transforms
            .chunks_exact(INSTANCE_TRANSFORM_FLOATS)
            .map(|m| depth_key(axis, Vec3::new(m[12], m[13], m[14])))
            .collect();
        let order = self.order_by_keys(&keys);
        gather_rows(transforms, INSTANCE_TRANSFORM_FLOATS, &order)
    }
}

impl DepthSorter for CountingSort {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn sort(&mut self, splats: &SplatBuffer, view: &ViewProjection) -> SortOutcome {
        let order = self.order_by_depth(splats, view.depth_axis());
        SortOutcome::Sorted(SortedFrame::gather(splats, order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::dot_splat::{decode_instance_transforms, encode_record};
    use crate::sort::tests::{assert_bijection, buffer_from_centers, seeded_buffer};
    use crate::sort::IncrementalPackedSort;

    #[test]
    fn equal_depths_keep_identity_order() {
        let mut sorter = CountingSort::new();
        assert_eq!(sorter.order_by_keys(&[3.0; 5]), vec![0, 1, 2, 3, 4]);
        assert_eq!(sorter.order_by_keys(&[]), Vec::<u32>::new());
        assert_eq!(sorter.order_by_keys(&[1.0]), vec![0]);
    }

    #[test]
    fn orders_by_quantized_key() {
        let mut sorter = CountingSort::new();
        let order = sorter.order_by_keys(&[0.5, -2.0, 7.0, 0.5, 3.0]);
        assert_eq!(order, vec![1, 0, 3, 4, 2]);
    }

    #[test]
    fn infinite_depths_sort_to_the_ends() {
        let mut centers: Vec<Vec3> = (0..5).map(|z| Vec3::new(0.0, 0.0, z as f32)).collect();
        centers.push(Vec3::new(0.0, 0.0, f32::INFINITY));
        let buffer = buffer_from_centers(&centers);
        let view = ViewProjection::from_view_direction(Vec3::new(0.0, 0.0, 1.0));
        let order = CountingSort::new().order_by_depth(&buffer, view.depth_axis());
        assert_eq!(order, vec![5, 4, 3, 2, 1, 0]);

        let packed = match IncrementalPackedSort::default().sort(&buffer, &view) {
            SortOutcome::Sorted(frame) => frame.order,
            SortOutcome::Unchanged => unreachable!(),
        };
        assert_eq!(order, packed);
    }

    #[test]
    fn extreme_finite_depths_do_not_overflow_the_range() {
        let centers = [-3e38_f32, 0.0, 3e38].map(|z| Vec3::new(0.0, 0.0, z));
        let buffer = buffer_from_centers(&centers);
        let order = CountingSort::new().order_by_depth(&buffer, Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn nan_keys_sort_last() {
        let mut sorter = CountingSort::new();
        assert_eq!(sorter.order_by_keys(&[1.0, f32::NAN, 0.0]), vec![2, 0, 1]);
        assert_eq!(sorter.order_by_keys(&[f32::NAN, f32::NEG_INFINITY]), vec![1, 0]);
        assert_eq!(sorter.order_by_keys(&[2.0, f32::INFINITY, 2.0]), vec![0, 2, 1]);
    }

    #[test]
    fn repeated_sorts_with_same_view_are_identical() {
        let buffer = seeded_buffer(2_000, 11);
        let view = ViewProjection::from_view_direction(Vec3::new(0.2, 0.9, -0.4).normalize());
        let mut sorter = CountingSort::new();
        let first = match sorter.sort(&buffer, &view) {
            SortOutcome::Sorted(frame) => frame,
            SortOutcome::Unchanged => unreachable!(),
        };
        let second = match sorter.sort(&buffer, &view) {
            SortOutcome::Sorted(frame) => frame,
            SortOutcome::Unchanged => panic!("counting sort never skips"),
        };
        assert_bijection(&first.order, 2_000);
        assert_eq!(first, second);
    }

    #[test]
    fn instance_transforms_sort_back_to_front() {
        let mut raw = Vec::new();
        for z in [2.0_f32, -5.0, 0.0, -1.0] {
            // The raw format stores z negated.
            raw.extend_from_slice(&encode_record([0.0, 0.0, -z], [1.0; 3], [z as u8, 0, 0, 255], [255, 128, 128, 128]));
        }
        let transforms = decode_instance_transforms(&raw).unwrap();
        let view = ViewProjection::from_view_direction(Vec3::new(0.0, 0.0, -1.0));
        let sorted = CountingSort::new().sort_instance_transforms(&transforms, &view);
        let zs: Vec<f32> = sorted.chunks_exact(16).map(|m| m[14]).collect();
        // Looking down -z, the most negative z is farthest.
        assert_eq!(zs, vec![-5.0, -1.0, 0.0, 2.0]);
    }
}
