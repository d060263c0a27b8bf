use crate::math::Vec3;
use crate::splat::SplatBuffer;

use super::{depth_key, DepthSorter, SortOutcome, SortedFrame, ViewProjection};

/// Added to every key so typical scene depths stay positive.
pub const DEPTH_BIAS: f32 = 10_000.0;
pub const DEFAULT_SKIP_THRESHOLD: f32 = 0.01;

const INDEX_MASK: u64 = 0xFFFF_FFFF;

/// Maps an f32 to a u32 with the same ordering, for all finite values.
pub fn sortable_bits(v: f32) -> u32 {
    let bits = v.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

pub fn pack(key: f32, index: u32) -> u64 {
    (u64::from(sortable_bits(key)) << 32) | u64::from(index)
}

/// Whether two depth axes point the same way, within `threshold` of cos = 1.
pub fn view_unchanged(previous: Vec3, current: Vec3, threshold: f32) -> bool {
    let (a, b) = (previous.normalize(), current.normalize());
    if a == Vec3::ZERO || b == Vec3::ZERO {
        return false;
    }
    (a.dot(b) - 1.0).abs() < threshold
}

/// Sorts one packed `(key << 32) | index` array kept across calls, and skips
/// the work while the view direction stays put.
///
/// The array is reallocated only when the splat count changes. Entries keep
/// their index from the previous order, so a re-sort starts nearly sorted.
#[derive(Debug)]
pub struct IncrementalPackedSort {
    packed: Vec<u64>,
    last_axis: Option<Vec3>,
    skip_threshold: f32,
}

impl Default for IncrementalPackedSort {
    fn default() -> Self {
        Self::with_skip_threshold(DEFAULT_SKIP_THRESHOLD)
    }
}

impl IncrementalPackedSort {
    pub fn with_skip_threshold(skip_threshold: f32) -> Self {
        Self {
            packed: Vec::new(),
            last_axis: None,
            skip_threshold,
        }
    }

    fn reset(&mut self, count: usize) {
        self.packed = (0..count as u64).collect();
        self.last_axis = None;
    }
}

impl DepthSorter for IncrementalPackedSort {
    fn name(&self) -> &'static str {
        "packed"
    }

    fn invalidate(&mut self) {
        self.last_axis = None;
    }

    fn sort(&mut self, splats: &SplatBuffer, view: &ViewProjection) -> SortOutcome {
        let axis = view.depth_axis();
        if self.packed.len() != splats.vertex_count() {
            self.reset(splats.vertex_count());
        } else if let Some(previous) = self.last_axis {
            if view_unchanged(previous, axis, self.skip_threshold) {
                return SortOutcome::Unchanged;
            }
        }

        for entry in self.packed.iter_mut() {
            let index = (*entry & INDEX_MASK) as u32;
            let key = DEPTH_BIAS + depth_key(axis, splats.center(index as usize));
            *entry = pack(key, index);
        }
        self.last_axis = Some(axis);
        self.packed.sort_unstable();

        let order = self.packed.iter().map(|e| (e & INDEX_MASK) as u32).collect();
        SortOutcome::Sorted(SortedFrame::gather(splats, order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::tests::{assert_bijection, buffer_from_centers, seeded_buffer};

    fn sorted(outcome: SortOutcome) -> SortedFrame {
        match outcome {
            SortOutcome::Sorted(frame) => frame,
            SortOutcome::Unchanged => panic!("expected a sort"),
        }
    }

    #[test]
    fn sortable_bits_preserve_float_order() {
        let values = [-1e9_f32, -3.5, -0.0, 0.0, 1e-30, 2.0, 9_999.5, 10_000.0, 1e9];
        for pair in values.windows(2) {
            assert!(sortable_bits(pair[0]) <= sortable_bits(pair[1]), "{pair:?}");
        }
        assert!(pack(1.0, u32::MAX) < pack(1.5, 0));
    }

    #[test]
    fn unchanged_view_is_skipped() {
        let buffer = seeded_buffer(500, 3);
        let view = ViewProjection::from_view_direction(Vec3::new(0.0, 0.0, -1.0));
        let mut sorter = IncrementalPackedSort::default();
        let frame = sorted(sorter.sort(&buffer, &view));
        assert_bijection(&frame.order, 500);
        assert!(matches!(sorter.sort(&buffer, &view), SortOutcome::Unchanged));

        // Scaling the axis is not a change of direction.
        let scaled = ViewProjection::from_view_direction(Vec3::new(0.0, 0.0, -3.0));
        assert!(matches!(sorter.sort(&buffer, &scaled), SortOutcome::Unchanged));
    }

    #[test]
    fn rotation_past_threshold_resorts() {
        let buffer = seeded_buffer(500, 4);
        let mut sorter = IncrementalPackedSort::default();
        let first = sorted(sorter.sort(&buffer, &ViewProjection::from_view_direction(Vec3::new(0.0, 0.0, 1.0))));

        // cos(5 deg) - 1 is about -0.0038: still skipped.
        let small = 5.0_f32.to_radians();
        let nudged = ViewProjection::from_view_direction(Vec3::new(small.sin(), 0.0, small.cos()));
        assert!(matches!(sorter.sort(&buffer, &nudged), SortOutcome::Unchanged));

        let turned = ViewProjection::from_view_direction(Vec3::new(1.0, 0.0, 0.0));
        let second = sorted(sorter.sort(&buffer, &turned));
        assert_bijection(&second.order, 500);
        assert_ne!(first.order, second.order);
        let again = sorted(IncrementalPackedSort::default().sort(&buffer, &turned));
        // Ties under the bias may land in either order, so compare the packed keys.
        let key = |i: u32| {
            sortable_bits(DEPTH_BIAS + depth_key(Vec3::new(1.0, 0.0, 0.0), buffer.center(i as usize)))
        };
        let keys: Vec<u32> = second.order.iter().map(|&i| key(i)).collect();
        let fresh: Vec<u32> = again.order.iter().map(|&i| key(i)).collect();
        assert_eq!(keys, fresh);
    }

    #[test]
    fn count_change_reallocates_and_sorts() {
        let mut sorter = IncrementalPackedSort::default();
        let view = ViewProjection::from_view_direction(Vec3::new(0.0, 1.0, 0.0));
        let small = buffer_from_centers(&[Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 2.0, 0.0)]);
        assert_eq!(sorted(sorter.sort(&small, &view)).order, vec![1, 0]);
        assert_eq!(sorter.packed.len(), 2);

        let large = seeded_buffer(50, 9);
        let frame = sorted(sorter.sort(&large, &view));
        assert_eq!(sorter.packed.len(), 50);
        assert_bijection(&frame.order, 50);
    }

    #[test]
    fn invalidate_keeps_the_allocation_but_forces_a_sort() {
        let view = ViewProjection::from_view_direction(Vec3::new(0.0, 0.0, 1.0));
        let mut sorter = IncrementalPackedSort::default();
        sorted(sorter.sort(&seeded_buffer(30, 1), &view));

        let replacement = seeded_buffer(30, 2);
        assert!(matches!(sorter.sort(&replacement, &view), SortOutcome::Unchanged));
        sorter.invalidate();
        let frame = sorted(sorter.sort(&replacement, &view));
        assert_eq!(sorter.packed.len(), 30);
        assert_bijection(&frame.order, 30);
    }

    #[test]
    fn zero_axis_never_counts_as_unchanged() {
        assert!(!view_unchanged(Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0), 0.01));
        assert!(view_unchanged(Vec3::new(0.0, 0.0, 2.0), Vec3::new(0.0, 0.0, 1.0), 0.01));
    }
}
