//! Back-to-front depth ordering of splats for a given view.
//!
//! Both sorters share one convention. The depth axis of a view is the clip-Z
//! row `(m[2], m[6], m[10])` of its column-major view-projection matrix, which
//! for a GL perspective camera points along the camera's forward direction.
//! The key of a splat is `-dot(axis, center)`; ascending keys are farthest
//! first, the order the over operator needs.

pub mod counting;
pub mod packed;

use crate::math::{Mat4, Vec3, MAT4_IDENTITY};
use crate::splat::{SplatBuffer, CENTER_SIZE_FLOATS, COLOR_SIZE_FLOATS, COVARIANCE_SIZE_FLOATS};

pub use counting::CountingSort;
pub use packed::IncrementalPackedSort;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewProjection(pub Mat4);

impl ViewProjection {
    /// A view whose depth axis is `direction` (the direction the camera looks along).
    pub fn from_view_direction(direction: Vec3) -> Self {
        let mut m = MAT4_IDENTITY;
        m[2] = direction.x;
        m[6] = direction.y;
        m[10] = direction.z;
        m[14] = 0.0;
        Self(m)
    }

    pub fn depth_axis(&self) -> Vec3 {
        Vec3::new(self.0[2], self.0[6], self.0[10])
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

pub fn depth_key(axis: Vec3, center: Vec3) -> f32 {
    -axis.dot(center)
}

/// Per-frame result handed to the render consumer: the permutation plus the
/// centers, covariances and colors gathered into that order.
#[derive(Debug, Clone, PartialEq)]
pub struct SortedFrame {
    pub order: Vec<u32>,
    pub centers: Vec<f32>,
    pub covariances: Vec<f32>,
    pub colors: Vec<f32>,
}

impl SortedFrame {
    pub fn gather(splats: &SplatBuffer, order: Vec<u32>) -> Self {
        let mut centers = Vec::with_capacity(order.len() * CENTER_SIZE_FLOATS);
        for &i in &order {
            centers.extend_from_slice(&splats.center(i as usize).to_array());
        }
        let covariances = gather_rows(splats.covariances(), COVARIANCE_SIZE_FLOATS, &order);
        let colors = gather_rows(splats.colors(), COLOR_SIZE_FLOATS, &order);
        Self {
            order,
            centers,
            covariances,
            colors,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.order.len()
    }

    /// Center followed by the six covariance terms, 9 floats per instance.
    pub fn center_covariance(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.instance_count() * 9);
        for (center, cov) in self
            .centers
            .chunks_exact(CENTER_SIZE_FLOATS)
            .zip(self.covariances.chunks_exact(COVARIANCE_SIZE_FLOATS))
        {
            out.extend_from_slice(center);
            out.extend_from_slice(cov);
        }
        out
    }
}

/// Copies `stride`-float rows of `src` in `order`.
pub fn gather_rows(src: &[f32], stride: usize, order: &[u32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(order.len() * stride);
    for &i in order {
        let start = i as usize * stride;
        out.extend_from_slice(&src[start..start + stride]);
    }
    out
}

#[derive(Debug)]
pub enum SortOutcome {
    Sorted(SortedFrame),
    /// The view did not change enough to warrant a new order.
    Unchanged,
}

pub trait DepthSorter: Send {
    fn name(&self) -> &'static str;
    fn sort(&mut self, splats: &SplatBuffer, view: &ViewProjection) -> SortOutcome;
    /// Forget anything cached about the previous buffer. Must be called
    /// before sorting a different buffer.
    fn invalidate(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SortStrategy {
    /// 16-bit counting sort on every request
    Counting,
    /// Packed 64-bit key sort, skipped while the view direction holds still
    #[default]
    Packed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SorterConfig {
    pub strategy: SortStrategy,
    pub skip_threshold: f32,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            strategy: SortStrategy::default(),
            skip_threshold: packed::DEFAULT_SKIP_THRESHOLD,
        }
    }
}

impl SorterConfig {
    pub fn build(&self) -> Box<dyn DepthSorter> {
        match self.strategy {
            SortStrategy::Counting => Box::new(CountingSort::new()),
            SortStrategy::Packed => Box::new(IncrementalPackedSort::with_skip_threshold(
                self.skip_threshold,
            )),
        }
    }
}
