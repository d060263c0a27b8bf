//! Axis and quaternion conventions of every supported source format.
//!
//! Canonical space is right-handed, quaternions are stored as (w, x, y, z).
//! Decoders must go through [`AxisConvention::apply_position`] and
//! [`AxisConvention::apply_rotation`] rather than flipping signs inline.

use crate::math::{quat_normalize, Vec3};

/// Index of a quaternion component in the canonical (w, x, y, z) layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuatComponent {
    W = 0,
    X = 1,
    Y = 2,
    Z = 3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisConvention {
    /// Multiplied into the decoded position, per axis.
    pub position_sign: [f32; 3],
    /// Which canonical component each source slot holds.
    pub quat_order: [QuatComponent; 4],
    /// Multiplied into the canonical (w, x, y, z) quaternion after reordering.
    pub quat_sign: [f32; 4],
}

/// Raw 32-byte `.splat` rows are left-handed: z is negated on import for both
/// the position and the quaternion's z axis. Quaternion bytes are stored w first.
pub const RAW_SPLAT: AxisConvention = AxisConvention {
    position_sign: [1.0, 1.0, -1.0],
    quat_order: [QuatComponent::W, QuatComponent::X, QuatComponent::Y, QuatComponent::Z],
    quat_sign: [1.0, 1.0, 1.0, -1.0],
};

/// PLY exports are already right-handed, `rot_0` is w.
pub const PLY: AxisConvention = AxisConvention {
    position_sign: [1.0, 1.0, 1.0],
    quat_order: [QuatComponent::W, QuatComponent::X, QuatComponent::Y, QuatComponent::Z],
    quat_sign: [1.0, 1.0, 1.0, 1.0],
};

impl AxisConvention {
    pub fn apply_position(&self, p: Vec3) -> Vec3 {
        Vec3::new(
            p.x * self.position_sign[0],
            p.y * self.position_sign[1],
            p.z * self.position_sign[2],
        )
    }

    /// Reorders `source` into (w, x, y, z), applies the sign table and normalizes.
    pub fn apply_rotation(&self, source: [f32; 4]) -> [f32; 4] {
        let mut q = [0.0_f32; 4];
        for (slot, component) in self.quat_order.iter().enumerate() {
            q[*component as usize] = source[slot];
        }
        for (v, sign) in q.iter_mut().zip(self.quat_sign) {
            *v *= sign;
        }
        quat_normalize(q)
    }
}
