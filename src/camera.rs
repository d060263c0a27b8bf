use crate::math::{mat4_mul, Mat4, Vec3};
use crate::sort::ViewProjection;

#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub forward: Vec3,
    pub right: Vec3,
    pub up: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub fov: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn new(position: Vec3, yaw: f32, pitch: f32) -> Self {
        let mut camera = Self {
            position,
            forward: Vec3::new(0.0, 0.0, -1.0),
            right: Vec3::new(1.0, 0.0, 0.0),
            up: Vec3::new(0.0, 1.0, 0.0),
            yaw,
            pitch,
            fov: std::f32::consts::PI / 3.0,
            near: 0.1,
            far: 1000.0,
        };
        camera.update_vectors();
        camera
    }

    pub fn update_vectors(&mut self) {
        let forward = Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize();

        let world_up = Vec3::new(0.0, 1.0, 0.0);
        let mut right = forward.cross(world_up).normalize();
        if right.length_squared() < 1e-6 {
            right = Vec3::new(1.0, 0.0, 0.0);
        }

        self.forward = forward;
        self.right = right;
        self.up = right.cross(forward).normalize();
    }

    /// World-to-view in GL convention: the camera looks down its local -z.
    pub fn view_matrix(&self) -> Mat4 {
        let (r, u, f) = (self.right, self.up, self.forward);
        let p = self.position;
        [
            r.x, u.x, -f.x, 0.0, //
            r.y, u.y, -f.y, 0.0, //
            r.z, u.z, -f.z, 0.0, //
            -r.dot(p), -u.dot(p), f.dot(p), 1.0,
        ]
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        let t = 1.0 / (self.fov * 0.5).tan().max(1e-6);
        let (n, f) = (self.near, self.far);
        let mut m = [0.0; 16];
        m[0] = t / aspect.max(1e-6);
        m[5] = t;
        m[10] = -(f + n) / (f - n);
        m[11] = -1.0;
        m[14] = -(2.0 * f * n) / (f - n);
        m
    }

    pub fn view_projection(&self, aspect: f32) -> ViewProjection {
        ViewProjection(mat4_mul(&self.projection_matrix(aspect), &self.view_matrix()))
    }
}

pub fn look_at_target(camera: &mut Camera, target: Vec3) {
    let to_target = (target - camera.position).normalize();
    if to_target.length_squared() < 1e-8 {
        return;
    }
    camera.yaw = to_target.z.atan2(to_target.x);
    camera.pitch = to_target.y.clamp(-1.0, 1.0).asin();
    camera.update_vectors();
}

/// Places the camera on a horizontal circle around `target` and aims at it.
pub fn orbit(camera: &mut Camera, target: Vec3, radius: f32, angle: f32, height: f32) {
    camera.position = target + Vec3::new(radius * angle.cos(), height, radius * angle.sin());
    look_at_target(camera, target);
}
