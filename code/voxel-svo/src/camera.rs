//! Pinhole camera and its per-frame uniform buffers.

use crate::config::CameraConfig;
use crate::gpu::elem::impl_gpu_element;
use glam::{Vec3, Vec4};
use std::sync::Arc;

/// Camera uniform for GPU, must match `Camera` in `common.wgsl`.
///
/// `side` and `up` are pre-scaled so that the ray through NDC `(u, v)` is
/// `normalize(look + u * side + v * up)`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniform {
    pub position: Vec4,
    pub look: Vec4,
    pub side: Vec4,
    pub up: Vec4,
}

impl_gpu_element!(CameraUniform, "Camera");

impl CameraUniform {
    pub fn ray_dir(&self, u: f32, v: f32) -> Vec3 {
        (self.look.truncate() + self.side.truncate() * u + self.up.truncate() * v).normalize()
    }
}

/// Forward vector for yaw (around +Y, zero looks down +Z) and pitch.
pub fn forward_vector(yaw: f32, pitch: f32) -> Vec3 {
    Vec3::new(pitch.cos() * yaw.sin(), pitch.sin(), pitch.cos() * yaw.cos())
}

pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    /// Vertical field of view (radians).
    pub fov: f32,
    pub aspect: f32,
    pub speed: f32,
    frame_buffers: Vec<Arc<wgpu::Buffer>>,
}

impl Camera {
    pub fn new(config: &CameraConfig, aspect: f32) -> Self {
        Self {
            position: Vec3::from_array(config.position),
            yaw: config.yaw,
            pitch: config.pitch,
            fov: config.fov.to_radians(),
            aspect,
            speed: config.speed,
            frame_buffers: Vec::new(),
        }
    }

    /// Allocate one uniform buffer per frame in flight.
    pub fn create_frame_buffers(&mut self, device: &wgpu::Device, frame_count: u32) {
        self.frame_buffers = (0..frame_count)
            .map(|_| {
                Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("camera_uniform"),
                    size: std::mem::size_of::<CameraUniform>() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }))
            })
            .collect();
    }

    pub fn frame_buffer(&self, frame: usize) -> Option<&Arc<wgpu::Buffer>> {
        self.frame_buffers.get(frame)
    }

    pub fn frame_count(&self) -> usize {
        self.frame_buffers.len()
    }

    pub fn forward(&self) -> Vec3 {
        forward_vector(self.yaw, self.pitch)
    }

    /// Face `target` from the current position.
    pub fn look_at(&mut self, target: Vec3) {
        let dir = (target - self.position).normalize_or_zero();
        if dir == Vec3::ZERO {
            return;
        }
        self.pitch = dir.y.clamp(-1.0, 1.0).asin();
        self.yaw = dir.x.atan2(dir.z);
    }

    /// Move along the camera axes, scaled by `speed`.
    pub fn translate(&mut self, forward: f32, right: f32, up: f32) {
        let f = self.forward();
        let r = f.cross(Vec3::Y).normalize_or(Vec3::X);
        self.position += (f * forward + r * right + Vec3::Y * up) * self.speed;
    }

    /// Rotate around `center` by `angle` radians about +Y, keeping the
    /// distance, then face the center.
    pub fn orbit(&mut self, center: Vec3, angle: f32) {
        let offset = self.position - center;
        let (s, c) = angle.sin_cos();
        let rotated = Vec3::new(offset.x * c + offset.z * s, offset.y, -offset.x * s + offset.z * c);
        self.position = center + rotated;
        self.look_at(center);
    }

    pub fn uniform(&self) -> CameraUniform {
        let look = self.forward();
        let right = look.cross(Vec3::Y).normalize_or(Vec3::X);
        let up = right.cross(look);
        let tan = (self.fov * 0.5).tan();
        CameraUniform {
            position: self.position.extend(1.0),
            look: look.extend(0.0),
            side: (right * tan * self.aspect).extend(0.0),
            up: (up * tan).extend(0.0),
        }
    }

    /// Origin and normalized direction of the ray through NDC `(u, v)`.
    pub fn ray(&self, u: f32, v: f32) -> (Vec3, Vec3) {
        (self.position, self.uniform().ray_dir(u, v))
    }

    pub fn update_frame_uniform_buffer(&self, queue: &wgpu::Queue, frame: usize) {
        if let Some(buffer) = self.frame_buffers.get(frame) {
            queue.write_buffer(buffer, 0, bytemuck::bytes_of(&self.uniform()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Camera {
        Camera::new(&CameraConfig::default(), 1.0)
    }

    #[test]
    fn default_camera_looks_at_scene_center() {
        let cam = camera();
        let (origin, dir) = cam.ray(0.0, 0.0);
        assert!((dir - Vec3::NEG_Z).length() < 1e-5);
        assert_eq!(origin, Vec3::new(0.5, 0.5, 2.5));
    }

    #[test]
    fn side_is_right_handed() {
        let u = camera().uniform();
        // looking down -Z: right is +X, up is +Y
        assert!(u.side.x > 0.0 && u.up.y > 0.0);
        assert!((u.up.truncate().length() - (30f32).to_radians().tan()).abs() < 1e-5);
    }

    #[test]
    fn translate_moves_along_view_axes() {
        let mut cam = camera();
        cam.speed = 0.5;
        cam.translate(1.0, 0.0, 0.0);
        assert!((cam.position - Vec3::new(0.5, 0.5, 2.0)).length() < 1e-5);
        cam.translate(0.0, 2.0, 1.0);
        assert!((cam.position - Vec3::new(1.5, 1.0, 2.0)).length() < 1e-5);
    }

    #[test]
    fn look_at_and_orbit_keep_target_centered() {
        let mut cam = camera();
        cam.position = Vec3::new(3.0, 2.0, 1.0);
        cam.look_at(Vec3::splat(0.5));
        let expected = (Vec3::splat(0.5) - cam.position).normalize();
        assert!((cam.forward() - expected).length() < 1e-5);

        let distance = (cam.position - Vec3::splat(0.5)).length();
        cam.orbit(Vec3::splat(0.5), 1.0);
        assert!(((cam.position - Vec3::splat(0.5)).length() - distance).abs() < 1e-5);
        let expected = (Vec3::splat(0.5) - cam.position).normalize();
        assert!((cam.forward() - expected).length() < 1e-5);
    }
}
