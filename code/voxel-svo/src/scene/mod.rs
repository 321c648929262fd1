//! Triangle geometry normalized into the unit cube, plus its device upload.

mod obj;

use crate::error::{Result, SvoError};
use crate::gpu::GpuContext;
use crate::gpu::elem::impl_gpu_element;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::path::Path;
use wgpu::util::DeviceExt;

pub use obj::parse_obj;

/// Albedo used for faces without a material.
pub const DEFAULT_ALBEDO: Vec3 = Vec3::splat(0.8);

/// One triangle with per-vertex normals and a flat albedo.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Triangle {
    pub positions: [Vec3; 3],
    pub normals: [Vec3; 3],
    pub albedo: Vec3,
}

impl Triangle {
    /// Triangle whose vertex normals all equal its face normal.
    pub fn flat(positions: [Vec3; 3], albedo: Vec3) -> Self {
        let n = Self::face_normal_of(&positions);
        Self {
            positions,
            normals: [n; 3],
            albedo,
        }
    }

    fn face_normal_of(p: &[Vec3; 3]) -> Vec3 {
        (p[1] - p[0]).cross(p[2] - p[0]).normalize_or_zero()
    }

    pub fn face_normal(&self) -> Vec3 {
        Self::face_normal_of(&self.positions)
    }
}

/// Axis-aligned bounds.
#[derive(Clone, Copy, Debug)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }
}

/// GPU 端三角形布局，与 voxelize.wgsl 中的 `Triangle` 一致
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct GpuTriangle {
    pub positions: [[f32; 4]; 3],
    pub normals: [[f32; 4]; 3],
    pub albedo: [f32; 4],
}

impl_gpu_element!(GpuTriangle, "Triangle");

impl From<&Triangle> for GpuTriangle {
    fn from(t: &Triangle) -> Self {
        Self {
            positions: t.positions.map(|p| p.extend(1.0).to_array()),
            normals: t.normals.map(|n| n.extend(0.0).to_array()),
            albedo: t.albedo.extend(1.0).to_array(),
        }
    }
}

/// A scene whose geometry fits `[0,1]^3`, the root volume of every octree.
#[derive(Clone, Debug, Default)]
pub struct Scene {
    triangles: Vec<Triangle>,
}

/// Device-resident triangles.
pub struct SceneBuffers {
    pub triangles: wgpu::Buffer,
    pub triangle_count: u32,
}

impl Scene {
    /// Normalize `triangles` so the longest bounding-box edge spans `[0,1]`
    /// and the box is centered in the unit cube.
    pub fn from_triangles(mut triangles: Vec<Triangle>) -> Result<Self> {
        if triangles.is_empty() {
            return Err(SvoError::EmptyScene);
        }
        let mut bounds = Bounds::empty();
        for p in triangles.iter().flat_map(|t| t.positions) {
            bounds.expand(p);
        }
        if !bounds.is_valid() || !bounds.min.is_finite() || !bounds.max.is_finite() {
            return Err(SvoError::EmptyScene);
        }
        let extent = (bounds.max - bounds.min).max_element();
        let scale = if extent > 0.0 { 1.0 / extent } else { 1.0 };
        let center = bounds.center();
        for t in &mut triangles {
            for p in &mut t.positions {
                *p = ((*p - center) * scale + 0.5).clamp(Vec3::ZERO, Vec3::ONE);
            }
        }
        log::debug!(
            "Scene normalized: {} triangles, bounds {:?}..{:?}",
            triangles.len(),
            bounds.min,
            bounds.max
        );
        Ok(Self { triangles })
    }

    /// Load a Wavefront OBJ file (and its `mtllib`, if any).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mesh_err = |reason: String| SvoError::MeshLoad {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| mesh_err(e.to_string()))?;
        let dir = path.parent().unwrap_or(Path::new("."));
        let triangles = parse_obj(&text, |lib| std::fs::read_to_string(dir.join(lib)).ok())
            .map_err(mesh_err)?;
        log::info!("Loaded {} ({} triangles)", path.display(), triangles.len());
        Self::from_triangles(triangles)
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Upload triangles into a read-only storage buffer.
    pub fn upload(&self, ctx: &GpuContext) -> Result<SceneBuffers> {
        let data: Vec<GpuTriangle> = self.triangles.iter().map(GpuTriangle::from).collect();
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        ctx.check_binding_size("scene_triangles", bytes.len() as u64)?;
        let triangles = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("scene_triangles"),
                contents: bytes,
                usage: wgpu::BufferUsages::STORAGE,
            });
        Ok(SceneBuffers {
            triangles,
            triangle_count: data.len() as u32,
        })
    }
}

/// Twelve outward-facing triangles of the axis-aligned cube
/// `[center - half, center + half]`.
pub fn cube_triangles(center: Vec3, half: f32, albedo: Vec3) -> Vec<Triangle> {
    let c = |x: f32, y: f32, z: f32| center + Vec3::new(x, y, z) * half;
    let quads = [
        // -x, +x
        [c(-1., -1., -1.), c(-1., -1., 1.), c(-1., 1., 1.), c(-1., 1., -1.)],
        [c(1., -1., -1.), c(1., 1., -1.), c(1., 1., 1.), c(1., -1., 1.)],
        // -y, +y
        [c(-1., -1., -1.), c(1., -1., -1.), c(1., -1., 1.), c(-1., -1., 1.)],
        [c(-1., 1., -1.), c(-1., 1., 1.), c(1., 1., 1.), c(1., 1., -1.)],
        // -z, +z
        [c(-1., -1., -1.), c(-1., 1., -1.), c(1., 1., -1.), c(1., -1., -1.)],
        [c(-1., -1., 1.), c(1., -1., 1.), c(1., 1., 1.), c(-1., 1., 1.)],
    ];
    quads
        .iter()
        .flat_map(|q| {
            [
                Triangle::flat([q[0], q[1], q[2]], albedo),
                Triangle::flat([q[0], q[2], q[3]], albedo),
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_normals_point_outward() {
        for t in cube_triangles(Vec3::ZERO, 1.0, DEFAULT_ALBEDO) {
            let centroid = (t.positions[0] + t.positions[1] + t.positions[2]) / 3.0;
            assert!(t.face_normal().dot(centroid) > 0.0);
        }
    }

    #[test]
    fn normalization_fills_unit_cube() {
        let scene = Scene::from_triangles(cube_triangles(Vec3::new(3.0, -2.0, 5.0), 4.0, DEFAULT_ALBEDO))
            .unwrap();
        let mut b = Bounds::empty();
        for p in scene.triangles().iter().flat_map(|t| t.positions) {
            b.expand(p);
        }
        assert_eq!(b.min, Vec3::ZERO);
        assert_eq!(b.max, Vec3::ONE);
    }

    #[test]
    fn normalization_centers_flat_extent() {
        let tri = Triangle::flat(
            [Vec3::new(0.0, 0.0, 0.0), Vec3::new(2.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0)],
            DEFAULT_ALBEDO,
        );
        let scene = Scene::from_triangles(vec![tri]).unwrap();
        let p = scene.triangles()[0].positions;
        assert_eq!(p[0], Vec3::new(0.0, 0.25, 0.5));
        assert_eq!(p[1], Vec3::new(1.0, 0.25, 0.5));
        assert_eq!(p[2], Vec3::new(0.0, 0.75, 0.5));
    }

    #[test]
    fn empty_scene_is_rejected() {
        assert!(matches!(Scene::from_triangles(Vec::new()), Err(SvoError::EmptyScene)));
    }
}
