//! Triangle → voxel fragment list.
//!
//! One fragment per (triangle, covered leaf cell). The list is unordered and
//! may hold duplicates where triangles share a cell.

pub mod raster;

use crate::config::BuildConfig;
use crate::error::{Result, SvoError};
use crate::gpu::elem::impl_gpu_element;
use crate::gpu::{self, GpuContext, GpuElement};
use crate::scene::{Scene, SceneBuffers, Triangle};
use crate::{check_level, morton, pack};
use bytemuck::{Pod, Zeroable};
use glam::{IVec3, UVec3, Vec3};
use rayon::prelude::*;
use wgpu::ShaderStages;
use wgpu::util::DeviceExt;

/// 体素片元：叶子坐标 (Morton) + 压缩法线 + 压缩反照率
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct VoxelFragment {
    pub key_lo: u32,
    pub key_hi: u32,
    pub normal: u32,
    pub albedo: u32,
}

impl_gpu_element!(VoxelFragment, "Fragment");

impl VoxelFragment {
    pub fn new(coord: UVec3, normal: Vec3, albedo: Vec3) -> Self {
        let (key_lo, key_hi) = morton::split(morton::encode(coord));
        Self {
            key_lo,
            key_hi,
            normal: pack::pack_normal(normal),
            albedo: pack::pack_albedo(albedo),
        }
    }

    pub fn key(&self) -> u64 {
        morton::join(self.key_lo, self.key_hi)
    }

    pub fn coord(&self) -> UVec3 {
        morton::decode(self.key())
    }
}

/// Fragments emitted for one triangle.
pub fn fragments_for_triangle(tri: &Triangle, level: u32, out: &mut Vec<VoxelFragment>) {
    let h = 1.0 / (1u32 << level) as f32;
    raster::for_each_covered_cell(&tri.positions, level, |cell: IVec3| {
        let center = (cell.as_vec3() + 0.5) * h;
        let normal = raster::interpolate_normal(center, tri);
        out.push(VoxelFragment::new(cell.as_uvec3(), normal, tri.albedo));
    });
}

/// Fragment-list capacity for `scene` at `level`: the per-triangle coverage
/// bound, scaled and clamped by the build configuration.
pub fn estimate_capacity(scene: &Scene, level: u32, config: &BuildConfig) -> u64 {
    let bound: u64 = scene
        .triangles()
        .par_iter()
        .map(|t| raster::coverage_bound(&t.positions, level))
        .sum();
    let scaled = (bound as f64 * config.fragment_coverage_factor).ceil() as u64;
    scaled
        .max(config.min_fragment_capacity)
        .min(config.max_fragment_capacity)
}

/// Host substrate: parallel-for over triangles. Fails instead of truncating
/// when more than `capacity` fragments are produced.
pub fn voxelize_host(scene: &Scene, level: u32, capacity: u64) -> Result<Vec<VoxelFragment>> {
    check_level(level)?;
    let fragments: Vec<VoxelFragment> = scene
        .triangles()
        .par_iter()
        .flat_map_iter(|tri| {
            let mut out = Vec::new();
            fragments_for_triangle(tri, level, &mut out);
            out
        })
        .collect();
    if fragments.len() as u64 > capacity {
        return Err(SvoError::FragmentOverflow {
            required: fragments.len() as u64,
            capacity,
        });
    }
    log::debug!("Host voxelization produced {} fragments", fragments.len());
    Ok(fragments)
}

// ===============================================================================
// GPU 侧实现
// ===============================================================================

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct VoxelizeParams {
    triangle_count: u32,
    level: u32,
    resolution: u32,
    capacity: u32,
    row_size: u32,
    _padding: [u32; 3],
}

impl_gpu_element!(VoxelizeParams, "Params");

/// Device voxelizer: owns the fragment list and its counter.
pub struct Voxelizer {
    ctx: GpuContext,
    level: u32,
    capacity: u64,
    _scene: SceneBuffers,
    fragments: wgpu::Buffer,
    counter: wgpu::Buffer,
    _params: wgpu::Buffer,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    dispatch: (u32, u32),
}

impl Voxelizer {
    pub fn new(ctx: &GpuContext, scene: &Scene, level: u32, config: &BuildConfig) -> Result<Self> {
        check_level(level)?;
        let device = &ctx.device;
        let capacity = estimate_capacity(scene, level, config);
        let fragments_size = gpu::padded_size::<VoxelFragment>(capacity);
        ctx.check_binding_size("fragment_list", fragments_size)?;

        let scene_buffers = scene.upload(ctx)?;
        let fragments = ctx.storage_buffer("fragment_list", fragments_size, wgpu::BufferUsages::COPY_SRC);
        let counter = ctx.storage_buffer(
            "fragment_counter",
            4,
            wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        );

        let dispatch = gpu::dispatch_size(scene_buffers.triangle_count as u64);
        let params = VoxelizeParams {
            triangle_count: scene_buffers.triangle_count,
            level,
            resolution: 1 << level,
            capacity: capacity as u32,
            row_size: gpu::dispatch_row(dispatch),
            _padding: [0; 3],
        };
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("voxelize_params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let shader = ctx.create_shader("voxelize.wgsl", include_str!("voxelize.wgsl"))?;
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxelize_layout"),
            entries: &[
                // binding 0: triangles
                gpu::storage_entry(0, ShaderStages::COMPUTE, true, crate::scene::GpuTriangle::MIN_BINDING_SIZE),
                // binding 1: fragment list
                gpu::storage_entry(1, ShaderStages::COMPUTE, false, VoxelFragment::MIN_BINDING_SIZE),
                // binding 2: atomic counter
                gpu::storage_entry(2, ShaderStages::COMPUTE, false, <u32 as GpuElement>::MIN_BINDING_SIZE),
                // binding 3: params
                gpu::uniform_entry(3, ShaderStages::COMPUTE, VoxelizeParams::MIN_BINDING_SIZE),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("voxelize_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = ctx.compute_pipeline("voxelize_pipeline", &shader, "cs_main", &pipeline_layout);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxelize_bind_group"),
            layout: &layout,
            entries: &[
                gpu::buffer_binding(0, &scene_buffers.triangles),
                gpu::buffer_binding(1, &fragments),
                gpu::buffer_binding(2, &counter),
                gpu::buffer_binding(3, &params_buffer),
            ],
        });

        log::debug!(
            "Voxelizer: {} triangles, level {}, fragment capacity {}",
            scene_buffers.triangle_count,
            level,
            capacity
        );
        Ok(Self {
            ctx: ctx.clone(),
            level,
            capacity,
            _scene: scene_buffers,
            fragments,
            counter,
            _params: params_buffer,
            pipeline,
            bind_group,
            dispatch,
        })
    }

    /// Record voxelization. Clears the counter first; readers must be in a
    /// later pass.
    pub fn cmd_voxelize(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.counter, 0, None);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("voxelize_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.dispatch_workgroups(self.dispatch.0, self.dispatch.1, 1);
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn fragment_buffer(&self) -> &wgpu::Buffer {
        &self.fragments
    }

    pub fn counter_buffer(&self) -> &wgpu::Buffer {
        &self.counter
    }

    /// Number of fragments the last execution tried to append. May exceed
    /// [`capacity`](Self::capacity) on overflow.
    pub fn read_fragment_count(&self) -> Result<u64> {
        let count = self.ctx.read_buffer::<u32>(&self.counter, 1)?;
        Ok(count.first().copied().unwrap_or(0) as u64)
    }

    pub fn read_fragments(&self) -> Result<Vec<VoxelFragment>> {
        let count = self.read_fragment_count()?;
        if count > self.capacity {
            return Err(SvoError::FragmentOverflow {
                required: count,
                capacity: self.capacity,
            });
        }
        self.ctx.read_buffer(&self.fragments, count)
    }
}
