//! Sparse octree construction from a fragment list.
//!
//! Per level: flag the children every fragment needs, allocate them with a
//! prefix sum over the working set, scatter child pointers, then advance the
//! working set to the new nodes. Leaves average their fragments last.

mod host;

pub use host::build_host;

use crate::config::BuildConfig;
use crate::dense_node_count;
use crate::error::{Result, SvoError};
use crate::gpu::elem::impl_gpu_element;
use crate::gpu::{self, GpuContext, GpuElement};
use crate::octree::OctreeNode;
use crate::voxelizer::{VoxelFragment, Voxelizer};
use bytemuck::{Pod, Zeroable};
use wgpu::ShaderStages;
use wgpu::util::DeviceExt;

const OVERFLOW_NODES: u32 = 1;
const OVERFLOW_FRAGMENTS: u32 = 2;
/// Byte offsets of the two indirect argument triples.
const FRAGMENT_ARGS: u64 = 0;
const PARENT_ARGS: u64 = 12;

/// Node-pool capacity for a build at `level` over at most `fragment_capacity`
/// fragments: never more than the dense tree, never more than one path per
/// fragment, never more than `max_bytes`.
pub fn node_capacity(level: u32, fragment_capacity: u64, max_bytes: u64) -> u64 {
    let sparse = 1 + fragment_capacity.saturating_mul(level as u64);
    let budget = max_bytes / std::mem::size_of::<OctreeNode>() as u64;
    dense_node_count(level).min(sparse).min(budget).max(1)
}

/// Leaves are distinct cells holding at least one fragment.
pub fn leaf_capacity(level: u32, fragment_capacity: u64) -> u64 {
    (1u64 << (3 * level)).min(fragment_capacity).max(1)
}

/// Mirrors `BuildState` in `build.wgsl`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct BuildState {
    pub fragment_count: u32,
    pub parent_begin: u32,
    pub parent_end: u32,
    pub node_count: u32,
    pub child_base: u32,
    pub child_count: u32,
    pub overflow: u32,
    pub required_fragments: u32,
    pub fragment_row: u32,
    pub parent_row: u32,
    _padding: [u32; 2],
}

impl_gpu_element!(BuildState, "BuildState");

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct LevelParams {
    level: u32,
    depth: u32,
    node_capacity: u32,
    fragment_capacity: u32,
}

impl_gpu_element!(LevelParams, "Params");

/// Layout-only twin of `LeafAccum`.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct LeafAccum([u32; 8]);

impl_gpu_element!(LeafAccum, "LeafAccum");

struct Pipelines {
    init: wgpu::ComputePipeline,
    flag: wgpu::ComputePipeline,
    allocate: wgpu::ComputePipeline,
    scatter: wgpu::ComputePipeline,
    advance: wgpu::ComputePipeline,
    leaf_accumulate: wgpu::ComputePipeline,
    leaf_normalize: wgpu::ComputePipeline,
}

/// 八叉树构建器 (GPU)
pub struct OctreeBuilder {
    ctx: GpuContext,
    level: u32,
    node_capacity: u64,
    fragment_capacity: u64,
    nodes: wgpu::Buffer,
    state: wgpu::Buffer,
    flags: wgpu::Buffer,
    accum: wgpu::Buffer,
    _buffers: Vec<wgpu::Buffer>,
    indirect: wgpu::Buffer,
    pipelines: Pipelines,
    /// One per depth `0..=level`; the last drives the leaf passes.
    level_groups: Vec<wgpu::BindGroup>,
    control_group: wgpu::BindGroup,
}

impl OctreeBuilder {
    pub fn new(ctx: &GpuContext, voxelizer: &Voxelizer, level: u32, config: &BuildConfig) -> Result<Self> {
        crate::check_level(level)?;
        if level != voxelizer.level() {
            return Err(SvoError::InvalidLevel(level));
        }
        let device = &ctx.device;
        let fragment_capacity = voxelizer.capacity();
        let device_budget = {
            let limits = device.limits();
            (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size)
        };
        let node_capacity = node_capacity(
            level,
            fragment_capacity,
            config.max_node_pool_bytes.min(device_budget),
        );
        // Working sets above the root never exceed the fragment count.
        let parent_capacity = (1u64 << (3 * (level - 1))).min(fragment_capacity).max(1);

        let nodes_size = gpu::padded_size::<OctreeNode>(node_capacity);
        ctx.check_binding_size("octree_nodes", nodes_size)?;
        let nodes = ctx.storage_buffer("octree_nodes", nodes_size, wgpu::BufferUsages::COPY_SRC);
        let state = ctx.storage_buffer(
            "build_state",
            BuildState::STRIDE_SIZE as u64,
            wgpu::BufferUsages::COPY_SRC,
        );
        let flags = ctx.storage_buffer(
            "build_flags",
            gpu::padded_size::<u32>(parent_capacity),
            wgpu::BufferUsages::COPY_DST,
        );
        let offsets = ctx.storage_buffer("build_offsets", gpu::padded_size::<u32>(parent_capacity), wgpu::BufferUsages::empty());
        let accum = ctx.storage_buffer(
            "leaf_accumulators",
            gpu::padded_size::<LeafAccum>(leaf_capacity(level, fragment_capacity)),
            wgpu::BufferUsages::COPY_DST,
        );
        ctx.check_binding_size("leaf_accumulators", accum.size())?;
        let indirect = ctx.storage_buffer("build_dispatch_args", 24, wgpu::BufferUsages::INDIRECT);

        let shader = ctx.create_shader("build.wgsl", include_str!("build.wgsl"))?;
        let data_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("build_data_layout"),
            entries: &[
                gpu::storage_entry(0, ShaderStages::COMPUTE, true, VoxelFragment::MIN_BINDING_SIZE),
                gpu::storage_entry(1, ShaderStages::COMPUTE, false, OctreeNode::MIN_BINDING_SIZE),
                gpu::storage_entry(2, ShaderStages::COMPUTE, false, BuildState::MIN_BINDING_SIZE),
                gpu::storage_entry(3, ShaderStages::COMPUTE, false, <u32 as GpuElement>::MIN_BINDING_SIZE),
                gpu::storage_entry(4, ShaderStages::COMPUTE, false, <u32 as GpuElement>::MIN_BINDING_SIZE),
                gpu::storage_entry(5, ShaderStages::COMPUTE, false, LeafAccum::MIN_BINDING_SIZE),
                gpu::storage_entry(6, ShaderStages::COMPUTE, true, <u32 as GpuElement>::MIN_BINDING_SIZE),
                gpu::uniform_entry(7, ShaderStages::COMPUTE, LevelParams::MIN_BINDING_SIZE),
            ],
        });
        let control_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("build_control_layout"),
            entries: &[gpu::storage_entry(
                0,
                ShaderStages::COMPUTE,
                false,
                <u32 as GpuElement>::MIN_BINDING_SIZE,
            )],
        });
        let data_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("build_data_pipeline_layout"),
            bind_group_layouts: &[&data_layout],
            push_constant_ranges: &[],
        });
        let control_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("build_control_pipeline_layout"),
            bind_group_layouts: &[&data_layout, &control_layout],
            push_constant_ranges: &[],
        });
        let data = |entry: &str| ctx.compute_pipeline(entry, &shader, entry, &data_pipeline_layout);
        let control = |entry: &str| ctx.compute_pipeline(entry, &shader, entry, &control_pipeline_layout);
        let pipelines = Pipelines {
            init: control("init"),
            flag: data("flag"),
            allocate: data("allocate"),
            scatter: data("scatter"),
            advance: control("advance"),
            leaf_accumulate: data("leaf_accumulate"),
            leaf_normalize: data("leaf_normalize"),
        };

        let mut params_buffers = Vec::with_capacity(level as usize + 1);
        let mut level_groups = Vec::with_capacity(level as usize + 1);
        for depth in 0..=level {
            let params = LevelParams {
                level,
                depth,
                node_capacity: node_capacity as u32,
                fragment_capacity: fragment_capacity as u32,
            };
            let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("build_level_params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            level_groups.push(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("build_level_bind_group"),
                layout: &data_layout,
                entries: &[
                    gpu::buffer_binding(0, voxelizer.fragment_buffer()),
                    gpu::buffer_binding(1, &nodes),
                    gpu::buffer_binding(2, &state),
                    gpu::buffer_binding(3, &flags),
                    gpu::buffer_binding(4, &offsets),
                    gpu::buffer_binding(5, &accum),
                    gpu::buffer_binding(6, voxelizer.counter_buffer()),
                    gpu::buffer_binding(7, &buffer),
                ],
            }));
            params_buffers.push(buffer);
        }
        let control_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("build_control_bind_group"),
            layout: &control_layout,
            entries: &[gpu::buffer_binding(0, &indirect)],
        });
        params_buffers.push(offsets);

        log::debug!(
            "OctreeBuilder: level {}, node capacity {}, parent capacity {}",
            level,
            node_capacity,
            parent_capacity
        );
        Ok(Self {
            ctx: ctx.clone(),
            level,
            node_capacity,
            fragment_capacity,
            nodes,
            state,
            flags,
            accum,
            _buffers: params_buffers,
            indirect,
            pipelines,
            level_groups,
            control_group,
        })
    }

    /// Record the whole construction. Must follow
    /// [`Voxelizer::cmd_voxelize`] in submission order.
    pub fn cmd_build(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.flags, 0, None);
        encoder.clear_buffer(&self.accum, 0, None);

        let root = &self.level_groups[0];
        self.control_pass(encoder, "build_init", &self.pipelines.init, root);
        for depth in 0..self.level as usize {
            let group = &self.level_groups[depth];
            self.indirect_pass(encoder, "build_flag", &self.pipelines.flag, group, FRAGMENT_ARGS);
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("build_allocate"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipelines.allocate);
                pass.set_bind_group(0, group, &[]);
                pass.dispatch_workgroups(1, 1, 1);
            }
            self.indirect_pass(encoder, "build_scatter", &self.pipelines.scatter, group, PARENT_ARGS);
            self.control_pass(encoder, "build_advance", &self.pipelines.advance, group);
        }
        let leaves = &self.level_groups[self.level as usize];
        self.indirect_pass(encoder, "build_leaf_accumulate", &self.pipelines.leaf_accumulate, leaves, FRAGMENT_ARGS);
        self.indirect_pass(encoder, "build_leaf_normalize", &self.pipelines.leaf_normalize, leaves, PARENT_ARGS);
    }

    fn control_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        group: &wgpu::BindGroup,
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, group, &[]);
        pass.set_bind_group(1, &self.control_group, &[]);
        pass.dispatch_workgroups(1, 1, 1);
    }

    fn indirect_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        group: &wgpu::BindGroup,
        args_offset: u64,
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, group, &[]);
        pass.dispatch_workgroups_indirect(&self.indirect, args_offset);
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn node_capacity(&self) -> u64 {
        self.node_capacity
    }

    pub fn octree_buffer(&self) -> &wgpu::Buffer {
        &self.nodes
    }

    /// Hand the node pool over to the live octree.
    pub fn into_octree_buffer(self) -> wgpu::Buffer {
        self.nodes
    }

    pub fn read_state(&self) -> Result<BuildState> {
        let state = self.ctx.read_buffer::<BuildState>(&self.state, 1)?;
        state
            .first()
            .copied()
            .ok_or_else(|| SvoError::Execution("empty build state read-back".into()))
    }

    /// Occupied bytes of the node pool after the submitted build completed.
    pub fn read_range(&self) -> Result<u64> {
        let state = self.read_state()?;
        match state.overflow {
            0 => Ok(state.node_count as u64 * std::mem::size_of::<OctreeNode>() as u64),
            OVERFLOW_FRAGMENTS => Err(SvoError::FragmentOverflow {
                required: state.required_fragments as u64,
                capacity: self.fragment_capacity,
            }),
            OVERFLOW_NODES => Err(SvoError::NodePoolOverflow {
                capacity: self.node_capacity,
            }),
            other => Err(SvoError::Execution(format!("unknown overflow code {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_capacity_is_bounded() {
        assert_eq!(node_capacity(3, 1_000_000, u64::MAX), dense_node_count(3));
        assert_eq!(node_capacity(10, 100, u64::MAX), 1 + 100 * 10);
        assert_eq!(node_capacity(10, 1_000_000, 1600), 100);
        assert_eq!(node_capacity(1, 0, 0), 1);
    }

    #[test]
    fn leaf_capacity_is_bounded_by_the_grid() {
        assert_eq!(leaf_capacity(1, 1 << 20), 8);
        assert_eq!(leaf_capacity(3, 1 << 20), 512);
        assert_eq!(leaf_capacity(10, 5000), 5000);
        assert_eq!(leaf_capacity(12, u32::MAX as u64), u32::MAX as u64);
        assert_eq!(leaf_capacity(2, 0), 1);
    }

    #[test]
    fn build_state_matches_wgsl_layout() {
        assert_eq!(std::mem::size_of::<BuildState>(), 48);
        assert_eq!(std::mem::size_of::<LeafAccum>(), 32);
    }
}
