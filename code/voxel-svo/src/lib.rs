pub mod app;
pub mod builder;
pub mod camera;
pub mod config;
mod error;
pub mod frame;
pub mod gpu;
pub mod morton;
pub mod octree;
pub mod pack;
pub mod scene;
pub mod tracer;
pub mod voxelizer;

pub use app::Application;
pub use builder::OctreeBuilder;
pub use camera::{Camera, CameraUniform};
pub use config::{BuildConfig, CameraConfig, Config, TracerConfig};
pub use error::{Result, SvoError};
pub use frame::FrameManager;
pub use gpu::GpuContext;
pub use octree::{Octree, OctreeData, OctreeInfo, OctreeNode};
pub use scene::Scene;
pub use tracer::{OctreeTracer, ViewMode};
pub use voxelizer::{VoxelFragment, Voxelizer};
pub use wgpu;

/// Deepest supported octree level; leaf grids are `2^level` cells per axis.
pub const MAX_LEVEL: u32 = 12;

/// Number of nodes in a full octree with leaves at depth `level`.
pub fn dense_node_count(level: u32) -> u64 {
    ((1u64 << (3 * (level + 1))) - 1) / 7
}

/// 校验八叉树层级
pub fn check_level(level: u32) -> Result<()> {
    if level == 0 || level > MAX_LEVEL {
        return Err(SvoError::InvalidLevel(level));
    }
    Ok(())
}
