// ===============================================================================
// 错误类型定义
// ===============================================================================

/// GPU 计算 / 构建错误类型
/// Every fallible core operation returns this instead of panicking across the
/// submission boundary.
#[derive(Debug, thiserror::Error)]
pub enum SvoError {
    #[error("No compatible adapter found")]
    NoAdapter,

    #[error("Device request failed: {0}")]
    RequestDevice(String),

    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    #[error("Buffer creation failed: {0}")]
    BufferCreation(String),

    #[error("GPU execution failed: {0}")]
    Execution(String),

    #[error("Failed to load mesh {path}: {reason}")]
    MeshLoad { path: String, reason: String },

    #[error("Scene contains no triangles")]
    EmptyScene,

    #[error("Octree level {0} is outside 1..={max}", max = crate::MAX_LEVEL)]
    InvalidLevel(u32),

    #[error("Fragment list overflow: {required} fragments, capacity {capacity}")]
    FragmentOverflow { required: u64, capacity: u64 },

    #[error("Node pool overflow: capacity {capacity} nodes")]
    NodePoolOverflow { capacity: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = SvoError> = std::result::Result<T, E>;
