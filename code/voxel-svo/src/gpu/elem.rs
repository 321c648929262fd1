use bytemuck::{Pod, Zeroable};
use wgpu::BufferSize;

// ============================================================================
// 1. 统一的 compile-time stride 计算器
// ============================================================================
const fn gpu_stride(bytes: usize) -> usize {
    match bytes {
        0..=4 => 4,
        5..=8 => 8,
        9..=12 => 16,
        _ => bytes.div_ceil(16) * 16,
    }
}

const fn stride_to_bufsize(n: usize) -> BufferSize {
    match BufferSize::new(n as u64) {
        Some(size) => size,
        None => panic!("zero-sized GPU element"),
    }
}

/// 计算满足 GPU 对齐要求的缓冲区大小
/// Never returns less than one element so empty lists still bind.
#[inline]
pub fn padded_size<E: GpuElement>(count: u64) -> u64 {
    let stride = E::STRIDE_SIZE as u64;
    count.saturating_mul(stride).max(stride)
}

// ============================================================================
// 2. Trait：GPU 可见元素
// ============================================================================
/// Element stored in a storage or uniform buffer whose layout is shared with
/// WGSL. `SIZE` must already be a valid WGSL array stride for the element.
pub trait GpuElement: Pod + Zeroable + Send + Sync + 'static {
    const WGSL_TYPE: &'static str;
    const SIZE: usize = core::mem::size_of::<Self>();
    const STRIDE_SIZE: usize = gpu_stride(Self::SIZE);
    const MIN_BINDING_SIZE: BufferSize = stride_to_bufsize(Self::STRIDE_SIZE);
}

macro_rules! impl_gpu_element {
    ($ty:ty, $wgsl:literal) => {
        impl $crate::gpu::elem::GpuElement for $ty {
            const WGSL_TYPE: &'static str = $wgsl;
        }
    };
}

impl_gpu_element!(u32, "u32");
impl_gpu_element!(i32, "i32");
impl_gpu_element!(f32, "f32");
impl_gpu_element!([u32; 4], "vec4<u32>");
impl_gpu_element!(glam::UVec4, "vec4<u32>");
impl_gpu_element!(glam::Vec4, "vec4<f32>");

pub(crate) use impl_gpu_element;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_match_wgsl_alignment() {
        assert_eq!(<u32 as GpuElement>::STRIDE_SIZE, 4);
        assert_eq!(<glam::Vec4 as GpuElement>::STRIDE_SIZE, 16);
        assert_eq!(gpu_stride(12), 16);
        assert_eq!(gpu_stride(112), 112);
        assert_eq!(gpu_stride(20), 32);
    }

    #[test]
    fn padded_size_never_zero() {
        assert_eq!(padded_size::<u32>(0), 4);
        assert_eq!(padded_size::<u32>(10), 40);
    }
}
