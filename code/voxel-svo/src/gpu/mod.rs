//! wgpu plumbing shared by every pipeline: device handles, layout helpers,
//! dispatch sizing and synchronous read-back.

pub mod elem;
mod timer;

use crate::error::{Result, SvoError};
use bytemuck::Pod;
use std::sync::{Arc, mpsc};
use wgpu::ShaderStages;

pub use elem::{GpuElement, padded_size};
pub use timer::{GpuTimer, timer_features};

/// Invocations per workgroup for every 1-D kernel in this crate.
pub const WORKGROUP_SIZE: u32 = 64;
const MAX_WORKGROUPS_PER_DIM: u32 = 65535;
/// Format of offscreen targets; linear so read-back equals shader output.
pub const RENDER_TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// wgpu 设备与队列句柄
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter_name: String,
}

impl GpuContext {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            adapter_name: String::from("external"),
        }
    }

    /// Request an adapter and device. Passing a surface restricts the adapter
    /// to ones that can present to it.
    pub async fn request(
        instance: &wgpu::Instance,
        compatible_surface: Option<&wgpu::Surface<'_>>,
    ) -> Result<Self> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| SvoError::NoAdapter)?;

        let info = adapter.get_info();
        // timestamps are optional; build timings fall back to host clocks
        let required_features = adapter.features() & timer_features();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("voxel_svo_device"),
                required_features,
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| SvoError::RequestDevice(e.to_string()))?;

        log::info!("Physical device: {} ({:?})", info.name, info.backend);
        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_name: info.name,
        })
    }

    /// Headless convenience used by the viewer and tests.
    pub async fn request_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        Self::request(&instance, None).await
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Block until every submitted command buffer has finished.
    pub fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| SvoError::Execution(e.to_string()))
    }

    pub fn wait_for(&self, submission: wgpu::SubmissionIndex) -> Result<()> {
        self.device
            .poll(wgpu::PollType::WaitForSubmissionIndex(submission))
            .map(|_| ())
            .map_err(|e| SvoError::Execution(e.to_string()))
    }

    /// Copy `count` elements of `buffer` into host memory, blocking on the copy.
    pub fn read_buffer<T: Pod>(&self, buffer: &wgpu::Buffer, count: u64) -> Result<Vec<T>> {
        let size = (count * std::mem::size_of::<T>() as u64)
            .next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if size == 0 {
            return Ok(Vec::new());
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging_buffer"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read_back_encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        let submission = self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.wait_for(submission)?;
        rx.recv()
            .map_err(|e| SvoError::Execution(e.to_string()))?
            .map_err(|e| SvoError::Execution(e.to_string()))?;

        let data = slice.get_mapped_range();
        let bytes = &data[..(count as usize) * std::mem::size_of::<T>()];
        let result: Vec<T> = bytemuck::cast_slice(bytes).to_vec();
        drop(data);
        staging.unmap();
        Ok(result)
    }

    /// Offscreen color target that can be read back with
    /// [`read_texture_rgba8`](Self::read_texture_rgba8).
    pub fn create_render_target(&self, width: u32, height: u32) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("offscreen_target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: RENDER_TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        })
    }

    /// Copy an RGBA8 texture into tightly packed rows.
    pub fn read_texture_rgba8(&self, texture: &wgpu::Texture) -> Result<Vec<u8>> {
        let (width, height) = (texture.width(), texture.height());
        let row = width * 4;
        let padded_row = row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture_staging_buffer"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("texture_read_back_encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            texture.size(),
        );
        let submission = self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.wait_for(submission)?;
        rx.recv()
            .map_err(|e| SvoError::Execution(e.to_string()))?
            .map_err(|e| SvoError::Execution(e.to_string()))?;

        let data = slice.get_mapped_range();
        let pixels = data
            .chunks(padded_row as usize)
            .flat_map(|r| &r[..row as usize])
            .copied()
            .collect();
        drop(data);
        staging.unmap();
        Ok(pixels)
    }

    /// Create a shader module, turning validation failures into errors
    /// instead of the default uncaptured-error panic.
    pub fn create_shader(&self, label: &str, source: &str) -> Result<wgpu::ShaderModule> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(SvoError::ShaderCompilation(format!("{label}: {err}"))),
            None => Ok(module),
        }
    }

    pub fn compute_pipeline(
        &self,
        label: &str,
        module: &wgpu::ShaderModule,
        entry_point: &str,
        layout: &wgpu::PipelineLayout,
    ) -> wgpu::ComputePipeline {
        self.device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(layout),
                module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
    }

    pub fn storage_buffer(&self, label: &str, size: u64, extra: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: wgpu::BufferUsages::STORAGE | extra,
            mapped_at_creation: false,
        })
    }

    /// Fails with `BufferCreation` if `size` exceeds what the device can bind.
    pub fn check_binding_size(&self, label: &str, size: u64) -> Result<()> {
        let limits = self.device.limits();
        let max = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
        if size > max {
            return Err(SvoError::BufferCreation(format!(
                "{label}: {size} bytes exceeds device limit {max}"
            )));
        }
        Ok(())
    }
}

// ===============================================================================
// Bind group layout helpers
// ===============================================================================

pub fn storage_entry(
    binding: u32,
    visibility: ShaderStages,
    read_only: bool,
    min_size: wgpu::BufferSize,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: Some(min_size),
        },
        count: None,
    }
}

pub fn uniform_entry(
    binding: u32,
    visibility: ShaderStages,
    min_size: wgpu::BufferSize,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: Some(min_size),
        },
        count: None,
    }
}

pub fn buffer_binding(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

// ===============================================================================
// Dispatch sizing
// ===============================================================================

/// Workgroup grid covering `invocations` threads of a 1-D kernel. Large
/// domains spill into `y`; kernels linearize with `gid.x + gid.y * row`.
pub fn dispatch_size(invocations: u64) -> (u32, u32) {
    let groups = invocations.div_ceil(WORKGROUP_SIZE as u64).max(1);
    if groups <= MAX_WORKGROUPS_PER_DIM as u64 {
        (groups as u32, 1)
    } else {
        let y = groups.div_ceil(MAX_WORKGROUPS_PER_DIM as u64);
        (MAX_WORKGROUPS_PER_DIM, y as u32)
    }
}

/// Threads per `y` row for a grid produced by [`dispatch_size`].
pub fn dispatch_row(size: (u32, u32)) -> u32 {
    size.0 * WORKGROUP_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_covers_domain() {
        assert_eq!(dispatch_size(0), (1, 1));
        assert_eq!(dispatch_size(64), (1, 1));
        assert_eq!(dispatch_size(65), (2, 1));
        let big = dispatch_size(70_000 * 64);
        assert_eq!(big, (65535, 2));
        assert!(dispatch_row(big) as u64 * big.1 as u64 >= 70_000 * 64);
    }
}
