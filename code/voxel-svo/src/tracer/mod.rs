//! Octree ray tracer: a beam compute pre-pass followed by a full-screen
//! traversal draw.

pub mod traverse;

pub use traverse::{HostFrame, RenderOptions, TraceResult, beam_distance, render_host, trace_ray};

use crate::camera::{Camera, CameraUniform};
use crate::config::TracerConfig;
use crate::error::{Result, SvoError};
use crate::gpu::elem::impl_gpu_element;
use crate::gpu::{self, GpuContext, GpuElement};
use crate::octree::{Octree, OctreeNode};
use bytemuck::{Pod, Zeroable};
use glam::UVec2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use wgpu::ShaderStages;

/// What the traversal pass writes per pixel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Diffuse,
    Normal,
    /// Node visits per ray, as a gray ramp.
    Iteration,
}

impl ViewMode {
    pub const ALL: [ViewMode; 3] = [ViewMode::Diffuse, ViewMode::Normal, ViewMode::Iteration];

    /// Value of `params.view_mode` in the shaders.
    pub fn shader_value(self) -> u32 {
        match self {
            ViewMode::Diffuse => 0,
            ViewMode::Normal => 1,
            ViewMode::Iteration => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ViewMode::Diffuse => "diffuse",
            ViewMode::Normal => "normal",
            ViewMode::Iteration => "iteration",
        }
    }
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ViewMode {
    type Err = SvoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| SvoError::Config(format!("unknown view mode {s:?}")))
    }
}

/// Mirrors `TraceParams` in `common.wgsl`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct TraceParams {
    width: u32,
    height: u32,
    beam_size: u32,
    beam_enable: u32,
    view_mode: u32,
    beam_width: u32,
    beam_height: u32,
    _padding: u32,
}

impl_gpu_element!(TraceParams, "TraceParams");

/// Resources of one frame in flight.
struct FrameResources {
    params: wgpu::Buffer,
    camera: Arc<wgpu::Buffer>,
    _beam: wgpu::Texture,
    beam_view: wgpu::TextureView,
    beam_group: Option<wgpu::BindGroup>,
    draw_group: Option<wgpu::BindGroup>,
    /// Octree version the bind groups reference.
    version: u64,
}

pub struct OctreeTracer {
    pub view_mode: ViewMode,
    pub beam_enable: bool,
    device: Arc<wgpu::Device>,
    extent: UVec2,
    beam_size: u32,
    beam_extent: UVec2,
    beam_layout: wgpu::BindGroupLayout,
    draw_layout: wgpu::BindGroupLayout,
    beam_pipeline: wgpu::ComputePipeline,
    draw_pipeline: wgpu::RenderPipeline,
    frames: Vec<FrameResources>,
}

impl OctreeTracer {
    pub fn new(
        ctx: &GpuContext,
        camera: &Camera,
        target_format: wgpu::TextureFormat,
        extent: UVec2,
        frame_count: usize,
        config: &TracerConfig,
    ) -> Result<Self> {
        let device = &ctx.device;
        if extent.x == 0 || extent.y == 0 {
            return Err(SvoError::Config(format!("render extent {extent} is empty")));
        }
        let beam_size = config.beam_size.max(1);
        let beam_extent = UVec2::new(extent.x.div_ceil(beam_size), extent.y.div_ceil(beam_size));

        let beam_shader = ctx.create_shader(
            "beam.wgsl",
            concat!(include_str!("common.wgsl"), include_str!("beam.wgsl")),
        )?;
        let trace_shader = ctx.create_shader(
            "trace.wgsl",
            concat!(include_str!("common.wgsl"), include_str!("trace.wgsl")),
        )?;

        let shared_entries = |stage: ShaderStages| {
            [
                gpu::storage_entry(0, stage, true, OctreeNode::MIN_BINDING_SIZE),
                gpu::uniform_entry(1, stage, CameraUniform::MIN_BINDING_SIZE),
                gpu::uniform_entry(2, stage, TraceParams::MIN_BINDING_SIZE),
            ]
        };
        let [n, c, p] = shared_entries(ShaderStages::COMPUTE);
        let beam_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("beam_layout"),
            entries: &[
                n,
                c,
                p,
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::R32Float,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        });
        let [n, c, p] = shared_entries(ShaderStages::FRAGMENT);
        let draw_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("trace_layout"),
            entries: &[
                n,
                c,
                p,
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });

        let beam_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("beam_pipeline_layout"),
            bind_group_layouts: &[&beam_layout],
            push_constant_ranges: &[],
        });
        let beam_pipeline = ctx.compute_pipeline("beam_pipeline", &beam_shader, "cs_beam", &beam_pipeline_layout);

        let draw_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("trace_pipeline_layout"),
            bind_group_layouts: &[&draw_layout],
            push_constant_ranges: &[],
        });
        let draw_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("trace_pipeline"),
            layout: Some(&draw_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &trace_shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &trace_shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: target_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        });

        let frames = (0..frame_count)
            .map(|frame| {
                let camera = camera.frame_buffer(frame).cloned().ok_or_else(|| {
                    SvoError::BufferCreation(format!("camera has no uniform buffer for frame {frame}"))
                })?;
                let params = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("trace_params"),
                    size: TraceParams::STRIDE_SIZE as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let beam = device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("beam_texture"),
                    size: wgpu::Extent3d {
                        width: beam_extent.x,
                        height: beam_extent.y,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu::TextureFormat::R32Float,
                    usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
                    view_formats: &[],
                });
                let beam_view = beam.create_view(&wgpu::TextureViewDescriptor::default());
                Ok(FrameResources {
                    params,
                    camera,
                    _beam: beam,
                    beam_view,
                    beam_group: None,
                    draw_group: None,
                    version: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "OctreeTracer: {}x{} target, {}x{} beam tiles, {} frames",
            extent.x,
            extent.y,
            beam_extent.x,
            beam_extent.y,
            frame_count
        );
        Ok(Self {
            view_mode: config.view_mode,
            beam_enable: config.beam_enable,
            device: ctx.device.clone(),
            extent,
            beam_size,
            beam_extent,
            beam_layout,
            draw_layout,
            beam_pipeline,
            draw_pipeline,
            frames,
        })
    }

    pub fn extent(&self) -> UVec2 {
        self.extent
    }

    pub fn beam_size(&self) -> u32 {
        self.beam_size
    }

    pub fn options(&self) -> RenderOptions {
        RenderOptions {
            view_mode: self.view_mode,
            beam_enable: self.beam_enable,
            beam_size: self.beam_size,
        }
    }

    /// Write `frame`'s parameters and rebind the node pool if the octree was
    /// replaced since this slot was last used.
    pub fn prepare_frame(&mut self, queue: &wgpu::Queue, octree: &Octree, frame: usize) -> Result<()> {
        let Some(nodes) = octree.buffer() else {
            return Err(SvoError::Execution("tracer invoked on an empty octree".into()));
        };
        let params = TraceParams {
            width: self.extent.x,
            height: self.extent.y,
            beam_size: self.beam_size,
            beam_enable: self.beam_enable as u32,
            view_mode: self.view_mode.shader_value(),
            beam_width: self.beam_extent.x,
            beam_height: self.beam_extent.y,
            _padding: 0,
        };
        let (device, beam_layout, draw_layout) = (&self.device, &self.beam_layout, &self.draw_layout);
        let res = self
            .frames
            .get_mut(frame)
            .ok_or_else(|| SvoError::Execution(format!("frame {frame} out of range")))?;
        queue.write_buffer(&res.params, 0, bytemuck::bytes_of(&params));

        if res.version != octree.version() || res.draw_group.is_none() {
            // one view serves as the storage target and the sampled input
            let entries = [
                gpu::buffer_binding(0, nodes),
                gpu::buffer_binding(1, &res.camera),
                gpu::buffer_binding(2, &res.params),
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&res.beam_view),
                },
            ];
            let beam_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("beam_bind_group"),
                layout: beam_layout,
                entries: &entries,
            });
            let draw_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("trace_bind_group"),
                layout: draw_layout,
                entries: &entries,
            });
            res.beam_group = Some(beam_group);
            res.draw_group = Some(draw_group);
            res.version = octree.version();
            log::debug!("Frame {frame}: rebound octree version {}", res.version);
        }
        Ok(())
    }

    /// Record the beam pre-pass. A no-op when the beam is disabled.
    pub fn cmd_beam_render_pass(&self, encoder: &mut wgpu::CommandEncoder, frame: usize) {
        if !self.beam_enable {
            return;
        }
        let Some(group) = self.frames.get(frame).and_then(|f| f.beam_group.as_ref()) else {
            log::warn!("beam pass for unprepared frame {frame}");
            return;
        };
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("beam_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.beam_pipeline);
        pass.set_bind_group(0, group, &[]);
        pass.dispatch_workgroups(self.beam_extent.x.div_ceil(8), self.beam_extent.y.div_ceil(8), 1);
    }

    /// Record the traversal draw into an open render pass.
    pub fn cmd_draw_pipeline(&self, render_pass: &mut wgpu::RenderPass<'_>, frame: usize) {
        let Some(group) = self.frames.get(frame).and_then(|f| f.draw_group.as_ref()) else {
            log::warn!("draw for unprepared frame {frame}");
            return;
        };
        render_pass.set_pipeline(&self.draw_pipeline);
        render_pass.set_bind_group(0, group, &[]);
        render_pass.draw(0..3, 0..1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_mode_parses_names() {
        assert_eq!("Normal".parse::<ViewMode>().unwrap(), ViewMode::Normal);
        assert_eq!("iteration".parse::<ViewMode>().unwrap(), ViewMode::Iteration);
        assert!("albedo".parse::<ViewMode>().is_err());
        assert_eq!(ViewMode::Diffuse.to_string(), "diffuse");
    }
}
