//! Orchestration: scene (re)builds and per-frame rendering.

use crate::builder::OctreeBuilder;
use crate::camera::Camera;
use crate::config::Config;
use crate::error::{Result, SvoError};
use crate::frame::FrameManager;
use crate::gpu::{GpuContext, GpuTimer};
use crate::octree::{Octree, OctreeData, OctreeInfo};
use crate::scene::Scene;
use crate::tracer::OctreeTracer;
use crate::voxelizer::Voxelizer;
use glam::UVec2;
use std::path::Path;
use std::time::{Duration, Instant};

/// Outcome of a successful build.
#[derive(Clone, Copy, Debug)]
pub struct BuildReport {
    pub level: u32,
    pub fragment_count: u64,
    pub range_bytes: u64,
    /// Scene upload and pipeline setup.
    pub setup: Duration,
    /// Voxelize + build, submission to completion.
    pub gpu: Duration,
    /// Device-side stage times, present when the device supports timestamps.
    pub voxelize: Option<Duration>,
    pub build: Option<Duration>,
    pub total: Duration,
}

pub struct Application {
    ctx: GpuContext,
    config: Config,
    camera: Camera,
    octree: Octree,
    tracer: OctreeTracer,
    frames: FrameManager,
}

impl Application {
    pub fn new(ctx: GpuContext, config: Config, target_format: wgpu::TextureFormat, extent: UVec2) -> Result<Self> {
        config.validate()?;
        let frame_count = config.tracer.frame_count;
        let mut camera = Camera::new(&config.camera, extent.x as f32 / extent.y.max(1) as f32);
        camera.create_frame_buffers(&ctx.device, frame_count);
        let tracer = OctreeTracer::new(
            &ctx,
            &camera,
            target_format,
            extent,
            frame_count as usize,
            &config.tracer,
        )?;
        Ok(Self {
            ctx,
            camera,
            octree: Octree::new(),
            tracer,
            frames: FrameManager::new(frame_count),
            config,
        })
    }

    /// Load an OBJ file and rebuild the octree at `level`. On failure the
    /// previous octree stays live.
    pub fn load_scene(&mut self, path: impl AsRef<Path>, level: u32) -> Result<BuildReport> {
        let path = path.as_ref();
        let result = Scene::load(path).and_then(|scene| self.build(&scene, level));
        if let Err(e) = &result {
            log::error!("Failed to load {}: {e}", path.display());
        }
        result
    }

    /// Rebuild the octree from an in-memory scene.
    pub fn load_scene_data(&mut self, scene: &Scene, level: u32) -> Result<BuildReport> {
        let result = self.build(scene, level);
        if let Err(e) = &result {
            log::error!("Failed to build octree: {e}");
        }
        result
    }

    fn build(&mut self, scene: &Scene, level: u32) -> Result<BuildReport> {
        crate::check_level(level)?;
        let start = Instant::now();
        // frames in flight may still read the current pool
        self.ctx.wait_idle()?;

        let voxelizer = Voxelizer::new(&self.ctx, scene, level, &self.config.build)?;
        let builder = OctreeBuilder::new(&self.ctx, &voxelizer, level, &self.config.build)?;
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("octree_build_encoder"),
            });
        let timer = GpuTimer::new(&self.ctx, 4);
        let stamp = |encoder: &mut wgpu::CommandEncoder, slot| {
            if let Some(timer) = &timer {
                timer.write(encoder, slot);
            }
        };
        stamp(&mut encoder, 0);
        voxelizer.cmd_voxelize(&mut encoder);
        stamp(&mut encoder, 1);
        stamp(&mut encoder, 2);
        builder.cmd_build(&mut encoder);
        stamp(&mut encoder, 3);
        if let Some(timer) = &timer {
            timer.resolve(&mut encoder);
        }
        let setup = start.elapsed();

        log::info!("Voxelize and octree building BEGIN");
        let gpu_start = Instant::now();
        let submission = self.ctx.queue.submit(std::iter::once(encoder.finish()));
        self.ctx.wait_for(submission)?;
        let gpu = gpu_start.elapsed();

        let range_bytes = builder.read_range()?;
        let fragment_count = voxelizer.read_fragment_count()?;
        if fragment_count == 0 {
            return Err(SvoError::EmptyScene);
        }
        let (voxelize, build) = match &timer {
            Some(timer) => {
                let ticks = timer.read_ticks(&self.ctx)?;
                (
                    Some(GpuTimer::span(&self.ctx, &ticks, 0, 1)),
                    Some(GpuTimer::span(&self.ctx, &ticks, 2, 3)),
                )
            }
            None => (None, None),
        };
        self.octree.update(builder.into_octree_buffer(), level, range_bytes);

        let report = BuildReport {
            level,
            fragment_count,
            range_bytes,
            setup,
            gpu,
            voxelize,
            build,
            total: start.elapsed(),
        };
        log::info!(
            "Voxelize and octree building FINISHED in {:.3} ms (setup {:.3} ms, gpu {:.3} ms), {} fragments",
            report.total.as_secs_f64() * 1e3,
            report.setup.as_secs_f64() * 1e3,
            report.gpu.as_secs_f64() * 1e3,
            fragment_count
        );
        if let (Some(voxelize), Some(build)) = (report.voxelize, report.build) {
            log::info!(
                "Voxelize {:.3} ms, octree build {:.3} ms",
                voxelize.as_secs_f64() * 1e3,
                build.as_secs_f64() * 1e3
            );
        }
        log::info!(
            "Octree range: {} ({:.1} MB)",
            range_bytes,
            range_bytes as f64 / 1_000_000.0
        );
        Ok(report)
    }

    /// Record and submit one frame into `target`. Tracer passes are skipped
    /// while no octree is loaded; the target is still cleared.
    pub fn draw_frame(&mut self, target: &wgpu::TextureView) -> Result<()> {
        let frame = self.frames.begin_frame(&self.ctx)?;
        self.camera.update_frame_uniform_buffer(&self.ctx.queue, frame);

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame_encoder"),
            });
        let draw = !self.octree.is_empty();
        if draw {
            self.tracer.prepare_frame(&self.ctx.queue, &self.octree, frame)?;
            self.tracer.cmd_beam_render_pass(&mut encoder, frame);
        }
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("main_render_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            if draw {
                self.tracer.cmd_draw_pipeline(&mut pass, frame);
            }
        }
        let submission = self.ctx.queue.submit(std::iter::once(encoder.finish()));
        self.frames.end_frame(submission);
        Ok(())
    }

    pub fn octree_info(&self) -> OctreeInfo {
        self.octree.info()
    }

    pub fn octree(&self) -> &Octree {
        &self.octree
    }

    /// Host copy of the live node pool.
    pub fn read_octree(&self) -> Result<Option<OctreeData>> {
        self.octree.read_back(&self.ctx)
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn tracer(&self) -> &OctreeTracer {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut OctreeTracer {
        &mut self.tracer
    }

    /// Block until every submitted frame has finished.
    pub fn wait_idle(&self) -> Result<()> {
        self.ctx.wait_idle()
    }
}
