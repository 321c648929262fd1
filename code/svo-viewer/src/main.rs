//! Headless octree viewer.
//!
//! Voxelizes a mesh, builds the octree and writes traced frames to PNG. With
//! `--frames N` the camera orbits the scene center once over N frames.

use anyhow::{Context, Result, bail};
use clap::Parser;
use glam::{UVec2, Vec3};
use std::path::{Path, PathBuf};
use std::time::Instant;
use voxel_svo::builder::{build_host, node_capacity};
use voxel_svo::gpu::RENDER_TARGET_FORMAT;
use voxel_svo::scene::{DEFAULT_ALBEDO, cube_triangles};
use voxel_svo::tracer::{RenderOptions, render_host};
use voxel_svo::voxelizer::{estimate_capacity, voxelize_host};
use voxel_svo::{Application, Camera, Config, GpuContext, Scene, ViewMode, wgpu};

#[derive(Parser, Debug)]
#[command(name = "svo-viewer")]
#[command(about = "Voxelize a mesh into a sparse voxel octree and ray trace it")]
struct Args {
    /// Wavefront OBJ mesh. A unit cube is used when omitted.
    #[arg(short, long)]
    mesh: Option<PathBuf>,

    /// Octree level (resolution 2^level); overrides the config file.
    #[arg(short, long)]
    level: Option<u32>,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Number of frames, orbiting the camera around the scene center.
    #[arg(long, default_value_t = 1)]
    frames: u32,

    /// diffuse, normal or iteration.
    #[arg(long)]
    view: Option<ViewMode>,

    /// Disable the beam pre-pass.
    #[arg(long)]
    no_beam: bool,

    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output PNG. Frame numbers are appended when rendering several frames.
    #[arg(short, long, default_value = "frame.png")]
    output: PathBuf,

    /// Voxelize, build and trace on the CPU instead of the GPU.
    #[arg(long)]
    host: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(view) = args.view {
        config.tracer.view_mode = view;
    }
    if args.no_beam {
        config.tracer.beam_enable = false;
    }
    let level = args.level.unwrap_or(config.build.level);
    if args.width == 0 || args.height == 0 {
        bail!("output size {}x{} is empty", args.width, args.height);
    }

    let scene = match &args.mesh {
        Some(path) => Scene::load(path)?,
        None => Scene::from_triangles(cube_triangles(Vec3::splat(0.5), 0.5, DEFAULT_ALBEDO))?,
    };

    if args.host {
        run_host(&args, &config, &scene, level)
    } else {
        run_device(&args, config, &scene, level)
    }
}

fn run_device(args: &Args, config: Config, scene: &Scene, level: u32) -> Result<()> {
    let ctx = pollster::block_on(GpuContext::request_headless()).context("Requesting GPU device")?;
    let mut app = Application::new(
        ctx,
        config,
        RENDER_TARGET_FORMAT,
        UVec2::new(args.width, args.height),
    )?;
    let report = app.load_scene_data(scene, level)?;
    log::info!(
        "Level {}: {} fragments, {} bytes of nodes",
        report.level,
        report.fragment_count,
        report.range_bytes
    );

    let target = app.context().create_render_target(args.width, args.height);
    let view = target.create_view(&wgpu::TextureViewDescriptor::default());
    for frame in 0..args.frames {
        if frame > 0 {
            orbit_step(app.camera_mut(), args.frames);
        }
        let start = Instant::now();
        app.draw_frame(&view)?;
        app.wait_idle()?;
        log::debug!("Frame {frame} traced in {:.3} ms", start.elapsed().as_secs_f64() * 1e3);
        let pixels = app.context().read_texture_rgba8(&target)?;
        save_png(&frame_path(&args.output, frame, args.frames), args.width, args.height, pixels)?;
    }
    Ok(())
}

fn run_host(args: &Args, config: &Config, scene: &Scene, level: u32) -> Result<()> {
    let start = Instant::now();
    let capacity = estimate_capacity(scene, level, &config.build);
    let fragments = voxelize_host(scene, level, capacity)?;
    if fragments.is_empty() {
        bail!("scene produced no fragments at level {level}");
    }
    let nodes = node_capacity(level, fragments.len() as u64, config.build.max_node_pool_bytes);
    let octree = build_host(&fragments, level, nodes)?;
    log::info!(
        "Host build at level {level}: {} fragments, {} bytes of nodes in {:.3} ms",
        fragments.len(),
        octree.range_bytes(),
        start.elapsed().as_secs_f64() * 1e3
    );

    let mut camera = Camera::new(&config.camera, args.width as f32 / args.height as f32);
    let options = RenderOptions {
        view_mode: config.tracer.view_mode,
        beam_enable: config.tracer.beam_enable,
        beam_size: config.tracer.beam_size,
    };
    for frame in 0..args.frames {
        if frame > 0 {
            orbit_step(&mut camera, args.frames);
        }
        let image = render_host(&octree, &camera.uniform(), args.width, args.height, &options);
        save_png(
            &frame_path(&args.output, frame, args.frames),
            args.width,
            args.height,
            image.to_rgba8(),
        )?;
    }
    Ok(())
}

fn orbit_step(camera: &mut Camera, frames: u32) {
    camera.orbit(Vec3::splat(0.5), std::f32::consts::TAU / frames as f32);
}

/// `out.png` stays as is for a single frame, `out_0003.png` otherwise.
fn frame_path(output: &Path, frame: u32, frames: u32) -> PathBuf {
    if frames <= 1 {
        return output.to_path_buf();
    }
    let stem = output.file_stem().and_then(|s| s.to_str()).unwrap_or("frame");
    let ext = output.extension().and_then(|s| s.to_str()).unwrap_or("png");
    output.with_file_name(format!("{stem}_{frame:04}.{ext}"))
}

fn save_png(path: &Path, width: u32, height: u32, pixels: Vec<u8>) -> Result<()> {
    let image = image::RgbaImage::from_raw(width, height, pixels)
        .context("Frame size does not match the pixel buffer")?;
    image
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_paths_are_numbered_only_for_sequences() {
        let out = Path::new("renders/orbit.png");
        assert_eq!(frame_path(out, 0, 1), PathBuf::from("renders/orbit.png"));
        assert_eq!(frame_path(out, 7, 12), PathBuf::from("renders/orbit_0007.png"));
    }

    #[test]
    fn parses_view_mode_flag() {
        let args = Args::try_parse_from(["svo-viewer", "--view", "iteration", "--no-beam"]).unwrap();
        assert_eq!(args.view, Some(ViewMode::Iteration));
        assert!(args.no_beam);
        assert!(Args::try_parse_from(["svo-viewer", "--view", "depth"]).is_err());
    }
}
