//! Device pipeline tests. Each test is skipped when no adapter is available.

use glam::{UVec2, UVec3, Vec3};
use std::collections::HashSet;
use voxel_svo::builder::build_host;
use voxel_svo::gpu::{RENDER_TARGET_FORMAT, timer_features};
use voxel_svo::scene::{DEFAULT_ALBEDO, Triangle, cube_triangles};
use voxel_svo::voxelizer::voxelize_host;
use voxel_svo::{
    Application, BuildConfig, Config, FrameManager, GpuContext, OctreeBuilder, OctreeNode, Scene, SvoError,
    Voxelizer,
};

async fn context() -> Option<GpuContext> {
    let _ = env_logger::builder().is_test(true).try_init();
    match GpuContext::request_headless().await {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("skipping device test: {e}");
            None
        }
    }
}

fn unit_cube() -> Scene {
    Scene::from_triangles(cube_triangles(Vec3::splat(0.5), 0.5, DEFAULT_ALBEDO)).unwrap()
}

fn submit(ctx: &GpuContext, record: impl FnOnce(&mut wgpu::CommandEncoder)) {
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("test_encoder") });
    record(&mut encoder);
    let submission = ctx.queue.submit(std::iter::once(encoder.finish()));
    ctx.wait_for(submission).unwrap();
}

#[tokio::test]
async fn device_voxelizer_matches_host() {
    let Some(ctx) = context().await else { return };
    let scene = unit_cube();
    let voxelizer = Voxelizer::new(&ctx, &scene, 3, &BuildConfig::default()).unwrap();
    submit(&ctx, |encoder| voxelizer.cmd_voxelize(encoder));

    let device = voxelizer.read_fragments().unwrap();
    let host = voxelize_host(&scene, 3, u64::MAX).unwrap();
    assert_eq!(device.len(), host.len());
    let device_cells: HashSet<UVec3> = device.iter().map(|f| f.coord()).collect();
    let host_cells: HashSet<UVec3> = host.iter().map(|f| f.coord()).collect();
    assert_eq!(device_cells, host_cells);
    assert_eq!(device_cells.len(), 296);
}

#[tokio::test]
async fn device_build_matches_host_build() {
    let Some(ctx) = context().await else { return };
    let mut triangles = cube_triangles(Vec3::splat(0.3), 0.2, Vec3::new(0.9, 0.1, 0.1));
    triangles.extend(cube_triangles(Vec3::new(0.7, 0.6, 0.7), 0.25, Vec3::new(0.1, 0.2, 0.9)));
    let scene = Scene::from_triangles(triangles).unwrap();
    let config = BuildConfig::default();

    let voxelizer = Voxelizer::new(&ctx, &scene, 5, &config).unwrap();
    let builder = OctreeBuilder::new(&ctx, &voxelizer, 5, &config).unwrap();
    submit(&ctx, |encoder| {
        voxelizer.cmd_voxelize(encoder);
        builder.cmd_build(encoder);
    });

    let range = builder.read_range().unwrap();
    let device: Vec<OctreeNode> = ctx
        .read_buffer(builder.octree_buffer(), range / std::mem::size_of::<OctreeNode>() as u64)
        .unwrap();
    let fragments = voxelizer.read_fragments().unwrap();
    let host = build_host(&fragments, 5, builder.node_capacity()).unwrap();

    assert_eq!(device.len(), host.len());
    for (i, (d, h)) in device.iter().zip(host.nodes()).enumerate() {
        assert_eq!((d.child, d.mask), (h.child, h.mask), "node {i}");
        assert!((d.albedo() - h.albedo()).abs().max_element() <= 1.0 / 255.0, "node {i}");
        assert!((d.normal() - h.normal()).abs().max_element() <= 2.0 / 127.0, "node {i}");
    }
}

#[tokio::test]
async fn application_builds_and_draws() {
    let Some(ctx) = context().await else { return };
    let mut app = Application::new(ctx, Config::default(), RENDER_TARGET_FORMAT, UVec2::new(32, 32)).unwrap();
    assert!(app.octree_info().empty);

    let report = app.load_scene_data(&unit_cube(), 3).unwrap();
    assert_eq!(report.level, 3);
    assert!(report.fragment_count >= 296);
    let timed = app.context().device.features().contains(timer_features());
    assert_eq!((report.voxelize.is_some(), report.build.is_some()), (timed, timed));
    let info = app.octree_info();
    assert_eq!((info.level, info.range_bytes), (3, report.range_bytes));
    let octree = app.read_octree().unwrap().unwrap();
    octree.check_structure().unwrap();
    assert_eq!(octree.leaf_coords().len(), 296);

    let target = app.context().create_render_target(32, 32);
    let view = target.create_view(&wgpu::TextureViewDescriptor::default());
    // more frames than slots, so every slot is reused
    for _ in 0..3 {
        app.draw_frame(&view).unwrap();
    }
    app.wait_idle().unwrap();
    let pixels = app.context().read_texture_rgba8(&target).unwrap();
    assert_eq!(pixels.len(), 32 * 32 * 4);
    let at = |x: usize, y: usize| &pixels[(y * 32 + x) * 4..(y * 32 + x) * 4 + 4];
    let expected = (DEFAULT_ALBEDO.x * 255.0).round() as i32;
    assert!(at(16, 16)[..3].iter().all(|&c| (c as i32 - expected).abs() <= 2));
    assert_eq!(at(0, 0), &[0, 0, 0, 255]);
}

#[tokio::test]
async fn failed_builds_keep_the_previous_octree() {
    let Some(ctx) = context().await else { return };
    let mut config = Config::default();
    config.build.min_fragment_capacity = 1024;
    config.build.max_fragment_capacity = 1024;
    let mut app = Application::new(ctx, config, RENDER_TARGET_FORMAT, UVec2::new(16, 16)).unwrap();

    let first = app.load_scene_data(&unit_cube(), 3).unwrap();
    let version = app.octree().version();

    // level 5 needs several thousand fragments
    let err = app.load_scene_data(&unit_cube(), 5).unwrap_err();
    assert!(matches!(err, SvoError::FragmentOverflow { capacity: 1024, .. }));

    let sliver = Triangle::flat([Vec3::ZERO, Vec3::splat(0.5), Vec3::ONE], Vec3::ONE);
    let empty = Scene::from_triangles(vec![sliver]).unwrap();
    assert!(matches!(app.load_scene_data(&empty, 3), Err(SvoError::EmptyScene)));
    assert!(matches!(app.load_scene_data(&unit_cube(), 0), Err(SvoError::InvalidLevel(0))));
    assert!(app.load_scene("/nonexistent/mesh.obj", 3).is_err());

    let info = app.octree_info();
    assert_eq!((info.level, info.range_bytes), (3, first.range_bytes));
    assert_eq!(app.octree().version(), version);

    let target = app.context().create_render_target(16, 16);
    let view = target.create_view(&wgpu::TextureViewDescriptor::default());
    app.draw_frame(&view).unwrap();
    app.wait_idle().unwrap();
}

#[tokio::test]
async fn node_pool_overflow_keeps_the_previous_octree() {
    let Some(ctx) = context().await else { return };
    let mut config = Config::default();
    // room for the 9-node tree at level 1, not for the level 3 shell
    config.build.max_node_pool_bytes = 16 * 20;
    let mut app = Application::new(ctx, config, RENDER_TARGET_FORMAT, UVec2::new(16, 16)).unwrap();

    let first = app.load_scene_data(&unit_cube(), 1).unwrap();
    assert_eq!(first.range_bytes, 9 * 16);
    let version = app.octree().version();

    let err = app.load_scene_data(&unit_cube(), 3).unwrap_err();
    assert!(matches!(err, SvoError::NodePoolOverflow { capacity: 20 }), "{err}");

    let info = app.octree_info();
    assert_eq!((info.level, info.range_bytes), (1, first.range_bytes));
    assert_eq!(app.octree().version(), version);
    let octree = app.read_octree().unwrap().unwrap();
    octree.check_structure().unwrap();
    assert_eq!(octree.leaf_coords().len(), 8);
}

#[tokio::test]
async fn frame_slots_wrap_after_frame_count() {
    let Some(ctx) = context().await else { return };
    let mut frames = FrameManager::new(3);
    assert_eq!(frames.frame_count(), 3);

    let mut used = Vec::new();
    for _ in 0..7 {
        let slot = frames.begin_frame(&ctx).unwrap();
        assert_eq!(slot, frames.current_frame());
        used.push(slot);
        frames.end_frame(ctx.queue.submit(std::iter::empty::<wgpu::CommandBuffer>()));
    }
    assert_eq!(used, [0, 1, 2, 0, 1, 2, 0]);
    assert_eq!(frames.current_frame(), 1);
    assert_eq!(FrameManager::new(0).frame_count(), 1);
}
