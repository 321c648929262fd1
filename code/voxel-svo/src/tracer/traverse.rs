//! Host ray traversal and beam pre-pass. `common.wgsl` implements the same
//! arithmetic for the device; keep the two in step.

use super::ViewMode;
use crate::MAX_LEVEL;
use crate::camera::CameraUniform;
use crate::octree::{OctreeData, OctreeNode};
use glam::{BVec3, UVec2, UVec3, Vec3};
use rayon::prelude::*;

/// Ancestor stack depth: one entry per level below the root.
pub const STACK_SIZE: usize = MAX_LEVEL as usize + 1;
/// Direction components smaller than this are nudged to it.
pub const DIR_EPSILON: f32 = 1e-8;
/// Pulled off every beam distance before use.
pub const BEAM_MARGIN: f32 = 1e-3;
/// Beam value of a tile that sees no geometry.
pub const BEAM_NONE: f32 = 1e30;
/// Iteration count rendered as white in [`ViewMode::Iteration`].
pub const ITERATION_SCALE: f32 = 128.0;
pub const BACKGROUND: Vec3 = Vec3::ZERO;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
    /// Pool index of the node that terminated the ray.
    pub node: u32,
    pub t: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TraceResult {
    pub hit: Option<Hit>,
    /// Node visits.
    pub iterations: u32,
}

impl TraceResult {
    fn miss(iterations: u32) -> Self {
        Self { hit: None, iterations }
    }
}

#[inline]
fn safe_dir(d: Vec3) -> Vec3 {
    let nudged = Vec3::select(d.cmplt(Vec3::ZERO), Vec3::splat(-DIR_EPSILON), Vec3::splat(DIR_EPSILON));
    Vec3::select(d.abs().cmplt(Vec3::splat(DIR_EPSILON)), nudged, d)
}

/// Entry and exit parameters of the ray against `[lo, hi]`.
#[inline]
fn slab(origin: Vec3, inv: Vec3, lo: Vec3, hi: Vec3) -> (f32, f32) {
    let a = (lo - origin) * inv;
    let b = (hi - origin) * inv;
    (a.min(b).max_element(), a.max(b).min_element())
}

/// Trace one ray (`dir` normalized, so `t` is distance) through the octree
/// rooted at `[0,1]^3`, starting no earlier than `t_start`.
pub fn trace_ray(data: &OctreeData, origin: Vec3, dir: Vec3, t_start: f32) -> TraceResult {
    let nodes = data.nodes();
    let d = safe_dir(dir);
    let inv = d.recip();
    let (t0, t1) = slab(origin, inv, Vec3::ZERO, Vec3::ONE);
    if t0 > t1 || t1 < 0.0 {
        return TraceResult::miss(0);
    }
    let mut t = t0.max(t_start).max(0.0);
    if t > t1 {
        return TraceResult::miss(0);
    }

    let positive = d.cmpgt(Vec3::ZERO);
    let mut stack = [(0u32, Vec3::ZERO, 0.0f32); STACK_SIZE];
    let mut sp = 0;
    let (mut index, mut lo, mut size) = (0u32, Vec3::ZERO, 1.0f32);
    let mut iterations = 0;

    'visit: loop {
        iterations += 1;
        let Some(node) = nodes.get(index as usize) else {
            return TraceResult::miss(iterations);
        };
        if node.is_leaf() {
            return TraceResult {
                hit: Some(Hit { node: index, t }),
                iterations,
            };
        }
        let half = size * 0.5;
        let t_mid = (lo + half - origin) * inv;
        let far = Vec3::select(positive, lo + size, lo);
        let t_exit = ((far - origin) * inv).min_element();

        // children front to back; `t` strictly increases each step
        while t < t_exit {
            let upper: BVec3 = !(Vec3::splat(t).cmpge(t_mid) ^ positive);
            let child_lo = lo + Vec3::select(upper, Vec3::splat(half), Vec3::ZERO);
            if let Some(child) = node.child_index(upper.bitmask()) {
                if sp == STACK_SIZE {
                    return TraceResult::miss(iterations);
                }
                stack[sp] = (index, lo, size);
                sp += 1;
                (index, lo, size) = (child, child_lo, half);
                continue 'visit;
            }
            let child_far = Vec3::select(positive, child_lo + half, child_lo);
            t = ((child_far - origin) * inv).min_element();
        }

        if sp == 0 {
            return TraceResult::miss(iterations);
        }
        sp -= 1;
        (index, lo, size) = stack[sp];
    }
}

/// Color of a traced ray in `mode`.
pub fn shade(data: &OctreeData, result: &TraceResult, mode: ViewMode) -> Vec3 {
    let node = |hit: &Hit| data.nodes().get(hit.node as usize).copied().unwrap_or(OctreeNode::EMPTY);
    match (mode, &result.hit) {
        (ViewMode::Iteration, _) => Vec3::splat((result.iterations as f32 / ITERATION_SCALE).min(1.0)),
        (_, None) => BACKGROUND,
        (ViewMode::Diffuse, Some(hit)) => node(hit).albedo(),
        (ViewMode::Normal, Some(hit)) => node(hit).normal() * 0.5 + 0.5,
    }
}

// ===============================================================================
// Beam pre-pass
// ===============================================================================

/// Side planes through the eye bounding every ray of one tile.
struct TileFrustum {
    eye: Vec3,
    normals: [Vec3; 4],
}

impl TileFrustum {
    fn new(camera: &CameraUniform, width: u32, height: u32, beam_size: u32, tile: UVec2) -> Self {
        let x0 = tile.x * beam_size;
        let x1 = (x0 + beam_size).min(width);
        let y0 = tile.y * beam_size;
        let y1 = (y0 + beam_size).min(height);
        // pixel edges, not centers, so border rays are strictly inside
        let u0 = x0 as f32 / width as f32 * 2.0 - 1.0;
        let u1 = x1 as f32 / width as f32 * 2.0 - 1.0;
        let v_top = 1.0 - y0 as f32 / height as f32 * 2.0;
        let v_bottom = 1.0 - y1 as f32 / height as f32 * 2.0;

        let corner = |u: f32, v: f32| camera.look.truncate() + camera.side.truncate() * u + camera.up.truncate() * v;
        let c = [
            corner(u0, v_bottom),
            corner(u1, v_bottom),
            corner(u1, v_top),
            corner(u0, v_top),
        ];
        Self {
            eye: camera.position.truncate(),
            normals: std::array::from_fn(|i| c[(i + 1) % 4].cross(c[i])),
        }
    }

    /// Conservative: may accept boxes just outside.
    fn intersects(&self, lo: Vec3, hi: Vec3) -> bool {
        self.normals.iter().all(|n| {
            let p = Vec3::select(n.cmpgt(Vec3::ZERO), hi, lo);
            n.dot(p - self.eye) >= 0.0
        })
    }
}

#[inline]
fn box_distance(p: Vec3, lo: Vec3, hi: Vec3) -> f32 {
    (lo - p).max(p - hi).max(Vec3::ZERO).length()
}

/// World-space size of one pixel per unit distance.
#[inline]
fn pixel_scale(camera: &CameraUniform, width: u32, height: u32) -> f32 {
    let sx = 2.0 * camera.side.truncate().length() / width as f32;
    let sy = 2.0 * camera.up.truncate().length() / height as f32;
    sx.max(sy)
}

/// Safe traversal start distance for every ray in `tile`: no ray of the
/// tile can meet an occupied leaf closer than this.
pub fn beam_distance(
    data: &OctreeData,
    camera: &CameraUniform,
    width: u32,
    height: u32,
    beam_size: u32,
    tile: UVec2,
) -> f32 {
    let frustum = TileFrustum::new(camera, width, height, beam_size, tile);
    let footprint = pixel_scale(camera, width, height) * beam_size as f32;
    let eye = frustum.eye;
    let nodes = data.nodes();

    let mut best = f32::INFINITY;
    let mut stack = vec![(0u32, UVec3::ZERO, 0u32)];
    while let Some((index, cell, depth)) = stack.pop() {
        let size = 1.0 / (1u32 << depth) as f32;
        let lo = cell.as_vec3() * size;
        let hi = lo + size;
        if !frustum.intersects(lo, hi) {
            continue;
        }
        let dist = box_distance(eye, lo, hi);
        if dist >= best {
            continue;
        }
        let Some(node) = nodes.get(index as usize) else {
            continue;
        };
        if node.is_leaf() || size <= dist * footprint {
            best = dist;
            continue;
        }
        let near = eye.cmpgt(lo + size * 0.5).bitmask();
        for k in (0..8u32).rev() {
            let octant = k ^ near;
            if let Some(child) = node.child_index(octant) {
                let offset = UVec3::new(octant & 1, (octant >> 1) & 1, (octant >> 2) & 1);
                stack.push((child, cell * 2 + offset, depth + 1));
            }
        }
    }

    if best.is_finite() {
        (best - BEAM_MARGIN).max(0.0)
    } else {
        BEAM_NONE
    }
}

// ===============================================================================
// Host frame
// ===============================================================================

#[derive(Clone, Copy, Debug)]
pub struct RenderOptions {
    pub view_mode: ViewMode,
    pub beam_enable: bool,
    pub beam_size: u32,
}

/// One rendered frame in host memory, row-major from the top-left pixel.
#[derive(Clone, Debug)]
pub struct HostFrame {
    pub width: u32,
    pub height: u32,
    pub color: Vec<Vec3>,
    pub iterations: Vec<u32>,
}

impl HostFrame {
    pub fn pixel(&self, x: u32, y: u32) -> Vec3 {
        self.color[(y * self.width + x) as usize]
    }

    pub fn to_rgba8(&self) -> Vec<u8> {
        self.color
            .iter()
            .flat_map(|c| {
                let c = (c.clamp(Vec3::ZERO, Vec3::ONE) * 255.0 + 0.5).as_uvec3();
                [c.x as u8, c.y as u8, c.z as u8, 255]
            })
            .collect()
    }
}

/// Pixel-center NDC coordinates of `(x, y)`.
#[inline]
pub fn pixel_ndc(x: u32, y: u32, width: u32, height: u32) -> (f32, f32) {
    let u = (x as f32 + 0.5) / width as f32 * 2.0 - 1.0;
    let v = 1.0 - (y as f32 + 0.5) / height as f32 * 2.0;
    (u, v)
}

/// Render a full frame on the host substrate.
pub fn render_host(
    data: &OctreeData,
    camera: &CameraUniform,
    width: u32,
    height: u32,
    options: &RenderOptions,
) -> HostFrame {
    let beam_size = options.beam_size.max(1);
    let tiles = UVec2::new(width.div_ceil(beam_size), height.div_ceil(beam_size));
    let beam: Vec<f32> = if options.beam_enable {
        (0..tiles.x * tiles.y)
            .into_par_iter()
            .map(|i| beam_distance(data, camera, width, height, beam_size, UVec2::new(i % tiles.x, i / tiles.x)))
            .collect()
    } else {
        Vec::new()
    };

    let origin = camera.position.truncate();
    let (color, iterations) = (0..width * height)
        .into_par_iter()
        .map(|i| {
            let (x, y) = (i % width, i / width);
            let (u, v) = pixel_ndc(x, y, width, height);
            let dir = camera.ray_dir(u, v);
            let t_start = if options.beam_enable {
                beam[((y / beam_size) * tiles.x + x / beam_size) as usize]
            } else {
                0.0
            };
            let result = trace_ray(data, origin, dir, t_start);
            (shade(data, &result, options.view_mode), result.iterations)
        })
        .unzip();

    HostFrame {
        width,
        height,
        color,
        iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack;

    fn single_leaf() -> OctreeData {
        let root = OctreeNode {
            albedo: pack::pack_albedo(Vec3::new(0.2, 0.4, 0.6)),
            normal: pack::pack_normal(Vec3::Z),
            ..OctreeNode::EMPTY
        };
        OctreeData::new(vec![root], 1).unwrap()
    }

    #[test]
    fn slab_handles_inside_origin() {
        let (t0, t1) = slab(Vec3::splat(0.5), Vec3::X.recip(), Vec3::ZERO, Vec3::ONE);
        assert!(t0 < 0.0 && (t1 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn axis_parallel_ray_is_stable() {
        let data = single_leaf();
        let r = trace_ray(&data, Vec3::new(0.5, 0.5, -1.0), Vec3::Z, 0.0);
        assert_eq!(r.iterations, 1);
        assert!((r.hit.unwrap().t - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shading_modes() {
        let data = single_leaf();
        let r = trace_ray(&data, Vec3::new(0.5, 0.5, -1.0), Vec3::Z, 0.0);
        let albedo = shade(&data, &r, ViewMode::Diffuse);
        assert!((albedo - Vec3::new(0.2, 0.4, 0.6)).abs().max_element() < 0.01);
        let normal = shade(&data, &r, ViewMode::Normal);
        assert!((normal - Vec3::new(0.5, 0.5, 1.0)).abs().max_element() < 0.01);
        assert_eq!(shade(&data, &r, ViewMode::Iteration), Vec3::splat(1.0 / ITERATION_SCALE));
        let miss = TraceResult::miss(0);
        assert_eq!(shade(&data, &miss, ViewMode::Diffuse), BACKGROUND);
    }

    #[test]
    fn beam_start_beyond_exit_misses() {
        let data = single_leaf();
        let r = trace_ray(&data, Vec3::new(0.5, 0.5, -1.0), Vec3::Z, BEAM_NONE);
        assert_eq!(r, TraceResult::miss(0));
    }
}
