//! Conservative triangle rasterization into leaf cells.
//!
//! `voxelize.wgsl` runs the same enumeration per invocation; keep the two
//! in step.

use crate::scene::Triangle;
use glam::{IVec3, Vec3};

/// Box half-size inflation so cells merely touched by float noise still count.
const OVERLAP_EPS: f32 = 1e-5;

/// Axis the triangle is most perpendicular to (largest normal component).
#[inline]
pub fn dominant_axis(n: Vec3) -> usize {
    let a = n.abs();
    if a.x >= a.y && a.x >= a.z {
        0
    } else if a.y >= a.z {
        1
    } else {
        2
    }
}

/// Lowest cell index whose region touches coordinate `x` from above.
#[inline]
fn first_cell(x: f32, res: f32, max_cell: i32) -> i32 {
    ((x * res).ceil() as i32 - 1).clamp(0, max_cell)
}

#[inline]
fn last_cell(x: f32, res: f32, max_cell: i32) -> i32 {
    ((x * res).floor() as i32).clamp(0, max_cell)
}

/// Separating-axis triangle/box test (box centered at `center`, half size
/// `half`). Touching counts as overlap.
pub fn triangle_box_overlap(center: Vec3, half: f32, tri: &[Vec3; 3]) -> bool {
    let v = [tri[0] - center, tri[1] - center, tri[2] - center];

    // box face normals
    let lo = v[0].min(v[1]).min(v[2]);
    let hi = v[0].max(v[1]).max(v[2]);
    if lo.cmpgt(Vec3::splat(half)).any() || hi.cmplt(Vec3::splat(-half)).any() {
        return false;
    }

    // triangle plane
    let n = (v[1] - v[0]).cross(v[2] - v[0]);
    if n.dot(v[0]).abs() > half * n.abs().element_sum() {
        return false;
    }

    // edge × box axis
    let edges = [v[1] - v[0], v[2] - v[1], v[0] - v[2]];
    for e in edges {
        for axis in [Vec3::X, Vec3::Y, Vec3::Z] {
            let a = axis.cross(e);
            let p = [a.dot(v[0]), a.dot(v[1]), a.dot(v[2])];
            let r = half * a.abs().element_sum();
            let pmin = p[0].min(p[1]).min(p[2]);
            let pmax = p[0].max(p[1]).max(p[2]);
            if pmin > r || pmax < -r {
                return false;
            }
        }
    }
    true
}

/// Barycentric weights of `p` projected onto the triangle plane, clamped
/// into the triangle.
pub fn barycentric(p: Vec3, tri: &[Vec3; 3]) -> Vec3 {
    let e0 = tri[1] - tri[0];
    let e1 = tri[2] - tri[0];
    let e2 = p - tri[0];
    let d00 = e0.dot(e0);
    let d01 = e0.dot(e1);
    let d11 = e1.dot(e1);
    let d20 = e2.dot(e0);
    let d21 = e2.dot(e1);
    let denom = d00 * d11 - d01 * d01;
    if denom == 0.0 {
        return Vec3::splat(1.0 / 3.0);
    }
    let b1 = (d11 * d20 - d01 * d21) / denom;
    let b2 = (d00 * d21 - d01 * d20) / denom;
    let w = Vec3::new(1.0 - b1 - b2, b1, b2).max(Vec3::ZERO);
    w / w.element_sum().max(f32::MIN_POSITIVE)
}

/// Interpolated shading normal at `p`, falling back to the face normal.
pub fn interpolate_normal(p: Vec3, tri: &Triangle) -> Vec3 {
    let w = barycentric(p, &tri.positions);
    let n = tri.normals[0] * w.x + tri.normals[1] * w.y + tri.normals[2] * w.z;
    let n = n.normalize_or_zero();
    if n == Vec3::ZERO { tri.face_normal() } else { n }
}

/// Projected footprint of a triangle on its dominant plane.
struct Footprint {
    axis: usize,
    u: usize,
    v: usize,
    lo: IVec3,
    hi: IVec3,
}

fn footprint(tri: &[Vec3; 3], level: u32) -> Option<(Footprint, Vec3)> {
    let n = (tri[1] - tri[0]).cross(tri[2] - tri[0]);
    if n.length_squared() == 0.0 {
        return None;
    }
    let res = (1u32 << level) as f32;
    let max_cell = (1i32 << level) - 1;
    let lo_p = tri[0].min(tri[1]).min(tri[2]);
    let hi_p = tri[0].max(tri[1]).max(tri[2]);
    let axis = dominant_axis(n);
    let lo = IVec3::from_array(lo_p.to_array().map(|x| first_cell(x, res, max_cell)));
    let hi = IVec3::from_array(hi_p.to_array().map(|x| last_cell(x, res, max_cell)));
    Some((
        Footprint {
            axis,
            u: (axis + 1) % 3,
            v: (axis + 2) % 3,
            lo,
            hi,
        },
        n,
    ))
}

/// Upper bound on the cells [`for_each_covered_cell`] can emit. The plane
/// slope along the dominant axis is at most 1 per step on the other axes,
/// so each projected column spans at most four cells.
pub fn coverage_bound(tri: &[Vec3; 3], level: u32) -> u64 {
    match footprint(tri, level) {
        None => 0,
        Some((f, _)) => {
            let cols_u = (f.hi[f.u] - f.lo[f.u] + 2) as u64;
            let cols_v = (f.hi[f.v] - f.lo[f.v] + 2) as u64;
            4 * cols_u * cols_v
        }
    }
}

/// Call `emit` for every leaf cell (at `2^level` per axis) whose region
/// intersects the triangle. Degenerate triangles cover nothing.
pub fn for_each_covered_cell(tri: &[Vec3; 3], level: u32, mut emit: impl FnMut(IVec3)) {
    let Some((f, n)) = footprint(tri, level) else {
        return;
    };
    let res = (1u32 << level) as f32;
    let max_cell = (1i32 << level) - 1;
    let h = 1.0 / res;
    let half = 0.5 * h * (1.0 + OVERLAP_EPS);
    let p0 = tri[0];
    let lo_a = tri[0][f.axis].min(tri[1][f.axis]).min(tri[2][f.axis]);
    let hi_a = tri[0][f.axis].max(tri[1][f.axis]).max(tri[2][f.axis]);
    let depth = |pu: f32, pv: f32| {
        p0[f.axis] - (n[f.u] * (pu - p0[f.u]) + n[f.v] * (pv - p0[f.v])) / n[f.axis]
    };

    for iu in f.lo[f.u]..=f.hi[f.u] {
        for iv in f.lo[f.v]..=f.hi[f.v] {
            let (u0, u1) = (iu as f32 * h, (iu + 1) as f32 * h);
            let (v0, v1) = (iv as f32 * h, (iv + 1) as f32 * h);
            let d = [depth(u0, v0), depth(u1, v0), depth(u0, v1), depth(u1, v1)];
            let dmin = d[0].min(d[1]).min(d[2]).min(d[3]).max(lo_a);
            let dmax = d[0].max(d[1]).max(d[2]).max(d[3]).min(hi_a);
            if dmin > dmax {
                continue;
            }
            for ia in first_cell(dmin, res, max_cell)..=last_cell(dmax, res, max_cell) {
                let mut cell = IVec3::ZERO;
                cell[f.axis] = ia;
                cell[f.u] = iu;
                cell[f.v] = iv;
                let center = (cell.as_vec3() + 0.5) * h;
                if triangle_box_overlap(center, half, tri) {
                    emit(cell);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dominant_axis_prefers_largest_component() {
        assert_eq!(dominant_axis(Vec3::new(0.1, -0.9, 0.2)), 1);
        assert_eq!(dominant_axis(Vec3::new(0.0, 0.0, -1.0)), 2);
        assert_eq!(dominant_axis(Vec3::splat(1.0)), 0);
    }

    #[test]
    fn overlap_counts_touching_boxes() {
        let tri = [Vec3::ZERO, Vec3::X, Vec3::Y];
        assert!(triangle_box_overlap(Vec3::new(0.25, 0.25, 0.5), 0.5, &tri));
        assert!(!triangle_box_overlap(Vec3::new(0.25, 0.25, 0.6), 0.5, &tri));
        assert!(!triangle_box_overlap(Vec3::new(1.5, 1.5, 0.0), 0.4, &tri));
    }

    #[test]
    fn axis_aligned_triangle_covers_its_half_square() {
        // z = 0.3 plane, lower-left half of the unit square, level 2 (4x4)
        let tri = [Vec3::new(0.0, 0.0, 0.3), Vec3::new(1.0, 0.0, 0.3), Vec3::new(0.0, 1.0, 0.3)];
        let mut cells = Vec::new();
        for_each_covered_cell(&tri, 2, |c| cells.push(c));
        assert!(cells.iter().all(|c| c.z == 1));
        // cells whose corner touches the hypotenuse (x + y == 4) count too
        let expected = (0..4)
            .flat_map(|x| (0..4).map(move |y| (x, y)))
            .filter(|(x, y)| x + y <= 4)
            .count();
        assert_eq!(expected, 13);
        assert_eq!(cells.len(), expected);
        assert!(cells.len() as u64 <= coverage_bound(&tri, 2));
    }

    #[test]
    fn sloped_triangle_has_no_gaps() {
        let tri = [Vec3::new(0.05, 0.05, 0.05), Vec3::new(0.95, 0.1, 0.5), Vec3::new(0.2, 0.9, 0.95)];
        let mut cells = std::collections::HashSet::new();
        for_each_covered_cell(&tri, 4, |c| {
            cells.insert(c);
        });
        // Interior samples must only land in emitted cells.
        for i in 1..64 {
            for j in 1..(64 - i) {
                let (a, b) = (i as f32 / 64.0, j as f32 / 64.0);
                let p = tri[0] + (tri[1] - tri[0]) * a + (tri[2] - tri[0]) * b;
                let c = (p * 16.0).floor().as_ivec3().clamp(IVec3::ZERO, IVec3::splat(15));
                assert!(cells.contains(&c), "missing cell {c:?}");
            }
        }
        assert!(cells.len() as u64 <= coverage_bound(&tri, 4));
    }

    #[test]
    fn degenerate_triangle_covers_nothing() {
        let tri = [Vec3::splat(0.5); 3];
        let mut count = 0;
        for_each_covered_cell(&tri, 3, |_| count += 1);
        assert_eq!(count, 0);
        assert_eq!(coverage_bound(&tri, 3), 0);
    }
}
