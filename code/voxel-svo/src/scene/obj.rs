//! Minimal Wavefront OBJ reader: `v`, `vn`, `f` (polygons are fanned),
//! `usemtl`, and `Kd` colors from `mtllib` files.

use super::{DEFAULT_ALBEDO, Triangle};
use glam::Vec3;
use std::collections::HashMap;

fn parse_vec3<'a>(mut it: impl Iterator<Item = &'a str>, line: usize) -> Result<Vec3, String> {
    let mut v = [0.0f32; 3];
    for c in &mut v {
        *c = it
            .next()
            .ok_or_else(|| format!("line {line}: expected 3 components"))?
            .parse()
            .map_err(|e| format!("line {line}: {e}"))?;
    }
    Ok(Vec3::from_array(v))
}

/// OBJ indices are 1-based; negative values count back from the end.
fn resolve_index(token: &str, len: usize, line: usize) -> Result<usize, String> {
    let i: i64 = token.parse().map_err(|e| format!("line {line}: bad index {token:?}: {e}"))?;
    let idx = if i > 0 { i - 1 } else { len as i64 + i };
    if idx < 0 || idx as usize >= len {
        return Err(format!("line {line}: index {i} out of range"));
    }
    Ok(idx as usize)
}

fn parse_mtl(text: &str, out: &mut HashMap<String, Vec3>) {
    let mut current: Option<String> = None;
    for (n, raw) in text.lines().enumerate() {
        let mut it = raw.split_whitespace();
        match it.next() {
            Some("newmtl") => current = it.next().map(str::to_owned),
            Some("Kd") => {
                if let (Some(name), Ok(kd)) = (&current, parse_vec3(it, n + 1)) {
                    out.insert(name.clone(), kd);
                }
            }
            _ => {}
        }
    }
}

/// Parse OBJ text. `load_mtl` resolves `mtllib` names to file contents;
/// missing libraries fall back to [`DEFAULT_ALBEDO`].
pub fn parse_obj(
    text: &str,
    load_mtl: impl Fn(&str) -> Option<String>,
) -> Result<Vec<Triangle>, String> {
    let mut positions = Vec::new();
    let mut normals = Vec::new();
    let mut materials = HashMap::new();
    let mut albedo = DEFAULT_ALBEDO;
    let mut triangles = Vec::new();

    for (n, raw) in text.lines().enumerate() {
        let line = n + 1;
        let raw = raw.split('#').next().unwrap_or("");
        let mut it = raw.split_whitespace();
        match it.next() {
            Some("v") => positions.push(parse_vec3(it, line)?),
            Some("vn") => normals.push(parse_vec3(it, line)?.normalize_or_zero()),
            Some("mtllib") => {
                for lib in it {
                    match load_mtl(lib) {
                        Some(mtl) => parse_mtl(&mtl, &mut materials),
                        None => log::warn!("mtllib {lib} not found, using default albedo"),
                    }
                }
            }
            Some("usemtl") => {
                albedo = it
                    .next()
                    .and_then(|name| materials.get(name).copied())
                    .unwrap_or(DEFAULT_ALBEDO);
            }
            Some("f") => {
                let mut corners = Vec::with_capacity(4);
                for vert in it {
                    let mut refs = vert.split('/');
                    let p = resolve_index(refs.next().unwrap_or(""), positions.len(), line)?;
                    let vn = match refs.nth(1) {
                        Some(t) if !t.is_empty() => {
                            Some(resolve_index(t, normals.len(), line)?)
                        }
                        _ => None,
                    };
                    corners.push((p, vn));
                }
                if corners.len() < 3 {
                    return Err(format!("line {line}: face with {} vertices", corners.len()));
                }
                for k in 1..corners.len() - 1 {
                    let tri = [corners[0], corners[k], corners[k + 1]];
                    let pos = tri.map(|(p, _)| positions[p]);
                    let mut t = Triangle::flat(pos, albedo);
                    if tri.iter().all(|(_, vn)| vn.is_some()) {
                        t.normals = tri.map(|(_, vn)| vn.map_or(Vec3::ZERO, |i| normals[i]));
                    }
                    triangles.push(t);
                }
            }
            _ => {}
        }
    }
    Ok(triangles)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = "\
mtllib quad.mtl
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vn 0 0 2
usemtl red
f 1//1 2//1 3//1 4//1
";

    #[test]
    fn fans_polygons_and_reads_materials() {
        let tris = parse_obj(QUAD, |name| {
            assert_eq!(name, "quad.mtl");
            Some("newmtl red\nKd 1 0 0\n".to_string())
        })
        .unwrap();
        assert_eq!(tris.len(), 2);
        assert_eq!(tris[0].albedo, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(tris[1].positions[2], Vec3::new(0.0, 1.0, 0.0));
        assert_eq!(tris[0].normals[0], Vec3::Z);
    }

    #[test]
    fn negative_indices_and_missing_mtl() {
        let text = "v 0 0 0\nv 1 0 0\nv 0 1 0\nf -3 -2 -1\n";
        let tris = parse_obj(text, |_| None).unwrap();
        assert_eq!(tris.len(), 1);
        assert_eq!(tris[0].albedo, DEFAULT_ALBEDO);
        assert_eq!(tris[0].normals[0], Vec3::Z);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        assert!(parse_obj("v 0 0 0\nf 1 2 3\n", |_| None).is_err());
    }
}
