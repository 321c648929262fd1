//! Host mirrors of WGSL `pack4x8unorm` / `pack4x8snorm` and their inverses.
//! Fragment and node attachments use these encodings on both substrates.

use glam::{Vec3, Vec4};

#[inline]
pub fn pack_unorm4x8(v: Vec4) -> u32 {
    v.to_array()
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, c)| {
            let q = (0.5 + 255.0 * c.clamp(0.0, 1.0)).floor() as u32;
            acc | (q & 0xff) << (8 * i)
        })
}

#[inline]
pub fn unpack_unorm4x8(p: u32) -> Vec4 {
    Vec4::from_array(std::array::from_fn(|i| ((p >> (8 * i)) & 0xff) as f32 / 255.0))
}

#[inline]
pub fn pack_snorm4x8(v: Vec4) -> u32 {
    v.to_array()
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, c)| {
            let q = (0.5 + 127.0 * c.clamp(-1.0, 1.0)).floor() as i32;
            acc | ((q as u8) as u32) << (8 * i)
        })
}

#[inline]
pub fn unpack_snorm4x8(p: u32) -> Vec4 {
    Vec4::from_array(std::array::from_fn(|i| {
        (((p >> (8 * i)) & 0xff) as u8 as i8 as f32 / 127.0).max(-1.0)
    }))
}

/// Raw signed byte `i` of a snorm word, as accumulated by the leaf pass.
#[inline]
pub fn snorm_byte(p: u32, i: usize) -> i32 {
    ((p >> (8 * i)) & 0xff) as u8 as i8 as i32
}

/// Raw unsigned byte `i` of a unorm word.
#[inline]
pub fn unorm_byte(p: u32, i: usize) -> u32 {
    (p >> (8 * i)) & 0xff
}

pub fn pack_normal(n: Vec3) -> u32 {
    pack_snorm4x8(n.extend(0.0))
}

pub fn unpack_normal(p: u32) -> Vec3 {
    unpack_snorm4x8(p).truncate()
}

pub fn pack_albedo(c: Vec3) -> u32 {
    pack_unorm4x8(c.extend(1.0))
}

pub fn unpack_albedo(p: u32) -> Vec3 {
    unpack_unorm4x8(p).truncate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unorm_matches_wgsl_rounding() {
        let p = pack_unorm4x8(Vec4::new(0.0, 1.0, 0.5, 2.0));
        assert_eq!(p, 0x00 | 0xff << 8 | 0x80 << 16 | 0xff << 24);
        assert!((unpack_unorm4x8(p).z - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn snorm_keeps_sign() {
        let p = pack_normal(Vec3::new(-1.0, 0.0, 1.0));
        assert_eq!(snorm_byte(p, 0), -127);
        assert_eq!(snorm_byte(p, 1), 0);
        assert_eq!(snorm_byte(p, 2), 127);
        assert_eq!(unpack_normal(p), Vec3::new(-1.0, 0.0, 1.0));
    }
}
