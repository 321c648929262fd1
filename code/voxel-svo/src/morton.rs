//! Morton (Z-order) keys for leaf coordinates.
//!
//! Bit `3k` of a key is bit `k` of x, `3k+1` of y, `3k+2` of z. A key is
//! therefore a root-to-leaf path: the three bits at position `3(level-1-d)`
//! select the octant entered at depth `d+1`.

use glam::UVec3;

#[inline]
fn spread(v: u32) -> u64 {
    let mut x = (v as u64) & 0x1f_ffff;
    x = (x | x << 32) & 0x001f_0000_0000_ffff;
    x = (x | x << 16) & 0x001f_0000_ff00_00ff;
    x = (x | x << 8) & 0x100f_00f0_0f00_f00f;
    x = (x | x << 4) & 0x10c3_0c30_c30c_30c3;
    x = (x | x << 2) & 0x1249_2492_4924_9249;
    x
}

#[inline]
fn compact(v: u64) -> u32 {
    let mut x = v & 0x1249_2492_4924_9249;
    x = (x | x >> 2) & 0x10c3_0c30_c30c_30c3;
    x = (x | x >> 4) & 0x100f_00f0_0f00_f00f;
    x = (x | x >> 8) & 0x001f_0000_ff00_00ff;
    x = (x | x >> 16) & 0x001f_0000_0000_ffff;
    x = (x | x >> 32) & 0x1f_ffff;
    x as u32
}

pub fn encode(coord: UVec3) -> u64 {
    spread(coord.x) | spread(coord.y) << 1 | spread(coord.z) << 2
}

pub fn decode(key: u64) -> UVec3 {
    UVec3::new(compact(key), compact(key >> 1), compact(key >> 2))
}

/// Octant taken when descending from depth `depth` to `depth + 1` in an
/// octree whose leaves sit at `level`.
#[inline]
pub fn octant_at(key: u64, level: u32, depth: u32) -> u32 {
    ((key >> (3 * (level - 1 - depth))) & 7) as u32
}

/// Split into the two 32-bit words stored in GPU buffers.
#[inline]
pub fn split(key: u64) -> (u32, u32) {
    (key as u32, (key >> 32) as u32)
}

#[inline]
pub fn join(lo: u32, hi: u32) -> u64 {
    lo as u64 | (hi as u64) << 32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_interleaves_axes() {
        assert_eq!(encode(UVec3::new(1, 0, 0)), 0b001);
        assert_eq!(encode(UVec3::new(0, 1, 0)), 0b010);
        assert_eq!(encode(UVec3::new(0, 0, 1)), 0b100);
        assert_eq!(encode(UVec3::new(3, 0, 0)), 0b001_001);
    }

    #[test]
    fn decode_inverts_encode_at_max_level() {
        let max = (1 << crate::MAX_LEVEL) - 1;
        for c in [
            UVec3::ZERO,
            UVec3::new(max, 0, 17),
            UVec3::new(1234, 4000, 7),
            UVec3::splat(max),
        ] {
            assert_eq!(decode(encode(c)), c);
        }
    }

    #[test]
    fn octants_follow_coordinate_bits() {
        // level 3, coord (5, 2, 7) = (101, 010, 111)
        let key = encode(UVec3::new(5, 2, 7));
        assert_eq!(octant_at(key, 3, 0), 1 | 0 << 1 | 1 << 2);
        assert_eq!(octant_at(key, 3, 1), 0 | 1 << 1 | 1 << 2);
        assert_eq!(octant_at(key, 3, 2), 1 | 0 << 1 | 1 << 2);
    }

    #[test]
    fn split_join() {
        let key = encode(UVec3::new(4095, 4095, 4095));
        let (lo, hi) = split(key);
        assert_eq!(join(lo, hi), key);
        assert_ne!(hi, 0);
    }
}
