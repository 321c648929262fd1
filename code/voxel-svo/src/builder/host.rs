//! Host substrate of the octree build. Same passes and data layout as the
//! kernels in `build.wgsl`, with rayon standing in for dispatches.

use crate::error::{Result, SvoError};
use crate::morton;
use crate::octree::{OctreeData, OctreeNode};
use crate::pack;
use crate::voxelizer::VoxelFragment;
use glam::{IVec3, UVec3};
use rayon::prelude::*;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Per-leaf attribute sums, mirrors `LeafAccum` in `build.wgsl`.
#[derive(Default)]
struct LeafAccum {
    albedo: [AtomicU32; 3],
    normal: [AtomicI32; 3],
    count: AtomicU32,
}

impl LeafAccum {
    fn add(&self, fragment: &VoxelFragment) {
        for i in 0..3 {
            self.albedo[i].fetch_add(pack::unorm_byte(fragment.albedo, i), Ordering::Relaxed);
            self.normal[i].fetch_add(pack::snorm_byte(fragment.normal, i), Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn resolve(&self, node: &mut OctreeNode) {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return;
        }
        let albedo = UVec3::from_array(self.albedo.each_ref().map(|a| a.load(Ordering::Relaxed)));
        let normal = IVec3::from_array(self.normal.each_ref().map(|n| n.load(Ordering::Relaxed)));
        node.albedo = pack::pack_albedo(albedo.as_vec3() / (count as f32 * 255.0));
        node.normal = pack::pack_normal(normal.as_vec3().normalize_or_zero());
    }
}

/// Follow `depth` Morton steps from the root.
fn descend(nodes: &[OctreeNode], key: u64, level: u32, depth: u32) -> Option<u32> {
    let mut index = 0u32;
    for d in 0..depth {
        index = nodes.get(index as usize)?.child_index(morton::octant_at(key, level, d))?;
    }
    Some(index)
}

/// Build a linear octree from an unordered fragment list. Fails with
/// [`SvoError::NodePoolOverflow`] rather than writing past `capacity` nodes.
pub fn build_host(fragments: &[VoxelFragment], level: u32, capacity: u64) -> Result<OctreeData> {
    crate::check_level(level)?;
    if capacity == 0 {
        return Err(SvoError::NodePoolOverflow { capacity });
    }
    let mut nodes = vec![OctreeNode::EMPTY];
    let (mut begin, mut end) = (0usize, 1usize);

    for depth in 0..level {
        // flag
        let flags: Vec<AtomicU32> = (begin..end).map(|_| AtomicU32::new(0)).collect();
        fragments.par_iter().for_each(|f| {
            let key = f.key();
            if let Some(node) = descend(&nodes, key, level, depth) {
                let bit = 1 << morton::octant_at(key, level, depth);
                flags[node as usize - begin].fetch_or(bit, Ordering::Relaxed);
            }
        });
        let flags: Vec<u32> = flags.into_iter().map(AtomicU32::into_inner).collect();

        // allocate
        let mut offsets = Vec::with_capacity(flags.len());
        let mut total = 0usize;
        for flag in &flags {
            offsets.push(total);
            total += flag.count_ones() as usize;
        }
        if (end + total) as u64 > capacity {
            return Err(SvoError::NodePoolOverflow { capacity });
        }

        // scatter; new children are already EMPTY
        nodes.resize(end + total, OctreeNode::EMPTY);
        nodes[begin..end]
            .par_iter_mut()
            .zip(flags.par_iter().zip(offsets.par_iter()))
            .for_each(|(node, (&flag, &offset))| {
                if flag != 0 {
                    node.child = (end + offset) as u32;
                    node.mask = flag;
                }
            });

        log::debug!("Level {depth}: {} parents, {total} children", end - begin);
        begin = end;
        end += total;
    }

    // leaves
    let accum: Vec<LeafAccum> = (begin..end).map(|_| LeafAccum::default()).collect();
    fragments.par_iter().for_each(|f| {
        if let Some(leaf) = descend(&nodes, f.key(), level, level) {
            accum[leaf as usize - begin].add(f);
        }
    });
    nodes[begin..end]
        .par_iter_mut()
        .zip(accum.par_iter())
        .for_each(|(node, acc)| acc.resolve(node));

    OctreeData::new(nodes, level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn single_fragment_builds_one_path() {
        let f = VoxelFragment::new(UVec3::new(3, 0, 1), Vec3::Y, Vec3::new(1.0, 0.0, 0.0));
        let tree = build_host(&[f], 2, 64).unwrap();
        assert_eq!(tree.len(), 3);
        tree.check_structure().unwrap();
        // (3,0,1) at level 2: depth0 octant (1,0,0)=1, depth1 octant (1,0,1)=5
        assert_eq!(tree.root().mask, 1 << 1);
        assert_eq!(tree.nodes()[1].mask, 1 << 5);
        let leaf = tree.find_leaf(UVec3::new(3, 0, 1)).unwrap();
        assert_eq!(leaf.albedo, pack::pack_albedo(Vec3::new(1.0, 0.0, 0.0)));
        assert_eq!(leaf.normal(), Vec3::Y);
    }

    #[test]
    fn duplicate_fragments_average() {
        let c = UVec3::new(1, 1, 1);
        let a = VoxelFragment::new(c, Vec3::X, Vec3::new(1.0, 0.0, 0.0));
        let b = VoxelFragment::new(c, Vec3::Y, Vec3::new(0.0, 0.0, 1.0));
        let tree = build_host(&[a, b], 1, 8).unwrap();
        let leaf = tree.find_leaf(c).unwrap();
        let albedo = leaf.albedo();
        assert!((albedo.x - 0.5).abs() < 0.01 && (albedo.z - 0.5).abs() < 0.01);
        let n = leaf.normal();
        assert!((n.x - n.y).abs() < 0.01 && n.z.abs() < 0.01);
    }

    #[test]
    fn no_fragments_leaves_childless_root() {
        let tree = build_host(&[], 4, 16).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.root().is_leaf());
        assert!(tree.is_empty());
    }

    #[test]
    fn pool_overflow_is_reported() {
        let fragments: Vec<_> = (0..8)
            .map(|i| VoxelFragment::new(UVec3::new(i & 1, (i >> 1) & 1, i >> 2), Vec3::Z, Vec3::ONE))
            .collect();
        assert!(matches!(
            build_host(&fragments, 1, 4),
            Err(SvoError::NodePoolOverflow { capacity: 4 })
        ));
        assert_eq!(build_host(&fragments, 1, 9).unwrap().len(), 9);
    }
}
