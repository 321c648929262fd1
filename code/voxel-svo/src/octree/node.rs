use crate::gpu::elem::impl_gpu_element;
use crate::pack;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Child pointer of a node without children.
pub const NULL_CHILD: u32 = u32::MAX;

/// 八叉树节点 (16 字节)
///
/// `child` points at a compacted block holding only the children present in
/// `mask`: child `i` lives at `child + popcount(mask & ((1 << i) - 1))`.
/// Octant `i` is `x | y << 1 | z << 2`.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct OctreeNode {
    pub child: u32,
    pub mask: u32,
    pub albedo: u32,
    pub normal: u32,
}

impl_gpu_element!(OctreeNode, "Node");

impl Default for OctreeNode {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl OctreeNode {
    /// Freshly allocated node: no children, no attachment.
    pub const EMPTY: Self = Self {
        child: NULL_CHILD,
        mask: 0,
        albedo: 0,
        normal: 0,
    };

    #[inline]
    pub fn valid_mask(&self) -> u32 {
        self.mask & 0xff
    }

    /// A node with no children terminates traversal.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.child == NULL_CHILD || self.valid_mask() == 0
    }

    #[inline]
    pub fn has_child(&self, octant: u32) -> bool {
        self.valid_mask() & (1 << octant) != 0
    }

    #[inline]
    pub fn child_count(&self) -> u32 {
        self.valid_mask().count_ones()
    }

    /// Pool index of child `octant`, if present.
    #[inline]
    pub fn child_index(&self, octant: u32) -> Option<u32> {
        if self.is_leaf() || !self.has_child(octant) {
            return None;
        }
        Some(self.child + (self.valid_mask() & ((1 << octant) - 1)).count_ones())
    }

    pub fn albedo(&self) -> Vec3 {
        pack::unpack_albedo(self.albedo)
    }

    pub fn normal(&self) -> Vec3 {
        pack::unpack_normal(self.normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_are_compacted() {
        let node = OctreeNode {
            child: 10,
            mask: 0b1010_0101,
            ..OctreeNode::EMPTY
        };
        assert_eq!(node.child_count(), 4);
        assert_eq!(node.child_index(0), Some(10));
        assert_eq!(node.child_index(1), None);
        assert_eq!(node.child_index(2), Some(11));
        assert_eq!(node.child_index(5), Some(12));
        assert_eq!(node.child_index(7), Some(13));
    }

    #[test]
    fn empty_node_is_leaf() {
        assert!(OctreeNode::EMPTY.is_leaf());
        assert_eq!(OctreeNode::EMPTY.child_index(0), None);
        assert_eq!(std::mem::size_of::<OctreeNode>(), 16);
    }
}
