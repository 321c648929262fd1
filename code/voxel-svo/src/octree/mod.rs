//! Linear sparse octree: the live device handle and a host snapshot used for
//! analysis and the host tracer.

mod node;

pub use node::{NULL_CHILD, OctreeNode};

use crate::error::{Result, SvoError};
use crate::gpu::GpuContext;
use crate::morton;
use glam::UVec3;

/// Diagnostics surface exposed to the UI / viewer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OctreeInfo {
    pub level: u32,
    pub range_bytes: u64,
    pub capacity_bytes: u64,
    pub empty: bool,
}

/// One successfully built node pool.
pub struct OctreeVersion {
    buffer: wgpu::Buffer,
    level: u32,
    range_bytes: u64,
    version: u64,
}

/// 运行时八叉树
///
/// Created empty, replaced wholesale by [`update`](Self::update). Every
/// replacement gets a new version so bind groups referencing the previous
/// pool can be rebuilt.
#[derive(Default)]
pub struct Octree {
    current: Option<OctreeVersion>,
    versions: u64,
}

impl Octree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a new node pool. The caller must have drained the device of
    /// work referencing the old one.
    pub fn update(&mut self, buffer: wgpu::Buffer, level: u32, range_bytes: u64) {
        self.versions += 1;
        if let Some(old) = self.current.take() {
            old.buffer.destroy();
        }
        self.current = Some(OctreeVersion {
            buffer,
            level,
            range_bytes,
            version: self.versions,
        });
    }

    pub fn clear(&mut self) {
        if let Some(old) = self.current.take() {
            old.buffer.destroy();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        self.current.as_ref().map(|c| &c.buffer)
    }

    pub fn level(&self) -> u32 {
        self.current.as_ref().map_or(0, |c| c.level)
    }

    pub fn range_bytes(&self) -> u64 {
        self.current.as_ref().map_or(0, |c| c.range_bytes)
    }

    /// Zero while empty.
    pub fn version(&self) -> u64 {
        self.current.as_ref().map_or(0, |c| c.version)
    }

    pub fn info(&self) -> OctreeInfo {
        match &self.current {
            None => OctreeInfo {
                empty: true,
                ..Default::default()
            },
            Some(c) => OctreeInfo {
                level: c.level,
                range_bytes: c.range_bytes,
                capacity_bytes: c.buffer.size(),
                empty: false,
            },
        }
    }

    /// Read the occupied range back into a host snapshot.
    pub fn read_back(&self, ctx: &GpuContext) -> Result<Option<OctreeData>> {
        let Some(c) = &self.current else {
            return Ok(None);
        };
        let count = c.range_bytes / std::mem::size_of::<OctreeNode>() as u64;
        let nodes = ctx.read_buffer::<OctreeNode>(&c.buffer, count)?;
        OctreeData::new(nodes, c.level).map(Some)
    }
}

// ===============================================================================
// Host snapshot
// ===============================================================================

/// Node pool in host memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OctreeData {
    nodes: Vec<OctreeNode>,
    level: u32,
}

impl OctreeData {
    pub fn new(nodes: Vec<OctreeNode>, level: u32) -> Result<Self> {
        crate::check_level(level)?;
        if nodes.is_empty() {
            return Err(SvoError::Execution("octree has no root node".into()));
        }
        Ok(Self { nodes, level })
    }

    pub fn nodes(&self) -> &[OctreeNode] {
        &self.nodes
    }

    pub fn root(&self) -> &OctreeNode {
        &self.nodes[0]
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1 && self.root().is_leaf() && self.root().albedo == 0
    }

    pub fn range_bytes(&self) -> u64 {
        (self.nodes.len() * std::mem::size_of::<OctreeNode>()) as u64
    }

    fn node(&self, index: u32) -> Option<&OctreeNode> {
        self.nodes.get(index as usize)
    }

    /// Depth-first walk from the root; `visit(index, node, depth, coord)`
    /// where `coord` is the node's cell at its own depth.
    pub fn walk(&self, mut visit: impl FnMut(u32, &OctreeNode, u32, UVec3)) {
        let mut stack = vec![(0u32, 0u32, UVec3::ZERO)];
        while let Some((index, depth, coord)) = stack.pop() {
            let Some(node) = self.node(index) else {
                continue;
            };
            visit(index, node, depth, coord);
            if depth >= self.level {
                continue;
            }
            for octant in (0..8).rev() {
                if let Some(child) = node.child_index(octant) {
                    let offset = UVec3::new(octant & 1, (octant >> 1) & 1, (octant >> 2) & 1);
                    stack.push((child, depth + 1, coord * 2 + offset));
                }
            }
        }
    }

    /// Nodes reachable from the root.
    pub fn reachable_count(&self) -> usize {
        let mut count = 0;
        self.walk(|_, _, _, _| count += 1);
        count
    }

    /// `histogram[depth][k]` = number of nodes at `depth` with `k` children.
    pub fn level_histogram(&self) -> Vec<[u64; 9]> {
        let mut histogram = vec![[0u64; 9]; self.level as usize + 1];
        self.walk(|_, node, depth, _| {
            let k = if node.is_leaf() { 0 } else { node.child_count() };
            histogram[depth as usize][k as usize] += 1;
        });
        histogram
    }

    /// Leaf at `coord` (leaf resolution), if populated.
    pub fn find_leaf(&self, coord: UVec3) -> Option<&OctreeNode> {
        let key = morton::encode(coord);
        let mut index = 0;
        for depth in 0..self.level {
            index = self.node(index)?.child_index(morton::octant_at(key, self.level, depth))?;
        }
        self.node(index)
    }

    /// Coordinates of every populated leaf at full depth, in Morton order.
    pub fn leaf_coords(&self) -> Vec<UVec3> {
        let mut coords = Vec::new();
        self.walk(|_, _, depth, coord| {
            if depth == self.level {
                coords.push(coord);
            }
        });
        coords
    }

    /// Tree-shape check: every child pointer lands in the pool, no node is
    /// reached twice and every pool slot is reachable.
    pub fn check_structure(&self) -> std::result::Result<(), String> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![0u32];
        while let Some(index) = stack.pop() {
            let slot = seen
                .get_mut(index as usize)
                .ok_or_else(|| format!("child pointer {index} outside pool of {}", self.nodes.len()))?;
            if *slot {
                return Err(format!("node {index} reached twice"));
            }
            *slot = true;
            let node = &self.nodes[index as usize];
            stack.extend((0..8).filter_map(|o| node.child_index(o)));
        }
        match seen.iter().position(|s| !s) {
            Some(i) => Err(format!("node {i} unreachable from the root")),
            None => Ok(()),
        }
    }
}
