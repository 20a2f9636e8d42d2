//! Dataset hierarchy: implicit tree addressing plus per-node bounds
//!
//! A hierarchy is loaded once when a dataset is registered and is
//! immutable afterwards.

pub mod address;
pub mod format;

use std::io::Write;
use std::path::Path;

use glam::DVec3;
use thiserror::Error;

use crate::core::types::{NodeId, Vec3};
use crate::math::Aabb;

pub use address::{
    AddressError, TreeLayout, child_id, depth_of_id, first_id_of_depth, length_of_depth,
    node_count_for, parent_id,
};
pub use format::{FileHeader, HEADER_SIZE, NODE_RECORD_SIZE, NodeRecord};

/// Malformed or unreadable hierarchy file
#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("hierarchy I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("hierarchy truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("header declares {declared} nodes but fan {fan_factor} depth {depth} implies {implied}")]
    NodeCountMismatch { declared: u32, implied: u64, fan_factor: u32, depth: u32 },
    #[error("primitives per node and primitive size must be non-zero")]
    EmptyNodes,
    #[error(transparent)]
    Address(#[from] AddressError),
}

/// Immutable description of one dataset's tree
#[derive(Clone, Debug)]
pub struct Hierarchy {
    layout: TreeLayout,
    primitives_per_node: u32,
    primitive_byte_size: u32,
    translation: DVec3,
    nodes: Vec<NodeRecord>,
}

impl Hierarchy {
    /// Parse a hierarchy from an in-memory file image
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HierarchyError> {
        let header = FileHeader::decode(bytes)?;
        let layout = TreeLayout::new(header.fan_factor, header.depth)?;
        let implied = node_count_for(header.fan_factor, header.depth);
        if implied != header.node_count as u64 {
            return Err(HierarchyError::NodeCountMismatch {
                declared: header.node_count,
                implied,
                fan_factor: header.fan_factor,
                depth: header.depth,
            });
        }
        if header.primitives_per_node == 0 || header.primitive_byte_size == 0 {
            return Err(HierarchyError::EmptyNodes);
        }

        let expected = HEADER_SIZE + header.node_count as usize * NODE_RECORD_SIZE;
        if bytes.len() < expected {
            return Err(HierarchyError::Truncated { expected, found: bytes.len() });
        }

        let nodes = bytes[HEADER_SIZE..expected]
            .chunks_exact(NODE_RECORD_SIZE)
            .map(bytemuck::pod_read_unaligned::<NodeRecord>)
            .collect();

        Ok(Self {
            layout,
            primitives_per_node: header.primitives_per_node,
            primitive_byte_size: header.primitive_byte_size,
            translation: header.translation,
            nodes,
        })
    }

    /// Load a hierarchy file from disk
    pub fn load(path: &Path) -> Result<Self, HierarchyError> {
        let bytes = std::fs::read(path)?;
        let hierarchy = Self::from_bytes(&bytes)?;
        log::debug!(
            "Loaded hierarchy {}: fan {} depth {} ({} nodes, {} bytes/node)",
            path.display(),
            hierarchy.fan_factor(),
            hierarchy.depth(),
            hierarchy.node_count(),
            hierarchy.node_byte_size()
        );
        Ok(hierarchy)
    }

    /// Write in the format read by [`Hierarchy::load`]
    pub fn write(&self, path: &Path) -> Result<(), HierarchyError> {
        let header = FileHeader {
            fan_factor: self.layout.fan_factor(),
            depth: self.layout.depth(),
            node_count: self.layout.node_count(),
            primitives_per_node: self.primitives_per_node,
            primitive_byte_size: self.primitive_byte_size,
            translation: self.translation,
        };
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        file.write_all(&header.encode())?;
        file.write_all(bytemuck::cast_slice(&self.nodes))?;
        file.flush()?;
        Ok(())
    }

    /// Regular subdivision: child `k` takes slab `k` of its parent along the
    /// longest axis and average extent halves per level.
    pub fn regular(
        fan_factor: u32,
        depth: u32,
        root_bounds: Aabb,
        root_extent: f32,
        primitives_per_node: u32,
        primitive_byte_size: u32,
    ) -> Result<Self, HierarchyError> {
        let layout = TreeLayout::new(fan_factor, depth)?;
        if primitives_per_node == 0 || primitive_byte_size == 0 {
            return Err(HierarchyError::EmptyNodes);
        }

        let count = layout.node_count() as usize;
        let mut nodes = Vec::with_capacity(count);
        nodes.push(NodeRecord::new(root_bounds, root_bounds.center(), root_extent, true));
        for id in 1..count as NodeId {
            let parent = &nodes[parent_id(id, fan_factor) as usize];
            let k = (id - 1) % fan_factor;
            let bounds = parent.bounds().slab(k, fan_factor);
            let extent = parent.avg_extent * 0.5;
            nodes.push(NodeRecord::new(bounds, bounds.center(), extent, true));
        }

        Ok(Self {
            layout,
            primitives_per_node,
            primitive_byte_size,
            translation: DVec3::ZERO,
            nodes,
        })
    }

    /// Replace the global translation
    pub fn with_translation(mut self, translation: DVec3) -> Self {
        self.translation = translation;
        self
    }

    /// Mutable access to a node record, for building fixtures
    pub fn record_mut(&mut self, id: NodeId) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(id as usize)
    }

    pub fn layout(&self) -> &TreeLayout {
        &self.layout
    }

    pub fn fan_factor(&self) -> u32 {
        self.layout.fan_factor()
    }

    pub fn depth(&self) -> u32 {
        self.layout.depth()
    }

    pub fn node_count(&self) -> u32 {
        self.layout.node_count()
    }

    pub fn primitives_per_node(&self) -> u32 {
        self.primitives_per_node
    }

    pub fn primitive_byte_size(&self) -> u32 {
        self.primitive_byte_size
    }

    /// Bytes occupied by one node in the primitive stream
    pub fn node_byte_size(&self) -> usize {
        self.primitives_per_node as usize * self.primitive_byte_size as usize
    }

    pub fn translation(&self) -> DVec3 {
        self.translation
    }

    pub fn record(&self, id: NodeId) -> &NodeRecord {
        &self.nodes[id as usize]
    }

    pub fn bounds(&self, id: NodeId) -> Aabb {
        self.record(id).bounds()
    }

    pub fn centroid(&self, id: NodeId) -> Vec3 {
        self.record(id).centroid()
    }

    pub fn avg_extent(&self, id: NodeId) -> f32 {
        self.record(id).avg_extent
    }

    pub fn is_visible(&self, id: NodeId) -> bool {
        self.record(id).is_visible()
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.layout.is_leaf(id)
    }

    /// First child of `id`. Callers check `is_leaf` first.
    pub fn first_child(&self, id: NodeId) -> NodeId {
        child_id(id, 0, self.fan_factor())
    }

    /// Children of a non-leaf node as a contiguous id range
    pub fn child_range(&self, id: NodeId) -> std::ops::Range<NodeId> {
        let first = self.first_child(id);
        first..first + self.fan_factor()
    }
}
