//! Implicit complete N-ary tree addressing
//!
//! Node 0 is the root. Children of node `i` are `i * fan + 1 ..= i * fan + fan`.
//! Nothing here allocates; ids are plain integers derived from the fan factor.

use thiserror::Error;

use crate::core::types::NodeId;

/// Misuse of tree addressing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("fan factor must be at least 2, got {0}")]
    InvalidFanFactor(u32),
    #[error("node {node} is outside the tree ({count} nodes)")]
    NodeOutOfRange { node: NodeId, count: u32 },
    #[error("child index {index} is outside fan factor {fan_factor}")]
    ChildIndexOutOfRange { index: u32, fan_factor: u32 },
    #[error("root node has no parent")]
    RootHasNoParent,
    #[error("depth {depth} exceeds tree depth {max}")]
    DepthOutOfRange { depth: u32, max: u32 },
}

/// `k`-th child of `id`
#[inline]
pub fn child_id(id: NodeId, k: u32, fan_factor: u32) -> NodeId {
    id * fan_factor + 1 + k
}

/// Parent of `id`. The root maps to itself.
#[inline]
pub fn parent_id(id: NodeId, fan_factor: u32) -> NodeId {
    if id == 0 { 0 } else { (id - 1) / fan_factor }
}

/// Id of the first node on level `depth`
pub fn first_id_of_depth(depth: u32, fan_factor: u32) -> NodeId {
    let mut first: u64 = 0;
    let mut width: u64 = 1;
    for _ in 0..depth {
        first += width;
        width *= fan_factor as u64;
    }
    first as NodeId
}

/// Number of nodes on level `depth`
pub fn length_of_depth(depth: u32, fan_factor: u32) -> u32 {
    (fan_factor as u64).pow(depth) as u32
}

/// Level of `id` (root = 0)
pub fn depth_of_id(id: NodeId, fan_factor: u32) -> u32 {
    let mut depth = 0;
    let mut current = id;
    while current != 0 {
        current = parent_id(current, fan_factor);
        depth += 1;
    }
    depth
}

/// Total nodes of a complete tree with levels `0..=depth`
pub fn node_count_for(fan_factor: u32, depth: u32) -> u64 {
    let mut total: u64 = 0;
    let mut width: u64 = 1;
    for _ in 0..=depth {
        total += width;
        width = width.saturating_mul(fan_factor as u64);
    }
    total
}

/// Shape of a dataset's tree with range-checked navigation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeLayout {
    fan_factor: u32,
    depth: u32,
    node_count: u32,
}

impl TreeLayout {
    pub fn new(fan_factor: u32, depth: u32) -> Result<Self, AddressError> {
        if fan_factor < 2 {
            return Err(AddressError::InvalidFanFactor(fan_factor));
        }
        let count = node_count_for(fan_factor, depth);
        if count > u32::MAX as u64 {
            return Err(AddressError::DepthOutOfRange { depth, max: Self::max_depth(fan_factor) });
        }
        Ok(Self { fan_factor, depth, node_count: count as u32 })
    }

    /// Deepest level whose complete tree still fits in a `NodeId`
    fn max_depth(fan_factor: u32) -> u32 {
        let mut depth = 0;
        while node_count_for(fan_factor, depth + 1) <= u32::MAX as u64 {
            depth += 1;
        }
        depth
    }

    pub fn fan_factor(&self) -> u32 {
        self.fan_factor
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id < self.node_count
    }

    fn check(&self, id: NodeId) -> Result<(), AddressError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(AddressError::NodeOutOfRange { node: id, count: self.node_count })
        }
    }

    pub fn child(&self, id: NodeId, k: u32) -> Result<NodeId, AddressError> {
        self.check(id)?;
        if k >= self.fan_factor {
            return Err(AddressError::ChildIndexOutOfRange { index: k, fan_factor: self.fan_factor });
        }
        let child = id as u64 * self.fan_factor as u64 + 1 + k as u64;
        if child >= self.node_count as u64 {
            return Err(AddressError::NodeOutOfRange { node: id, count: self.node_count });
        }
        Ok(child as NodeId)
    }

    pub fn parent(&self, id: NodeId) -> Result<NodeId, AddressError> {
        self.check(id)?;
        if id == 0 {
            return Err(AddressError::RootHasNoParent);
        }
        Ok(parent_id(id, self.fan_factor))
    }

    /// Children of `id`, empty for leaves
    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>, AddressError> {
        self.check(id)?;
        if self.is_leaf(id) {
            return Ok(Vec::new());
        }
        let first = child_id(id, 0, self.fan_factor);
        Ok((first..first + self.fan_factor).collect())
    }

    /// All children of `id`'s parent, including `id`
    pub fn siblings(&self, id: NodeId) -> Result<Vec<NodeId>, AddressError> {
        let parent = self.parent(id)?;
        self.children(parent)
    }

    pub fn depth_of(&self, id: NodeId) -> Result<u32, AddressError> {
        self.check(id)?;
        Ok(depth_of_id(id, self.fan_factor))
    }

    pub fn first_of_depth(&self, depth: u32) -> Result<NodeId, AddressError> {
        if depth > self.depth {
            return Err(AddressError::DepthOutOfRange { depth, max: self.depth });
        }
        Ok(first_id_of_depth(depth, self.fan_factor))
    }

    pub fn length_of(&self, depth: u32) -> Result<u32, AddressError> {
        if depth > self.depth {
            return Err(AddressError::DepthOutOfRange { depth, max: self.depth });
        }
        Ok(length_of_depth(depth, self.fan_factor))
    }

    /// True when `id` sits on the deepest level
    pub fn is_leaf(&self, id: NodeId) -> bool {
        id >= first_id_of_depth(self.depth, self.fan_factor)
    }

    /// True when `ancestor` lies strictly above `id` on its root path
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = id;
        while current != 0 && current > ancestor {
            current = parent_id(current, self.fan_factor);
            if current == ancestor {
                return true;
            }
        }
        false
    }
}
