//! Cuts and the published front snapshot

use std::collections::{BTreeSet, HashMap};

use crate::core::types::{DatasetId, NodeId, SlotId, ViewId};
use crate::gpu::TransferDescriptor;
use crate::hierarchy::TreeLayout;

/// Frontier of nodes selected for one (view, dataset) pair
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cut {
    nodes: BTreeSet<NodeId>,
}

impl Cut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root() -> Self {
        Self { nodes: BTreeSet::from([0]) }
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self { nodes: nodes.into_iter().collect() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    /// Nodes in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<NodeId> {
        self.iter().collect()
    }

    /// Replace `node` by its children
    pub fn split(&mut self, node: NodeId, children: impl IntoIterator<Item = NodeId>) {
        self.nodes.remove(&node);
        self.nodes.extend(children);
    }

    /// Replace `children` by their parent
    pub fn collapse(&mut self, parent: NodeId, children: impl IntoIterator<Item = NodeId>) {
        for child in children {
            self.nodes.remove(&child);
        }
        self.nodes.insert(parent);
    }

    /// No member is an ancestor of another
    pub fn is_frontier(&self, layout: &TreeLayout) -> bool {
        self.nodes.iter().all(|&node| {
            let mut current = node;
            while current != 0 {
                current = crate::hierarchy::parent_id(current, layout.fan_factor());
                if self.nodes.contains(&current) {
                    return false;
                }
            }
            true
        })
    }
}

/// A cut member with its resident buffer slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderNode {
    pub node: NodeId,
    pub slot: SlotId,
}

/// Immutable result of one update cycle for a context.
///
/// Published as a whole behind an `Arc`, so readers see either this
/// cycle or another one, never a mixture.
#[derive(Clone, Debug, Default)]
pub struct Front {
    cycle: u64,
    cuts: HashMap<(ViewId, DatasetId), Vec<RenderNode>>,
    transfers: Vec<TransferDescriptor>,
    staging_buffer: usize,
}

impl Front {
    pub fn new(
        cycle: u64,
        cuts: HashMap<(ViewId, DatasetId), Vec<RenderNode>>,
        transfers: Vec<TransferDescriptor>,
        staging_buffer: usize,
    ) -> Self {
        Self { cycle, cuts, transfers, staging_buffer }
    }

    /// Update cycle that produced this front (0 = never updated)
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Draw list of one (view, dataset) pair
    pub fn cut(&self, view: ViewId, dataset: DatasetId) -> Option<&[RenderNode]> {
        self.cuts.get(&(view, dataset)).map(|v| v.as_slice())
    }

    /// Node ids of one pair, ascending
    pub fn cut_nodes(&self, view: ViewId, dataset: DatasetId) -> Vec<NodeId> {
        self.cut(view, dataset)
            .map(|c| c.iter().map(|r| r.node).collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(ViewId, DatasetId), &Vec<RenderNode>)> {
        self.cuts.iter()
    }

    /// Copies pending for this front
    pub fn transfers(&self) -> &[TransferDescriptor] {
        &self.transfers
    }

    /// Which staging buffer the transfers read from
    pub fn staging_buffer(&self) -> usize {
        self.staging_buffer
    }

    /// True when this front needs an upload before drawing
    pub fn is_modified(&self) -> bool {
        !self.transfers.is_empty()
    }

    /// Total nodes over all pairs
    pub fn node_count(&self) -> usize {
        self.cuts.values().map(|c| c.len()).sum()
    }
}
