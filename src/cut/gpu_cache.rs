//! Residency of nodes in a context's resident GPU buffer
//!
//! Same slot index as the host cache, sized by the render budget. Newly
//! registered nodes are queued for transfer; the transfer budget caps how
//! many may be registered per cycle.

use std::collections::BTreeSet;

use crate::core::types::{DatasetId, NodeId, SlotId, ViewId};
use crate::streaming::{NodeBudget, SlotCounts, SlotError, SlotIndex};

/// A node waiting to be copied into its resident slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingTransfer {
    pub slot: SlotId,
    pub dataset: DatasetId,
    pub node: NodeId,
}

#[derive(Debug)]
pub struct GpuCache {
    index: SlotIndex,
    transfer_budget: NodeBudget,
    transfers: BTreeSet<PendingTransfer>,
}

impl GpuCache {
    pub fn new(render_budget: usize) -> Self {
        Self {
            index: SlotIndex::new(render_budget),
            transfer_budget: NodeBudget::new(0),
            transfers: BTreeSet::new(),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.index.num_slots()
    }

    /// Start a cycle's budget. Transfers carried over from the last cycle
    /// count against it.
    pub fn reset_transfer_budget(&mut self, budget: usize) {
        self.transfer_budget = NodeBudget::new(budget);
        self.transfer_budget.try_take(self.transfers.len().min(budget));
    }

    /// Registrations still allowed this cycle
    pub fn transfer_budget(&self) -> usize {
        self.transfer_budget.remaining()
    }

    pub fn is_node_resident(&self, dataset: DatasetId, node: NodeId) -> bool {
        self.index.is_node_indexed(dataset, node)
    }

    pub fn is_node_acquired(&self, dataset: DatasetId, node: NodeId) -> bool {
        self.index.is_node_acquired(dataset, node)
    }

    /// Slots that can still be handed out (free or evictable)
    pub fn num_available_slots(&self) -> usize {
        self.index.num_available_slots()
    }

    /// Give `node` a resident slot and queue its transfer.
    ///
    /// Returns `None` when the transfer budget is spent or every slot is
    /// pinned.
    pub fn register_node(&mut self, dataset: DatasetId, node: NodeId) -> Option<SlotId> {
        if self.index.is_node_indexed(dataset, node) {
            return None;
        }
        if !self.transfer_budget.try_take(1) {
            return None;
        }
        let Some(slot) = self.index.reserve_slot() else {
            self.transfer_budget.give_back(1);
            return None;
        };
        // A slot reused from an evicted node must not be copied for it
        self.transfers.retain(|t| t.slot != slot);
        self.index.apply_slot(slot, dataset, node);
        self.transfers.insert(PendingTransfer { slot, dataset, node });
        Some(slot)
    }

    pub fn acquire(&mut self, view: ViewId, dataset: DatasetId, node: NodeId) -> SlotId {
        self.index.acquire_slot(view, dataset, node)
    }

    pub fn release(&mut self, view: ViewId, dataset: DatasetId, node: NodeId) {
        self.index.release_slot(view, dataset, node);
    }

    pub fn is_acquired_by(&self, view: ViewId, dataset: DatasetId, node: NodeId) -> bool {
        self.index.is_acquired_by(view, dataset, node)
    }

    /// Slot of an acquired node
    pub fn slot_of(&self, dataset: DatasetId, node: NodeId) -> Result<SlotId, SlotError> {
        self.index.get_slot(dataset, node)
    }

    /// Forget a node nobody acquired, dropping its queued transfer.
    pub fn invalidate(&mut self, dataset: DatasetId, node: NodeId) -> bool {
        if !self.index.invalidate_node(dataset, node) {
            return false;
        }
        self.transfers.retain(|t| (t.dataset, t.node) != (dataset, node));
        true
    }

    /// Queue a transfer again for the next cycle
    pub fn requeue_transfer(&mut self, transfer: PendingTransfer) {
        self.transfers.insert(transfer);
    }

    /// Hand over this cycle's transfers in slot order
    pub fn take_transfers(&mut self) -> Vec<PendingTransfer> {
        std::mem::take(&mut self.transfers).into_iter().collect()
    }

    pub fn counts(&self) -> SlotCounts {
        self.index.counts()
    }
}
