//! Slot index: maps (dataset, node) to one of N fixed cache slots
//!
//! Slot metadata lives in one arena allocated at construction. Slots that
//! are evictable or free are threaded on a single doubly linked list by
//! array index, with two sentinels at the ends:
//!
//! ```text
//! head -> free ... free -> resident (LRU) ... resident (MRU) -> tail
//! ```
//!
//! Free slots are pushed at the head and resident slots appended at the
//! tail, so popping the head yields a free slot when one exists and the
//! least recently released resident slot otherwise. Acquired and reserved
//! slots are not on the list.
//!
//! The index is a plain owned value; callers share it behind one lock.

use std::collections::HashMap;

use thiserror::Error;

use crate::core::types::{DatasetId, NodeId, SlotId, ViewerId};

/// Lookup failure for slot addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("node {node} of dataset {dataset} is not cached")]
    NotIndexed { dataset: DatasetId, node: NodeId },
    #[error("node {node} of dataset {dataset} is cached but not acquired")]
    NotAcquired { dataset: DatasetId, node: NodeId },
}

/// Lifecycle of a slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// No identity, on the list
    Free,
    /// Held exclusively by a pending load, off the list
    Reserved,
    /// Holds a node, evictable, on the list
    Resident,
    /// Holds a node referenced by at least one viewer, off the list
    Acquired,
}

/// Slot population per state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotCounts {
    pub free: usize,
    pub reserved: usize,
    pub resident: usize,
    pub acquired: usize,
}

impl SlotCounts {
    pub fn total(&self) -> usize {
        self.free + self.reserved + self.resident + self.acquired
    }
}

#[derive(Debug)]
struct SlotMeta {
    state: SlotState,
    identity: Option<(DatasetId, NodeId)>,
    viewers: Vec<ViewerId>,
    prev: usize,
    next: usize,
}

const HEAD: usize = 0;

/// Fixed-capacity slot index
#[derive(Debug)]
pub struct SlotIndex {
    /// Entry 0 is the head sentinel, entry `len - 1` the tail sentinel,
    /// slot `s` lives at `s + 1`.
    meta: Vec<SlotMeta>,
    nodes: HashMap<(DatasetId, NodeId), SlotId>,
    counts: SlotCounts,
}

impl SlotIndex {
    pub fn new(num_slots: usize) -> Self {
        let tail = num_slots + 1;
        let meta = (0..num_slots + 2)
            .map(|i| SlotMeta {
                state: SlotState::Free,
                identity: None,
                viewers: Vec::new(),
                prev: i.saturating_sub(1),
                next: (i + 1).min(tail),
            })
            .collect();

        Self {
            meta,
            nodes: HashMap::with_capacity(num_slots),
            counts: SlotCounts { free: num_slots, ..Default::default() },
        }
    }

    pub fn num_slots(&self) -> usize {
        self.meta.len() - 2
    }

    fn tail(&self) -> usize {
        self.meta.len() - 1
    }

    fn entry(slot: SlotId) -> usize {
        slot as usize + 1
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.meta[i].prev, self.meta[i].next);
        self.meta[prev].next = next;
        self.meta[next].prev = prev;
        self.meta[i].prev = i;
        self.meta[i].next = i;
    }

    fn push_front(&mut self, i: usize) {
        let first = self.meta[HEAD].next;
        self.meta[i].prev = HEAD;
        self.meta[i].next = first;
        self.meta[first].prev = i;
        self.meta[HEAD].next = i;
    }

    fn push_back(&mut self, i: usize) {
        let tail = self.tail();
        let last = self.meta[tail].prev;
        self.meta[i].prev = last;
        self.meta[i].next = tail;
        self.meta[last].next = i;
        self.meta[tail].prev = i;
    }

    fn count_of(counts: &mut SlotCounts, state: SlotState) -> &mut usize {
        match state {
            SlotState::Free => &mut counts.free,
            SlotState::Reserved => &mut counts.reserved,
            SlotState::Resident => &mut counts.resident,
            SlotState::Acquired => &mut counts.acquired,
        }
    }

    fn set_state(&mut self, i: usize, state: SlotState) {
        let old = self.meta[i].state;
        *Self::count_of(&mut self.counts, old) -= 1;
        *Self::count_of(&mut self.counts, state) += 1;
        self.meta[i].state = state;
    }

    /// Take the list head for a new load.
    ///
    /// Evicts the least recently released resident node when no free slot
    /// is left. Returns `None` when every slot is reserved or acquired.
    pub fn reserve_slot(&mut self) -> Option<SlotId> {
        let i = self.meta[HEAD].next;
        if i == self.tail() {
            return None;
        }
        self.unlink(i);

        if let Some(key) = self.meta[i].identity.take() {
            debug_assert_eq!(self.meta[i].state, SlotState::Resident);
            self.nodes.remove(&key);
            log::trace!("Evicting node {} of dataset {} from slot {}", key.1, key.0, i - 1);
        }
        self.set_state(i, SlotState::Reserved);
        Some((i - 1) as SlotId)
    }

    /// Bind a reserved slot to a node once its data is in place.
    pub fn apply_slot(&mut self, slot: SlotId, dataset: DatasetId, node: NodeId) {
        let i = Self::entry(slot);
        assert_eq!(self.meta[i].state, SlotState::Reserved, "apply on slot {slot} that is not reserved");
        let previous = self.nodes.insert((dataset, node), slot);
        assert!(previous.is_none(), "node {node} of dataset {dataset} applied twice");

        self.meta[i].identity = Some((dataset, node));
        self.set_state(i, SlotState::Resident);
        self.push_back(i);
    }

    /// Return a reserved slot whose load was abandoned.
    pub fn unreserve_slot(&mut self, slot: SlotId) {
        let i = Self::entry(slot);
        assert_eq!(self.meta[i].state, SlotState::Reserved, "unreserve on slot {slot} that is not reserved");
        self.set_state(i, SlotState::Free);
        self.push_front(i);
    }

    /// Add `viewer` to the reference set of a cached node, pinning it.
    ///
    /// Panics if the node is not indexed.
    pub fn acquire_slot(&mut self, viewer: ViewerId, dataset: DatasetId, node: NodeId) -> SlotId {
        let slot = match self.nodes.get(&(dataset, node)) {
            Some(&slot) => slot,
            None => panic!("acquire of node {node} of dataset {dataset} which is not cached"),
        };
        let i = Self::entry(slot);
        if self.meta[i].viewers.contains(&viewer) {
            return slot;
        }
        if self.meta[i].viewers.is_empty() {
            self.unlink(i);
            self.set_state(i, SlotState::Acquired);
        }
        self.meta[i].viewers.push(viewer);
        slot
    }

    fn release_viewer(&mut self, viewer: ViewerId, dataset: DatasetId, node: NodeId) -> Option<usize> {
        let slot = match self.nodes.get(&(dataset, node)) {
            Some(&slot) => slot,
            None => panic!("release of node {node} of dataset {dataset} which is not cached"),
        };
        let i = Self::entry(slot);
        let viewers = &mut self.meta[i].viewers;
        let Some(pos) = viewers.iter().position(|&v| v == viewer) else {
            panic!("viewer {viewer:#x} releases node {node} it never acquired");
        };
        viewers.swap_remove(pos);
        viewers.is_empty().then_some(i)
    }

    /// Drop `viewer`'s reference; the last release makes the slot the most
    /// recently used resident.
    pub fn release_slot(&mut self, viewer: ViewerId, dataset: DatasetId, node: NodeId) {
        if let Some(i) = self.release_viewer(viewer, dataset, node) {
            self.set_state(i, SlotState::Resident);
            self.push_back(i);
        }
    }

    /// Like [`release_slot`](Self::release_slot) but the last release also
    /// forgets the node and frees the slot.
    pub fn release_slot_invalidate(&mut self, viewer: ViewerId, dataset: DatasetId, node: NodeId) {
        if let Some(i) = self.release_viewer(viewer, dataset, node) {
            self.nodes.remove(&(dataset, node));
            self.meta[i].identity = None;
            self.set_state(i, SlotState::Free);
            self.push_front(i);
        }
    }

    /// Forget an unreferenced resident node and free its slot.
    ///
    /// Returns false if the node is not indexed or still acquired.
    pub fn invalidate_node(&mut self, dataset: DatasetId, node: NodeId) -> bool {
        let Some(&slot) = self.nodes.get(&(dataset, node)) else {
            return false;
        };
        let i = Self::entry(slot);
        if !self.meta[i].viewers.is_empty() {
            return false;
        }
        self.unlink(i);
        self.nodes.remove(&(dataset, node));
        self.meta[i].identity = None;
        self.set_state(i, SlotState::Free);
        self.push_front(i);
        true
    }

    /// Slot of an acquired node
    pub fn get_slot(&self, dataset: DatasetId, node: NodeId) -> Result<SlotId, SlotError> {
        let slot = *self
            .nodes
            .get(&(dataset, node))
            .ok_or(SlotError::NotIndexed { dataset, node })?;
        if self.meta[Self::entry(slot)].viewers.is_empty() {
            return Err(SlotError::NotAcquired { dataset, node });
        }
        Ok(slot)
    }

    pub fn is_node_indexed(&self, dataset: DatasetId, node: NodeId) -> bool {
        self.nodes.contains_key(&(dataset, node))
    }

    pub fn is_node_acquired(&self, dataset: DatasetId, node: NodeId) -> bool {
        self.get_slot(dataset, node).is_ok()
    }

    /// True when `viewer` holds a reference on the node
    pub fn is_acquired_by(&self, viewer: ViewerId, dataset: DatasetId, node: NodeId) -> bool {
        self.nodes
            .get(&(dataset, node))
            .is_some_and(|&slot| self.meta[Self::entry(slot)].viewers.contains(&viewer))
    }

    pub fn slot_state(&self, slot: SlotId) -> SlotState {
        self.meta[Self::entry(slot)].state
    }

    pub fn counts(&self) -> SlotCounts {
        self.counts
    }

    /// Slots a reservation could still obtain (free or evictable)
    pub fn num_available_slots(&self) -> usize {
        self.counts.free + self.counts.resident
    }

    pub fn num_free_slots(&self) -> usize {
        self.counts.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk the list and check it agrees with the counters
    fn check_list(index: &SlotIndex) {
        let mut on_list = 0;
        let mut i = index.meta[HEAD].next;
        let mut seen_resident = false;
        while i != index.tail() {
            let state = index.meta[i].state;
            assert!(matches!(state, SlotState::Free | SlotState::Resident));
            if state == SlotState::Resident {
                seen_resident = true;
            } else {
                assert!(!seen_resident, "free slot behind a resident one");
            }
            assert_eq!(index.meta[index.meta[i].next].prev, i);
            on_list += 1;
            i = index.meta[i].next;
        }
        let counts = index.counts();
        assert_eq!(on_list, counts.free + counts.resident);
        assert_eq!(counts.total(), index.num_slots());
    }

    fn load(index: &mut SlotIndex, dataset: DatasetId, node: NodeId) -> SlotId {
        let slot = index.reserve_slot().unwrap();
        index.apply_slot(slot, dataset, node);
        slot
    }

    #[test]
    fn test_new_index_is_free() {
        let index = SlotIndex::new(8);
        assert_eq!(index.counts(), SlotCounts { free: 8, ..Default::default() });
        check_list(&index);
    }

    #[test]
    fn test_slot_conservation() {
        let mut index = SlotIndex::new(6);
        let a = load(&mut index, 0, 1);
        let _b = load(&mut index, 0, 2);
        let c = index.reserve_slot().unwrap();
        index.unreserve_slot(c);
        index.acquire_slot(7, 0, 1);
        index.acquire_slot(9, 0, 1);
        load(&mut index, 1, 1);
        check_list(&index);

        let counts = index.counts();
        assert_eq!(counts.reserved, 0);
        assert_eq!(counts.free + counts.resident + counts.acquired, 6);
        assert_eq!(counts.acquired, 1);
        assert_eq!(index.slot_state(a), SlotState::Acquired);

        index.release_slot(7, 0, 1);
        assert_eq!(index.slot_state(a), SlotState::Acquired);
        index.release_slot(9, 0, 1);
        assert_eq!(index.slot_state(a), SlotState::Resident);
        check_list(&index);
        assert_eq!(index.counts().free + index.counts().resident, 6);
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut index = SlotIndex::new(4);
        let slots: Vec<SlotId> = (1..=4).map(|n| load(&mut index, 0, n)).collect();
        assert_eq!(index.num_free_slots(), 0);

        for expected in &slots {
            let evicted = index.reserve_slot().unwrap();
            assert_eq!(evicted, *expected);
        }
        for node in 1..=4 {
            assert!(!index.is_node_indexed(0, node));
        }
        assert!(index.reserve_slot().is_none());
    }

    #[test]
    fn test_free_slots_taken_before_eviction() {
        let mut index = SlotIndex::new(3);
        load(&mut index, 0, 1);
        let s = index.reserve_slot().unwrap();
        index.unreserve_slot(s);

        // Two free slots remain, node 1 survives both reservations
        index.reserve_slot().unwrap();
        index.reserve_slot().unwrap();
        assert!(index.is_node_indexed(0, 1));
        index.reserve_slot().unwrap();
        assert!(!index.is_node_indexed(0, 1));
    }

    #[test]
    fn test_release_refreshes_recency() {
        let mut index = SlotIndex::new(2);
        let a = load(&mut index, 0, 1);
        let b = load(&mut index, 0, 2);

        index.acquire_slot(1, 0, 1);
        index.release_slot(1, 0, 1);

        // Node 1 was released after node 2 was applied
        assert_eq!(index.reserve_slot(), Some(b));
        assert_eq!(index.reserve_slot(), Some(a));
    }

    #[test]
    fn test_acquired_slots_not_evicted() {
        let mut index = SlotIndex::new(2);
        load(&mut index, 0, 1);
        load(&mut index, 0, 2);
        index.acquire_slot(1, 0, 1);
        index.acquire_slot(1, 0, 2);
        assert!(index.reserve_slot().is_none());
        assert_eq!(index.num_available_slots(), 0);
    }

    #[test]
    fn test_get_slot_requires_acquire() {
        let mut index = SlotIndex::new(2);
        assert_eq!(index.get_slot(0, 5), Err(SlotError::NotIndexed { dataset: 0, node: 5 }));

        let slot = load(&mut index, 0, 5);
        assert_eq!(index.get_slot(0, 5), Err(SlotError::NotAcquired { dataset: 0, node: 5 }));

        index.acquire_slot(3, 0, 5);
        assert_eq!(index.get_slot(0, 5), Ok(slot));
        assert!(index.is_acquired_by(3, 0, 5));
        assert!(!index.is_acquired_by(4, 0, 5));

        index.release_slot(3, 0, 5);
        assert_eq!(index.get_slot(0, 5), Err(SlotError::NotAcquired { dataset: 0, node: 5 }));
    }

    #[test]
    fn test_release_invalidate_frees_slot() {
        let mut index = SlotIndex::new(2);
        load(&mut index, 0, 1);
        index.acquire_slot(1, 0, 1);
        index.release_slot_invalidate(1, 0, 1);
        assert!(!index.is_node_indexed(0, 1));
        assert_eq!(index.num_free_slots(), 2);
        check_list(&index);
    }

    #[test]
    fn test_invalidate_unreferenced_node() {
        let mut index = SlotIndex::new(3);
        load(&mut index, 0, 1);
        load(&mut index, 0, 2);
        index.acquire_slot(1, 0, 2);

        assert!(index.invalidate_node(0, 1));
        assert!(!index.is_node_indexed(0, 1));
        // Acquired and unknown nodes stay as they are
        assert!(!index.invalidate_node(0, 2));
        assert!(!index.invalidate_node(0, 9));
        assert!(index.is_node_acquired(0, 2));
        assert_eq!(index.num_free_slots(), 2);
        check_list(&index);
    }

    #[test]
    fn test_double_acquire_same_viewer() {
        let mut index = SlotIndex::new(1);
        load(&mut index, 0, 1);
        index.acquire_slot(1, 0, 1);
        index.acquire_slot(1, 0, 1);
        index.release_slot(1, 0, 1);
        assert!(!index.is_node_acquired(0, 1));
    }

    #[test]
    #[should_panic(expected = "not cached")]
    fn test_acquire_unindexed_panics() {
        let mut index = SlotIndex::new(1);
        index.acquire_slot(1, 0, 0);
    }

    #[test]
    #[should_panic(expected = "not reserved")]
    fn test_double_apply_panics() {
        let mut index = SlotIndex::new(2);
        let slot = load(&mut index, 0, 1);
        index.apply_slot(slot, 0, 2);
    }

    #[test]
    #[should_panic(expected = "applied twice")]
    fn test_duplicate_node_panics() {
        let mut index = SlotIndex::new(2);
        load(&mut index, 0, 1);
        load(&mut index, 0, 1);
    }
}
