//! Priority queue of pending node loads
//!
//! Array-backed binary max-heap with a side index from (dataset, node) to
//! heap position, so a repeated request revises the existing job instead of
//! queueing a duplicate. Jobs handed to a worker move to the loading set
//! until the worker reports back.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::core::config::UpdateMode;
use crate::core::types::{DatasetId, NodeId, SlotId};

/// A request to read one node into a reserved slot
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadJob {
    pub dataset: DatasetId,
    pub node: NodeId,
    /// Reserved destination slot
    pub slot: SlotId,
    /// Larger is more urgent
    pub priority: f32,
}

impl LoadJob {
    pub fn new(dataset: DatasetId, node: NodeId, slot: SlotId, priority: f32) -> Self {
        Self { dataset, node, slot, priority }
    }

    pub fn key(&self) -> (DatasetId, NodeId) {
        (self.dataset, self.node)
    }

    fn outranks(&self, other: &LoadJob) -> bool {
        self.priority.total_cmp(&other.priority) == Ordering::Greater
    }
}

/// Where a node stands with respect to loading
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryResult {
    NotIndexed,
    /// Queued, not yet picked up
    Waiting,
    /// Picked up by a worker
    Loading,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AbortResult {
    /// Removed before any worker took it; its slot is still reserved
    Aborted(LoadJob),
    /// A worker is reading it
    InFlight,
    NotFound,
}

#[derive(Debug)]
pub struct LoadQueue {
    heap: Vec<LoadJob>,
    positions: HashMap<(DatasetId, NodeId), usize>,
    loading: HashSet<(DatasetId, NodeId)>,
    capacity: usize,
    mode: UpdateMode,
}

impl LoadQueue {
    pub fn new(capacity: usize, mode: UpdateMode) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
            loading: HashSet::new(),
            capacity,
            mode,
        }
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    /// Waiting jobs
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn num_loading(&self) -> usize {
        self.loading.len()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() + self.loading.len() >= self.capacity
    }

    /// Queue a job. Returns false if the node is already queued or loading,
    /// or if the queue is full.
    pub fn push_job(&mut self, job: LoadJob) -> bool {
        let key = job.key();
        if self.positions.contains_key(&key) || self.loading.contains(&key) || self.is_full() {
            return false;
        }
        let at = self.heap.len();
        self.heap.push(job);
        self.positions.insert(key, at);
        self.sift_up(at);
        true
    }

    /// Highest priority waiting job without removing it
    pub fn peek(&self) -> Option<&LoadJob> {
        self.heap.first()
    }

    /// Remove the highest priority job and mark it as loading.
    pub fn top_job(&mut self) -> Option<LoadJob> {
        let job = self.remove_at(0)?;
        self.loading.insert(job.key());
        Some(job)
    }

    /// Forget a job a worker has finished, successfully or not.
    pub fn pop_job(&mut self, job: &LoadJob) {
        self.loading.remove(&job.key());
    }

    /// Revise the priority of a waiting job according to the update mode.
    ///
    /// Returns true if the priority changed.
    pub fn update_job(&mut self, dataset: DatasetId, node: NodeId, priority: f32) -> bool {
        let Some(&at) = self.positions.get(&(dataset, node)) else {
            return false;
        };
        let old = self.heap[at].priority;
        let allowed = match self.mode {
            UpdateMode::Never => false,
            UpdateMode::IncrementOnly => priority > old,
            UpdateMode::DecrementOnly => priority < old,
            UpdateMode::Always => priority != old,
        };
        if !allowed {
            return false;
        }
        self.heap[at].priority = priority;
        if priority > old {
            self.sift_up(at);
        } else {
            self.sift_down(at);
        }
        true
    }

    pub fn abort_job(&mut self, dataset: DatasetId, node: NodeId) -> AbortResult {
        if self.loading.contains(&(dataset, node)) {
            return AbortResult::InFlight;
        }
        match self.positions.get(&(dataset, node)) {
            Some(&at) => match self.remove_at(at) {
                Some(job) => AbortResult::Aborted(job),
                None => AbortResult::NotFound,
            },
            None => AbortResult::NotFound,
        }
    }

    pub fn query(&self, dataset: DatasetId, node: NodeId) -> QueryResult {
        if self.loading.contains(&(dataset, node)) {
            QueryResult::Loading
        } else if self.positions.contains_key(&(dataset, node)) {
            QueryResult::Waiting
        } else {
            QueryResult::NotIndexed
        }
    }

    /// Remove every job no worker has started.
    pub fn take_waiting(&mut self) -> Vec<LoadJob> {
        self.positions.clear();
        std::mem::take(&mut self.heap)
    }

    fn remove_at(&mut self, at: usize) -> Option<LoadJob> {
        if at >= self.heap.len() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(at, last);
        let job = self.heap.pop()?;
        self.positions.remove(&job.key());
        if at < self.heap.len() {
            self.sift_down(at);
            self.sift_up(at);
        }
        Some(job)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.positions.insert(self.heap[a].key(), a);
        self.positions.insert(self.heap[b].key(), b);
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if !self.heap[at].outranks(&self.heap[parent]) {
                break;
            }
            self.swap(at, parent);
            at = parent;
        }
    }

    fn sift_down(&mut self, mut at: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * at + 1;
            let right = left + 1;
            let mut largest = at;
            if left < len && self.heap[left].outranks(&self.heap[largest]) {
                largest = left;
            }
            if right < len && self.heap[right].outranks(&self.heap[largest]) {
                largest = right;
            }
            if largest == at {
                break;
            }
            self.swap(at, largest);
            at = largest;
        }
    }
}
