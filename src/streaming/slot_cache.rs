//! Host-side out-of-core node cache
//!
//! Combines the slot index, the slot arena and the loader pool. Requests
//! and completion draining are serialized by one bookkeeping lock so a
//! node is never queued twice; readers (acquire/release/data access) only
//! take the index lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::load_queue::{AbortResult, LoadJob, QueryResult};
use super::loader_pool::{LoadOutcome, LoaderPool, LoaderStats, SlotArena};
use super::slot_index::{SlotCounts, SlotError, SlotIndex};
use crate::core::config::StreamingConfig;
use crate::core::error::Error;
use crate::core::types::{DatasetId, NodeId, Result, ViewerId};
use crate::dataset::DatasetRegistry;

/// Answer to a residency request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Data is in a slot
    Resident,
    /// A load was queued by this call
    Requested,
    /// A load was already queued or running
    Pending,
    /// No slot or queue capacity left this time
    Exhausted,
    /// Failed too often, no longer requested
    Unavailable,
}

/// Completions applied by one refresh
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub applied: usize,
    pub failed: usize,
    pub flushed: usize,
}

#[derive(Debug, Default)]
struct Bookkeeping {
    failures: HashMap<(DatasetId, NodeId), u32>,
    refreshes: u32,
}

pub struct SlotCache {
    index: Mutex<SlotIndex>,
    pool: LoaderPool,
    book: Mutex<Bookkeeping>,
    max_retries: u32,
    maintenance_interval: u32,
}

impl SlotCache {
    /// Create a cache of `num_slots` slots of `slot_bytes` each and start
    /// its loader threads.
    pub fn new(
        num_slots: usize,
        slot_bytes: usize,
        config: &StreamingConfig,
        registry: Arc<DatasetRegistry>,
    ) -> Result<Self> {
        if num_slots == 0 {
            return Err(Error::Config(format!(
                "host budget of {} MB holds no {} byte node",
                config.host_budget_mb, slot_bytes
            )));
        }
        let arena = Arc::new(SlotArena::new(num_slots, slot_bytes));
        let pool = LoaderPool::new(config.loader_threads, config.queue_update_mode, registry, arena)?;

        log::info!(
            "Host cache: {} slots x {} bytes ({:.1} MB)",
            num_slots,
            slot_bytes,
            (num_slots * slot_bytes) as f64 / (1024.0 * 1024.0)
        );

        Ok(Self {
            index: Mutex::new(SlotIndex::new(num_slots)),
            pool,
            book: Mutex::new(Bookkeeping::default()),
            max_retries: config.max_load_retries,
            maintenance_interval: config.queue_maintenance_interval,
        })
    }

    fn index(&self) -> MutexGuard<'_, SlotIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn book(&self) -> MutexGuard<'_, Bookkeeping> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn num_slots(&self) -> usize {
        self.pool.arena().num_slots()
    }

    pub fn slot_bytes(&self) -> usize {
        self.pool.arena().slot_bytes()
    }

    /// Make sure a node is resident or on its way.
    ///
    /// A queued request has its priority revised instead of being
    /// duplicated.
    pub fn register_node(&self, dataset: DatasetId, node: NodeId, priority: f32) -> RequestState {
        let book = self.book();
        if self.index().is_node_indexed(dataset, node) {
            return RequestState::Resident;
        }
        if book.failures.get(&(dataset, node)).is_some_and(|&n| n >= self.max_retries) {
            return RequestState::Unavailable;
        }

        match self.pool.query(dataset, node) {
            QueryResult::Waiting => {
                self.pool.update(dataset, node, priority);
                RequestState::Pending
            }
            QueryResult::Loading => RequestState::Pending,
            QueryResult::NotIndexed => {
                let Some(slot) = self.index().reserve_slot() else {
                    return RequestState::Exhausted;
                };
                if self.pool.request(LoadJob::new(dataset, node, slot, priority)) {
                    RequestState::Requested
                } else {
                    self.index().unreserve_slot(slot);
                    RequestState::Exhausted
                }
            }
        }
    }

    /// Apply finished loads to the index.
    pub fn refresh(&self) -> RefreshSummary {
        let mut book = self.book();
        let mut summary = RefreshSummary::default();

        for outcome in self.pool.drain_completions() {
            match outcome {
                LoadOutcome::Loaded(job) => {
                    self.index().apply_slot(job.slot, job.dataset, job.node);
                    self.pool.finish(&job);
                    book.failures.remove(&job.key());
                    summary.applied += 1;
                }
                LoadOutcome::Failed { job, error } => {
                    self.index().unreserve_slot(job.slot);
                    self.pool.finish(&job);
                    let count = book.failures.entry(job.key()).or_insert(0);
                    *count += 1;
                    summary.failed += 1;
                    if *count >= self.max_retries {
                        log::warn!(
                            "Giving up on node {} of dataset {} after {} failed loads: {}",
                            job.node, job.dataset, count, error
                        );
                    } else {
                        log::warn!("Failed to load node {} of dataset {}: {}", job.node, job.dataset, error);
                    }
                }
            }
        }

        book.refreshes = book.refreshes.wrapping_add(1);
        if self.maintenance_interval > 0 && book.refreshes % self.maintenance_interval == 0 {
            let waiting = self.pool.take_waiting();
            if !waiting.is_empty() {
                let mut index = self.index();
                for job in &waiting {
                    index.unreserve_slot(job.slot);
                }
                log::debug!("Flushed {} queued loads", waiting.len());
            }
            summary.flushed = waiting.len();
        }

        if summary.applied + summary.failed > 0 {
            log::trace!("Cache refresh: {} applied, {} failed", summary.applied, summary.failed);
        }
        summary
    }

    /// Refresh until no load is queued or running, or `timeout` passes.
    /// Returns true when the pool went idle.
    pub fn flush(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            self.refresh();
            if self.pool.num_jobs() == 0 {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Cancel a queued load. Loads already being read cannot be cancelled.
    pub fn abort(&self, dataset: DatasetId, node: NodeId) -> bool {
        let _book = self.book();
        match self.pool.abort(dataset, node) {
            AbortResult::Aborted(job) => {
                self.index().unreserve_slot(job.slot);
                true
            }
            AbortResult::InFlight | AbortResult::NotFound => false,
        }
    }

    pub fn query(&self, dataset: DatasetId, node: NodeId) -> QueryResult {
        self.pool.query(dataset, node)
    }

    pub fn is_node_resident(&self, dataset: DatasetId, node: NodeId) -> bool {
        self.index().is_node_indexed(dataset, node)
    }

    pub fn is_node_acquired(&self, dataset: DatasetId, node: NodeId) -> bool {
        self.index().is_node_acquired(dataset, node)
    }

    pub fn is_unavailable(&self, dataset: DatasetId, node: NodeId) -> bool {
        self.book().failures.get(&(dataset, node)).is_some_and(|&n| n >= self.max_retries)
    }

    /// Pin a node for `viewer` if it is resident. Returns false otherwise.
    pub fn try_acquire(&self, viewer: ViewerId, dataset: DatasetId, node: NodeId) -> bool {
        let mut index = self.index();
        if !index.is_node_indexed(dataset, node) {
            return false;
        }
        index.acquire_slot(viewer, dataset, node);
        true
    }

    pub fn release(&self, viewer: ViewerId, dataset: DatasetId, node: NodeId) {
        self.index().release_slot(viewer, dataset, node);
    }

    /// Read the data of an acquired node
    pub fn with_node_data<R>(
        &self,
        dataset: DatasetId,
        node: NodeId,
        f: impl FnOnce(&[u8]) -> R,
    ) -> std::result::Result<R, SlotError> {
        let slot = self.index().get_slot(dataset, node)?;
        Ok(self.pool.arena().with_slot(slot, f))
    }

    pub fn counts(&self) -> SlotCounts {
        self.index().counts()
    }

    pub fn num_available_slots(&self) -> usize {
        self.index().num_available_slots()
    }

    pub fn stats(&self) -> LoaderStats {
        self.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::testing;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn cache_for(dir: &std::path::Path, slots: usize, config: StreamingConfig) -> (SlotCache, usize) {
        let fixture = testing::write_fixture(dir, "cache", 4, 2, 4, 4);
        let node_bytes = fixture.hierarchy.node_byte_size();
        let registry = Arc::new(DatasetRegistry::new());
        registry.register(&fixture.hierarchy_path, &fixture.stream_path).unwrap();
        (SlotCache::new(slots, node_bytes, &config, registry).unwrap(), node_bytes)
    }

    #[test]
    fn test_register_load_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, node_bytes) = cache_for(dir.path(), 8, StreamingConfig::default());

        assert_eq!(cache.register_node(0, 3, 1.0), RequestState::Requested);
        assert_eq!(cache.register_node(0, 3, 2.0), RequestState::Pending);
        assert!(cache.flush(TIMEOUT));
        assert_eq!(cache.register_node(0, 3, 1.0), RequestState::Resident);

        assert_eq!(
            cache.with_node_data(0, 3, |b| b.len()),
            Err(SlotError::NotAcquired { dataset: 0, node: 3 })
        );
        assert!(cache.try_acquire(1, 0, 3));
        let data = cache.with_node_data(0, 3, |b| b.to_vec()).unwrap();
        assert_eq!(data, testing::node_pattern(3, node_bytes));
        cache.release(1, 0, 3);
        assert_eq!(cache.stats().jobs_completed, 1);
    }

    #[test]
    fn test_exhausted_when_all_acquired() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_for(dir.path(), 2, StreamingConfig::default());

        cache.register_node(0, 1, 1.0);
        cache.register_node(0, 2, 1.0);
        assert!(cache.flush(TIMEOUT));
        assert!(cache.try_acquire(1, 0, 1));
        assert!(cache.try_acquire(1, 0, 2));
        assert_eq!(cache.register_node(0, 3, 1.0), RequestState::Exhausted);

        // Releasing makes the node evictable again
        cache.release(1, 0, 1);
        assert_eq!(cache.register_node(0, 3, 1.0), RequestState::Requested);
        assert!(cache.flush(TIMEOUT));
        assert!(!cache.is_node_resident(0, 1));
        assert!(cache.is_node_resident(0, 3));
    }

    #[test]
    fn test_failures_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let config = StreamingConfig { max_load_retries: 2, ..Default::default() };
        let (cache, _) = cache_for(dir.path(), 4, config);

        // Dataset 5 is not registered, so every read fails
        for _ in 0..2 {
            assert_eq!(cache.register_node(5, 0, 1.0), RequestState::Requested);
            assert!(cache.flush(TIMEOUT));
        }
        assert!(cache.is_unavailable(5, 0));
        assert_eq!(cache.register_node(5, 0, 1.0), RequestState::Unavailable);
        // Failed reservations went back to the free list
        assert_eq!(cache.counts().free, 4);
    }

    #[test]
    fn test_try_acquire_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_for(dir.path(), 2, StreamingConfig::default());
        assert!(!cache.try_acquire(1, 0, 0));
    }

    #[test]
    fn test_zero_slots_rejected() {
        let registry = Arc::new(DatasetRegistry::new());
        let result = SlotCache::new(0, 64, &StreamingConfig::default(), registry);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_maintenance_flushes_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let config = StreamingConfig { queue_maintenance_interval: 1, ..Default::default() };
        let (cache, _) = cache_for(dir.path(), 8, config);

        for node in 0..8 {
            cache.register_node(0, node, node as f32);
        }
        // Whatever was still queued is dropped and its slot freed
        let summary = cache.refresh();
        assert!(cache.flush(TIMEOUT));
        let counts = cache.counts();
        assert_eq!(counts.reserved, 0);
        assert_eq!(counts.free + counts.resident, 8);
        assert!(summary.flushed <= 8);
    }
}
