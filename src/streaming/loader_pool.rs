//! Worker threads reading nodes from disk into reserved slots
//!
//! Workers block on a counting signal raised once per accepted job, pop
//! the most urgent job and read it from the dataset's primitive stream
//! straight into the job's reserved slot. Outcomes go over a bounded channel to a
//! single consumer, which applies them to the slot index; workers never
//! touch the index themselves.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use super::load_queue::{AbortResult, LoadJob, LoadQueue, QueryResult};
use super::stream_file::PrimitiveStream;
use crate::core::config::UpdateMode;
use crate::core::types::{DatasetId, NodeId, SlotId};
use crate::dataset::DatasetRegistry;

/// Host memory backing the cache slots, one lock per slot
#[derive(Debug)]
pub struct SlotArena {
    slots: Vec<Mutex<Box<[u8]>>>,
    slot_bytes: usize,
}

impl SlotArena {
    pub fn new(num_slots: usize, slot_bytes: usize) -> Self {
        let slots = (0..num_slots)
            .map(|_| Mutex::new(vec![0u8; slot_bytes].into_boxed_slice()))
            .collect();
        Self { slots, slot_bytes }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    fn lock(&self, slot: SlotId) -> MutexGuard<'_, Box<[u8]>> {
        // A panic while reading leaves plain bytes behind, safe to reuse
        self.slots[slot as usize].lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` over the bytes of `slot`
    pub fn with_slot<R>(&self, slot: SlotId, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.lock(slot);
        f(&guard)
    }
}

/// Result of one job, reported to the cache
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(LoadJob),
    Failed { job: LoadJob, error: io::Error },
}

impl LoadOutcome {
    pub fn job(&self) -> &LoadJob {
        match self {
            LoadOutcome::Loaded(job) => job,
            LoadOutcome::Failed { job, .. } => job,
        }
    }
}

/// Snapshot of loader counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub bytes_loaded: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_loaded: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
}

/// Counting signal with shutdown
#[derive(Debug, Default)]
struct Semaphore {
    state: Mutex<(usize, bool)>,
    cond: Condvar,
}

impl Semaphore {
    fn post(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.0 += 1;
        self.cond.notify_one();
    }

    /// Block until a post is available. Returns false on shutdown.
    fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if state.1 {
                return false;
            }
            if state.0 > 0 {
                state.0 -= 1;
                return true;
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.1 = true;
        self.cond.notify_all();
    }
}

struct Shared {
    queue: Mutex<LoadQueue>,
    signal: Semaphore,
    registry: Arc<DatasetRegistry>,
    arena: Arc<SlotArena>,
    counters: Counters,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, LoadQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed pool of disk loader threads
pub struct LoaderPool {
    shared: Arc<Shared>,
    completions: Receiver<LoadOutcome>,
    workers: Vec<JoinHandle<()>>,
}

impl LoaderPool {
    /// Spawn `num_threads` workers writing into `arena`.
    ///
    /// The queue and completion channel are bounded by the slot count,
    /// which also bounds the number of jobs in flight.
    pub fn new(
        num_threads: usize,
        mode: UpdateMode,
        registry: Arc<DatasetRegistry>,
        arena: Arc<SlotArena>,
    ) -> io::Result<Self> {
        let capacity = arena.num_slots();
        let shared = Arc::new(Shared {
            queue: Mutex::new(LoadQueue::new(capacity, mode)),
            signal: Semaphore::default(),
            registry,
            arena,
            counters: Counters::default(),
        });
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared = Arc::clone(&shared);
            let tx = tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("lod-loader-{i}"))
                .spawn(move || worker_loop(&shared, &tx))?;
            workers.push(handle);
        }

        log::info!(
            "Loader pool started: {} threads, {} slots of {} bytes",
            num_threads,
            capacity,
            shared.arena.slot_bytes()
        );

        Ok(Self { shared, completions: rx, workers })
    }

    pub fn arena(&self) -> &Arc<SlotArena> {
        &self.shared.arena
    }

    /// Queue a load. Returns false if the node is already queued or
    /// loading, or the queue is full.
    pub fn request(&self, job: LoadJob) -> bool {
        let accepted = self.shared.queue().push_job(job);
        if accepted {
            self.shared.signal.post();
        }
        accepted
    }

    pub fn update(&self, dataset: DatasetId, node: NodeId, priority: f32) -> bool {
        self.shared.queue().update_job(dataset, node, priority)
    }

    pub fn abort(&self, dataset: DatasetId, node: NodeId) -> AbortResult {
        self.shared.queue().abort_job(dataset, node)
    }

    pub fn query(&self, dataset: DatasetId, node: NodeId) -> QueryResult {
        self.shared.queue().query(dataset, node)
    }

    /// Remove every job no worker has started
    pub fn take_waiting(&self) -> Vec<LoadJob> {
        self.shared.queue().take_waiting()
    }

    /// Waiting plus loading jobs
    pub fn num_jobs(&self) -> usize {
        let queue = self.shared.queue();
        queue.len() + queue.num_loading()
    }

    /// Collect finished jobs without blocking
    pub fn drain_completions(&self) -> Vec<LoadOutcome> {
        self.completions.try_iter().collect()
    }

    /// Block up to `timeout` for the next finished job
    pub fn recv_completion(&self, timeout: std::time::Duration) -> Option<LoadOutcome> {
        self.completions.recv_timeout(timeout).ok()
    }

    /// Release a drained job from the loading set
    pub fn finish(&self, job: &LoadJob) {
        self.shared.queue().pop_job(job);
    }

    pub fn stats(&self) -> LoaderStats {
        let c = &self.shared.counters;
        LoaderStats {
            bytes_loaded: c.bytes_loaded.load(Ordering::Relaxed),
            jobs_completed: c.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: c.jobs_failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for LoaderPool {
    fn drop(&mut self) {
        self.shared.signal.shutdown();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("Loader thread panicked during shutdown");
            }
        }
    }
}

fn worker_loop(shared: &Shared, tx: &Sender<LoadOutcome>) {
    let mut streams: HashMap<DatasetId, PrimitiveStream> = HashMap::new();

    while shared.signal.wait() {
        // The job this post was raised for may have been aborted already
        let Some(job) = shared.queue().top_job() else {
            continue;
        };

        let outcome = match load_job(shared, &mut streams, &job) {
            Ok(bytes) => {
                shared.counters.bytes_loaded.fetch_add(bytes as u64, Ordering::Relaxed);
                shared.counters.jobs_completed.fetch_add(1, Ordering::Relaxed);
                LoadOutcome::Loaded(job)
            }
            Err(error) => {
                shared.counters.jobs_failed.fetch_add(1, Ordering::Relaxed);
                LoadOutcome::Failed { job, error }
            }
        };

        if tx.send(outcome).is_err() {
            break;
        }
    }
}

fn load_job(
    shared: &Shared,
    streams: &mut HashMap<DatasetId, PrimitiveStream>,
    job: &LoadJob,
) -> io::Result<usize> {
    let stream = match streams.entry(job.dataset) {
        std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
        std::collections::hash_map::Entry::Vacant(e) => {
            let dataset = shared.registry.get(job.dataset).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("dataset {} not registered", job.dataset))
            })?;
            let stream = PrimitiveStream::open(
                dataset.stream_path(),
                dataset.node_byte_size(),
                dataset.hierarchy().node_count(),
            )?;
            e.insert(stream)
        }
    };

    let node_bytes = stream.node_byte_size();
    if job.slot as usize >= shared.arena.num_slots() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("slot {} outside arena of {} slots", job.slot, shared.arena.num_slots()),
        ));
    }
    // The slot is reserved for this job alone until the cache applies it
    let mut slot = shared.arena.lock(job.slot);
    if node_bytes > slot.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} byte node exceeds {} byte slot", node_bytes, slot.len()),
        ));
    }
    stream.read_node(job.node, &mut slot[..node_bytes])?;
    drop(slot);
    log::trace!("Loaded node {} of dataset {} into slot {}", job.node, job.dataset, job.slot);
    Ok(node_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::testing;
    use std::time::Duration;

    fn pool_with_dataset(dir: &std::path::Path, slots: usize) -> (LoaderPool, usize) {
        let fixture = testing::write_fixture(dir, "pool", 4, 2, 4, 4);
        let node_bytes = fixture.hierarchy.node_byte_size();
        let registry = Arc::new(DatasetRegistry::new());
        registry.register(&fixture.hierarchy_path, &fixture.stream_path).unwrap();
        let arena = Arc::new(SlotArena::new(slots, node_bytes));
        let pool = LoaderPool::new(2, UpdateMode::Always, registry, arena).unwrap();
        (pool, node_bytes)
    }

    #[test]
    fn test_loads_into_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, node_bytes) = pool_with_dataset(dir.path(), 4);

        assert!(pool.request(LoadJob::new(0, 7, 2, 1.0)));
        let outcome = pool.recv_completion(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, LoadOutcome::Loaded(job) if job.node == 7 && job.slot == 2));
        assert_eq!(pool.query(0, 7), QueryResult::Loading);
        pool.finish(outcome.job());
        assert_eq!(pool.query(0, 7), QueryResult::NotIndexed);

        let data = pool.arena().with_slot(2, |bytes| bytes.to_vec());
        assert_eq!(data, testing::node_pattern(7, node_bytes));
        assert_eq!(pool.stats().jobs_completed, 1);
        assert_eq!(pool.stats().bytes_loaded, node_bytes as u64);
    }

    #[test]
    fn test_unknown_dataset_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with_dataset(dir.path(), 4);

        pool.request(LoadJob::new(9, 0, 0, 1.0));
        let outcome = pool.recv_completion(Duration::from_secs(5)).unwrap();
        match outcome {
            LoadOutcome::Failed { job, error } => {
                assert_eq!(job.dataset, 9);
                assert_eq!(error.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(pool.stats().jobs_failed, 1);
    }

    #[test]
    fn test_out_of_range_node_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with_dataset(dir.path(), 4);

        pool.request(LoadJob::new(0, 500, 1, 1.0));
        let outcome = pool.recv_completion(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, LoadOutcome::Failed { .. }));
    }

    #[test]
    fn test_slot_outside_arena_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with_dataset(dir.path(), 2);

        pool.request(LoadJob::new(0, 1, 7, 1.0));
        let outcome = pool.recv_completion(Duration::from_secs(5)).unwrap();
        match outcome {
            LoadOutcome::Failed { error, .. } => assert_eq!(error.kind(), io::ErrorKind::InvalidInput),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_many_jobs_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, node_bytes) = pool_with_dataset(dir.path(), 16);

        for node in 0..16 {
            assert!(pool.request(LoadJob::new(0, node, node, node as f32)));
        }
        let mut seen = Vec::new();
        while seen.len() < 16 {
            let outcome = pool.recv_completion(Duration::from_secs(5)).unwrap();
            pool.finish(outcome.job());
            seen.push(outcome.job().node);
        }
        seen.sort();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
        for node in 0..16 {
            let data = pool.arena().with_slot(node, |b| b.to_vec());
            assert_eq!(data, testing::node_pattern(node, node_bytes));
        }
        assert_eq!(pool.num_jobs(), 0);
    }
}
