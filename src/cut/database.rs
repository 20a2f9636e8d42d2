//! Per-context double-buffered fronts and update inputs
//!
//! The update cycle publishes into the hidden front; `swap` exposes it
//! once the upload of the currently exposed front was acknowledged. A
//! hidden front is never overwritten before it was swapped in, since its
//! transfers are the only record of what still has to be uploaded.
//! Fronts are shared as `Arc`s, so a reader keeps whatever front it
//! fetched even if a swap happens while it draws.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::camera::ViewCamera;
use crate::core::types::{ContextId, DatasetId, Mat4, ViewId};

use super::cut::Front;

/// What the renderer submitted for the next cycle
#[derive(Clone, Debug, Default)]
pub struct CutInputs {
    pub cameras: HashMap<ViewId, ViewCamera>,
    pub transforms: HashMap<DatasetId, Mat4>,
    pub thresholds: HashMap<DatasetId, f32>,
}

impl CutInputs {
    pub fn transform(&self, dataset: DatasetId) -> Mat4 {
        self.transforms.get(&dataset).copied().unwrap_or(Mat4::IDENTITY)
    }

    pub fn threshold(&self, dataset: DatasetId) -> Option<f32> {
        self.thresholds.get(&dataset).copied()
    }
}

#[derive(Debug)]
struct CutRecord {
    fronts: [Arc<Front>; 2],
    exposed: usize,
    swap_required: bool,
    upload_acknowledged: bool,
    inputs: CutInputs,
}

impl CutRecord {
    fn new() -> Self {
        Self {
            fronts: [Arc::new(Front::default()), Arc::new(Front::default())],
            exposed: 0,
            swap_required: false,
            upload_acknowledged: true,
            inputs: CutInputs::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CutDatabase {
    records: Mutex<HashMap<ContextId, CutRecord>>,
}

impl CutDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ContextId, CutRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_context(&self, context: ContextId) {
        self.records().entry(context).or_insert_with(CutRecord::new);
    }

    pub fn has_context(&self, context: ContextId) -> bool {
        self.records().contains_key(&context)
    }

    /// Currently exposed front
    pub fn front(&self, context: ContextId) -> Option<Arc<Front>> {
        self.records().get(&context).map(|r| Arc::clone(&r.fronts[r.exposed]))
    }

    /// Write the hidden front; it becomes visible on the next swap.
    ///
    /// Refused while the previously published front waits for its swap.
    pub fn publish(&self, context: ContextId, front: Front) -> bool {
        let mut records = self.records();
        let Some(record) = records.get_mut(&context) else {
            return false;
        };
        if record.swap_required {
            log::warn!("Context {} published cycle {} over an unswapped front", context, front.cycle());
            return false;
        }
        let back = record.exposed ^ 1;
        record.fronts[back] = Arc::new(front);
        record.swap_required = true;
        true
    }

    /// Expose the hidden front if one was published and the previous
    /// upload is done. Returns true if the exposed front changed.
    pub fn swap(&self, context: ContextId) -> bool {
        let mut records = self.records();
        let Some(record) = records.get_mut(&context) else {
            return false;
        };
        if !record.swap_required || !record.upload_acknowledged {
            return false;
        }
        record.exposed ^= 1;
        record.swap_required = false;
        record.upload_acknowledged = !record.fronts[record.exposed].is_modified();
        log::trace!("Context {} swapped to front cycle {}", context, record.fronts[record.exposed].cycle());
        true
    }

    pub fn is_swap_required(&self, context: ContextId) -> bool {
        self.records().get(&context).is_some_and(|r| r.swap_required)
    }

    /// Exposed front has transfers that were not uploaded yet
    pub fn is_front_modified(&self, context: ContextId) -> bool {
        self.records().get(&context).is_some_and(|r| !r.upload_acknowledged)
    }

    /// Renderer finished copying the exposed front's transfers
    pub fn signal_upload_complete(&self, context: ContextId) {
        if let Some(record) = self.records().get_mut(&context) {
            record.upload_acknowledged = true;
        }
    }

    pub fn set_camera(&self, context: ContextId, view: ViewId, camera: ViewCamera) {
        if let Some(record) = self.records().get_mut(&context) {
            record.inputs.cameras.insert(view, camera);
        }
    }

    pub fn set_transform(&self, context: ContextId, dataset: DatasetId, transform: Mat4) {
        if let Some(record) = self.records().get_mut(&context) {
            record.inputs.transforms.insert(dataset, transform);
        }
    }

    pub fn set_threshold(&self, context: ContextId, dataset: DatasetId, threshold: f32) {
        if let Some(record) = self.records().get_mut(&context) {
            record.inputs.thresholds.insert(dataset, threshold);
        }
    }

    /// Copy of the inputs for one cycle
    pub fn inputs(&self, context: ContextId) -> Option<CutInputs> {
        self.records().get(&context).map(|r| r.inputs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cut::cut::RenderNode;
    use crate::gpu::TransferDescriptor;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn front_with(cycle: u64, nodes: &[u32], transfers: usize) -> Front {
        let mut cuts = HashMap::new();
        cuts.insert(
            (0, 0),
            nodes.iter().map(|&node| RenderNode { node, slot: node }).collect(),
        );
        let transfers = (0..transfers as u32)
            .map(|i| TransferDescriptor { staging_slot: i, primary_slot: i })
            .collect();
        Front::new(cycle, cuts, transfers, 0)
    }

    #[test]
    fn test_publish_then_swap() {
        let db = CutDatabase::new();
        db.add_context(0);
        assert_eq!(db.front(0).unwrap().cycle(), 0);
        assert!(!db.swap(0));

        assert!(db.publish(0, front_with(1, &[0], 0)));
        assert!(db.is_swap_required(0));
        // Not visible until swapped
        assert_eq!(db.front(0).unwrap().cycle(), 0);
        assert!(db.swap(0));
        assert_eq!(db.front(0).unwrap().cycle(), 1);
        assert!(!db.is_swap_required(0));
    }

    #[test]
    fn test_swap_waits_for_upload() {
        let db = CutDatabase::new();
        db.add_context(0);

        db.publish(0, front_with(1, &[1, 2, 3, 4], 4));
        assert!(db.swap(0));
        assert!(db.is_front_modified(0));

        db.publish(0, front_with(2, &[1, 2, 3, 4], 0));
        assert!(!db.swap(0));
        assert_eq!(db.front(0).unwrap().cycle(), 1);

        db.signal_upload_complete(0);
        assert!(!db.is_front_modified(0));
        assert!(db.swap(0));
        assert_eq!(db.front(0).unwrap().cycle(), 2);
    }

    #[test]
    fn test_pending_front_not_replaced() {
        let db = CutDatabase::new();
        db.add_context(0);

        assert!(db.publish(0, front_with(1, &[1, 2, 3, 4], 4)));
        assert!(!db.publish(0, front_with(2, &[1, 2, 3, 4], 0)));
        assert!(db.swap(0));
        let front = db.front(0).unwrap();
        assert_eq!(front.cycle(), 1);
        assert_eq!(front.transfers().len(), 4);

        db.signal_upload_complete(0);
        assert!(db.publish(0, front_with(2, &[1, 2, 3, 4], 0)));
    }

    #[test]
    fn test_inputs_per_context() {
        let db = CutDatabase::new();
        db.add_context(0);
        db.add_context(1);
        db.set_camera(0, 3, ViewCamera::default());
        db.set_threshold(1, 0, 4.0);

        assert_eq!(db.inputs(0).unwrap().cameras.len(), 1);
        assert!(db.inputs(1).unwrap().cameras.is_empty());
        assert_eq!(db.inputs(1).unwrap().threshold(0), Some(4.0));
        assert_eq!(db.inputs(0).unwrap().transform(0), Mat4::IDENTITY);
        assert!(db.inputs(2).is_none());
    }

    #[test]
    fn test_reader_never_sees_mixed_cycles() {
        let db = Arc::new(CutDatabase::new());
        db.add_context(0);
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let db = Arc::clone(&db);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut reads = 0u64;
                loop {
                    let front = db.front(0).unwrap();
                    let nodes = front.cut_nodes(0, 0);
                    // Every node of cycle c carries id c
                    assert!(nodes.iter().all(|&n| n as u64 == front.cycle()));
                    reads += 1;
                    if done.load(Ordering::Relaxed) {
                        break reads;
                    }
                }
            })
        };

        for cycle in 1..2000u64 {
            let id = cycle as u32;
            assert!(db.publish(0, front_with(cycle, &[id; 16], 0)));
            assert!(db.swap(0));
        }
        done.store(true, Ordering::Relaxed);
        assert!(reader.join().unwrap() > 0);
    }

    #[test]
    fn test_unknown_context() {
        let db = CutDatabase::new();
        assert!(db.front(7).is_none());
        assert!(!db.swap(7));
        assert!(!db.publish(7, Front::default()));
        assert!(!db.has_context(7));
    }
}
