//! Double-buffered staging memory for node uploads
//!
//! The update cycle fills the back buffer while the front buffer may still
//! be waiting to be copied into the resident buffer. Each buffer holds as
//! many nodes as one cycle may upload.

use std::sync::{Mutex, MutexGuard};

use crate::core::types::SlotId;

/// Copy of one staged node into the resident buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransferDescriptor {
    /// Node index inside the staging buffer
    pub staging_slot: u32,
    /// Destination slot in the resident buffer
    pub primary_slot: SlotId,
}

#[derive(Debug)]
pub struct StagingBuffers {
    buffers: [Mutex<Vec<u8>>; 2],
    slot_bytes: usize,
    capacity: usize,
}

impl StagingBuffers {
    /// Two buffers of `capacity` nodes, `slot_bytes` each
    pub fn new(capacity: usize, slot_bytes: usize) -> Self {
        let size = capacity * slot_bytes;
        Self {
            buffers: [Mutex::new(vec![0u8; size]), Mutex::new(vec![0u8; size])],
            slot_bytes,
            capacity,
        }
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Nodes per buffer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self, buffer: usize) -> MutexGuard<'_, Vec<u8>> {
        self.buffers[buffer & 1].lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stage `data` at node index `staging_slot` of `buffer`
    pub fn write(&self, buffer: usize, staging_slot: u32, data: &[u8]) {
        assert!((staging_slot as usize) < self.capacity, "staging slot {staging_slot} out of range");
        let at = staging_slot as usize * self.slot_bytes;
        let len = data.len().min(self.slot_bytes);
        self.lock(buffer)[at..at + len].copy_from_slice(&data[..len]);
    }

    /// Run `f` over the whole contents of `buffer`
    pub fn with_buffer<R>(&self, buffer: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.lock(buffer);
        f(&guard)
    }
}
