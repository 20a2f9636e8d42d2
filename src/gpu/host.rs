//! Resident buffer kept in host memory
//!
//! Useful for tests and for renderers that manage their own GPU copies.

use super::{ResidentUploader, TransferDescriptor};
use crate::core::error::Error;
use crate::core::types::{Result, SlotId};

#[derive(Debug, Clone)]
pub struct HostResidentBuffer {
    data: Vec<u8>,
    slot_bytes: usize,
    uploads: u64,
}

impl HostResidentBuffer {
    pub fn new(num_slots: usize, slot_bytes: usize) -> Self {
        Self {
            data: vec![0u8; num_slots * slot_bytes],
            slot_bytes,
            uploads: 0,
        }
    }

    pub fn num_slots(&self) -> usize {
        if self.slot_bytes == 0 { 0 } else { self.data.len() / self.slot_bytes }
    }

    /// Contents of one resident slot
    pub fn slot(&self, slot: SlotId) -> &[u8] {
        let at = slot as usize * self.slot_bytes;
        &self.data[at..at + self.slot_bytes]
    }

    /// Nodes copied so far
    pub fn uploads(&self) -> u64 {
        self.uploads
    }
}

impl ResidentUploader for HostResidentBuffer {
    fn upload(&mut self, staging: &[u8], slot_bytes: usize, transfers: &[TransferDescriptor]) -> Result<()> {
        if slot_bytes != self.slot_bytes {
            return Err(Error::Upload(format!(
                "staging slots of {} bytes for resident slots of {} bytes",
                slot_bytes, self.slot_bytes
            )));
        }
        for t in transfers {
            let src = t.staging_slot as usize * slot_bytes;
            let dst = t.primary_slot as usize * slot_bytes;
            if src + slot_bytes > staging.len() || dst + slot_bytes > self.data.len() {
                return Err(Error::Upload(format!("transfer {:?} out of bounds", t)));
            }
            self.data[dst..dst + slot_bytes].copy_from_slice(&staging[src..src + slot_bytes]);
        }
        self.uploads += transfers.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copies_slot_to_slot() {
        let mut resident = HostResidentBuffer::new(4, 2);
        let staging = [1u8, 1, 2, 2, 3, 3];
        let transfers = [
            TransferDescriptor { staging_slot: 0, primary_slot: 3 },
            TransferDescriptor { staging_slot: 2, primary_slot: 0 },
        ];
        resident.upload(&staging, 2, &transfers).unwrap();

        assert_eq!(resident.slot(3), &[1, 1]);
        assert_eq!(resident.slot(0), &[3, 3]);
        assert_eq!(resident.slot(1), &[0, 0]);
        assert_eq!(resident.uploads(), 2);
    }

    #[test]
    fn test_out_of_bounds_transfer() {
        let mut resident = HostResidentBuffer::new(1, 2);
        let transfers = [TransferDescriptor { staging_slot: 0, primary_slot: 5 }];
        assert!(matches!(resident.upload(&[0u8; 2], 2, &transfers), Err(Error::Upload(_))));
    }

    #[test]
    fn test_slot_size_mismatch() {
        let mut resident = HostResidentBuffer::new(1, 2);
        assert!(resident.upload(&[0u8; 4], 4, &[]).is_err());
    }
}
