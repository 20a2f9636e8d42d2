//! Resident node buffer in GPU memory

use super::{ResidentUploader, TransferDescriptor};
use crate::core::error::Error;
use crate::core::types::Result;

/// Storage buffer holding `num_slots` nodes for draw passes
pub struct WgpuResidentBuffer {
    buffer: wgpu::Buffer,
    queue: wgpu::Queue,
    num_slots: u32,
    slot_bytes: usize,
}

impl WgpuResidentBuffer {
    pub fn new(device: &wgpu::Device, queue: wgpu::Queue, num_slots: u32, slot_bytes: usize) -> Self {
        let size = num_slots as u64 * slot_bytes as u64;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lod_resident_nodes"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        log::info!(
            "Created resident node buffer: {} slots, {}MB",
            num_slots,
            size / 1024 / 1024
        );

        Self { buffer, queue, num_slots, slot_bytes }
    }

    /// The GPU buffer
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    /// Byte offset of a slot, for binding a single node
    pub fn slot_offset(&self, slot: u32) -> u64 {
        slot as u64 * self.slot_bytes as u64
    }
}

impl ResidentUploader for WgpuResidentBuffer {
    fn upload(&mut self, staging: &[u8], slot_bytes: usize, transfers: &[TransferDescriptor]) -> Result<()> {
        if slot_bytes != self.slot_bytes {
            return Err(Error::Upload(format!(
                "staging slots of {} bytes for resident slots of {} bytes",
                slot_bytes, self.slot_bytes
            )));
        }
        for t in transfers {
            if t.primary_slot >= self.num_slots {
                return Err(Error::Upload(format!("resident slot {} out of range", t.primary_slot)));
            }
            let src = t.staging_slot as usize * slot_bytes;
            let data = staging
                .get(src..src + slot_bytes)
                .ok_or_else(|| Error::Upload(format!("staging slot {} out of range", t.staging_slot)))?;
            self.queue.write_buffer(&self.buffer, self.slot_offset(t.primary_slot), data);
        }
        log::trace!("Queued {} node uploads", transfers.len());
        Ok(())
    }
}
