//! GPU-facing side: staging buffers and the resident buffer interface

pub mod host;
pub mod staging;
#[cfg(feature = "wgpu")]
pub mod wgpu_buffer;

pub use host::HostResidentBuffer;
pub use staging::{StagingBuffers, TransferDescriptor};
#[cfg(feature = "wgpu")]
pub use wgpu_buffer::WgpuResidentBuffer;

use crate::core::types::Result;

/// Destination of node uploads: the permanent resident buffer of a context.
///
/// `staging` is the whole staging buffer of a published front, laid out
/// as consecutive slots of `slot_bytes`. Each transfer copies one staging
/// slot into one resident slot.
pub trait ResidentUploader {
    fn upload(&mut self, staging: &[u8], slot_bytes: usize, transfers: &[TransferDescriptor]) -> Result<()>;
}
