//! Error types for the streaming system

use thiserror::Error;

use crate::core::types::{ContextId, DatasetId, ViewId};
use crate::hierarchy::{AddressError, HierarchyError};
use crate::streaming::SlotError;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hierarchy error: {0}")]
    Hierarchy(#[from] HierarchyError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Slot error: {0}")]
    Slot(#[from] SlotError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown dataset {0}")]
    UnknownDataset(DatasetId),

    #[error("Unknown view {0}")]
    UnknownView(ViewId),

    #[error("Unknown context {0}")]
    UnknownContext(ContextId),

    #[error("Upload error: {0}")]
    Upload(String),
}
