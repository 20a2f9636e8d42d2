//! Dataset registration

pub mod registry;

pub use registry::{Dataset, DatasetRegistry};
