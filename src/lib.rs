//! Lodstream - out-of-core level-of-detail streaming
//!
//! Datasets are implicit N-ary trees of fixed-size nodes streamed from disk
//! into a host cache and from there into a per-context GPU resident buffer.
//! Each context refines a cut through every dataset per view on its own
//! update thread; the renderer picks up the published cut in `dispatch`.

pub mod core;
pub mod math;
pub mod hierarchy;
pub mod dataset;
pub mod streaming;
pub mod cut;
pub mod gpu;
pub mod controller;

pub use controller::Controller;
pub use crate::core::{Error, StreamingConfig, ViewCamera};
pub use cut::{CycleOutcome, CycleReport, Front, RenderNode};
pub use gpu::{HostResidentBuffer, ResidentUploader, TransferDescriptor};
