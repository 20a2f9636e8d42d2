//! Cut selection: per-view frontiers, their double-buffered publication
//! and the update cycle that refines them.

pub mod action;
pub mod cut;
pub mod database;
pub mod engine;
pub mod gpu_cache;
pub mod metric;

pub use action::{ActionQueues, Classification, CutAction};
pub use cut::{Cut, Front, RenderNode};
pub use database::{CutDatabase, CutInputs};
pub use engine::{CutUpdateEngine, CycleOutcome, CycleReport, EngineConfig};
pub use gpu_cache::{GpuCache, PendingTransfer};
pub use metric::{ErrorMetric, HYSTERESIS, model_matrix};
