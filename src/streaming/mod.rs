//! Out-of-core node streaming from disk into a bounded host cache

pub mod budget;
pub mod load_queue;
pub mod loader_pool;
pub mod slot_cache;
pub mod slot_index;
pub mod stream_file;

pub use budget::{NodeBudget, host_slot_count};
pub use load_queue::{AbortResult, LoadJob, LoadQueue, QueryResult};
pub use loader_pool::{LoadOutcome, LoaderPool, LoaderStats, SlotArena};
pub use slot_cache::{RefreshSummary, RequestState, SlotCache};
pub use slot_index::{SlotCounts, SlotError, SlotIndex, SlotState};
pub use stream_file::PrimitiveStream;
