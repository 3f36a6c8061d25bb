//! Persistent-memory log manager.
//!
//! The crate maps a fixed pool of log slots, tracks each slot through the
//! free, active, pending and recovering states, replays pending logs in their
//! global commit order after a restart, and hands slots out to registered log
//! types. Log payloads stay with the log types; the manager only owns slot
//! lifecycle and the persisted type tag.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod fs;
pub mod global;
pub mod metrics;
pub mod ops;
pub mod pool;
pub mod test_support;

mod allocator;
mod manager;
mod recovery;
mod registry;
mod truncation;

pub use allocator::{FreeSlotChoice, select_free_slot};
pub use config::{LogManagerConfig, PoolConfig, TruncationConfig, segment_file_path};
pub use descriptor::{
    LogDescriptor, RecoveryOrder, SlotCounts, SlotId, SlotMetadata, SlotRegion, SlotState,
    SlotTable,
};
pub use error::{LogMgrError, LogMgrResult};
pub use manager::{LogHandle, LogManager, LogManagerBuilder};
pub use metrics::{LogManagerMetrics, LogManagerMetricsSnapshot};
pub use ops::{LogOps, LogTypeId, RecoveryOps, SlotTag, TruncationOps};
pub use pool::PersistentPool;
pub use pool::layout::{LOG_TYPE_FREE, LOG_TYPE_MASK, MAX_LOG_TYPE, PoolLayout};
pub use pool::mapping::{
    FileSegmentMapper, MemorySegmentMapper, PoolMapping, PoolWord, SegmentMapper,
};
pub use recovery::RecoveryReport;
pub use registry::{Registration, TypeRegistry};
