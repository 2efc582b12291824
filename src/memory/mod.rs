//! Device memory management.
//!
//! - [`block`]: refcounted memory blocks with read/write/copy
//! - [`allocator`]: OOM-aware allocation with preemptive and reactive eviction
//! - [`accounting`]: per-device usage counters and thresholds
//! - [`eviction`]: eviction coordinator and the cache traits it drives
//! - [`spill`]: named device data that can be spilled to host under pressure
//! - [`precision`]: element precisions and host-array conversion

pub mod accounting;
pub mod allocator;
pub mod block;
pub mod eviction;
pub mod precision;
pub mod spill;

pub use accounting::{MemoryAccounting, UsageSnapshot};
pub use allocator::{AllocStatsSnapshot, Allocator};
pub use block::{BlockGuard, MemoryBlock};
pub use eviction::{CacheHolder, EvictionCause, EvictionCoordinator, EvictionReport, ResidentDataCache};
pub use precision::{HostScalar, Precision};
pub use spill::{SpillStats, SpillStore};
