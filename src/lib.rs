//! accel-mem: device-memory manager for accelerator-backed tensor engines.
//!
//! Coordinates finite accelerator memory across concurrent compute calls:
//! refcounted memory blocks with exactly-once native release, per-device usage
//! accounting, eviction and retry on out-of-memory, a per-shape
//! descriptor/workspace cache and a pool of thread-bound execution contexts.
//! Handles are epoch-tagged so a catastrophic reset invalidates all of them at
//! once.

pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod handle;
pub mod memory;
pub mod metrics;
pub mod native;
pub mod runtime;
pub mod server;

pub use cache::{BundleLease, DescriptorCache, Persistence, ShapeKey};
pub use config::Config;
pub use device::{Device, DeviceId, DeviceRegistry};
pub use error::{MemError, MemResult};
pub use memory::{MemoryBlock, Precision, UsageSnapshot};
pub use native::{MemoryKind, NativeApi};
pub use runtime::Runtime;
