//! Error types surfaced to the tensor engine.
//!
//! Only [`MemError::OutOfMemory`] is recovered locally (eviction + retry inside
//! the allocator). Everything else propagates to the caller unchanged.

use thiserror::Error;

use crate::device::DeviceId;
use crate::memory::accounting::UsageSnapshot;
use crate::native::NativeError;

pub type MemResult<T> = Result<T, MemError>;

#[derive(Error, Debug)]
pub enum MemError {
    #[error("Requested size {requested} bytes is outside [0, {max}]")]
    OutOfRange { requested: i64, max: u64 },

    /// One allocation attempt ran out of memory, either in the driver or under
    /// the global ceiling. The allocator retries these; callers see
    /// [`MemError::AllocationFailed`] once the retry budget is spent.
    #[error("Out of memory allocating {size} bytes on {location}: {source}")]
    OutOfMemory {
        location: String,
        size: u64,
        #[source]
        source: NativeError,
    },

    #[error(
        "Allocation of {size} bytes on {location} failed after {retries} retries \
         (used {} bytes, peak {} bytes): {source}",
        .usage.used_bytes,
        .usage.peak_bytes
    )]
    AllocationFailed {
        location: String,
        size: u64,
        retries: u32,
        usage: UsageSnapshot,
        #[source]
        source: NativeError,
    },

    #[error("Stale {kind} handle: {reason}{}", release_suffix(.released_at))]
    StaleResource {
        kind: &'static str,
        reason: StaleReason,
        released_at: Option<String>,
    },

    #[error("Size mismatch: {needed} bytes at offset {offset} do not fit a {capacity}-byte block")]
    SizeMismatch {
        needed: u64,
        offset: u64,
        capacity: u64,
    },

    #[error("Device {0} is not available")]
    DeviceNotFound(DeviceId),

    #[error("No accelerator devices available")]
    NoDevices,

    #[error("Native call failed: {0}")]
    Native(#[from] NativeError),

    #[error("Spill compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

fn release_suffix(site: &Option<String>) -> String {
    site.as_ref()
        .map(|s| format!(" (released at {s})"))
        .unwrap_or_default()
}

/// Why a handle was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The handle was released explicitly or its refcount reached zero.
    Released,
    /// The handle predates the current epoch.
    EpochRolledOver { captured: u64, current: u64 },
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::Released => write!(f, "already released"),
            StaleReason::EpochRolledOver { captured, current } => {
                write!(f, "captured epoch {captured}, current epoch {current}")
            }
        }
    }
}

impl MemError {
    /// True only for the per-attempt OOM handled by the allocator's retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MemError::OutOfMemory { .. })
    }

    /// True for failures that should abort the in-flight computation.
    pub fn is_fatal_allocation(&self) -> bool {
        matches!(self, MemError::AllocationFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_oom_is_retryable() {
        let oom = MemError::OutOfMemory {
            location: "device 0".to_string(),
            size: 10,
            source: NativeError::OutOfMemory { requested: 10 },
        };
        assert!(oom.is_retryable());
        assert!(!MemError::NoDevices.is_retryable());
        assert!(!MemError::OutOfRange { requested: -1, max: 8 }.is_retryable());
    }

    #[test]
    fn test_stale_message_includes_release_site() {
        let err = MemError::StaleResource {
            kind: "memory block",
            reason: StaleReason::Released,
            released_at: Some("src/foo.rs:10:5".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("already released"));
        assert!(msg.contains("src/foo.rs:10:5"));
    }
}
