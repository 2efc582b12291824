//! Native handle ownership.
//!
//! - [`epoch`]: epoch counter invalidating every handle after a device reset
//! - [`resource`]: refcounted, epoch-tagged wrapper with exactly-once release

pub mod epoch;
pub mod resource;

use std::sync::Arc;

pub use epoch::EpochCounter;
pub use resource::Resource;

/// Shared settings every [`Resource`] is created with.
#[derive(Debug, Clone)]
pub struct HandleContext {
    /// Epoch source all handles are validated against.
    pub epochs: Arc<EpochCounter>,

    /// Record release call sites and log lifecycle events at debug.
    pub trace: bool,

    /// Warn when a handle is dropped while it still owns its native object.
    pub leak_warnings: bool,
}

impl HandleContext {
    pub fn new(epochs: Arc<EpochCounter>) -> Self {
        Self {
            epochs,
            trace: false,
            leak_warnings: true,
        }
    }

    pub fn with_tracing(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_leak_warnings(mut self, enabled: bool) -> Self {
        self.leak_warnings = enabled;
        self
    }
}
