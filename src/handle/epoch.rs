//! Epoch counter.
//!
//! Every handle captures the epoch at creation and compares it on each access.
//! Advancing the epoch after a catastrophic reset turns every outstanding
//! handle stale in one step, without touching the handles themselves.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

#[derive(Debug, Default)]
pub struct EpochCounter {
    current: AtomicU64,
}

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn is_current(&self, captured: u64) -> bool {
        self.current() == captured
    }

    /// Invalidate all outstanding handles. Returns the new epoch.
    pub fn advance(&self) -> u64 {
        let next = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(epoch = next, "Epoch advanced; all outstanding native handles are now stale");
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_invalidates_captured() {
        let epochs = EpochCounter::new();
        let captured = epochs.current();
        assert!(epochs.is_current(captured));

        assert_eq!(epochs.advance(), captured + 1);
        assert!(!epochs.is_current(captured));
    }
}
