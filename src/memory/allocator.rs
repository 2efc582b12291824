//! OOM-aware block allocation.
//!
//! The critical path for every block request:
//! 1. Reject sizes outside `[0, max_block_bytes]` before touching the driver.
//! 2. If the allocation would push the device past its threshold, or the sum of
//!    device usage past the global ceiling, run a preemptive eviction round.
//! 3. Reserve the bytes under the global ceiling. The threshold may be
//!    overshot after eviction; the ceiling may not, so a refused reservation
//!    counts as out of memory.
//! 4. Call the native allocator. Success is charged to accounting.
//! 5. On out of memory, run a reactive eviction round and retry while the
//!    retry budget lasts.
//! 6. Once the budget is spent, fail with [`MemError::AllocationFailed`]; the
//!    failed block is never charged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::MemoryConfig;
use crate::device::DeviceId;
use crate::error::{MemError, MemResult};
use crate::handle::{HandleContext, Resource};
use crate::memory::accounting::MemoryAccounting;
use crate::memory::block::MemoryBlock;
use crate::memory::eviction::{EvictionCause, EvictionCoordinator, EvictionReport};
use crate::native::{MemoryKind, NativeApi, NativeError, NativePtr, Residency};

/// Running allocation statistics.
#[derive(Debug, Default)]
pub struct AllocStats {
    allocations: AtomicU64,
    preemptive_evictions: AtomicU64,
    reactive_evictions: AtomicU64,
    bytes_reclaimed: AtomicU64,
    eviction_micros: AtomicU64,
    retries: AtomicU64,
    fatal_failures: AtomicU64,
}

/// Point-in-time copy of [`AllocStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocStatsSnapshot {
    pub allocations: u64,
    pub preemptive_evictions: u64,
    pub reactive_evictions: u64,
    pub bytes_reclaimed: u64,
    pub eviction_micros: u64,
    pub retries: u64,
    pub fatal_failures: u64,
}

impl AllocStats {
    fn record_eviction(&self, cause: EvictionCause, report: &EvictionReport) {
        if report.skipped {
            return;
        }
        let rounds = match cause {
            EvictionCause::Preemptive => &self.preemptive_evictions,
            _ => &self.reactive_evictions,
        };
        rounds.fetch_add(1, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(report.bytes_freed(), Ordering::Relaxed);
        self.eviction_micros
            .fetch_add(report.elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AllocStatsSnapshot {
        AllocStatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            preemptive_evictions: self.preemptive_evictions.load(Ordering::Relaxed),
            reactive_evictions: self.reactive_evictions.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            eviction_micros: self.eviction_micros.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fatal_failures: self.fatal_failures.load(Ordering::Relaxed),
        }
    }
}

impl AllocStatsSnapshot {
    pub fn eviction_time(&self) -> Duration {
        Duration::from_micros(self.eviction_micros)
    }
}

/// Hands out [`MemoryBlock`]s and owns the pieces every block needs on free.
pub struct Allocator {
    pub(crate) native: Arc<dyn NativeApi>,
    pub(crate) accounting: Arc<MemoryAccounting>,
    eviction: Arc<EvictionCoordinator>,
    handles: HandleContext,
    config: MemoryConfig,
    stats: AllocStats,
}

impl Allocator {
    pub fn new(
        native: Arc<dyn NativeApi>,
        accounting: Arc<MemoryAccounting>,
        eviction: Arc<EvictionCoordinator>,
        handles: HandleContext,
        config: MemoryConfig,
    ) -> Self {
        Self {
            native,
            accounting,
            eviction,
            handles,
            config,
            stats: AllocStats::default(),
        }
    }

    pub fn accounting(&self) -> &Arc<MemoryAccounting> {
        &self.accounting
    }

    pub fn eviction(&self) -> &Arc<EvictionCoordinator> {
        &self.eviction
    }

    pub fn stats(&self) -> AllocStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn max_block_bytes(&self) -> u64 {
        self.config.max_block_bytes()
    }

    /// Allocate `size` bytes of `kind` memory.
    ///
    /// `device` binds device-local blocks and is ignored for managed and host
    /// blocks. With `zero_fill` the block starts zeroed; otherwise its content
    /// is unspecified.
    pub fn allocate(
        self: &Arc<Self>,
        device: DeviceId,
        size: i64,
        kind: MemoryKind,
        zero_fill: bool,
    ) -> MemResult<MemoryBlock> {
        let max = self.max_block_bytes();
        if size < 0 || size as u64 > max {
            return Err(MemError::OutOfRange {
                requested: size,
                max,
            });
        }
        let size = size as u64;
        let residency = Residency::new(kind, device);
        // Fail unknown devices before any native call.
        self.accounting.record(residency)?;

        let mut retries_left = self.config.max_retries;
        let ptr = loop {
            match self.try_allocate(residency, size) {
                Ok(ptr) => break ptr,
                Err(err) if err.is_retryable() && retries_left > 0 => {
                    retries_left -= 1;
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(%residency, size, retries_left, error = %err, "Allocation attempt failed, evicting and retrying");
                    self.evict(residency, size, EvictionCause::Reactive);
                }
                Err(MemError::OutOfMemory { source, .. }) => {
                    return Err(self.fatal(residency, size, source));
                }
                Err(err) => return Err(err),
            }
        };

        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        let block = self.adopt(ptr, size, residency);

        if zero_fill {
            if let Err(err) = self.native.memset_zero(residency, ptr, size) {
                let _ = block.free_ref();
                return Err(err.into());
            }
        }
        debug!(%residency, size, ptr = ptr.0, "Allocated block");
        Ok(block)
    }

    /// One attempt: evict first if the request crosses a limit, claim room under
    /// the global ceiling, then call the driver. A failed attempt leaves nothing
    /// charged; running out of memory either way is [`MemError::OutOfMemory`].
    fn try_allocate(&self, residency: Residency, size: u64) -> MemResult<NativePtr> {
        if let Some(pressure) = self.accounting.pressure(residency, size) {
            debug!(%residency, size, ?pressure, "Allocation would cross threshold, evicting first");
            self.evict(residency, size, EvictionCause::Preemptive);
        }

        let out_of_memory = |source| MemError::OutOfMemory {
            location: residency.to_string(),
            size,
            source,
        };
        if let Err(pressure) = self.accounting.reserve(residency, size) {
            debug!(%residency, size, ?pressure, "Global ceiling still exceeded after eviction");
            return Err(out_of_memory(NativeError::OutOfMemory { requested: size }));
        }

        let ptr = match self.native.malloc(residency, size) {
            Ok(ptr) => ptr,
            Err(err) => {
                self.accounting.cancel_reservation(residency, size);
                return Err(match err {
                    NativeError::OutOfMemory { .. } => out_of_memory(err),
                    other => MemError::Native(other),
                });
            }
        };
        if let Err(err) = self.accounting.commit(residency, size) {
            self.accounting.cancel_reservation(residency, size);
            let _ = self.native.free(residency, ptr);
            return Err(err);
        }
        Ok(ptr)
    }

    /// Wrap a freshly allocated pointer; its destructor frees it and uncharges it.
    ///
    /// Only device-local blocks die with a device reset. Managed and host
    /// blocks keep working across epochs and are freed normally.
    fn adopt(self: &Arc<Self>, ptr: NativePtr, size: u64, residency: Residency) -> MemoryBlock {
        let native = Arc::clone(&self.native);
        let accounting = Arc::clone(&self.accounting);
        let destroy = move |ptr: NativePtr| {
            if let Err(err) = native.free(residency, ptr) {
                error!(%residency, ptr = ptr.0, error = %err, "Native free failed");
            }
            if let Err(err) = accounting.record_free(residency, size) {
                error!(%residency, size, error = %err, "Could not uncharge freed block");
            }
            debug!(%residency, size, ptr = ptr.0, "Freed block");
        };
        let resource = match residency {
            Residency::Device(_) => Resource::wrap("memory block", ptr, &self.handles, destroy),
            Residency::Managed | Residency::Host => {
                Resource::wrap_unscoped("memory block", ptr, &self.handles, destroy)
            }
        };
        MemoryBlock::new(resource, size, residency, Arc::clone(self))
    }

    /// Evict on the block's device, or on every device when the global ceiling
    /// is what stands in the way.
    fn evict(&self, residency: Residency, size: u64, cause: EvictionCause) {
        let over_ceiling =
            self.accounting.global_used().saturating_add(size) > self.accounting.global_ceiling();
        let target = if over_ceiling { None } else { residency.device() };
        let report = self.eviction.evict(target, cause);
        self.stats.record_eviction(cause, &report);
    }

    fn fatal(&self, residency: Residency, size: u64, source: NativeError) -> MemError {
        self.stats.fatal_failures.fetch_add(1, Ordering::Relaxed);
        let usage = self
            .accounting
            .record(residency)
            .map(|r| r.snapshot())
            .unwrap_or_default();
        error!(
            %residency,
            size,
            retries = self.config.max_retries,
            used = usage.used_bytes,
            peak = usage.peak_bytes,
            "Allocation failed after exhausting retries"
        );
        MemError::AllocationFailed {
            location: residency.to_string(),
            size,
            retries: self.config.max_retries,
            usage,
            source,
        }
    }
}
