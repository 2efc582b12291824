//! Eviction coordination.
//!
//! Reclaims device memory on threshold breach or native allocation failure.
//! A round runs synchronously on the triggering thread, serialized with every
//! other round, and walks three stages:
//!
//! 1. In conservative mode, run the registered host reclaim hooks.
//! 2. Ask every [`CacheHolder`] to drop its device-resident buffers.
//! 3. Ask every [`ResidentDataCache`] to spill its content to host memory.
//!
//! Eviction is best effort and may free nothing; the allocator's retry budget
//! bounds the failure handling. Participants are held weakly so a dropped
//! cache simply disappears from future rounds.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use crate::device::DeviceId;
use crate::memory::accounting::MemoryAccounting;

thread_local! {
    static IN_EVICTION: Cell<bool> = const { Cell::new(false) };
}

/// A cache owning device buffers it can drop and later recompute.
pub trait CacheHolder: Send + Sync {
    fn name(&self) -> &str;

    /// Drop evictable buffers resident on `device`. Returns bytes freed.
    fn release_device_buffers(&self, device: DeviceId) -> u64;
}

/// A store of device-resident data that can be moved to host memory without loss.
pub trait ResidentDataCache: Send + Sync {
    fn name(&self) -> &str;

    /// Move content resident on `device` to host memory. Returns device bytes freed.
    fn spill_to_host(&self, device: DeviceId) -> u64;
}

/// Host-side reclamation hint run before eviction in conservative mode.
pub type ReclaimHook = Box<dyn Fn() + Send + Sync>;

/// What triggered an eviction round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionCause {
    /// Projected usage crossed the device threshold or global ceiling.
    Preemptive,
    /// The native allocator reported out of memory.
    Reactive,
    /// Requested explicitly by the engine or an operator.
    Manual,
}

impl std::fmt::Display for EvictionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionCause::Preemptive => write!(f, "preemptive"),
            EvictionCause::Reactive => write!(f, "reactive"),
            EvictionCause::Manual => write!(f, "manual"),
        }
    }
}

/// Outcome of one eviction round.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionReport {
    /// Bytes released by cache holders.
    pub cache_bytes: u64,

    /// Device bytes freed by spilling resident data to host.
    pub spilled_bytes: u64,

    /// Wall time spent in the round.
    pub elapsed: Duration,

    /// True when the round was skipped because the thread was already evicting.
    pub skipped: bool,
}

impl EvictionReport {
    pub fn bytes_freed(&self) -> u64 {
        self.cache_bytes + self.spilled_bytes
    }
}

/// Serializes eviction rounds across threads.
pub struct EvictionCoordinator {
    accounting: Arc<MemoryAccounting>,
    round: Mutex<()>,
    holders: RwLock<Vec<Weak<dyn CacheHolder>>>,
    resident: RwLock<Vec<Weak<dyn ResidentDataCache>>>,
    hooks: RwLock<Vec<ReclaimHook>>,
    conservative: AtomicBool,
    rounds: AtomicU64,
}

impl EvictionCoordinator {
    pub fn new(accounting: Arc<MemoryAccounting>, conservative: bool) -> Self {
        Self {
            accounting,
            round: Mutex::new(()),
            holders: RwLock::new(Vec::new()),
            resident: RwLock::new(Vec::new()),
            hooks: RwLock::new(Vec::new()),
            conservative: AtomicBool::new(conservative),
            rounds: AtomicU64::new(0),
        }
    }

    pub fn register_cache<C: CacheHolder + 'static>(&self, holder: &Arc<C>) {
        let weak: Weak<C> = Arc::downgrade(holder);
        let weak: Weak<dyn CacheHolder> = weak;
        debug!(cache = holder.name(), "Registered cache holder");
        self.holders.write().push(weak);
    }

    pub fn register_resident<C: ResidentDataCache + 'static>(&self, cache: &Arc<C>) {
        let weak: Weak<C> = Arc::downgrade(cache);
        let weak: Weak<dyn ResidentDataCache> = weak;
        debug!(cache = cache.name(), "Registered resident data cache");
        self.resident.write().push(weak);
    }

    /// Add a host reclamation hint. Hooks only run in conservative mode and
    /// correctness never depends on what they free.
    pub fn add_reclaim_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.write().push(Box::new(hook));
    }

    pub fn set_conservative(&self, enabled: bool) {
        self.conservative.store(enabled, Ordering::Relaxed);
    }

    pub fn is_conservative(&self) -> bool {
        self.conservative.load(Ordering::Relaxed)
    }

    /// Completed (non-skipped) rounds since startup.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// True while the calling thread is inside an eviction round.
    pub fn in_eviction() -> bool {
        IN_EVICTION.with(|flag| flag.get())
    }

    /// Run one eviction round for `device`, or for every device when `None`.
    pub fn evict(&self, device: Option<DeviceId>, cause: EvictionCause) -> EvictionReport {
        // A participant freeing memory may call back into the allocator.
        if Self::in_eviction() {
            debug!(?device, %cause, "Nested eviction request ignored");
            return EvictionReport {
                skipped: true,
                ..Default::default()
            };
        }

        let _round = self.round.lock();
        IN_EVICTION.with(|flag| flag.set(true));
        let _reset = ResetOnDrop;

        let start = Instant::now();
        let targets: Vec<DeviceId> = match device {
            Some(id) => vec![id],
            None => self.accounting.device_ids().collect(),
        };
        let conservative = self.is_conservative();
        let before = self.usage_of(&targets);

        if conservative {
            for hook in self.hooks.read().iter() {
                hook();
            }
        }

        let holders = live(&self.holders);
        let resident = live(&self.resident);

        let mut report = EvictionReport::default();
        for &target in &targets {
            for holder in &holders {
                let freed = holder.release_device_buffers(target);
                if conservative {
                    info!(cache = holder.name(), device = target, freed, "Cache released device buffers");
                }
                report.cache_bytes += freed;
            }
            for cache in &resident {
                let freed = cache.spill_to_host(target);
                if conservative {
                    info!(cache = cache.name(), device = target, freed, "Spilled resident data to host");
                }
                report.spilled_bytes += freed;
            }
        }
        report.elapsed = start.elapsed();
        self.rounds.fetch_add(1, Ordering::Relaxed);

        let after = self.usage_of(&targets);
        info!(
            ?device,
            %cause,
            before,
            after,
            cache_bytes = report.cache_bytes,
            spilled_bytes = report.spilled_bytes,
            elapsed_us = report.elapsed.as_micros() as u64,
            "Eviction round complete"
        );
        report
    }

    fn usage_of(&self, targets: &[DeviceId]) -> u64 {
        targets
            .iter()
            .filter_map(|&id| self.accounting.snapshot(id).ok())
            .map(|s| s.used_bytes)
            .sum()
    }
}

/// Upgrade the live participants and forget the dropped ones.
fn live<T: ?Sized>(list: &RwLock<Vec<Weak<T>>>) -> Vec<Arc<T>> {
    let mut list = list.write();
    list.retain(|w| w.strong_count() > 0);
    list.iter().filter_map(Weak::upgrade).collect()
}

struct ResetOnDrop;

impl Drop for ResetOnDrop {
    fn drop(&mut self) {
        IN_EVICTION.with(|flag| flag.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::device::Device;
    use std::sync::atomic::AtomicUsize;

    struct FixedCache {
        calls: AtomicUsize,
        freed: u64,
    }

    impl CacheHolder for FixedCache {
        fn name(&self) -> &str {
            "fixed"
        }

        fn release_device_buffers(&self, _device: DeviceId) -> u64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.freed
        }
    }

    fn coordinator(conservative: bool) -> EvictionCoordinator {
        let devices = vec![
            Device { id: 0, name: "a".into(), total_memory: 1000 },
            Device { id: 1, name: "b".into(), total_memory: 1000 },
        ];
        let acct = Arc::new(MemoryAccounting::new(&devices, &MemoryConfig::default()));
        EvictionCoordinator::new(acct, conservative)
    }

    #[test]
    fn test_round_sums_freed_bytes() {
        let coord = coordinator(false);
        let cache = Arc::new(FixedCache { calls: AtomicUsize::new(0), freed: 64 });
        coord.register_cache(&cache);

        let report = coord.evict(Some(0), EvictionCause::Manual);
        assert_eq!(report.cache_bytes, 64);
        assert_eq!(cache.calls.load(Ordering::SeqCst), 1);

        // All devices.
        let report = coord.evict(None, EvictionCause::Manual);
        assert_eq!(report.bytes_freed(), 128);
        assert_eq!(coord.rounds(), 2);
    }

    #[test]
    fn test_dropped_holder_forgotten() {
        let coord = coordinator(false);
        let cache = Arc::new(FixedCache { calls: AtomicUsize::new(0), freed: 10 });
        coord.register_cache(&cache);
        drop(cache);

        let report = coord.evict(Some(0), EvictionCause::Reactive);
        assert_eq!(report.bytes_freed(), 0);
        assert!(coord.holders.read().is_empty());
    }

    #[test]
    fn test_hooks_only_in_conservative_mode() {
        let coord = coordinator(false);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        coord.add_reclaim_hook(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        coord.evict(Some(0), EvictionCause::Preemptive);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        coord.set_conservative(true);
        coord.evict(Some(0), EvictionCause::Preemptive);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_round_skipped() {
        struct Reentrant {
            coord: Mutex<Option<Arc<EvictionCoordinator>>>,
            nested_skipped: AtomicBool,
        }

        impl CacheHolder for Reentrant {
            fn name(&self) -> &str {
                "reentrant"
            }

            fn release_device_buffers(&self, device: DeviceId) -> u64 {
                if let Some(coord) = self.coord.lock().as_ref() {
                    let nested = coord.evict(Some(device), EvictionCause::Reactive);
                    self.nested_skipped.store(nested.skipped, Ordering::SeqCst);
                }
                0
            }
        }

        let coord = Arc::new(coordinator(false));
        let holder = Arc::new(Reentrant {
            coord: Mutex::new(Some(coord.clone())),
            nested_skipped: AtomicBool::new(false),
        });
        coord.register_cache(&holder);

        let report = coord.evict(Some(0), EvictionCause::Manual);
        assert!(!report.skipped);
        assert!(holder.nested_skipped.load(Ordering::SeqCst));
        assert!(!EvictionCoordinator::in_eviction());
        // Break the cycle.
        holder.coord.lock().take();
    }

    #[test]
    fn test_resident_cache_spills_after_holders() {
        struct Parked {
            bytes: AtomicU64,
        }

        impl ResidentDataCache for Parked {
            fn name(&self) -> &str {
                "parked"
            }

            fn spill_to_host(&self, _device: DeviceId) -> u64 {
                self.bytes.swap(0, Ordering::SeqCst)
            }
        }

        let coord = coordinator(false);
        let holder = Arc::new(FixedCache { calls: AtomicUsize::new(0), freed: 8 });
        let parked = Arc::new(Parked { bytes: AtomicU64::new(512) });
        coord.register_cache(&holder);
        coord.register_resident(&parked);

        let report = coord.evict(Some(1), EvictionCause::Reactive);
        assert_eq!(report.cache_bytes, 8);
        assert_eq!(report.spilled_bytes, 512);
        assert_eq!(report.bytes_freed(), 520);

        // Nothing left parked on the second round.
        let report = coord.evict(Some(1), EvictionCause::Reactive);
        assert_eq!(report.spilled_bytes, 0);
    }
}
