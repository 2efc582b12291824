//! Descriptor/workspace cache.
//!
//! Lookup-or-create is guarded per key: the map lock is held only long enough
//! to find (or insert) the key's slot, and the expensive compute runs under the
//! slot's own lock. Concurrent misses on one key therefore compute exactly one
//! bundle, while misses on different keys proceed in parallel.
//!
//! Eviction only ever `try_lock`s slots, so a thread evicting from inside a
//! compute (its workspace allocation hit the threshold) skips the slot it holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::bundle::{BundleLease, DescriptorBundle};
use crate::cache::key::ShapeKey;
use crate::cache::policy::{Persistence, PersistencePolicy, Uniform};
use crate::device::DeviceId;
use crate::error::MemResult;
use crate::handle::HandleContext;
use crate::memory::eviction::CacheHolder;
use crate::memory::Allocator;
use crate::native::NativeApi;

#[derive(Debug)]
struct Cached {
    bundle: DescriptorBundle,
    persistence: Persistence,
}

type Slot = Arc<Mutex<Option<Cached>>>;

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub computes: u64,
    pub evicted: u64,
    pub workspace_bytes: u64,
}

pub struct DescriptorCache {
    native: Arc<dyn NativeApi>,
    allocator: Arc<Allocator>,
    handles: HandleContext,
    policy: Box<dyn PersistencePolicy>,
    slots: Mutex<HashMap<ShapeKey, Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    computes: AtomicU64,
    evicted: AtomicU64,
}

impl DescriptorCache {
    pub fn new(
        native: Arc<dyn NativeApi>,
        allocator: Arc<Allocator>,
        handles: HandleContext,
        default_persistence: Persistence,
    ) -> Self {
        Self {
            native,
            allocator,
            handles,
            policy: Box::new(Uniform(default_persistence)),
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            computes: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Replace the persistence policy. Applies to bundles computed from now on.
    pub fn with_policy(mut self, policy: impl PersistencePolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Bundle for `key`, computing and caching it on a miss.
    pub fn lookup(&self, key: &ShapeKey) -> MemResult<BundleLease> {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let result = self.lookup_in(key, &slot);
        // Uncached persistence and failed computes leave the slot empty.
        self.prune(key, &slot);
        result
    }

    fn lookup_in(&self, key: &ShapeKey, slot: &Slot) -> MemResult<BundleLease> {
        let mut cached = slot.lock();

        if let Some(entry) = cached.as_ref() {
            match entry.bundle.retain() {
                Ok(lease) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(lease);
                }
                Err(err) => {
                    debug!(key = %key, error = %err, "Cached bundle is stale, recomputing");
                    if let Some(stale) = cached.take() {
                        stale.bundle.release();
                    }
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let bundle = DescriptorBundle::compute(key, &self.native, &self.allocator, &self.handles)?;
        self.computes.fetch_add(1, Ordering::Relaxed);

        let persistence = self.policy.persistence(key);
        if persistence == Persistence::None {
            return Ok(bundle.into_lease());
        }
        let lease = bundle.retain()?;
        *cached = Some(Cached {
            bundle,
            persistence,
        });
        Ok(lease)
    }

    /// Forget `key`'s slot if it is empty and nobody else holds it.
    ///
    /// Slots are only cloned out under the map lock, so a count of two (the
    /// map and `slot`) means no other thread can be using it. The caller must
    /// not hold the slot's lock.
    fn prune(&self, key: &ShapeKey, slot: &Slot) {
        let mut slots = self.slots.lock();
        let unused = slots
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
            && Arc::strong_count(slot) == 2
            && slot.try_lock().is_some_and(|cached| cached.is_none());
        if unused {
            slots.remove(key);
        }
    }

    /// Drop the bundle cached for `key`, whatever its persistence.
    pub fn invalidate(&self, key: &ShapeKey) -> bool {
        let slot = self.slots.lock().get(key).cloned();
        let Some(slot) = slot else {
            return false;
        };
        let taken = slot.lock().take();
        self.prune(key, &slot);
        match taken {
            Some(entry) => {
                entry.bundle.release();
                true
            }
            None => false,
        }
    }

    /// Drop every cached bundle, Strong ones included.
    pub fn clear(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        let mut released = 0;
        for slot in slots {
            if let Some(entry) = slot.lock().take() {
                entry.bundle.release();
                released += 1;
            }
        }
        info!(released, "Descriptor cache cleared");
        released
    }

    /// Number of keys with a cached bundle.
    pub fn len(&self) -> usize {
        self.slots_snapshot()
            .iter()
            .filter(|(_, slot)| slot.lock().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &ShapeKey) -> bool {
        let slot = self.slots.lock().get(key).cloned();
        slot.is_some_and(|slot| slot.lock().is_some())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computes: self.computes.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            ..Default::default()
        };
        for (_, slot) in self.slots_snapshot() {
            // A slot mid-compute has nothing cached yet.
            if let Some(cached) = slot.try_lock() {
                if let Some(entry) = cached.as_ref() {
                    stats.entries += 1;
                    stats.workspace_bytes += entry.bundle.workspace_bytes();
                }
            }
        }
        stats
    }

    fn slots_snapshot(&self) -> Vec<(ShapeKey, Slot)> {
        self.slots
            .lock()
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect()
    }
}

impl CacheHolder for DescriptorCache {
    fn name(&self) -> &str {
        "descriptor cache"
    }

    fn release_device_buffers(&self, device: DeviceId) -> u64 {
        let slots: Vec<(ShapeKey, Slot)> = self
            .slots
            .lock()
            .iter()
            .filter(|(key, _)| key.device == device)
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect();

        let mut freed = 0;
        let mut dropped = 0;
        for (key, slot) in slots {
            let Some(mut cached) = slot.try_lock() else {
                continue;
            };
            let weak = cached
                .as_ref()
                .is_some_and(|entry| entry.persistence == Persistence::Weak);
            if !weak {
                continue;
            }
            let entry = cached.take();
            drop(cached);
            if let Some(entry) = entry {
                freed += entry.bundle.release();
                dropped += 1;
            }
            self.prune(&key, &slot);
        }
        self.evicted.fetch_add(dropped, Ordering::Relaxed);
        debug!(device, dropped, freed, "Released weak descriptor bundles");
        freed
    }
}
