//! Top-level wiring.
//!
//! [`Runtime`] builds the device registry, accounting, eviction coordinator,
//! allocator, descriptor cache and spill store from one [`Config`], and is the
//! entry point the tensor engine talks to.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::cache::{BundleLease, DescriptorCache, ShapeKey};
use crate::config::Config;
use crate::device::{Device, DeviceId, DeviceRegistry, ExecutionContext};
use crate::error::{MemError, MemResult};
use crate::handle::{EpochCounter, HandleContext};
use crate::memory::{
    AllocStatsSnapshot, Allocator, EvictionCause, EvictionCoordinator, EvictionReport,
    MemoryAccounting, MemoryBlock, SpillStore, UsageSnapshot,
};
use crate::native::sim::SimulatedAccelerator;
use crate::native::{MemoryKind, NativeApi};

pub struct Runtime {
    config: Config,
    native: Arc<dyn NativeApi>,
    epochs: Arc<EpochCounter>,
    registry: DeviceRegistry,
    accounting: Arc<MemoryAccounting>,
    eviction: Arc<EvictionCoordinator>,
    allocator: Arc<Allocator>,
    descriptors: Arc<DescriptorCache>,
    spill: Arc<SpillStore>,
}

impl Runtime {
    pub fn new(config: Config, native: Arc<dyn NativeApi>) -> MemResult<Self> {
        let epochs = Arc::new(EpochCounter::new());
        let handles = HandleContext::new(Arc::clone(&epochs))
            .with_tracing(config.debug.trace_handles)
            .with_leak_warnings(config.debug.leak_warnings);

        let registry = DeviceRegistry::new(Arc::clone(&native), &config.devices, handles.clone())?;
        let accounting = Arc::new(MemoryAccounting::new(registry.devices(), &config.memory));
        let eviction = Arc::new(EvictionCoordinator::new(
            Arc::clone(&accounting),
            config.eviction.conservative,
        ));
        let allocator = Arc::new(Allocator::new(
            Arc::clone(&native),
            Arc::clone(&accounting),
            Arc::clone(&eviction),
            handles.clone(),
            config.memory.clone(),
        ));
        let descriptors = Arc::new(DescriptorCache::new(
            Arc::clone(&native),
            Arc::clone(&allocator),
            handles,
            config.cache.default_persistence,
        ));
        let spill = Arc::new(SpillStore::new(Arc::clone(&allocator), &config.eviction));

        eviction.register_cache(&descriptors);
        eviction.register_resident(&spill);

        info!(
            devices = registry.devices().len(),
            global_ceiling = accounting.global_ceiling(),
            max_retries = config.memory.max_retries,
            conservative = config.eviction.conservative,
            "Memory runtime initialized"
        );

        Ok(Self {
            config,
            native,
            epochs,
            registry,
            accounting,
            eviction,
            allocator,
            descriptors,
            spill,
        })
    }

    /// A runtime over `count` simulated devices of `capacity` bytes each.
    pub fn simulated(
        config: Config,
        count: usize,
        capacity: u64,
    ) -> MemResult<(Self, Arc<SimulatedAccelerator>)> {
        let sim = Arc::new(SimulatedAccelerator::uniform(count, capacity));
        let runtime = Self::new(config, sim.clone())?;
        Ok((runtime, sim))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn devices(&self) -> &[Device] {
        self.registry.devices()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn accounting(&self) -> &Arc<MemoryAccounting> {
        &self.accounting
    }

    pub fn eviction(&self) -> &Arc<EvictionCoordinator> {
        &self.eviction
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn descriptors(&self) -> &Arc<DescriptorCache> {
        &self.descriptors
    }

    pub fn spill(&self) -> &Arc<SpillStore> {
        &self.spill
    }

    pub fn epoch(&self) -> u64 {
        self.epochs.current()
    }

    /// Allocate a block; see [`Allocator::allocate`].
    pub fn allocate(
        &self,
        device: DeviceId,
        size: i64,
        kind: MemoryKind,
        zero_fill: bool,
    ) -> MemResult<MemoryBlock> {
        if kind == MemoryKind::DeviceLocal && self.registry.is_cpu_only() {
            return Err(MemError::NoDevices);
        }
        self.allocator.allocate(device, size, kind, zero_fill)
    }

    /// Descriptor/workspace bundle for `key`.
    pub fn lookup(&self, key: &ShapeKey) -> MemResult<BundleLease> {
        self.descriptors.lookup(key)
    }

    /// Run `f` bound to an execution context on `device`.
    pub fn with_device<R>(
        &self,
        device: DeviceId,
        f: impl FnOnce(&ExecutionContext) -> R,
    ) -> MemResult<R> {
        self.registry.with_device(device, f)
    }

    /// Run an eviction round outside the allocation path.
    pub fn evict(&self, device: Option<DeviceId>) -> EvictionReport {
        self.eviction.evict(device, EvictionCause::Manual)
    }

    pub fn snapshot(&self, device: DeviceId) -> MemResult<UsageSnapshot> {
        self.accounting.snapshot(device)
    }

    pub fn snapshots(&self) -> Vec<(DeviceId, UsageSnapshot)> {
        self.accounting.snapshots()
    }

    pub fn alloc_stats(&self) -> AllocStatsSnapshot {
        self.allocator.stats()
    }

    /// Tear down all native state and start a new epoch.
    ///
    /// Every device-local block, descriptor and context created before the
    /// reset becomes stale: accessing it fails, and giving it back never frees
    /// it a second time. Device usage counters restart from zero. Managed and
    /// host blocks are not torn down; they stay usable and stay charged until
    /// freed. Returns the new epoch.
    pub fn reset(&self) -> MemResult<u64> {
        warn!("Catastrophic reset requested; invalidating all native handles");
        for device in self.registry.devices() {
            if let Err(err) = self.native.reset_device(device.id) {
                error!(device = device.id, error = %err, "Device reset failed");
                return Err(err.into());
            }
        }
        let epoch = self.epochs.advance();
        for device in self.registry.devices() {
            self.accounting.reset_usage(device.id)?;
        }
        info!(epoch, "Reset complete");
        Ok(epoch)
    }

    /// Release cached bundles, spilled data and idle contexts.
    pub fn shutdown(&self) {
        self.descriptors.clear();
        self.spill.clear();
        self.registry.shutdown();
        info!("Memory runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    #[test]
    fn test_cpu_only_rejects_device_memory() {
        let config = Config {
            devices: DeviceConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let (rt, _sim) = Runtime::simulated(config, 2, 1 << 20).unwrap();
        assert!(rt.devices().is_empty());
        assert!(matches!(
            rt.allocate(0, 16, MemoryKind::DeviceLocal, false),
            Err(MemError::NoDevices)
        ));

        let host = rt.allocate(0, 16, MemoryKind::Host, false).unwrap();
        host.free_ref().unwrap();
    }

    #[test]
    fn test_global_ceiling_defaults_to_capacity() {
        let (rt, _sim) = Runtime::simulated(Config::default(), 3, 1000).unwrap();
        assert_eq!(rt.accounting().global_ceiling(), 3000);
    }

    #[test]
    fn test_reset_invalidates_and_zeroes() {
        let (rt, sim) = Runtime::simulated(Config::default(), 1, 1 << 20).unwrap();
        let block = rt.allocate(0, 256, MemoryKind::DeviceLocal, true).unwrap();
        assert_eq!(rt.snapshot(0).unwrap().used_bytes, 256);

        assert_eq!(rt.reset().unwrap(), 1);
        assert_eq!(rt.snapshot(0).unwrap().used_bytes, 0);
        assert!(matches!(
            block.write_bytes(&[0], 0),
            Err(MemError::StaleResource { .. })
        ));

        // Giving back the stale owner frees nothing and uncharges nothing.
        assert!(!block.free_ref().unwrap());
        assert_eq!(sim.counters().free_calls.load(std::sync::atomic::Ordering::Relaxed), 0);
        assert_eq!(rt.snapshot(0).unwrap().used_bytes, 0);
    }
}
