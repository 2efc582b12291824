//! Device discovery and scoped context acquisition.
//!
//! Detects available devices and their memory capacity, applies the configured
//! selection, and owns one bounded context pool per selected device. With no
//! devices (none detected, or disabled by configuration) the registry is empty
//! and callers take their CPU path.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::device::context::{ContextLease, ContextPool, ExecutionContext};
use crate::device::{Device, DeviceId};
use crate::error::{MemError, MemResult};
use crate::handle::HandleContext;
use crate::native::NativeApi;

pub struct DeviceRegistry {
    native: Arc<dyn NativeApi>,
    handles: HandleContext,
    devices: Vec<Device>,
    pools: HashMap<DeviceId, Arc<ContextPool>>,
}

impl DeviceRegistry {
    /// Enumerate devices and build their context pools.
    pub fn new(
        native: Arc<dyn NativeApi>,
        config: &DeviceConfig,
        handles: HandleContext,
    ) -> MemResult<Self> {
        let devices = if config.enabled {
            detect_devices(native.as_ref(), config.selection.as_deref())?
        } else {
            info!("Accelerator support disabled by configuration, running in CPU-only mode");
            Vec::new()
        };

        if devices.is_empty() && config.enabled {
            warn!("No accelerator devices available, running in CPU-only mode");
        }

        let pools = devices
            .iter()
            .map(|d| {
                (
                    d.id,
                    Arc::new(ContextPool::new(d.id, config.contexts_per_device)),
                )
            })
            .collect();

        Ok(Self {
            native,
            handles,
            devices,
            pools,
        })
    }

    /// Selected devices, in id order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// True when no device is available and callers should use the CPU path.
    pub fn is_cpu_only(&self) -> bool {
        self.devices.is_empty()
    }

    /// Lease a context on `device`, blocking until one is free.
    pub fn acquire(&self, device: DeviceId) -> MemResult<ContextLease> {
        let pool = self
            .pools
            .get(&device)
            .ok_or(MemError::DeviceNotFound(device))?;
        pool.acquire(&self.native, &self.handles)
    }

    /// Run `f` with the calling thread bound to a context on `device`.
    ///
    /// The context goes back to the pool however `f` exits, including by panic.
    pub fn with_device<R>(
        &self,
        device: DeviceId,
        f: impl FnOnce(&ExecutionContext) -> R,
    ) -> MemResult<R> {
        let lease = self.acquire(device)?;
        Ok(f(&lease))
    }

    /// Idle contexts currently pooled for `device`.
    pub fn idle_contexts(&self, device: DeviceId) -> usize {
        self.pools.get(&device).map(|p| p.idle()).unwrap_or(0)
    }

    /// Release all idle contexts.
    pub fn shutdown(&self) {
        let released: usize = self.pools.values().map(|p| p.drain()).sum();
        info!(released, "Execution contexts released");
    }
}

/// Enumerate devices through the driver and keep those in `selection`.
fn detect_devices(
    native: &dyn NativeApi,
    selection: Option<&[DeviceId]>,
) -> MemResult<Vec<Device>> {
    let count = native.device_count()?;
    if let Some(selection) = selection {
        for id in selection.iter().filter(|&&id| id >= count) {
            warn!(device = id, available = count, "Selected device does not exist, ignoring");
        }
    }

    let mut devices = Vec::new();
    for id in 0..count {
        if selection.is_some_and(|s| !s.contains(&id)) {
            continue;
        }
        let props = native.device_properties(id)?;
        info!(
            device = id,
            name = %props.name,
            total_memory = props.total_memory,
            "Detected device"
        );
        devices.push(Device {
            id,
            name: props.name,
            total_memory: props.total_memory,
        });
    }
    Ok(devices)
}
