//! Spill store for device-resident engine data.
//!
//! The tensor engine parks named blocks here. Under memory pressure the
//! eviction coordinator asks the store to spill: each block resident on the
//! target device is copied to host memory (zstd-compressed when enabled) and
//! its device owner is given back. A later [`SpillStore::fetch`] restores the
//! data onto the original device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EvictionConfig;
use crate::device::DeviceId;
use crate::error::MemResult;
use crate::memory::allocator::Allocator;
use crate::memory::block::MemoryBlock;
use crate::memory::eviction::ResidentDataCache;
use crate::native::Residency;

/// Host copy of a spilled block.
#[derive(Debug)]
struct HostCopy {
    data: Vec<u8>,
    compressed: bool,
    size: u64,
    residency: Residency,
}

#[derive(Debug)]
enum Slot {
    Resident(MemoryBlock),
    Spilled(HostCopy),
}

/// Counts exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpillStats {
    pub resident_entries: usize,
    pub spilled_entries: usize,
    pub host_bytes: u64,
    pub total_spilled_bytes: u64,
    pub restores: u64,
}

pub struct SpillStore {
    allocator: Arc<Allocator>,
    entries: Mutex<HashMap<String, Slot>>,
    compression: bool,
    zstd_level: i32,
    spilled_bytes: AtomicU64,
    restores: AtomicU64,
}

impl SpillStore {
    pub fn new(allocator: Arc<Allocator>, config: &EvictionConfig) -> Self {
        Self {
            allocator,
            entries: Mutex::new(HashMap::new()),
            compression: config.spill_compression,
            zstd_level: config.zstd_level,
            spilled_bytes: AtomicU64::new(0),
            restores: AtomicU64::new(0),
        }
    }

    /// Park `block` under `name`, taking over the caller's owner. Any previous
    /// entry under the same name is released.
    pub fn put(&self, name: impl Into<String>, block: MemoryBlock) {
        let previous = self.entries.lock().insert(name.into(), Slot::Resident(block));
        if let Some(Slot::Resident(old)) = previous {
            let _ = old.free_ref();
        }
    }

    /// A new owner of the block parked under `name`, restoring it to its
    /// original device first if it was spilled.
    pub fn fetch(&self, name: &str) -> MemResult<Option<MemoryBlock>> {
        let host = {
            let mut entries = self.entries.lock();
            match entries.remove(name) {
                None => return Ok(None),
                Some(Slot::Resident(block)) => {
                    let owner = block.add_ref();
                    entries.insert(name.to_string(), Slot::Resident(block));
                    return owner.map(Some);
                }
                Some(Slot::Spilled(host)) => host,
            }
        };

        // Restoring allocates, which may evict; the entries lock must be free.
        match self.restore(&host) {
            Ok(block) => {
                let owner = block.add_ref()?;
                self.entries
                    .lock()
                    .insert(name.to_string(), Slot::Resident(block));
                self.restores.fetch_add(1, Ordering::Relaxed);
                debug!(name, size = host.size, residency = %host.residency, "Restored spilled block");
                Ok(Some(owner))
            }
            Err(err) => {
                self.entries
                    .lock()
                    .insert(name.to_string(), Slot::Spilled(host));
                Err(err)
            }
        }
    }

    fn restore(&self, host: &HostCopy) -> MemResult<MemoryBlock> {
        let bytes = if host.compressed {
            zstd::decode_all(host.data.as_slice())?
        } else {
            host.data.clone()
        };
        let block = self.allocator.allocate(
            host.residency.device().unwrap_or(0),
            host.size as i64,
            host.residency.kind(),
            false,
        )?;
        if let Err(err) = block.write_bytes(&bytes, 0) {
            let _ = block.free_ref();
            return Err(err);
        }
        Ok(block)
    }

    /// Drop the entry under `name`. Returns false if there was none.
    pub fn remove(&self, name: &str) -> bool {
        match self.entries.lock().remove(name) {
            Some(Slot::Resident(block)) => {
                let _ = block.free_ref();
                true
            }
            Some(Slot::Spilled(_)) => true,
            None => false,
        }
    }

    pub fn is_spilled(&self, name: &str) -> bool {
        matches!(self.entries.lock().get(name), Some(Slot::Spilled(_)))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every entry.
    pub fn clear(&self) {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        for (_, slot) in drained {
            if let Slot::Resident(block) = slot {
                let _ = block.free_ref();
            }
        }
    }

    pub fn stats(&self) -> SpillStats {
        let entries = self.entries.lock();
        let mut stats = SpillStats {
            total_spilled_bytes: self.spilled_bytes.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
            ..Default::default()
        };
        for slot in entries.values() {
            match slot {
                Slot::Resident(_) => stats.resident_entries += 1,
                Slot::Spilled(host) => {
                    stats.spilled_entries += 1;
                    stats.host_bytes += host.data.len() as u64;
                }
            }
        }
        stats
    }

    fn spill_block(&self, block: &MemoryBlock) -> MemResult<HostCopy> {
        let raw = block.to_host_vec()?;
        let (data, compressed) = if self.compression {
            (zstd::encode_all(raw.as_slice(), self.zstd_level)?, true)
        } else {
            (raw, false)
        };
        Ok(HostCopy {
            data,
            compressed,
            size: block.size(),
            residency: block.residency(),
        })
    }
}

impl ResidentDataCache for SpillStore {
    fn name(&self) -> &str {
        "spill store"
    }

    fn spill_to_host(&self, device: DeviceId) -> u64 {
        // Held by a fetch or put on this thread (or another): skip this round.
        let Some(mut entries) = self.entries.try_lock() else {
            debug!(device, "Spill store busy, skipping");
            return 0;
        };

        let mut freed = 0;
        for (name, slot) in entries.iter_mut() {
            let Slot::Resident(block) = slot else {
                continue;
            };
            if block.device() != Some(device) {
                continue;
            }
            let host = match self.spill_block(block) {
                Ok(host) => host,
                Err(err) => {
                    warn!(name = %name, device, error = %err, "Could not spill block, keeping it resident");
                    continue;
                }
            };
            let size = block.size();
            if let Ok(true) = block.free_ref() {
                freed += size;
            }
            debug!(name = %name, device, size, host_bytes = host.data.len(), "Spilled block to host");
            *slot = Slot::Spilled(host);
        }
        self.spilled_bytes.fetch_add(freed, Ordering::Relaxed);
        freed
    }
}
