//! Per-device memory accounting.
//!
//! Every counter is an atomic so allocation and free can run concurrently on
//! any thread. Device-local blocks are charged to their device; managed and
//! host blocks are charged to a separate host record that does not count
//! against the device threshold or global ceiling.
//!
//! The device threshold is soft: crossing it only triggers eviction. The global
//! ceiling is hard. A device block claims its bytes with
//! [`MemoryAccounting::reserve`] before the native call, so concurrent
//! allocations can never push the device total past it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::error;

use crate::config::MemoryConfig;
use crate::device::{Device, DeviceId};
use crate::error::{MemError, MemResult};
use crate::native::Residency;

/// Live counters for one device (or the host).
#[derive(Debug)]
pub struct UsageRecord {
    used: AtomicU64,
    peak: AtomicU64,
    read: AtomicU64,
    written: AtomicU64,
    threshold: AtomicU64,
    capacity: u64,
}

/// Point-in-time copy of a [`UsageRecord`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub used_bytes: u64,
    pub peak_bytes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub threshold_bytes: u64,
    pub capacity_bytes: u64,
}

impl UsageRecord {
    fn new(capacity: u64, threshold: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            read: AtomicU64::new(0),
            written: AtomicU64::new(0),
            threshold: AtomicU64::new(threshold),
            capacity,
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Relaxed)
    }

    fn add(&self, size: u64) {
        let used = self.used.fetch_add(size, Ordering::AcqRel) + size;
        self.peak.fetch_max(used, Ordering::AcqRel);
    }

    fn sub(&self, size: u64) {
        saturating_sub(&self.used, size);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            used_bytes: self.used.load(Ordering::Acquire),
            peak_bytes: self.peak.load(Ordering::Acquire),
            bytes_read: self.read.load(Ordering::Relaxed),
            bytes_written: self.written.load(Ordering::Relaxed),
            threshold_bytes: self.threshold(),
            capacity_bytes: self.capacity,
        }
    }
}

fn saturating_sub(counter: &AtomicU64, size: u64) {
    let result = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
        Some(used.saturating_sub(size))
    });
    if let Ok(previous) = result {
        if previous < size {
            error!(previous, size, "Usage underflow: freed more than was accounted");
        }
    }
}

/// Why an allocation should be preceded by eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    DeviceThreshold { projected: u64, threshold: u64 },
    GlobalCeiling { projected: u64, ceiling: u64 },
}

/// Usage records for every selected device plus the host.
#[derive(Debug)]
pub struct MemoryAccounting {
    devices: BTreeMap<DeviceId, UsageRecord>,
    host: UsageRecord,
    /// Device bytes charged or reserved, across all devices.
    global_used: AtomicU64,
    global_ceiling: AtomicU64,
}

impl MemoryAccounting {
    pub fn new(devices: &[Device], config: &MemoryConfig) -> Self {
        let records: BTreeMap<_, _> = devices
            .iter()
            .map(|d| {
                (
                    d.id,
                    UsageRecord::new(d.total_memory, config.threshold_for(d.total_memory)),
                )
            })
            .collect();
        let ceiling = config
            .global_ceiling_bytes
            .unwrap_or_else(|| devices.iter().map(|d| d.total_memory).sum());

        Self {
            devices: records,
            host: UsageRecord::new(u64::MAX, u64::MAX),
            global_used: AtomicU64::new(0),
            global_ceiling: AtomicU64::new(ceiling),
        }
    }

    /// Record charged for blocks with this residency.
    pub fn record(&self, residency: Residency) -> MemResult<&UsageRecord> {
        match residency {
            Residency::Device(id) => self.devices.get(&id).ok_or(MemError::DeviceNotFound(id)),
            Residency::Managed | Residency::Host => Ok(&self.host),
        }
    }

    pub fn device_ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.keys().copied()
    }

    /// Sum of device usage plus in-flight reservations (host excluded).
    pub fn global_used(&self) -> u64 {
        self.global_used.load(Ordering::Acquire)
    }

    pub fn global_ceiling(&self) -> u64 {
        self.global_ceiling.load(Ordering::Relaxed)
    }

    pub fn set_global_ceiling(&self, bytes: u64) {
        self.global_ceiling.store(bytes, Ordering::Relaxed);
    }

    pub fn set_threshold(&self, device: DeviceId, bytes: u64) -> MemResult<()> {
        let record = self.record(Residency::Device(device))?;
        record.threshold.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Whether allocating `size` more bytes would cross the device threshold or
    /// the global ceiling.
    pub fn pressure(&self, residency: Residency, size: u64) -> Option<Pressure> {
        let Residency::Device(id) = residency else {
            return None;
        };
        let record = self.devices.get(&id)?;

        let projected = record.used().saturating_add(size);
        let threshold = record.threshold();
        if projected > threshold {
            return Some(Pressure::DeviceThreshold {
                projected,
                threshold,
            });
        }

        let projected = self.global_used().saturating_add(size);
        let ceiling = self.global_ceiling();
        if projected > ceiling {
            return Some(Pressure::GlobalCeiling { projected, ceiling });
        }
        None
    }

    /// Claim `size` bytes of the global ceiling for a device block that is
    /// about to be allocated. Managed and host blocks always succeed.
    ///
    /// Follow with [`commit`](Self::commit) once the block exists, or
    /// [`cancel_reservation`](Self::cancel_reservation) if it never will.
    pub fn reserve(&self, residency: Residency, size: u64) -> Result<(), Pressure> {
        if residency.device().is_none() {
            return Ok(());
        }
        let ceiling = self.global_ceiling();
        self.global_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let projected = used.saturating_add(size);
                (projected <= ceiling).then_some(projected)
            })
            .map(|_| ())
            .map_err(|used| Pressure::GlobalCeiling {
                projected: used.saturating_add(size),
                ceiling,
            })
    }

    pub fn cancel_reservation(&self, residency: Residency, size: u64) {
        if residency.device().is_some() {
            saturating_sub(&self.global_used, size);
        }
    }

    /// Charge a block whose bytes were already claimed with [`reserve`](Self::reserve).
    pub fn commit(&self, residency: Residency, size: u64) -> MemResult<()> {
        self.record(residency)?.add(size);
        Ok(())
    }

    /// Charge `size` bytes without checking the global ceiling.
    pub fn record_alloc(&self, residency: Residency, size: u64) -> MemResult<()> {
        let record = self.record(residency)?;
        if residency.device().is_some() {
            self.global_used.fetch_add(size, Ordering::AcqRel);
        }
        record.add(size);
        Ok(())
    }

    pub fn record_free(&self, residency: Residency, size: u64) -> MemResult<()> {
        self.record(residency)?.sub(size);
        self.cancel_reservation(residency, size);
        Ok(())
    }

    pub fn record_read(&self, residency: Residency, bytes: u64) -> MemResult<()> {
        self.record(residency)?.read.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_write(&self, residency: Residency, bytes: u64) -> MemResult<()> {
        self.record(residency)?
            .written
            .fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Forget all usage on `device` after the driver tore its memory down.
    pub fn reset_usage(&self, device: DeviceId) -> MemResult<()> {
        let previous = self
            .record(Residency::Device(device))?
            .used
            .swap(0, Ordering::AcqRel);
        saturating_sub(&self.global_used, previous);
        Ok(())
    }

    pub fn snapshot(&self, device: DeviceId) -> MemResult<UsageSnapshot> {
        Ok(self.record(Residency::Device(device))?.snapshot())
    }

    pub fn host_snapshot(&self) -> UsageSnapshot {
        self.host.snapshot()
    }

    /// Snapshots of every device, in id order.
    pub fn snapshots(&self) -> Vec<(DeviceId, UsageSnapshot)> {
        self.devices
            .iter()
            .map(|(&id, record)| (id, record.snapshot()))
            .collect()
    }
}
