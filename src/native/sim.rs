//! Simulated accelerator.
//!
//! Backs every allocation with host memory and enforces per-device capacity,
//! so the allocator's OOM and eviction paths behave as they would on real
//! hardware. Used for CPU-only runs and throughout the test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::key::ShapeKey;
use crate::device::DeviceId;
use crate::native::{
    AlgorithmChoice, DescriptorSpec, DeviceProperties, NativeApi, NativeError, NativeHandle,
    NativePtr, Residency,
};

/// Description of one simulated device.
#[derive(Debug, Clone)]
pub struct SimDeviceSpec {
    pub name: String,
    pub capacity: u64,
}

/// How upcoming `malloc` calls should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailurePlan {
    None,
    Next(u32),
    Always,
}

#[derive(Debug)]
struct Allocation {
    residency: Residency,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct SimState {
    allocations: HashMap<u64, Allocation>,
    used: Vec<u64>,
    descriptors: HashMap<u64, DeviceId>,
    contexts: HashMap<u64, DeviceId>,
}

/// Call counters, readable from tests.
#[derive(Debug, Default)]
pub struct SimCounters {
    pub malloc_calls: AtomicUsize,
    pub failed_mallocs: AtomicUsize,
    pub free_calls: AtomicUsize,
    pub invalid_frees: AtomicUsize,
    pub sync_calls: AtomicUsize,
    pub algorithm_queries: AtomicUsize,
    pub descriptors_created: AtomicUsize,
    pub descriptors_destroyed: AtomicUsize,
    pub contexts_created: AtomicUsize,
    pub contexts_destroyed: AtomicUsize,
}

/// In-process accelerator with host-backed memory.
pub struct SimulatedAccelerator {
    devices: Vec<SimDeviceSpec>,
    state: Mutex<SimState>,
    failures: Mutex<FailurePlan>,
    next_id: AtomicU64,
    counters: SimCounters,
}

impl SimulatedAccelerator {
    pub fn new(devices: Vec<SimDeviceSpec>) -> Self {
        let state = SimState {
            used: vec![0; devices.len()],
            ..Default::default()
        };
        Self {
            devices,
            state: Mutex::new(state),
            failures: Mutex::new(FailurePlan::None),
            // Start away from zero so a null-looking pointer is never handed out.
            next_id: AtomicU64::new(0x1000),
            counters: SimCounters::default(),
        }
    }

    /// `count` identical devices of `capacity` bytes each.
    pub fn uniform(count: usize, capacity: u64) -> Self {
        let devices = (0..count)
            .map(|i| SimDeviceSpec {
                name: format!("Simulated Accelerator {i}"),
                capacity,
            })
            .collect();
        Self::new(devices)
    }

    /// Two 8 GB devices, resembling a consumer dual-GPU workstation.
    pub fn workstation() -> Self {
        Self::uniform(2, 8 * 1024 * 1024 * 1024)
    }

    /// Make the next `n` native allocations fail with OOM.
    pub fn fail_next_mallocs(&self, n: u32) {
        *self.failures.lock() = FailurePlan::Next(n);
    }

    /// Make every native allocation fail with OOM until cleared.
    pub fn fail_all_mallocs(&self) {
        *self.failures.lock() = FailurePlan::Always;
    }

    pub fn clear_failures(&self) {
        *self.failures.lock() = FailurePlan::None;
    }

    pub fn counters(&self) -> &SimCounters {
        &self.counters
    }

    /// Bytes currently held by live allocations on `device`.
    pub fn device_used(&self, device: DeviceId) -> u64 {
        self.state.lock().used.get(device).copied().unwrap_or(0)
    }

    /// Number of live allocations of any kind.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn live_descriptors(&self) -> usize {
        self.state.lock().descriptors.len()
    }

    fn next_id(&self) -> u64 {
        // Keep ids 256-byte aligned like real device pointers.
        self.next_id.fetch_add(0x100, Ordering::Relaxed)
    }

    fn check_device(&self, device: DeviceId) -> Result<(), NativeError> {
        if device < self.devices.len() {
            Ok(())
        } else {
            Err(NativeError::InvalidDevice(device))
        }
    }

    fn should_fail(&self) -> bool {
        let mut plan = self.failures.lock();
        match *plan {
            FailurePlan::None => false,
            FailurePlan::Always => true,
            FailurePlan::Next(n) => {
                *plan = if n <= 1 {
                    FailurePlan::None
                } else {
                    FailurePlan::Next(n - 1)
                };
                true
            }
        }
    }

    fn bounds(offset: u64, len: u64, size: u64) -> Result<std::ops::Range<usize>, NativeError> {
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset as usize..end as usize),
            _ => Err(NativeError::OutOfBounds { offset, len, size }),
        }
    }
}

impl NativeApi for SimulatedAccelerator {
    fn device_count(&self) -> Result<usize, NativeError> {
        Ok(self.devices.len())
    }

    fn device_properties(&self, device: DeviceId) -> Result<DeviceProperties, NativeError> {
        let spec = self
            .devices
            .get(device)
            .ok_or(NativeError::InvalidDevice(device))?;
        Ok(DeviceProperties {
            name: spec.name.clone(),
            total_memory: spec.capacity,
        })
    }

    fn create_context(&self, device: DeviceId) -> Result<NativeHandle, NativeError> {
        self.check_device(device)?;
        let id = self.next_id();
        self.state.lock().contexts.insert(id, device);
        self.counters.contexts_created.fetch_add(1, Ordering::Relaxed);
        Ok(NativeHandle(id))
    }

    fn destroy_context(&self, device: DeviceId, context: NativeHandle) {
        if self.state.lock().contexts.remove(&context.0).is_none() {
            warn!(device, handle = context.0, "Destroying unknown context");
            return;
        }
        self.counters.contexts_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn malloc(&self, residency: Residency, size: u64) -> Result<NativePtr, NativeError> {
        self.counters.malloc_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(device) = residency.device() {
            self.check_device(device)?;
        }
        if self.should_fail() {
            self.counters.failed_mallocs.fetch_add(1, Ordering::Relaxed);
            return Err(NativeError::OutOfMemory { requested: size });
        }

        let mut state = self.state.lock();
        if let Some(device) = residency.device() {
            let capacity = self.devices[device].capacity;
            if state.used[device] + size > capacity {
                self.counters.failed_mallocs.fetch_add(1, Ordering::Relaxed);
                return Err(NativeError::OutOfMemory { requested: size });
            }
            state.used[device] += size;
        }

        let id = self.next_id();
        state.allocations.insert(
            id,
            Allocation {
                residency,
                data: vec![0xA5; size as usize],
            },
        );
        Ok(NativePtr(id))
    }

    fn free(&self, residency: Residency, ptr: NativePtr) -> Result<(), NativeError> {
        self.counters.free_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let alloc = match state.allocations.remove(&ptr.0) {
            Some(alloc) if alloc.residency == residency => alloc,
            Some(alloc) => {
                state.allocations.insert(ptr.0, alloc);
                self.counters.invalid_frees.fetch_add(1, Ordering::Relaxed);
                return Err(NativeError::InvalidPointer(ptr.0));
            }
            None => {
                self.counters.invalid_frees.fetch_add(1, Ordering::Relaxed);
                return Err(NativeError::InvalidPointer(ptr.0));
            }
        };
        if let Some(device) = residency.device() {
            state.used[device] -= alloc.data.len() as u64;
        }
        Ok(())
    }

    fn memset_zero(&self, _residency: Residency, ptr: NativePtr, size: u64) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        let alloc = state
            .allocations
            .get_mut(&ptr.0)
            .ok_or(NativeError::InvalidPointer(ptr.0))?;
        let range = Self::bounds(0, size, alloc.data.len() as u64)?;
        alloc.data[range].fill(0);
        Ok(())
    }

    fn copy_host_to_device(
        &self,
        _residency: Residency,
        dst: NativePtr,
        offset: u64,
        src: &[u8],
    ) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        let alloc = state
            .allocations
            .get_mut(&dst.0)
            .ok_or(NativeError::InvalidPointer(dst.0))?;
        let range = Self::bounds(offset, src.len() as u64, alloc.data.len() as u64)?;
        alloc.data[range].copy_from_slice(src);
        Ok(())
    }

    fn copy_device_to_host(
        &self,
        _residency: Residency,
        src: NativePtr,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<(), NativeError> {
        let state = self.state.lock();
        let alloc = state
            .allocations
            .get(&src.0)
            .ok_or(NativeError::InvalidPointer(src.0))?;
        let range = Self::bounds(offset, dst.len() as u64, alloc.data.len() as u64)?;
        dst.copy_from_slice(&alloc.data[range]);
        Ok(())
    }

    fn copy_device_to_device(
        &self,
        _src_residency: Residency,
        src: NativePtr,
        src_offset: u64,
        _dst_residency: Residency,
        dst: NativePtr,
        dst_offset: u64,
        len: u64,
    ) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        let staged = {
            let alloc = state
                .allocations
                .get(&src.0)
                .ok_or(NativeError::InvalidPointer(src.0))?;
            let range = Self::bounds(src_offset, len, alloc.data.len() as u64)?;
            alloc.data[range].to_vec()
        };
        let alloc = state
            .allocations
            .get_mut(&dst.0)
            .ok_or(NativeError::InvalidPointer(dst.0))?;
        let range = Self::bounds(dst_offset, len, alloc.data.len() as u64)?;
        alloc.data[range].copy_from_slice(&staged);
        Ok(())
    }

    fn synchronize(&self, device: Option<DeviceId>) -> Result<(), NativeError> {
        if let Some(device) = device {
            self.check_device(device)?;
        }
        self.counters.sync_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn create_descriptor(
        &self,
        device: DeviceId,
        spec: &DescriptorSpec,
    ) -> Result<NativeHandle, NativeError> {
        self.check_device(device)?;
        let id = self.next_id();
        self.state.lock().descriptors.insert(id, device);
        self.counters.descriptors_created.fetch_add(1, Ordering::Relaxed);
        debug!(device, handle = id, dims = ?spec.dims, "Created descriptor");
        Ok(NativeHandle(id))
    }

    fn destroy_descriptor(&self, descriptor: NativeHandle) {
        if self.state.lock().descriptors.remove(&descriptor.0).is_none() {
            warn!(handle = descriptor.0, "Destroying unknown descriptor");
            return;
        }
        self.counters.descriptors_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn select_algorithm(&self, key: &ShapeKey) -> Result<AlgorithmChoice, NativeError> {
        self.check_device(key.device)?;
        self.counters.algorithm_queries.fetch_add(1, Ordering::Relaxed);

        // Scratch proportional to one output tensor, scaled by batch.
        let output_elems: u64 = key.output.iter().map(|&d| d as u64).product();
        let workspace_bytes =
            output_elems * key.precision.size_bytes() as u64 * key.batch_len.max(1) as u64;
        let algorithm = (key.filter.iter().sum::<usize>() % 4) as u32;

        Ok(AlgorithmChoice {
            algorithm,
            workspace_bytes,
        })
    }

    fn reset_device(&self, device: DeviceId) -> Result<(), NativeError> {
        self.check_device(device)?;
        let mut state = self.state.lock();
        state
            .allocations
            .retain(|_, alloc| alloc.residency.device() != Some(device));
        state.used[device] = 0;
        state.descriptors.retain(|_, d| *d != device);
        state.contexts.retain(|_, d| *d != device);
        Ok(())
    }
}
