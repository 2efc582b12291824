//! CUDA driver backend via cudarc.
//!
//! Device-local memory lives in `CudaSlice<u8>` buffers owned by this backend
//! and addressed through opaque ids. Managed and host kinds are served from
//! host memory. Descriptors are host-side records; algorithm selection uses the
//! same output-sized workspace heuristic as the simulator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cudarc::driver::{sys, CudaContext, CudaSlice, DriverError};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::cache::key::ShapeKey;
use crate::device::DeviceId;
use crate::native::{
    AlgorithmChoice, DescriptorSpec, DeviceProperties, NativeApi, NativeError, NativeHandle,
    NativePtr, Residency,
};

enum Buffer {
    Device(DeviceId, CudaSlice<u8>),
    Host(Vec<u8>),
}

impl From<DriverError> for NativeError {
    fn from(err: DriverError) -> Self {
        NativeError::Driver(format!("{err:?}"))
    }
}

fn map_alloc_error(err: DriverError, requested: u64) -> NativeError {
    if err.0 == sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY {
        NativeError::OutOfMemory { requested }
    } else {
        err.into()
    }
}

/// CUDA implementation of [`NativeApi`].
pub struct CudaBackend {
    contexts: Vec<Arc<CudaContext>>,
    buffers: Mutex<HashMap<u64, Buffer>>,
    handles: Mutex<HashMap<u64, DeviceId>>,
    next_id: AtomicU64,
}

impl CudaBackend {
    /// Open a context on every visible device.
    pub fn new() -> Result<Self, NativeError> {
        let count = CudaContext::device_count()? as usize;
        let contexts = (0..count)
            .map(CudaContext::new)
            .collect::<Result<Vec<_>, _>>()?;
        info!(devices = count, "CUDA backend initialized");
        Ok(Self {
            contexts,
            buffers: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0x1000),
        })
    }

    fn context(&self, device: DeviceId) -> Result<&Arc<CudaContext>, NativeError> {
        self.contexts
            .get(device)
            .ok_or(NativeError::InvalidDevice(device))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(0x100, Ordering::Relaxed)
    }

    fn check_range(offset: u64, len: u64, size: u64) -> Result<std::ops::Range<usize>, NativeError> {
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset as usize..end as usize),
            _ => Err(NativeError::OutOfBounds { offset, len, size }),
        }
    }

    fn read_bytes(&self, ptr: NativePtr, offset: u64, len: u64) -> Result<Vec<u8>, NativeError> {
        let buffers = self.buffers.lock();
        match buffers.get(&ptr.0) {
            Some(Buffer::Device(device, slice)) => {
                let range = Self::check_range(offset, len, slice.len() as u64)?;
                let stream = self.context(*device)?.default_stream();
                let mut out = vec![0u8; range.len()];
                stream.memcpy_dtoh(&slice.slice(range), &mut out)?;
                stream.synchronize()?;
                Ok(out)
            }
            Some(Buffer::Host(data)) => {
                let range = Self::check_range(offset, len, data.len() as u64)?;
                Ok(data[range].to_vec())
            }
            None => Err(NativeError::InvalidPointer(ptr.0)),
        }
    }

    fn write_bytes(&self, ptr: NativePtr, offset: u64, src: &[u8]) -> Result<(), NativeError> {
        let mut buffers = self.buffers.lock();
        match buffers.get_mut(&ptr.0) {
            Some(Buffer::Device(device, slice)) => {
                let range = Self::check_range(offset, src.len() as u64, slice.len() as u64)?;
                let stream = self.context(*device)?.default_stream();
                let mut view = slice.slice_mut(range);
                stream.memcpy_htod(src, &mut view)?;
                Ok(())
            }
            Some(Buffer::Host(data)) => {
                let range = Self::check_range(offset, src.len() as u64, data.len() as u64)?;
                data[range].copy_from_slice(src);
                Ok(())
            }
            None => Err(NativeError::InvalidPointer(ptr.0)),
        }
    }
}

impl NativeApi for CudaBackend {
    fn device_count(&self) -> Result<usize, NativeError> {
        Ok(self.contexts.len())
    }

    fn device_properties(&self, device: DeviceId) -> Result<DeviceProperties, NativeError> {
        let ctx = self.context(device)?;
        let total_memory = unsafe { cudarc::driver::result::device::total_mem(ctx.cu_device()) }?;
        Ok(DeviceProperties {
            name: ctx.name()?,
            total_memory: total_memory as u64,
        })
    }

    fn create_context(&self, device: DeviceId) -> Result<NativeHandle, NativeError> {
        self.context(device)?;
        let id = self.next_id();
        self.handles.lock().insert(id, device);
        Ok(NativeHandle(id))
    }

    fn destroy_context(&self, _device: DeviceId, context: NativeHandle) {
        self.handles.lock().remove(&context.0);
    }

    fn malloc(&self, residency: Residency, size: u64) -> Result<NativePtr, NativeError> {
        let buffer = match residency {
            Residency::Device(device) => {
                let stream = self.context(device)?.default_stream();
                let slice = stream
                    .alloc_zeros::<u8>(size as usize)
                    .map_err(|e| map_alloc_error(e, size))?;
                Buffer::Device(device, slice)
            }
            Residency::Managed | Residency::Host => Buffer::Host(vec![0u8; size as usize]),
        };
        let id = self.next_id();
        self.buffers.lock().insert(id, buffer);
        Ok(NativePtr(id))
    }

    fn free(&self, _residency: Residency, ptr: NativePtr) -> Result<(), NativeError> {
        // Dropping the CudaSlice returns the memory to the driver.
        self.buffers
            .lock()
            .remove(&ptr.0)
            .map(|_| ())
            .ok_or(NativeError::InvalidPointer(ptr.0))
    }

    fn memset_zero(&self, _residency: Residency, ptr: NativePtr, size: u64) -> Result<(), NativeError> {
        let mut buffers = self.buffers.lock();
        match buffers.get_mut(&ptr.0) {
            Some(Buffer::Device(device, slice)) => {
                let range = Self::check_range(0, size, slice.len() as u64)?;
                let stream = self.context(*device)?.default_stream();
                let mut view = slice.slice_mut(range);
                stream.memset_zeros(&mut view)?;
                Ok(())
            }
            Some(Buffer::Host(data)) => {
                let range = Self::check_range(0, size, data.len() as u64)?;
                data[range].fill(0);
                Ok(())
            }
            None => Err(NativeError::InvalidPointer(ptr.0)),
        }
    }

    fn copy_host_to_device(
        &self,
        _residency: Residency,
        dst: NativePtr,
        offset: u64,
        src: &[u8],
    ) -> Result<(), NativeError> {
        self.write_bytes(dst, offset, src)
    }

    fn copy_device_to_host(
        &self,
        _residency: Residency,
        src: NativePtr,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<(), NativeError> {
        let data = self.read_bytes(src, offset, dst.len() as u64)?;
        dst.copy_from_slice(&data);
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
        // Staged through host memory; peer access is not assumed.
        let staged = self.read_bytes(src, src_offset, len)?;
        self.write_bytes(dst, dst_offset, &staged)
    }

    fn synchronize(&self, device: Option<DeviceId>) -> Result<(), NativeError> {
        match device {
            Some(device) => self.context(device)?.synchronize()?,
            None => {
                for ctx in &self.contexts {
                    ctx.synchronize()?;
                }
            }
        }
        Ok(())
    }

    fn create_descriptor(
        &self,
        device: DeviceId,
        _spec: &DescriptorSpec,
    ) -> Result<NativeHandle, NativeError> {
        self.context(device)?;
        let id = self.next_id();
        self.handles.lock().insert(id, device);
        Ok(NativeHandle(id))
    }

    fn destroy_descriptor(&self, descriptor: NativeHandle) {
        if self.handles.lock().remove(&descriptor.0).is_none() {
            warn!(handle = descriptor.0, "Destroying unknown descriptor");
        }
    }

    fn select_algorithm(&self, key: &ShapeKey) -> Result<AlgorithmChoice, NativeError> {
        self.context(key.device)?;
        let output_elems: u64 = key.output.iter().map(|&d| d as u64).product();
        Ok(AlgorithmChoice {
            algorithm: 0,
            workspace_bytes: output_elems * key.precision.size_bytes() as u64,
        })
    }

    fn reset_device(&self, device: DeviceId) -> Result<(), NativeError> {
        let ctx = self.context(device)?;
        ctx.synchronize()?;
        self.buffers
            .lock()
            .retain(|_, buf| !matches!(buf, Buffer::Device(d, _) if *d == device));
        self.handles.lock().retain(|_, d| *d != device);
        Ok(())
    }
}
