//! Downstream accelerator API.
//!
//! Everything the memory manager needs from the driver goes through
//! [`NativeApi`]: device enumeration, context lifecycle, raw allocation,
//! host↔device copies, descriptors and algorithm queries.
//!
//! - [`sim`]: in-process simulated accelerator (CPU-only builds and tests)
//! - `cuda`: CUDA driver backend via cudarc (behind the `cuda` feature)

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod sim;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::key::ShapeKey;
use crate::device::DeviceId;
use crate::memory::precision::Precision;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },

    #[error("invalid device {0}")]
    InvalidDevice(DeviceId),

    #[error("invalid or already freed pointer {0:#x}")]
    InvalidPointer(u64),

    #[error("invalid handle {0:#x}")]
    InvalidHandle(u64),

    #[error("access of {len} bytes at offset {offset} exceeds allocation of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("driver error: {0}")]
    Driver(String),
}

/// Opaque device (or host-pinned) pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativePtr(pub u64);

/// Opaque handle to a native object (context, descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeHandle(pub u64);

/// Memory kinds the driver can hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Resident on one device.
    DeviceLocal,
    /// Unified memory addressable from host and every device.
    Managed,
    /// Host memory.
    Host,
}

/// Where a block lives. Only device-local memory is bound to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Residency {
    Device(DeviceId),
    Managed,
    Host,
}

impl Residency {
    pub fn new(kind: MemoryKind, device: DeviceId) -> Self {
        match kind {
            MemoryKind::DeviceLocal => Residency::Device(device),
            MemoryKind::Managed => Residency::Managed,
            MemoryKind::Host => Residency::Host,
        }
    }

    pub fn kind(&self) -> MemoryKind {
        match self {
            Residency::Device(_) => MemoryKind::DeviceLocal,
            Residency::Managed => MemoryKind::Managed,
            Residency::Host => MemoryKind::Host,
        }
    }

    /// Owning device, or None for non device-bound kinds.
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Residency::Device(id) => Some(*id),
            _ => None,
        }
    }
}

impl std::fmt::Display for Residency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Residency::Device(id) => write!(f, "device {id}"),
            Residency::Managed => write!(f, "managed memory"),
            Residency::Host => write!(f, "host memory"),
        }
    }
}

/// Static properties reported for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProperties {
    pub name: String,
    pub total_memory: u64,
}

/// Shape/layout of one tensor descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorSpec {
    pub dims: Vec<usize>,
    pub precision: Precision,
}

/// Result of an algorithm-selection query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlgorithmChoice {
    pub algorithm: u32,
    pub workspace_bytes: u64,
}

/// The opaque accelerator driver.
///
/// Implementations must be callable from any thread; per-context ordering is
/// the driver's concern.
pub trait NativeApi: Send + Sync {
    /// Number of devices visible to the driver.
    fn device_count(&self) -> Result<usize, NativeError>;

    fn device_properties(&self, device: DeviceId) -> Result<DeviceProperties, NativeError>;

    fn create_context(&self, device: DeviceId) -> Result<NativeHandle, NativeError>;

    fn destroy_context(&self, device: DeviceId, context: NativeHandle);

    fn malloc(&self, residency: Residency, size: u64) -> Result<NativePtr, NativeError>;

    fn free(&self, residency: Residency, ptr: NativePtr) -> Result<(), NativeError>;

    fn memset_zero(&self, residency: Residency, ptr: NativePtr, size: u64) -> Result<(), NativeError>;

    fn copy_host_to_device(
        &self,
        residency: Residency,
        dst: NativePtr,
        offset: u64,
        src: &[u8],
    ) -> Result<(), NativeError>;

    fn copy_device_to_host(
        &self,
        residency: Residency,
        src: NativePtr,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<(), NativeError>;

    #[allow(clippy::too_many_arguments)]
    fn copy_device_to_device(
        &self,
        src_residency: Residency,
        src: NativePtr,
        src_offset: u64,
        dst_residency: Residency,
        dst: NativePtr,
        dst_offset: u64,
        len: u64,
    ) -> Result<(), NativeError>;

    /// Block until all queued work on `device` (or on every device) completes.
    fn synchronize(&self, device: Option<DeviceId>) -> Result<(), NativeError>;

    fn create_descriptor(
        &self,
        device: DeviceId,
        spec: &DescriptorSpec,
    ) -> Result<NativeHandle, NativeError>;

    fn destroy_descriptor(&self, descriptor: NativeHandle);

    /// Pick an algorithm for the operation and report its workspace size.
    fn select_algorithm(&self, key: &ShapeKey) -> Result<AlgorithmChoice, NativeError>;

    /// Tear down all device state. Every outstanding pointer and handle on the
    /// device becomes invalid.
    fn reset_device(&self, device: DeviceId) -> Result<(), NativeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_residency_binding() {
        assert_eq!(Residency::new(MemoryKind::DeviceLocal, 3).device(), Some(3));
        assert_eq!(Residency::new(MemoryKind::Managed, 3).device(), None);
        assert_eq!(Residency::new(MemoryKind::Host, 3), Residency::Host);
        assert_eq!(Residency::Managed.kind(), MemoryKind::Managed);
    }
}
