//! Reference-counted memory blocks.
//!
//! A [`MemoryBlock`] is one owner of a native allocation. The allocation starts
//! with a single owner; [`MemoryBlock::add_ref`] hands out more and
//! [`MemoryBlock::free_ref`] gives one back. The native free, and the matching
//! uncharge in accounting, run exactly once when the last owner is given back.
//! Dropping a `MemoryBlock` value does not free anything; use
//! [`MemoryBlock::into_guard`] for scope-bound release.

use std::sync::Arc;

use tracing::trace;

use crate::device::DeviceId;
use crate::error::{MemError, MemResult};
use crate::handle::Resource;
use crate::memory::allocator::Allocator;
use crate::memory::precision::{self, HostScalar, Precision};
use crate::native::{MemoryKind, NativePtr, Residency};

pub struct MemoryBlock {
    resource: Resource<NativePtr>,
    size: u64,
    residency: Residency,
    allocator: Arc<Allocator>,
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("size", &self.size)
            .field("residency", &self.residency)
            .field("resource", &self.resource)
            .finish()
    }
}

impl MemoryBlock {
    pub(crate) fn new(
        resource: Resource<NativePtr>,
        size: u64,
        residency: Residency,
        allocator: Arc<Allocator>,
    ) -> Self {
        Self {
            resource,
            size,
            residency,
            allocator,
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> MemoryKind {
        self.residency.kind()
    }

    /// Owning device; `None` for managed and host blocks.
    pub fn device(&self) -> Option<DeviceId> {
        self.residency.device()
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn ref_count(&self) -> usize {
        self.resource.ref_count()
    }

    /// Not released and not invalidated by a reset.
    pub fn is_live(&self) -> bool {
        self.resource.is_valid()
    }

    /// True if both values own the same allocation.
    pub fn same_block(&self, other: &MemoryBlock) -> bool {
        self.resource.same_object(&other.resource)
    }

    /// The native pointer; fails once released or stale.
    pub fn native_ptr(&self) -> MemResult<NativePtr> {
        self.resource.get()
    }

    /// Register another owner of this allocation.
    pub fn add_ref(&self) -> MemResult<MemoryBlock> {
        Ok(Self {
            resource: self.resource.add_ref()?,
            size: self.size,
            residency: self.residency,
            allocator: Arc::clone(&self.allocator),
        })
    }

    /// Give back this owner. Returns true when the allocation was freed.
    #[track_caller]
    pub fn free_ref(&self) -> MemResult<bool> {
        self.resource.free_ref()
    }

    /// Consume this owner and give it back.
    #[track_caller]
    pub fn free(self) -> MemResult<bool> {
        self.resource.free_ref()
    }

    /// Release this owner when the returned guard goes out of scope.
    pub fn into_guard(self) -> BlockGuard {
        BlockGuard { block: Some(self) }
    }

    fn check_fit(&self, needed: u64, offset: u64) -> MemResult<()> {
        match offset.checked_add(needed) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemError::SizeMismatch {
                needed,
                offset,
                capacity: self.size,
            }),
        }
    }

    /// Store `data` at `byte_offset`, converted to `precision`.
    pub fn write<T: HostScalar>(
        &self,
        precision: Precision,
        data: &[T],
        byte_offset: u64,
    ) -> MemResult<()> {
        let ptr = self.resource.get()?;
        self.check_fit(precision::stored_len(precision, data.len()), byte_offset)?;
        let bytes = precision::encode(precision, data);
        self.transfer_in(ptr, &bytes, byte_offset)
    }

    /// Fill `out` from `byte_offset`, converting from `precision`.
    ///
    /// Synchronizes first so writes queued from any context are visible.
    pub fn read<T: HostScalar>(
        &self,
        precision: Precision,
        out: &mut [T],
        byte_offset: u64,
    ) -> MemResult<()> {
        let ptr = self.resource.get()?;
        let needed = precision::stored_len(precision, out.len());
        self.check_fit(needed, byte_offset)?;
        let mut bytes = vec![0u8; needed as usize];
        self.transfer_out(ptr, &mut bytes, byte_offset)?;
        precision::decode(precision, &bytes, out);
        Ok(())
    }

    /// Raw byte write.
    pub fn write_bytes(&self, data: &[u8], byte_offset: u64) -> MemResult<()> {
        let ptr = self.resource.get()?;
        self.check_fit(data.len() as u64, byte_offset)?;
        self.transfer_in(ptr, data, byte_offset)
    }

    /// Raw byte read, preceded by a synchronize.
    pub fn read_bytes(&self, out: &mut [u8], byte_offset: u64) -> MemResult<()> {
        let ptr = self.resource.get()?;
        self.check_fit(out.len() as u64, byte_offset)?;
        self.transfer_out(ptr, out, byte_offset)
    }

    /// Copy the whole block into a new host vector.
    pub fn to_host_vec(&self) -> MemResult<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];
        self.read_bytes(&mut out, 0)?;
        Ok(out)
    }

    fn transfer_in(&self, ptr: NativePtr, bytes: &[u8], offset: u64) -> MemResult<()> {
        let native = &self.allocator.native;
        native.copy_host_to_device(self.residency, ptr, offset, bytes)?;
        self.allocator
            .accounting
            .record_write(self.residency, bytes.len() as u64)?;
        trace!(residency = %self.residency, offset, len = bytes.len(), "Wrote block");
        Ok(())
    }

    fn transfer_out(&self, ptr: NativePtr, bytes: &mut [u8], offset: u64) -> MemResult<()> {
        let native = &self.allocator.native;
        native.synchronize(self.residency.device())?;
        native.copy_device_to_host(self.residency, ptr, offset, bytes)?;
        self.allocator
            .accounting
            .record_read(self.residency, bytes.len() as u64)?;
        trace!(residency = %self.residency, offset, len = bytes.len(), "Read block");
        Ok(())
    }

    /// Copy into `dst`, starting at offset 0 in both blocks.
    pub fn copy_into(&self, dst: &MemoryBlock) -> MemResult<()> {
        let src_ptr = self.resource.get()?;
        let dst_ptr = dst.resource.get()?;
        dst.check_fit(self.size, 0)?;
        self.allocator.native.copy_device_to_device(
            self.residency,
            src_ptr,
            0,
            dst.residency,
            dst_ptr,
            0,
            self.size,
        )?;
        let accounting = &self.allocator.accounting;
        accounting.record_read(self.residency, self.size)?;
        accounting.record_write(dst.residency, self.size)?;
        Ok(())
    }

    /// Independent duplicate on `device`; this block is unaffected.
    ///
    /// Managed and host blocks are duplicated with the same kind.
    pub fn copy_to(&self, device: DeviceId) -> MemResult<MemoryBlock> {
        self.resource.get()?;
        let copy = self
            .allocator
            .allocate(device, self.size as i64, self.kind(), false)?;
        if let Err(err) = self.copy_into(&copy) {
            let _ = copy.free_ref();
            return Err(err);
        }
        Ok(copy)
    }

    /// This block (as a new owner) when already usable from `device`,
    /// otherwise a copy there.
    pub fn move_to(&self, device: DeviceId) -> MemResult<MemoryBlock> {
        match self.residency {
            Residency::Device(id) if id != device => self.copy_to(device),
            _ => self.add_ref(),
        }
    }

    /// Duplicate in place and give back this owner.
    ///
    /// The original owner is given back even when the copy fails.
    #[track_caller]
    pub fn as_copy(self) -> MemResult<MemoryBlock> {
        let device = self.device().unwrap_or(0);
        let copy = self.copy_to(device);
        self.resource.free_ref()?;
        copy
    }
}

/// Gives back one owner of a block when dropped.
#[derive(Debug)]
pub struct BlockGuard {
    block: Option<MemoryBlock>,
}

impl BlockGuard {
    /// Keep the owner instead of releasing it.
    pub fn into_inner(mut self) -> MemoryBlock {
        self.block.take().expect("block guard already disarmed")
    }
}

impl std::ops::Deref for BlockGuard {
    type Target = MemoryBlock;

    fn deref(&self) -> &MemoryBlock {
        // Only taken by into_inner, which consumes the guard.
        self.block.as_ref().expect("block guard already disarmed")
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            // Stale after a reset: nothing left to give back.
            let _ = block.free_ref();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::device::Device;
    use crate::handle::{EpochCounter, HandleContext};
    use crate::memory::accounting::MemoryAccounting;
    use crate::memory::eviction::EvictionCoordinator;
    use crate::native::sim::SimulatedAccelerator;
    use std::sync::atomic::Ordering;

    fn allocator(devices: usize) -> (Arc<SimulatedAccelerator>, Arc<Allocator>) {
        let sim = Arc::new(SimulatedAccelerator::uniform(devices, 1 << 20));
        let devs: Vec<_> = (0..devices)
            .map(|id| Device {
                id,
                name: format!("sim{id}"),
                total_memory: 1 << 20,
            })
            .collect();
        let config = MemoryConfig::default();
        let accounting = Arc::new(MemoryAccounting::new(&devs, &config));
        let eviction = Arc::new(EvictionCoordinator::new(accounting.clone(), false));
        let handles = HandleContext::new(Arc::new(EpochCounter::new()));
        let alloc = Allocator::new(sim.clone(), accounting, eviction, handles, config);
        (sim, Arc::new(alloc))
    }

    #[test]
    fn test_write_read_counts_bytes() {
        let (sim, alloc) = allocator(1);
        let block = alloc.allocate(0, 64, MemoryKind::DeviceLocal, true).unwrap();

        block.write(Precision::Float, &[1.0f32, 2.0, 3.0], 8).unwrap();
        let mut out = [0f32; 3];
        block.read(Precision::Float, &mut out, 8).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0]);

        let snap = alloc.accounting().snapshot(0).unwrap();
        assert_eq!(snap.bytes_written, 12);
        assert_eq!(snap.bytes_read, 12);
        assert_eq!(sim.counters().sync_calls.load(Ordering::Relaxed), 1);
        block.free_ref().unwrap();
    }

    #[test]
    fn test_size_mismatch_before_native_call() {
        let (sim, alloc) = allocator(1);
        let block = alloc.allocate(0, 16, MemoryKind::DeviceLocal, false).unwrap();

        let err = block.write(Precision::Double, &[0f64; 2], 8).unwrap_err();
        assert!(matches!(
            err,
            MemError::SizeMismatch { needed: 16, offset: 8, capacity: 16 }
        ));
        let mut out = [0u8; 4];
        assert!(block.read_bytes(&mut out, u64::MAX).is_err());
        assert_eq!(sim.counters().sync_calls.load(Ordering::Relaxed), 0);
        block.free_ref().unwrap();
    }

    #[test]
    fn test_guard_frees_on_scope_exit() {
        let (sim, alloc) = allocator(1);
        {
            let guard = alloc
                .allocate(0, 32, MemoryKind::DeviceLocal, false)
                .unwrap()
                .into_guard();
            assert_eq!(guard.size(), 32);
            assert_eq!(sim.live_allocations(), 1);
        }
        assert_eq!(sim.live_allocations(), 0);
        assert_eq!(alloc.accounting().snapshot(0).unwrap().used_bytes, 0);
    }

    #[test]
    fn test_move_to_same_device_shares_block() {
        let (_sim, alloc) = allocator(2);
        let block = alloc.allocate(1, 8, MemoryKind::DeviceLocal, true).unwrap();

        let same = block.move_to(1).unwrap();
        assert!(same.same_block(&block));
        assert_eq!(block.ref_count(), 2);

        let moved = block.move_to(0).unwrap();
        assert!(!moved.same_block(&block));
        assert_eq!(moved.device(), Some(0));

        same.free_ref().unwrap();
        block.free_ref().unwrap();
        moved.free_ref().unwrap();
    }

    #[test]
    fn test_use_after_release_fails() {
        let (_sim, alloc) = allocator(1);
        let block = alloc.allocate(0, 8, MemoryKind::DeviceLocal, false).unwrap();
        let other = block.add_ref().unwrap();
        assert!(!block.free_ref().unwrap());
        assert!(other.free_ref().unwrap());

        assert!(matches!(
            block.write_bytes(&[1], 0),
            Err(MemError::StaleResource { .. })
        ));
        assert!(block.native_ptr().is_err());
        assert!(block.free_ref().is_err());
    }
}
