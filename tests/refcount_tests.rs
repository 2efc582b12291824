//! Integration tests for shared ownership, stale handles and epoch rollover.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use accel_mem::config::{Config, DebugConfig};
use accel_mem::error::StaleReason;
use accel_mem::native::sim::SimulatedAccelerator;
use accel_mem::{MemError, MemoryKind, Precision, Runtime};

fn runtime() -> (Runtime, Arc<SimulatedAccelerator>) {
    Runtime::simulated(Config::default(), 1, 1 << 20).unwrap()
}

fn free_calls(sim: &SimulatedAccelerator) -> usize {
    sim.counters().free_calls.load(Ordering::Relaxed)
}

#[test]
fn test_concurrent_add_free_frees_once() {
    let (rt, sim) = runtime();
    let block = rt.allocate(0, 256, MemoryKind::DeviceLocal, false).unwrap();

    std::thread::scope(|s| {
        for _ in 0..2 {
            let block = &block;
            s.spawn(move || {
                for _ in 0..100 {
                    let owner = block.add_ref().unwrap();
                    assert!(!owner.free().unwrap());
                }
            });
        }
    });

    assert_eq!(block.ref_count(), 1);
    assert_eq!(free_calls(&sim), 0);
    assert!(block.free_ref().unwrap());
    assert_eq!(free_calls(&sim), 1);
    assert_eq!(rt.snapshot(0).unwrap().used_bytes, 0);
}

#[test]
fn test_last_owner_racing_releases_exactly_once() {
    let (rt, sim) = runtime();
    let block = rt.allocate(0, 64, MemoryKind::DeviceLocal, false).unwrap();
    let owners: Vec<_> = (0..7).map(|_| block.add_ref().unwrap()).collect();
    block.free().unwrap();

    let barrier = Barrier::new(owners.len());
    let released = AtomicUsize::new(0);
    std::thread::scope(|s| {
        for owner in owners {
            let barrier = &barrier;
            let released = &released;
            s.spawn(move || {
                barrier.wait();
                if owner.free().unwrap() {
                    released.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(released.load(Ordering::Relaxed), 1);
    assert_eq!(free_calls(&sim), 1);
    assert_eq!(sim.live_allocations(), 0);
}

#[test]
fn test_access_after_release_is_stale() {
    let (rt, sim) = runtime();
    let block = rt.allocate(0, 16, MemoryKind::DeviceLocal, true).unwrap();
    let other = block.add_ref().unwrap();
    block.free().unwrap();
    assert!(other.is_live());
    assert!(other.free_ref().unwrap());

    assert!(!other.is_live());
    let mut out = [0f32; 4];
    match other.read(Precision::Float, &mut out, 0) {
        Err(MemError::StaleResource { reason, .. }) => assert_eq!(reason, StaleReason::Released),
        res => panic!("expected stale handle, got {res:?}"),
    }
    assert!(matches!(other.add_ref(), Err(MemError::StaleResource { .. })));
    assert!(matches!(other.free_ref(), Err(MemError::StaleResource { .. })));
    assert_eq!(free_calls(&sim), 1);
}

#[test]
fn test_release_site_reported_when_tracing() {
    let config = Config {
        debug: DebugConfig {
            trace_handles: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let (rt, _sim) = Runtime::simulated(config, 1, 1 << 20).unwrap();
    let block = rt.allocate(0, 16, MemoryKind::DeviceLocal, false).unwrap();
    let watcher = block.add_ref().unwrap();
    watcher.free_ref().unwrap();
    block.free_ref().unwrap();

    match watcher.native_ptr() {
        Err(MemError::StaleResource { released_at, .. }) => {
            let site = released_at.expect("release site recorded");
            assert!(site.contains("refcount_tests.rs"), "{site}");
        }
        other => panic!("expected stale handle, got {other:?}"),
    }
}

#[test]
fn test_reset_invalidates_without_double_free() {
    let (rt, sim) = runtime();
    let block = rt.allocate(0, 1024, MemoryKind::DeviceLocal, false).unwrap();
    let shared = block.add_ref().unwrap();
    let before = rt.epoch();

    let epoch = rt.reset().unwrap();
    assert_eq!(epoch, before + 1);
    assert_eq!(rt.snapshot(0).unwrap().used_bytes, 0);
    assert_eq!(sim.live_allocations(), 0);

    match block.native_ptr() {
        Err(MemError::StaleResource {
            reason: StaleReason::EpochRolledOver { captured, current },
            ..
        }) => {
            assert_eq!(captured, before);
            assert_eq!(current, epoch);
        }
        other => panic!("expected epoch rollover, got {other:?}"),
    }
    assert!(shared.add_ref().is_err());

    // Giving back stale owners never reaches the driver or the counters.
    assert!(!block.free().unwrap());
    assert!(!shared.free().unwrap());
    assert_eq!(free_calls(&sim), 0);
    assert_eq!(sim.counters().invalid_frees.load(Ordering::Relaxed), 0);
    assert_eq!(rt.snapshot(0).unwrap().used_bytes, 0);

    // New handles in the new epoch work normally.
    let fresh = rt.allocate(0, 1024, MemoryKind::DeviceLocal, false).unwrap();
    assert_eq!(rt.snapshot(0).unwrap().used_bytes, 1024);
    assert!(fresh.free().unwrap());
    assert_eq!(rt.snapshot(0).unwrap().used_bytes, 0);
}

#[test]
fn test_host_block_survives_reset_and_frees() {
    let (rt, sim) = runtime();
    let host = rt.allocate(0, 4096, MemoryKind::Host, false).unwrap();
    let managed = rt.allocate(0, 512, MemoryKind::Managed, false).unwrap();
    host.write_bytes(&[7u8; 16], 0).unwrap();
    assert_eq!(rt.accounting().host_snapshot().used_bytes, 4608);

    rt.reset().unwrap();

    // The driver kept both allocations, so the handles stay usable.
    assert!(host.is_live());
    let mut out = [0u8; 16];
    host.read_bytes(&mut out, 0).unwrap();
    assert_eq!(out, [7u8; 16]);
    assert_eq!(rt.accounting().host_snapshot().used_bytes, 4608);

    assert!(host.free().unwrap());
    assert!(managed.free().unwrap());
    assert_eq!(rt.accounting().host_snapshot().used_bytes, 0);
    assert_eq!(sim.live_allocations(), 0);
    assert_eq!(sim.counters().invalid_frees.load(Ordering::Relaxed), 0);
}

#[test]
fn test_guard_releases_on_early_return() {
    let (rt, sim) = runtime();

    let result = (|| -> Result<(), MemError> {
        let guard = rt.allocate(0, 32, MemoryKind::DeviceLocal, false)?.into_guard();
        guard.write(Precision::Float, &[1.0f32; 16], 0)?;
        Ok(())
    })();

    assert!(matches!(result, Err(MemError::SizeMismatch { .. })));
    assert_eq!(free_calls(&sim), 1);
    assert_eq!(rt.snapshot(0).unwrap().used_bytes, 0);
}
