//! Integration tests for eviction rounds and the spill store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use accel_mem::config::{Config, EvictionConfig, MemoryConfig};
use accel_mem::memory::CacheHolder;
use accel_mem::native::sim::SimulatedAccelerator;
use accel_mem::{DeviceId, MemoryBlock, MemoryKind, Runtime};

const CAPACITY: u64 = 1 << 20;

fn runtime_with(memory: MemoryConfig, eviction: EvictionConfig) -> (Runtime, Arc<SimulatedAccelerator>) {
    let config = Config {
        memory,
        eviction,
        ..Default::default()
    };
    Runtime::simulated(config, 2, CAPACITY).unwrap()
}

fn patterned(rt: &Runtime, device: DeviceId, size: usize) -> (MemoryBlock, Vec<u8>) {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let block = rt
        .allocate(device, size as i64, MemoryKind::DeviceLocal, false)
        .unwrap();
    block.write_bytes(&data, 0).unwrap();
    (block, data)
}

/// Engine-side cache holding one device block until asked to let it go.
struct ScratchCache {
    block: Mutex<Option<MemoryBlock>>,
}

impl CacheHolder for ScratchCache {
    fn name(&self) -> &str {
        "scratch"
    }

    fn release_device_buffers(&self, device: DeviceId) -> u64 {
        let mut slot = self.block.lock();
        match slot.take() {
            Some(block) if block.device() == Some(device) => {
                let size = block.size();
                match block.free() {
                    Ok(true) => size,
                    _ => 0,
                }
            }
            other => {
                *slot = other;
                0
            }
        }
    }
}

#[test]
fn test_threshold_pressure_spills_parked_block() {
    let (rt, _sim) = runtime_with(MemoryConfig::default(), EvictionConfig::default());
    let (parked, data) = patterned(&rt, 0, 600_000);
    rt.spill().put("activations", parked);

    // 600_000 + 500_000 crosses 85% of the device.
    let block = rt.allocate(0, 500_000, MemoryKind::DeviceLocal, false).unwrap();
    assert!(rt.spill().is_spilled("activations"));
    assert_eq!(rt.snapshot(0).unwrap().used_bytes, 500_000);
    assert_eq!(rt.alloc_stats().preemptive_evictions, 1);

    let stats = rt.spill().stats();
    assert_eq!(stats.spilled_entries, 1);
    assert_eq!(stats.total_spilled_bytes, 600_000);
    // Compressed by default, and the pattern compresses well.
    assert!(stats.host_bytes < 600_000);
    block.free().unwrap();

    let restored = rt.spill().fetch("activations").unwrap().unwrap();
    assert_eq!(restored.device(), Some(0));
    assert_eq!(restored.to_host_vec().unwrap(), data);
    assert!(!rt.spill().is_spilled("activations"));
    assert_eq!(rt.spill().stats().restores, 1);

    restored.free().unwrap();
    rt.spill().clear();
    assert_eq!(rt.snapshot(0).unwrap().used_bytes, 0);
}

#[test]
fn test_native_oom_spills_then_retries() {
    let memory = MemoryConfig {
        device_threshold_bytes: Some(u64::MAX),
        global_ceiling_bytes: Some(u64::MAX),
        ..Default::default()
    };
    let eviction = EvictionConfig {
        spill_compression: false,
        ..Default::default()
    };
    let (rt, sim) = runtime_with(memory, eviction);
    let (parked, data) = patterned(&rt, 0, 600_000);
    rt.spill().put("weights", parked);

    // Nothing forces a preemptive round; the driver itself runs out.
    let block = rt.allocate(0, 600_000, MemoryKind::DeviceLocal, false).unwrap();
    let stats = rt.alloc_stats();
    assert_eq!(stats.preemptive_evictions, 0);
    assert_eq!(stats.reactive_evictions, 1);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.bytes_reclaimed, 600_000);
    assert_eq!(sim.counters().failed_mallocs.load(Ordering::Relaxed), 1);
    assert_eq!(rt.spill().stats().host_bytes, 600_000);

    // Restoring needs the room back.
    block.free().unwrap();
    let restored = rt.spill().fetch("weights").unwrap().unwrap();
    assert_eq!(restored.to_host_vec().unwrap(), data);
    restored.free().unwrap();
}

#[test]
fn test_failed_restore_keeps_host_copy() {
    let (rt, sim) = runtime_with(MemoryConfig::default(), EvictionConfig::default());
    let (parked, data) = patterned(&rt, 1, 4096);
    rt.spill().put("kv", parked);
    rt.evict(Some(1));
    assert!(rt.spill().is_spilled("kv"));

    sim.fail_all_mallocs();
    assert!(rt.spill().fetch("kv").unwrap_err().is_fatal_allocation());
    assert!(rt.spill().is_spilled("kv"));

    sim.clear_failures();
    let restored = rt.spill().fetch("kv").unwrap().unwrap();
    assert_eq!(restored.device(), Some(1));
    assert_eq!(restored.to_host_vec().unwrap(), data);
    restored.free().unwrap();
}

#[test]
fn test_manual_round_reaches_engine_caches() {
    let (rt, _sim) = runtime_with(MemoryConfig::default(), EvictionConfig::default());
    let scratch = Arc::new(ScratchCache {
        block: Mutex::new(Some(
            rt.allocate(1, 8192, MemoryKind::DeviceLocal, false).unwrap(),
        )),
    });
    rt.eviction().register_cache(&scratch);

    let report = rt.evict(Some(0));
    assert_eq!(report.cache_bytes, 0);
    assert_eq!(rt.snapshot(1).unwrap().used_bytes, 8192);

    let report = rt.evict(None);
    assert_eq!(report.cache_bytes, 8192);
    assert_eq!(report.bytes_freed(), 8192);
    assert!(!report.skipped);
    assert_eq!(rt.snapshot(1).unwrap().used_bytes, 0);
}

#[test]
fn test_dropped_cache_is_forgotten() {
    let (rt, _sim) = runtime_with(MemoryConfig::default(), EvictionConfig::default());
    let block = rt.allocate(0, 64, MemoryKind::DeviceLocal, false).unwrap();
    let keep = block.add_ref().unwrap();
    let scratch = Arc::new(ScratchCache {
        block: Mutex::new(Some(block)),
    });
    rt.eviction().register_cache(&scratch);
    drop(scratch);

    // The registry holds no ownership: the dropped cache is never asked again.
    let report = rt.evict(None);
    assert_eq!(report.cache_bytes, 0);
    assert_eq!(keep.ref_count(), 2);
}

#[test]
fn test_conservative_mode_runs_reclaim_hooks() {
    let eviction = EvictionConfig {
        conservative: true,
        ..Default::default()
    };
    let (rt, _sim) = runtime_with(MemoryConfig::default(), eviction);
    let hook_runs = Arc::new(AtomicUsize::new(0));
    let counter = hook_runs.clone();
    rt.eviction().add_reclaim_hook(move || {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    rt.evict(None);
    assert_eq!(hook_runs.load(Ordering::Relaxed), 1);

    rt.eviction().set_conservative(false);
    rt.evict(None);
    assert_eq!(hook_runs.load(Ordering::Relaxed), 1);
    assert_eq!(rt.eviction().rounds(), 2);
}
