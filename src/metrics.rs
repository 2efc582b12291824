//! Prometheus metrics mirroring the usage snapshots.
//!
//! Gauges are refreshed from the runtime on every scrape rather than updated
//! on the allocation path.

use prometheus::{IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::runtime::Runtime;

pub struct Metrics {
    registry: Registry,
    used: IntGaugeVec,
    peak: IntGaugeVec,
    read: IntGaugeVec,
    written: IntGaugeVec,
    threshold: IntGaugeVec,
    host_used: IntGauge,
    evictions: IntGaugeVec,
    retries: IntGauge,
    fatal_failures: IntGauge,
    cache_entries: IntGauge,
    cache_hits: IntGauge,
    cache_misses: IntGauge,
    epoch: IntGauge,
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, label: &str) -> prometheus::Result<IntGaugeVec> {
    let gauge = IntGaugeVec::new(Opts::new(name, help), &[label])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("accel_mem".to_string()), None)?;
        Ok(Self {
            used: gauge_vec(&registry, "device_used_bytes", "Bytes currently allocated per device", "device")?,
            peak: gauge_vec(&registry, "device_peak_bytes", "Peak bytes allocated per device", "device")?,
            read: gauge_vec(&registry, "device_read_bytes", "Bytes read from each device", "device")?,
            written: gauge_vec(&registry, "device_written_bytes", "Bytes written to each device", "device")?,
            threshold: gauge_vec(&registry, "device_threshold_bytes", "Eviction threshold per device", "device")?,
            host_used: gauge(&registry, "host_used_bytes", "Bytes of managed and host memory allocated")?,
            evictions: gauge_vec(&registry, "evictions", "Eviction rounds run by the allocator", "cause")?,
            retries: gauge(&registry, "allocation_retries", "Native allocation retries")?,
            fatal_failures: gauge(&registry, "allocation_failures", "Allocations that exhausted their retries")?,
            cache_entries: gauge(&registry, "descriptor_cache_entries", "Cached descriptor bundles")?,
            cache_hits: gauge(&registry, "descriptor_cache_hits", "Descriptor cache hits")?,
            cache_misses: gauge(&registry, "descriptor_cache_misses", "Descriptor cache misses")?,
            epoch: gauge(&registry, "epoch", "Current handle epoch")?,
            registry,
        })
    }

    /// Copy the runtime's current counters into the gauges.
    pub fn refresh(&self, runtime: &Runtime) {
        for (device, snap) in runtime.snapshots() {
            let label = device.to_string();
            self.used.with_label_values(&[label.as_str()]).set(clamp(snap.used_bytes));
            self.peak.with_label_values(&[label.as_str()]).set(clamp(snap.peak_bytes));
            self.read.with_label_values(&[label.as_str()]).set(clamp(snap.bytes_read));
            self.written.with_label_values(&[label.as_str()]).set(clamp(snap.bytes_written));
            self.threshold.with_label_values(&[label.as_str()]).set(clamp(snap.threshold_bytes));
        }
        self.host_used
            .set(clamp(runtime.accounting().host_snapshot().used_bytes));

        let stats = runtime.alloc_stats();
        self.evictions
            .with_label_values(&["preemptive"])
            .set(clamp(stats.preemptive_evictions));
        self.evictions
            .with_label_values(&["reactive"])
            .set(clamp(stats.reactive_evictions));
        self.retries.set(clamp(stats.retries));
        self.fatal_failures.set(clamp(stats.fatal_failures));

        let cache = runtime.descriptors().stats();
        self.cache_entries.set(cache.entries as i64);
        self.cache_hits.set(clamp(cache.hits));
        self.cache_misses.set(clamp(cache.misses));
        self.epoch.set(clamp(runtime.epoch()));
    }

    /// Refresh and render in the Prometheus text format.
    pub fn render(&self, runtime: &Runtime) -> prometheus::Result<String> {
        self.refresh(runtime);
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::native::MemoryKind;

    #[test]
    fn test_render_includes_device_usage() {
        let (rt, _sim) = Runtime::simulated(Config::default(), 2, 1 << 20).unwrap();
        let block = rt.allocate(1, 4096, MemoryKind::DeviceLocal, false).unwrap();

        let metrics = Metrics::new().unwrap();
        let text = metrics.render(&rt).unwrap();
        assert!(text.contains("accel_mem_device_used_bytes{device=\"1\"} 4096"));
        assert!(text.contains("accel_mem_device_used_bytes{device=\"0\"} 0"));
        block.free_ref().unwrap();
    }
}
