//! Runtime configuration for accel-mem.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All memory-related knobs (thresholds, ceilings, retry budgets, eviction mode)
//! live here rather than as literals in the allocator.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::policy::Persistence;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "accel-mem", about = "Accelerator memory manager with an observability API")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Run against N simulated devices instead of the native backend.
    #[arg(long)]
    pub simulate_devices: Option<usize>,

    /// Capacity of each simulated device in bytes.
    #[arg(long, default_value_t = 8 * 1024 * 1024 * 1024)]
    pub device_memory: usize,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device selection and context pool.
    pub devices: DeviceConfig,

    /// Thresholds, ceilings and retry budget.
    pub memory: MemoryConfig,

    /// Eviction behaviour.
    pub eviction: EvictionConfig,

    /// Descriptor/workspace cache.
    pub cache: CacheConfig,

    /// Handle-lifecycle diagnostics.
    pub debug: DebugConfig,

    /// Observability server.
    pub server: ServerConfig,
}

/// Device enumeration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// When false, zero devices are exposed and callers take the CPU path.
    pub enabled: bool,

    /// Restrict to these device indices (None = all detected devices).
    pub selection: Option<Vec<usize>>,

    /// Number of execution contexts pooled per device.
    pub contexts_per_device: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            selection: None,
            contexts_per_device: 1,
        }
    }
}

/// Memory accounting and allocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// High watermark: evict before allocating when device usage would exceed
    /// this fraction of device capacity.
    pub high_watermark: f64,

    /// Absolute per-device threshold in bytes; overrides `high_watermark`.
    pub device_threshold_bytes: Option<u64>,

    /// Ceiling on the sum of device usage (None = sum of device capacities).
    pub global_ceiling_bytes: Option<u64>,

    /// Native allocation retries (each preceded by an eviction) before the
    /// failure becomes fatal.
    pub max_retries: u32,

    /// Largest element count a single block may hold.
    pub max_block_elements: u64,

    /// Element width used to derive the per-block byte maximum.
    pub element_size: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.85,
            device_threshold_bytes: None,
            global_ceiling_bytes: None,
            max_retries: 3,
            max_block_elements: i32::MAX as u64,
            element_size: 8, // widest supported precision (f64)
        }
    }
}

impl MemoryConfig {
    /// Hard per-block maximum in bytes.
    pub fn max_block_bytes(&self) -> u64 {
        self.max_block_elements.saturating_mul(self.element_size)
    }

    /// Threshold for a device with the given capacity.
    pub fn threshold_for(&self, capacity: u64) -> u64 {
        match self.device_threshold_bytes {
            Some(bytes) => bytes,
            None => (capacity as f64 * self.high_watermark) as u64,
        }
    }
}

/// Eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Run host reclamation hints before eviction and log each round at info.
    pub conservative: bool,

    /// Compress spilled data with zstd.
    pub spill_compression: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            conservative: false,
            spill_compression: true,
            zstd_level: 3,
        }
    }
}

/// Descriptor cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Persistence applied to every key unless a custom policy is installed.
    pub default_persistence: Persistence,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_persistence: Persistence::Weak,
        }
    }
}

/// Diagnostics for leak and use-after-release hunting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Record the call site of every release and log handle lifecycle events.
    pub trace_handles: bool,

    /// Warn when a handle is dropped while it still owns native memory.
    pub leak_warnings: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            trace_handles: false,
            leak_warnings: true,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:9400").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9400".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject settings the allocator cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.memory.high_watermark) {
            anyhow::bail!(
                "memory.high_watermark must be within [0, 1], got {}",
                self.memory.high_watermark
            );
        }
        if self.devices.contexts_per_device == 0 {
            anyhow::bail!("devices.contexts_per_device must be at least 1");
        }
        if !(1..=22).contains(&self.eviction.zstd_level) {
            anyhow::bail!("eviction.zstd_level must be within 1-22");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.memory.max_retries, 3);
        assert_eq!(cfg.devices.contexts_per_device, 1);
        assert_eq!(cfg.cache.default_persistence, Persistence::Weak);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_max_block_bytes() {
        let cfg = MemoryConfig::default();
        assert_eq!(cfg.max_block_bytes(), 8 * i32::MAX as u64);
    }

    #[test]
    fn test_threshold_override() {
        let mut cfg = MemoryConfig::default();
        assert_eq!(cfg.threshold_for(1000), 850);
        cfg.device_threshold_bytes = Some(123);
        assert_eq!(cfg.threshold_for(1000), 123);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"devices": {{"selection": [1]}}, "memory": {{"max_retries": 5}}}}"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.devices.selection, Some(vec![1]));
        assert!(cfg.devices.enabled);
        assert_eq!(cfg.memory.max_retries, 5);
        assert_eq!(cfg.memory.high_watermark, 0.85);
    }

    #[test]
    fn test_load_rejects_bad_watermark() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"memory": {{"high_watermark": 1.5}}}}"#).unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/accel-mem.json")).unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:9400");
    }
}
