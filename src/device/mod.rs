//! Accelerator devices and execution contexts.
//!
//! - [`registry`]: device enumeration, selection and the per-device context pools
//! - [`context`]: execution contexts and the scoped lease that returns them

pub mod context;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use context::{current_device, ContextLease, ExecutionContext};
pub use registry::DeviceRegistry;

/// Device index as reported by the driver.
pub type DeviceId = usize;

/// Information about a single selected device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Device index.
    pub id: DeviceId,

    /// Device name (e.g., "NVIDIA GeForce GTX 1070").
    pub name: String,

    /// Total memory in bytes.
    pub total_memory: u64,
}
