//! Descriptor/workspace caching.
//!
//! Memoizes the descriptors, chosen algorithm and workspace of each operation
//! shape so repeated calls skip the expensive native queries:
//! - [`key`]: ShapeKey, covering every field that changes the native calls
//! - [`policy`]: Strong/Weak/None persistence and pluggable policies
//! - [`bundle`]: DescriptorBundle and the BundleLease handed to callers
//! - [`descriptor`]: the per-key-locked cache itself

pub mod bundle;
pub mod descriptor;
pub mod key;
pub mod policy;

pub use bundle::BundleLease;
pub use descriptor::{CacheStats, DescriptorCache};
pub use key::ShapeKey;
pub use policy::{FnPolicy, Persistence, PersistencePolicy, Uniform};
