//! Descriptor/workspace bundles and the leases handed to callers.

use std::sync::Arc;

use tracing::debug;

use crate::cache::key::ShapeKey;
use crate::error::MemResult;
use crate::handle::{HandleContext, Resource};
use crate::memory::{Allocator, MemoryBlock};
use crate::native::{MemoryKind, NativeApi, NativeHandle};

/// Descriptors, chosen algorithm and workspace for one [`ShapeKey`].
///
/// The bundle owns one reference to each native object. Callers never hold a
/// bundle directly; they get a [`BundleLease`] with references of their own.
#[derive(Debug)]
pub struct DescriptorBundle {
    /// Input, output and filter descriptors, in that order.
    descriptors: Vec<Resource<NativeHandle>>,
    algorithm: u32,
    workspace: Option<MemoryBlock>,
}

impl DescriptorBundle {
    /// Run the algorithm query, create the descriptors and allocate the workspace.
    pub(crate) fn compute(
        key: &ShapeKey,
        native: &Arc<dyn NativeApi>,
        allocator: &Arc<Allocator>,
        handles: &HandleContext,
    ) -> MemResult<Self> {
        let choice = native.select_algorithm(key)?;

        let mut descriptors: Vec<Resource<NativeHandle>> = Vec::with_capacity(3);
        for spec in key.descriptor_specs() {
            match native.create_descriptor(key.device, &spec) {
                Ok(raw) => {
                    let driver = Arc::clone(native);
                    descriptors.push(Resource::wrap("descriptor", raw, handles, move |h| {
                        driver.destroy_descriptor(h)
                    }));
                }
                Err(err) => {
                    release_all(&descriptors);
                    return Err(err.into());
                }
            }
        }

        let workspace = if choice.workspace_bytes > 0 {
            match allocator.allocate(
                key.device,
                choice.workspace_bytes as i64,
                MemoryKind::DeviceLocal,
                false,
            ) {
                Ok(block) => Some(block),
                Err(err) => {
                    release_all(&descriptors);
                    return Err(err);
                }
            }
        } else {
            None
        };

        debug!(
            key = %key,
            algorithm = choice.algorithm,
            workspace_bytes = choice.workspace_bytes,
            "Computed descriptor bundle"
        );
        Ok(Self {
            descriptors,
            algorithm: choice.algorithm,
            workspace,
        })
    }

    pub fn workspace_bytes(&self) -> u64 {
        self.workspace.as_ref().map_or(0, MemoryBlock::size)
    }

    /// A lease holding new references to every object in the bundle.
    /// Fails if the bundle went stale in a reset.
    pub(crate) fn retain(&self) -> MemResult<BundleLease> {
        let mut descriptors = Vec::with_capacity(self.descriptors.len());
        for res in &self.descriptors {
            match res.add_ref() {
                Ok(owner) => descriptors.push(owner),
                Err(err) => {
                    release_all(&descriptors);
                    return Err(err);
                }
            }
        }
        let workspace = match self.workspace.as_ref().map(MemoryBlock::add_ref).transpose() {
            Ok(workspace) => workspace,
            Err(err) => {
                release_all(&descriptors);
                return Err(err);
            }
        };
        Ok(BundleLease {
            descriptors,
            algorithm: self.algorithm,
            workspace,
        })
    }

    /// Hand the bundle's own references to the caller.
    pub(crate) fn into_lease(self) -> BundleLease {
        BundleLease {
            descriptors: self.descriptors,
            algorithm: self.algorithm,
            workspace: self.workspace,
        }
    }

    /// Give back the bundle's references. Returns workspace bytes actually
    /// freed; a workspace still leased elsewhere is freed by its last lease.
    pub(crate) fn release(self) -> u64 {
        release_all(&self.descriptors);
        match self.workspace {
            Some(block) => {
                let size = block.size();
                match block.free_ref() {
                    Ok(true) => size,
                    _ => 0,
                }
            }
            None => 0,
        }
    }
}

fn release_all(resources: &[Resource<NativeHandle>]) {
    for res in resources {
        // Stale after a reset: already destroyed by the driver.
        let _ = res.free_ref();
    }
}

/// A caller's references to one bundle; given back on drop.
#[derive(Debug)]
pub struct BundleLease {
    descriptors: Vec<Resource<NativeHandle>>,
    algorithm: u32,
    workspace: Option<MemoryBlock>,
}

impl BundleLease {
    pub fn input_descriptor(&self) -> MemResult<NativeHandle> {
        self.descriptors[0].get()
    }

    pub fn output_descriptor(&self) -> MemResult<NativeHandle> {
        self.descriptors[1].get()
    }

    pub fn filter_descriptor(&self) -> MemResult<NativeHandle> {
        self.descriptors[2].get()
    }

    pub fn algorithm(&self) -> u32 {
        self.algorithm
    }

    /// Scratch memory for the operation; `None` when the algorithm needs none.
    pub fn workspace(&self) -> Option<&MemoryBlock> {
        self.workspace.as_ref()
    }

    pub fn workspace_bytes(&self) -> u64 {
        self.workspace.as_ref().map_or(0, MemoryBlock::size)
    }

    /// True if both leases refer to the same native objects.
    pub fn same_bundle(&self, other: &BundleLease) -> bool {
        let descriptors = self
            .descriptors
            .iter()
            .zip(&other.descriptors)
            .all(|(a, b)| a.same_object(b));
        let workspace = match (&self.workspace, &other.workspace) {
            (Some(a), Some(b)) => a.same_block(b),
            (None, None) => true,
            _ => false,
        };
        descriptors && workspace
    }
}

impl Drop for BundleLease {
    fn drop(&mut self) {
        release_all(&self.descriptors);
        if let Some(block) = self.workspace.take() {
            let _ = block.free_ref();
        }
    }
}
