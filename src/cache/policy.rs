//! Persistence policies for cached bundles.
//!
//! The policy is consulted once per key, when its bundle is first computed,
//! and decides whether eviction may drop the bundle.

use serde::{Deserialize, Serialize};

use crate::cache::key::ShapeKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persistence {
    /// Kept until explicitly invalidated.
    Strong,
    /// Dropped by eviction and recomputed on the next lookup.
    Weak,
    /// Never cached; every lookup computes a fresh bundle.
    None,
}

/// Chooses the persistence of each key.
pub trait PersistencePolicy: Send + Sync {
    fn persistence(&self, key: &ShapeKey) -> Persistence;
}

/// Same persistence for every key.
#[derive(Debug, Clone, Copy)]
pub struct Uniform(pub Persistence);

impl PersistencePolicy for Uniform {
    fn persistence(&self, _key: &ShapeKey) -> Persistence {
        self.0
    }
}

/// Policy backed by a closure.
pub struct FnPolicy<F>(pub F);

impl<F> PersistencePolicy for FnPolicy<F>
where
    F: Fn(&ShapeKey) -> Persistence + Send + Sync,
{
    fn persistence(&self, key: &ShapeKey) -> Persistence {
        (self.0)(key)
    }
}
