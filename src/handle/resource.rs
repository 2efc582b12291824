//! Refcounted wrapper around one opaque native handle.
//!
//! A [`Resource`] starts with one owner. [`Resource::add_ref`] hands out another
//! owner; [`Resource::free_ref`] gives one back, and the destructor fires exactly
//! when the count reaches zero. Dropping a `Resource` value never releases the
//! native object: release is always explicit (or done by a scoped guard), and
//! an unreleased drop is only reported as a leak.
//!
//! Handles are epoch-scoped unless created with [`Resource::wrap_unscoped`],
//! which is for objects a device reset does not tear down.

use std::fmt::Debug;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{MemError, MemResult, StaleReason};
use crate::handle::HandleContext;

type Destructor<H> = Box<dyn FnOnce(H) + Send>;

struct Inner<H> {
    kind: &'static str,
    handle: H,
    epoch: u64,
    scoped: bool,
    ctx: HandleContext,
    refs: AtomicUsize,
    valid: AtomicBool,
    released: AtomicBool,
    destructor: Mutex<Option<Destructor<H>>>,
    created_at: Option<&'static Location<'static>>,
    released_at: Mutex<Option<&'static Location<'static>>>,
}

/// One owner of a shared native handle.
pub struct Resource<H: Copy + Debug + Send + Sync + 'static> {
    inner: Arc<Inner<H>>,
}

impl<H: Copy + Debug + Send + Sync + 'static> Resource<H> {
    /// Take ownership of a freshly created native handle.
    #[track_caller]
    pub fn wrap(
        kind: &'static str,
        handle: H,
        ctx: &HandleContext,
        destructor: impl FnOnce(H) + Send + 'static,
    ) -> Self {
        Self::build(kind, handle, ctx, true, Box::new(destructor))
    }

    /// Like [`wrap`](Self::wrap), for a handle that survives epoch rollover.
    #[track_caller]
    pub fn wrap_unscoped(
        kind: &'static str,
        handle: H,
        ctx: &HandleContext,
        destructor: impl FnOnce(H) + Send + 'static,
    ) -> Self {
        Self::build(kind, handle, ctx, false, Box::new(destructor))
    }

    #[track_caller]
    fn build(
        kind: &'static str,
        handle: H,
        ctx: &HandleContext,
        scoped: bool,
        destructor: Destructor<H>,
    ) -> Self {
        let created_at = if ctx.trace {
            Some(Location::caller())
        } else {
            None
        };
        if let Some(site) = created_at {
            debug!(kind, ?handle, %site, "Acquired native handle");
        }
        Self {
            inner: Arc::new(Inner {
                kind,
                handle,
                epoch: ctx.epochs.current(),
                scoped,
                ctx: ctx.clone(),
                refs: AtomicUsize::new(1),
                valid: AtomicBool::new(true),
                released: AtomicBool::new(false),
                destructor: Mutex::new(Some(destructor)),
                created_at,
                released_at: Mutex::new(None),
            }),
        }
    }

    /// The native handle, if it is still valid in the current epoch.
    pub fn get(&self) -> MemResult<H> {
        if self.is_valid() {
            Ok(self.inner.handle)
        } else {
            Err(self.stale_error())
        }
    }

    /// Register another owner. Fails once the handle is released or stale.
    pub fn add_ref(&self) -> MemResult<Self> {
        let mut current = self.inner.refs.load(Ordering::Acquire);
        loop {
            if current == 0 || !self.is_valid() {
                return Err(self.stale_error());
            }
            match self.inner.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Ok(Self {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Give back one ownership. Returns true when this call released the
    /// native object; errors if every owner has already been given back.
    #[track_caller]
    pub fn free_ref(&self) -> MemResult<bool> {
        let site = Location::caller();
        let mut current = self.inner.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(self.stale_error());
            }
            match self.inner.refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current == 1 {
            Ok(self.release_at(site))
        } else {
            Ok(false)
        }
    }

    /// Invalidate the handle and run the destructor, at most once across all
    /// owners. Returns true if this call ran the destructor.
    ///
    /// A handle from an older epoch is marked released without running the
    /// destructor: the reset that advanced the epoch already destroyed it.
    #[track_caller]
    pub fn release(&self) -> bool {
        self.release_at(Location::caller())
    }

    fn release_at(&self, site: &'static Location<'static>) -> bool {
        let inner = &self.inner;
        if inner
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if inner.ctx.trace {
            *inner.released_at.lock() = Some(site);
            debug!(kind = inner.kind, handle = ?inner.handle, %site, "Released native handle");
        }
        inner.valid.store(false, Ordering::Release);

        let destructor = inner.destructor.lock().take();
        if !inner.is_current() {
            debug!(
                kind = inner.kind,
                handle = ?inner.handle,
                epoch = inner.epoch,
                "Handle predates current epoch; skipping native destroy"
            );
            return false;
        }
        match destructor {
            Some(destroy) => {
                destroy(inner.handle);
                true
            }
            None => false,
        }
    }

    /// Current number of owners.
    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Not released and, when epoch-scoped, created in the current epoch.
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire) && self.is_current()
    }

    pub fn is_current(&self) -> bool {
        self.inner.is_current()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    pub fn kind(&self) -> &'static str {
        self.inner.kind
    }

    /// True if both values own the same native object.
    pub fn same_object(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Where the native object was released, when tracing is enabled.
    pub fn released_at(&self) -> Option<String> {
        let site = *self.inner.released_at.lock();
        site.map(|site| site.to_string())
    }

    fn stale_error(&self) -> MemError {
        let current = self.inner.ctx.epochs.current();
        let reason = if !self.inner.valid.load(Ordering::Acquire) {
            StaleReason::Released
        } else {
            StaleReason::EpochRolledOver {
                captured: self.inner.epoch,
                current,
            }
        };
        let released_at = self.released_at();
        if self.inner.ctx.trace {
            warn!(
                kind = self.inner.kind,
                handle = ?self.inner.handle,
                %reason,
                released_at = ?released_at,
                "Access to stale handle"
            );
        }
        MemError::StaleResource {
            kind: self.inner.kind,
            reason,
            released_at,
        }
    }
}

impl<H: Copy + Debug + Send + Sync + 'static> Debug for Resource<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("kind", &self.inner.kind)
            .field("handle", &self.inner.handle)
            .field("epoch", &self.inner.epoch)
            .field("refs", &self.ref_count())
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl<H> Inner<H> {
    fn is_current(&self) -> bool {
        !self.scoped || self.ctx.epochs.is_current(self.epoch)
    }
}

impl<H> Drop for Inner<H> {
    fn drop(&mut self) {
        if !self.ctx.leak_warnings || *self.released.get_mut() {
            return;
        }
        if self.is_current() {
            warn!(
                kind = self.kind,
                created_at = ?self.created_at.map(|s| s.to_string()),
                "Native handle dropped without release; native object leaked"
            );
        }
    }
}
