//! Execution contexts and their pool.
//!
//! Each device owns a bounded pool. Acquiring a context blocks while every
//! context of that device is leased out; the [`ContextLease`] guard puts the
//! context back and wakes one waiter on every exit path, including unwinding.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::device::DeviceId;
use crate::error::MemResult;
use crate::handle::{HandleContext, Resource};
use crate::native::{NativeApi, NativeHandle};

thread_local! {
    static BOUND_DEVICE: Cell<Option<DeviceId>> = const { Cell::new(None) };
}

/// Device the calling thread is currently bound to, if any.
pub fn current_device() -> Option<DeviceId> {
    BOUND_DEVICE.with(|bound| bound.get())
}

/// A native execution context bound to one device.
#[derive(Debug)]
pub struct ExecutionContext {
    device: DeviceId,
    handle: Resource<NativeHandle>,
}

impl ExecutionContext {
    fn create(
        native: &Arc<dyn NativeApi>,
        device: DeviceId,
        handles: &HandleContext,
    ) -> MemResult<Self> {
        let raw = native.create_context(device)?;
        let driver = Arc::clone(native);
        let handle = Resource::wrap("execution context", raw, handles, move |h| {
            driver.destroy_context(device, h);
        });
        debug!(device, handle = raw.0, "Created execution context");
        Ok(Self { device, handle })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The native context handle; fails if the context predates the current epoch.
    pub fn native_handle(&self) -> MemResult<NativeHandle> {
        self.handle.get()
    }

    pub fn epoch(&self) -> u64 {
        self.handle.epoch()
    }

    fn is_current(&self) -> bool {
        self.handle.is_valid()
    }

    fn release(&self) {
        // Stale contexts were destroyed by the reset; free_ref skips them.
        let _ = self.handle.free_ref();
    }
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<ExecutionContext>,
    created: usize,
}

/// Bounded pool of contexts for one device.
pub(crate) struct ContextPool {
    device: DeviceId,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ContextPool {
    pub(crate) fn new(device: DeviceId, capacity: usize) -> Self {
        Self {
            device,
            capacity,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        }
    }

    /// Take a context, creating one lazily while under capacity and blocking
    /// once the pool is exhausted.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        native: &Arc<dyn NativeApi>,
        handles: &HandleContext,
    ) -> MemResult<ContextLease> {
        let mut state = self.state.lock();
        let context = loop {
            if let Some(ctx) = state.idle.pop() {
                if ctx.is_current() {
                    break ctx;
                }
                // Left over from before a reset: forget it and build a fresh one.
                ctx.release();
                state.created -= 1;
                continue;
            }
            if state.created < self.capacity {
                state.created += 1;
                match ExecutionContext::create(native, self.device, handles) {
                    Ok(ctx) => break ctx,
                    Err(err) => {
                        state.created -= 1;
                        return Err(err);
                    }
                }
            }
            debug!(device = self.device, "Waiting for a free execution context");
            self.available.wait(&mut state);
        };
        drop(state);

        let previous = BOUND_DEVICE.with(|bound| bound.replace(Some(self.device)));
        Ok(ContextLease {
            pool: Arc::clone(self),
            context: Some(context),
            previous,
            _not_send: PhantomData,
        })
    }

    fn give_back(&self, context: ExecutionContext) {
        self.state.lock().idle.push(context);
        self.available.notify_one();
    }

    /// Release every idle context; leased ones come back to the pool as usual.
    pub(crate) fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let drained = state.idle.len();
        for ctx in state.idle.drain(..) {
            ctx.release();
        }
        state.created -= drained;
        drained
    }

    pub(crate) fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }
}

/// Exclusive use of one execution context; returns it to the pool on drop.
///
/// Not `Send`: dropping restores the acquiring thread's device binding.
pub struct ContextLease {
    pool: Arc<ContextPool>,
    context: Option<ExecutionContext>,
    previous: Option<DeviceId>,
    _not_send: PhantomData<*const ()>,
}

impl std::ops::Deref for ContextLease {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        // Only taken in drop.
        self.context.as_ref().expect("context lease already returned")
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        BOUND_DEVICE.with(|bound| bound.set(self.previous));
        if let Some(context) = self.context.take() {
            self.pool.give_back(context);
        }
    }
}
