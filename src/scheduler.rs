use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::trace;

/// Something that was registered with a scheduler and is waiting to be
/// dispatched. Dispatching must be idempotent: a batch that has already been
/// dispatched (for instance, because a drain raced a full batch) is simply
/// skipped.
pub(crate) trait Dispatch: Send + Sync {
    fn dispatch(self: Arc<Self>);
}

/// The pending-batch registry for one concurrency context.
///
/// Every batch a [`Loader`](crate::Loader) opens is registered with that
/// loader's scheduler, and stays there until it is dispatched: by a drain, by
/// filling up, or by [`Loader::dispatch`](crate::Loader::dispatch). Batches
/// are never merged across schedulers, so whatever executes a unit of work
/// (a request handler, a thread, a task) should own one scheduler and build
/// its loaders against it.
///
/// `Scheduler` is a cheap handle; clones share the same registry.
#[derive(Clone, Default)]
pub struct Scheduler {
    pending: Arc<Mutex<Vec<Arc<dyn Dispatch>>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, batch: Arc<dyn Dispatch>) {
        self.pending.lock().push(batch);
    }

    /// Forget a batch that is about to be dispatched outside of a drain. The
    /// registry only ever holds batches that haven't been dispatched yet.
    pub(crate) fn unregister<D: Dispatch>(&self, batch: &Arc<D>) {
        let target = Arc::as_ptr(batch) as *const u8;
        let mut pending = self.pending.lock();

        // Compare addresses only; vtable pointers aren't guaranteed unique.
        if let Some(index) = pending
            .iter()
            .position(|entry| Arc::as_ptr(entry) as *const u8 == target)
        {
            pending.remove(index);
        }
    }

    /// The number of batches waiting for the next drain.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Dispatch every pending batch, and keep dispatching until no new
    /// batches appear.
    ///
    /// Batch functions may load from other loaders (or their own). The
    /// batches opened that way land in the registry and are picked up by the
    /// same loop, so arbitrarily deep chains of dependent loaders flush
    /// completely without recursion.
    ///
    /// The most recently registered batch dispatches first. A loader whose
    /// batch function feeds another loader is usually the one queried last,
    /// so this lets the inner batch absorb the keys requested through the
    /// outer one before it runs.
    ///
    /// Batches stay in the registry until the moment they dispatch, so it is
    /// safe to call this (or to `wait` on a value) from inside a batch
    /// function; the inner call simply takes over the remaining work.
    pub fn drain_pending(&self) {
        let mut dispatched = 0usize;

        while let Some(batch) = self.take_newest() {
            batch.dispatch();
            dispatched += 1;
        }

        if dispatched > 0 {
            trace!(batches = dispatched, "drained pending batches");
        }
    }

    // Kept separate so that the registry lock is released before the batch
    // dispatches.
    fn take_newest(&self) -> Option<Arc<dyn Dispatch>> {
        self.pending.lock().pop()
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
