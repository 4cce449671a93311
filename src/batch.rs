use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    hash::Hash,
    mem,
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    data::Fetched,
    deferred::Deferred,
    error::LoadError,
    scheduler::{Dispatch, Scheduler},
};

/// The batch function shared by a loader and every batch it opens.
pub(crate) type BatchFn<Key, Value> =
    Arc<dyn Fn(&[Key]) -> Result<Fetched<Key, Value>, LoadError> + Send + Sync>;

// Design notes:
//
// The queue lives behind the same lock as the phase, so appending a key and
// checking that the batch is still open is one atomic step, and the order of
// the queue is the real order in which keys were appended. Once the batch
// leaves Open, the queue is moved out and handed to the batch function; it's
// never touched again.
//
// The batch owns the shared result. Every per-key value is a projection of
// that result, holding a handle to its own cell only, so a batch (and its
// value map) is freed as soon as the scheduler, the loader, and the
// projections' continuations have all let go of it.
enum Phase<Key> {
    Open(Vec<Key>),
    Dispatching,
    Settled,
}

impl<Key> Debug for Phase<Key> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Open(keys) => f.debug_struct("Open").field("keys", &keys.len()).finish(),
            Phase::Dispatching => f.write_str("Dispatching"),
            Phase::Settled => f.write_str("Settled"),
        }
    }
}

/// Returned when queueing into a batch that has left the Open phase; hands
/// the key back so the caller can queue it somewhere else.
#[derive(Debug)]
pub(crate) struct Closed<Key>(pub(crate) Key);

impl<Key: Debug> From<Closed<Key>> for LoadError {
    fn from(Closed(key): Closed<Key>) -> Self {
        LoadError::AlreadyDispatched {
            key: format!("{:?}", key),
        }
    }
}

/// A freshly queued key: the projection of the batch result for that key,
/// and the size of the queue right after the key was added.
pub(crate) struct Queued<Value> {
    pub(crate) value: Deferred<Value>,
    pub(crate) len: usize,
}

/// The keys collected for one call to a batch function.
pub(crate) struct Batch<Key, Value> {
    phase: Mutex<Phase<Key>>,
    batcher: BatchFn<Key, Value>,
    result: Deferred<Arc<HashMap<Key, Value>>>,
}

impl<Key, Value> Batch<Key, Value>
where
    Key: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
{
    /// Open a new batch with its first key already queued.
    pub(crate) fn open(
        batcher: BatchFn<Key, Value>,
        scheduler: &Scheduler,
        key: Key,
    ) -> (Self, Deferred<Value>) {
        let batch = Self {
            phase: Mutex::new(Phase::Open(vec![key.clone()])),
            batcher,
            result: Deferred::pending(Some(scheduler.clone())),
        };
        let value = batch.project(key);

        (batch, value)
    }

    /// Append a key to this batch, and return the future value for that key.
    pub(crate) fn queue(&self, key: Key) -> Result<Queued<Value>, Closed<Key>> {
        let len = {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Open(ref mut keys) => {
                    keys.push(key.clone());
                    keys.len()
                }
                _ => return Err(Closed(key)),
            }
        };

        Ok(Queued {
            value: self.project(key),
            len,
        })
    }

    fn project(&self, key: Key) -> Deferred<Value> {
        self.result.and_then(move |values| {
            values
                .get(&key)
                .cloned()
                .ok_or_else(|| LoadError::missing_key(&key, values.keys()))
        })
    }

    fn settle(&self, result: Result<HashMap<Key, Value>, LoadError>) {
        *self.phase.lock() = Phase::Settled;

        if let Err(ref err) = result {
            debug!(error = %err, "batch rejected");
        }

        self.result.settle(result.map(Arc::new));
    }
}

impl<Key, Value> Dispatch for Batch<Key, Value>
where
    Key: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
{
    /// Run the batch function over the queued keys. No-op unless the batch is
    /// still open.
    fn dispatch(self: Arc<Self>) {
        let keys = {
            let mut phase = self.phase.lock();
            match mem::replace(&mut *phase, Phase::Dispatching) {
                Phase::Open(keys) => keys,
                other => {
                    *phase = other;
                    return;
                }
            }
        };

        debug!(keys = keys.len(), "dispatching batch");

        // The batch function runs without any lock held; it's free to load
        // from this loader or any other.
        match (self.batcher)(keys.as_slice()) {
            Err(err) => self.settle(Err(err)),
            Ok(Fetched::Ready(values)) => self.settle(values.reconcile(&keys)),
            Ok(Fetched::Deferred(values)) => {
                let batch = self;
                values.on_settle(move |result| {
                    batch.settle(result.and_then(|values| values.reconcile(&keys)))
                });
            }
        }
    }
}

impl<Key, Value> Debug for Batch<Key, Value> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("phase", &*self.phase.lock())
            .field("batcher", &"<closure>")
            .field("settled", &self.result.is_settled())
            .finish()
    }
}
