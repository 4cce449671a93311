//! A single-assignment deferred value, settled at most once, that can be
//! forced synchronously with [`Deferred::wait`] or awaited as a [`Future`].

use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::LoadError,
    scheduler::Scheduler,
    wakerset::{Token as WakerToken, WakerSet},
};

type Continuation<T> = Box<dyn FnOnce(Result<T, LoadError>) + Send>;

enum State<T> {
    Pending {
        continuations: Vec<Continuation<T>>,
        wakers: WakerSet,
    },
    Settled(Result<T, LoadError>),
}

impl<T: Clone> State<T> {
    fn outcome(&self) -> Option<Result<T, LoadError>> {
        match self {
            State::Pending { .. } => None,
            State::Settled(result) => Some(result.clone()),
        }
    }
}

impl<T: Debug> Debug for State<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            State::Pending {
                continuations,
                wakers,
            } => f
                .debug_struct("Pending")
                .field("continuations", &continuations.len())
                .field("wakers", wakers)
                .finish(),
            State::Settled(Ok(value)) => f.debug_tuple("Fulfilled").field(value).finish(),
            State::Settled(Err(err)) => f.debug_tuple("Rejected").field(err).finish(),
        }
    }
}

struct Cell<T> {
    state: Mutex<State<T>>,
    settled: Condvar,
}

/// A handle to a value that will be available later.
///
/// Handles are cheap to clone; every clone observes the same cell. A handle
/// produced by a [`Loader`](crate::Loader) remembers the [`Scheduler`] its
/// batch was registered with, and forcing the handle (with [`wait`] or by
/// polling it) drains that scheduler first. This is what dispatches pending
/// batches: there is no background thread, and the batching window lasts
/// until somebody needs a result.
///
/// [`wait`]: Deferred::wait
pub struct Deferred<T> {
    cell: Arc<Cell<T>>,
    scheduler: Option<Scheduler>,

    // Only set while this particular handle has a waker registered with a
    // pending cell.
    waker_token: Option<WakerToken>,
}

impl<T> Deferred<T> {
    fn from_state(state: State<T>, scheduler: Option<Scheduler>) -> Self {
        Self {
            cell: Arc::new(Cell {
                state: Mutex::new(state),
                settled: Condvar::new(),
            }),
            scheduler,
            waker_token: None,
        }
    }

    pub(crate) fn pending(scheduler: Option<Scheduler>) -> Self {
        Self::from_state(
            State::Pending {
                continuations: Vec::new(),
                wakers: WakerSet::default(),
            },
            scheduler,
        )
    }

    /// A deferred value that is already fulfilled.
    pub fn fulfilled(value: T) -> Self {
        Self::from_state(State::Settled(Ok(value)), None)
    }

    /// A deferred value that is already rejected.
    pub fn rejected(err: LoadError) -> Self {
        Self::from_state(State::Settled(Err(err)), None)
    }

    pub fn from_result(result: Result<T, LoadError>) -> Self {
        Self::from_state(State::Settled(result), None)
    }

    /// Attach the scheduler that must be drained before this value can be
    /// expected to settle.
    pub(crate) fn bind(mut self, scheduler: &Scheduler) -> Self {
        self.scheduler = Some(scheduler.clone());
        self
    }

    /// The scheduler this handle drains when forced, if any.
    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.cell.state.lock(), State::Settled(..))
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Create a pending value along with the [`Resolver`] that settles it.
    /// This is how a batch function hands back a result that isn't ready
    /// yet.
    pub fn channel() -> (Self, Resolver<T>) {
        let deferred = Self::pending(None);
        let resolver = Resolver {
            target: Some(deferred.clone()),
        };

        (deferred, resolver)
    }

    /// Settle the cell. Returns false, leaving the cell untouched, if it was
    /// already settled.
    ///
    /// Continuations run on the calling thread, after the cell's lock has
    /// been released, so they are free to call back into loaders.
    pub(crate) fn settle(&self, result: Result<T, LoadError>) -> bool {
        let (continuations, wakers) = {
            let mut state = self.cell.state.lock();
            let taken = match *state {
                State::Settled(..) => return false,
                State::Pending {
                    ref mut continuations,
                    ref mut wakers,
                } => (mem::take(continuations), mem::take(wakers)),
            };

            *state = State::Settled(result.clone());
            self.cell.settled.notify_all();
            taken
        };

        wakers.wake_all();
        continuations
            .into_iter()
            .for_each(|continuation| continuation(result.clone()));

        true
    }

    /// The outcome, if the value has settled. Never drains the scheduler.
    pub fn peek(&self) -> Option<Result<T, LoadError>> {
        self.cell.state.lock().outcome()
    }

    /// Register a continuation to run once the value settles. If it has
    /// already settled, the continuation runs immediately.
    pub fn on_settle(&self, continuation: impl FnOnce(Result<T, LoadError>) + Send + 'static) {
        let settled = {
            let mut state = self.cell.state.lock();
            match *state {
                State::Pending {
                    ref mut continuations,
                    ..
                } => {
                    continuations.push(Box::new(continuation));
                    return;
                }
                State::Settled(ref result) => result.clone(),
            }
        };

        continuation(settled)
    }

    /// Derive a new deferred value from this one with a fallible transform.
    /// Rejections pass through untouched.
    pub fn and_then<U, F>(&self, transform: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, LoadError> + Send + 'static,
    {
        let derived = Deferred::pending(self.scheduler.clone());
        let target = derived.clone();
        self.on_settle(move |result| {
            target.settle(result.and_then(transform));
        });

        derived
    }

    /// Derive a new deferred value from this one.
    pub fn map<U, F>(&self, transform: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.and_then(move |value| Ok(transform(value)))
    }

    /// Combine several deferred values into one list, in input order. The
    /// list is fulfilled once every input is fulfilled; it is rejected with
    /// the first rejection to arrive.
    pub fn all(deferreds: impl IntoIterator<Item = Deferred<T>>) -> Deferred<Vec<T>> {
        let deferreds: Vec<Deferred<T>> = deferreds.into_iter().collect();
        let scheduler = deferreds.iter().find_map(|d| d.scheduler.clone());
        let combined = Deferred::pending(scheduler);

        if deferreds.is_empty() {
            combined.settle(Ok(Vec::new()));
            return combined;
        }

        let gather = Arc::new(Mutex::new(Gather {
            values: deferreds.iter().map(|_| None).collect(),
            remaining: deferreds.len(),
        }));

        for (index, deferred) in deferreds.iter().enumerate() {
            let gather = gather.clone();
            let target = combined.clone();

            deferred.on_settle(move |result| match result {
                Err(err) => {
                    target.settle(Err(err));
                }
                Ok(value) => {
                    let complete = {
                        let mut gather = gather.lock();
                        gather.values[index] = Some(value);
                        gather.remaining -= 1;
                        match gather.remaining {
                            0 => Some(mem::take(&mut gather.values)),
                            _ => None,
                        }
                    };

                    if let Some(values) = complete {
                        target.settle(Ok(values.into_iter().flatten().collect()));
                    }
                }
            });
        }

        combined
    }

    /// Force the value. Drains the bound scheduler, which runs every pending
    /// batch function (including any batches those functions queue in
    /// turn), then blocks until the value settles.
    ///
    /// A value whose producer never settles it blocks forever.
    pub fn wait(&self) -> Result<T, LoadError> {
        if let Some(scheduler) = &self.scheduler {
            scheduler.drain_pending();
        }

        let mut state = self.cell.state.lock();
        loop {
            if let Some(result) = state.outcome() {
                return result;
            }

            self.cell.settled.wait(&mut state);
        }
    }
}

struct Gather<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            scheduler: self.scheduler.clone(),
            waker_token: None,
        }
    }
}

impl<T: Debug> Debug for Deferred<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("state", &*self.cell.state.lock())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Future for Deferred<T> {
    type Output = Result<T, LoadError>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        // Draining runs batch functions, which may settle this very cell, so
        // it has to happen before we take the lock.
        if let Some(scheduler) = &unpinned.scheduler {
            if !unpinned.is_settled() {
                scheduler.drain_pending();
            }
        }

        let mut state = unpinned.cell.state.lock();
        match *state {
            State::Settled(ref result) => {
                unpinned.waker_token = None;
                Poll::Ready(result.clone())
            }
            State::Pending { ref mut wakers, .. } => {
                let token = match unpinned.waker_token.take() {
                    Some(token) => wakers.replace_waker(token, ctx.waker()),
                    None => wakers.add_waker(ctx.waker().clone()),
                };

                unpinned.waker_token = Some(token);
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for Deferred<T> {
    fn drop(&mut self) {
        // A handle that lost interest while pending shouldn't leave a stale
        // waker behind.
        if let Some(token) = self.waker_token.take() {
            if let State::Pending { ref mut wakers, .. } = *self.cell.state.lock() {
                wakers.discard_waker(token);
            }
        }
    }
}

/// The settling half of [`Deferred::channel`].
///
/// Dropping a resolver without settling rejects its value with
/// [`LoadError::Canceled`], so nobody waits forever on a producer that went
/// away.
pub struct Resolver<T: Clone + Send + 'static> {
    target: Option<Deferred<T>>,
}

impl<T: Clone + Send + 'static> Resolver<T> {
    pub fn fulfill(self, value: T) {
        self.settle(Ok(value))
    }

    pub fn reject(self, err: LoadError) {
        self.settle(Err(err))
    }

    pub fn settle(mut self, result: Result<T, LoadError>) {
        if let Some(target) = self.target.take() {
            target.settle(result);
        }
    }
}

impl<T: Clone + Send + 'static> Debug for Resolver<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("settled", &self.target.is_none())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            target.settle(Err(LoadError::Canceled));
        }
    }
}
