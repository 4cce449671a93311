use std::{
    fmt::{self, Debug, Formatter},
    hash::Hash,
    mem,
    num::NonZeroUsize,
    sync::{Arc, Weak},
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::{
    batch::{Batch, BatchFn, Closed, Queued},
    cache::{Cache, MapCache, NoCache},
    data::Fetched,
    deferred::Deferred,
    error::LoadError,
    scheduler::{Dispatch, Scheduler},
};

type KeyFn<Key, CacheKey> = Arc<dyn Fn(&Key) -> CacheKey + Send + Sync>;

/// A cache as held by a [`Loader`].
pub type SharedCache<CacheKey, Value> = Arc<dyn Cache<CacheKey, Value>>;

enum CacheChoice<CacheKey, Value> {
    Default,
    Disabled,
    Custom(SharedCache<CacheKey, Value>),
}

/// Options for building a [`Loader`]. Created with [`Loader::builder`].
pub struct LoaderBuilder<Key, Value, CacheKey = Key> {
    batcher: BatchFn<Key, Value>,
    key_fn: KeyFn<Key, CacheKey>,
    cache: CacheChoice<CacheKey, Value>,
    max_batch_size: Option<NonZeroUsize>,
}

impl<Key, Value> LoaderBuilder<Key, Value, Key> {
    /// Derive the cache key from each key. Two keys with the same cache key
    /// are loaded once. By default, the key is its own cache key.
    ///
    /// This changes the type of the cache, so any cache set with
    /// [`cache`](LoaderBuilder::cache) beforehand is forgotten; set it
    /// afterwards instead.
    pub fn key_fn<CacheKey, F>(self, key_fn: F) -> LoaderBuilder<Key, Value, CacheKey>
    where
        F: Fn(&Key) -> CacheKey + Send + Sync + 'static,
    {
        LoaderBuilder {
            batcher: self.batcher,
            key_fn: Arc::new(key_fn),
            cache: match self.cache {
                CacheChoice::Disabled => CacheChoice::Disabled,
                CacheChoice::Default | CacheChoice::Custom(..) => CacheChoice::Default,
            },
            max_batch_size: self.max_batch_size,
        }
    }
}

impl<Key, Value, CacheKey> LoaderBuilder<Key, Value, CacheKey> {
    /// Use this cache instead of a fresh [`MapCache`]. Handy for priming.
    pub fn cache(mut self, cache: SharedCache<CacheKey, Value>) -> Self {
        self.cache = CacheChoice::Custom(cache);
        self
    }

    /// Don't deduplicate keys at all.
    pub fn no_cache(mut self) -> Self {
        self.cache = CacheChoice::Disabled;
        self
    }

    /// Dispatch a batch as soon as it holds this many keys, instead of
    /// waiting for the scheduler to be drained.
    pub fn max_batch_size(mut self, max_batch_size: NonZeroUsize) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }
}

impl<Key, Value, CacheKey> LoaderBuilder<Key, Value, CacheKey>
where
    Key: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
    CacheKey: Eq + Hash + Send + Sync + 'static,
{
    /// Build the loader. Its batches are registered with `scheduler`.
    pub fn build(self, scheduler: &Scheduler) -> Loader<Key, Value, CacheKey> {
        let cache: SharedCache<CacheKey, Value> = match self.cache {
            CacheChoice::Default => Arc::new(MapCache::new()),
            CacheChoice::Disabled => Arc::new(NoCache),
            CacheChoice::Custom(cache) => cache,
        };

        Loader {
            inner: Arc::new(LoaderInner {
                batcher: self.batcher,
                key_fn: self.key_fn,
                cache: ArcSwap::from_pointee(cache),
                max_batch_size: self.max_batch_size,
                current: Mutex::new(Weak::new()),
                scheduler: scheduler.clone(),
            }),
        }
    }
}

impl<Key, Value, CacheKey> Debug for LoaderBuilder<Key, Value, CacheKey> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderBuilder")
            .field("batcher", &"<closure>")
            .field("key_fn", &"<closure>")
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

struct LoaderInner<Key, Value, CacheKey> {
    batcher: BatchFn<Key, Value>,
    key_fn: KeyFn<Key, CacheKey>,
    cache: ArcSwap<SharedCache<CacheKey, Value>>,
    max_batch_size: Option<NonZeroUsize>,

    // Like the cache, the current batch is shared by every thread using this
    // loader. It's held weakly: the scheduler owns a batch until it's
    // dispatched, and the loader has no reason to keep it alive after that.
    current: Mutex<Weak<Batch<Key, Value>>>,
    scheduler: Scheduler,
}

impl<Key, Value, CacheKey> LoaderInner<Key, Value, CacheKey>
where
    Key: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
{
    fn is_full(&self, len: usize) -> bool {
        matches!(self.max_batch_size, Some(max) if len >= max.get())
    }

    /// Queue a key into the open batch, opening a new one if necessary. If
    /// this fills the batch, it's detached from the loader and returned so
    /// that the caller can dispatch it once no locks are held.
    fn enqueue(&self, key: Key) -> (Deferred<Value>, Option<Arc<Batch<Key, Value>>>) {
        let mut current = self.current.lock();

        let key = match current.upgrade() {
            None => key,
            Some(batch) => match batch.queue(key) {
                Ok(Queued { value, len }) if self.is_full(len) => {
                    *current = Weak::new();
                    return (value, Some(batch));
                }
                Ok(Queued { value, .. }) => return (value, None),
                // A drain got to the batch first. Start a new one.
                Err(Closed(key)) => key,
            },
        };

        let (batch, value) = Batch::open(self.batcher.clone(), &self.scheduler, key);
        let batch = Arc::new(batch);
        self.scheduler.register(batch.clone());

        if self.is_full(1) {
            *current = Weak::new();
            return (value, Some(batch));
        }

        *current = Arc::downgrade(&batch);
        (value, None)
    }
}

/// The entry point for loading values in batches.
///
/// A loader pairs a batch function with a cache. Every key loaded between two
/// drains of the loader's [`Scheduler`] is queued into the same batch, and the
/// batch function sees each of those keys once (unless caching is disabled).
/// Values that have been loaded before come straight out of the cache.
///
/// Loaders are cheap to clone, and can be shared between threads. Clones
/// share their cache and their open batch.
pub struct Loader<Key, Value, CacheKey = Key> {
    inner: Arc<LoaderInner<Key, Value, CacheKey>>,
}

impl<Key, Value> Loader<Key, Value, Key>
where
    Key: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
{
    /// Create a loader with the default options: every key is its own cache
    /// key, values are cached in a fresh [`MapCache`], and batches are only
    /// dispatched when `scheduler` is drained.
    ///
    /// The batch function is given the queued keys in the order they were
    /// loaded. It must produce either one value per key, in the same order,
    /// or a value for each key by key; see [`Values`](crate::Values).
    pub fn new<F>(scheduler: &Scheduler, batcher: F) -> Self
    where
        F: Fn(&[Key]) -> Result<Fetched<Key, Value>, LoadError> + Send + Sync + 'static,
    {
        Self::builder(batcher).build(scheduler)
    }

    pub fn builder<F>(batcher: F) -> LoaderBuilder<Key, Value, Key>
    where
        F: Fn(&[Key]) -> Result<Fetched<Key, Value>, LoadError> + Send + Sync + 'static,
    {
        LoaderBuilder {
            batcher: Arc::new(batcher),
            key_fn: Arc::new(|key: &Key| key.clone()),
            cache: CacheChoice::Default,
            max_batch_size: None,
        }
    }
}

impl<Key, Value, CacheKey> Loader<Key, Value, CacheKey>
where
    Key: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
{
    /// Load a single value.
    ///
    /// If the key has been loaded before, this returns the cached value (or
    /// the same pending value as the earlier load). Otherwise the key is
    /// queued into this loader's open batch, and the batch function runs the
    /// next time the scheduler is drained, usually because some deferred
    /// value is being waited on.
    pub fn load(&self, key: Key) -> Deferred<Value> {
        let inner = &*self.inner;
        let cache_key = (inner.key_fn)(&key);
        let cache = inner.cache.load_full();

        let mut filled = None;
        let cached = cache.get_or_insert(
            cache_key,
            Box::new(|| {
                let (value, full) = inner.enqueue(key);
                filled = full;
                value
            }),
        );

        // The cache may hold locks while computing, so a batch that filled up
        // is dispatched only after it returns.
        if let Some(batch) = filled {
            inner.scheduler.unregister(&batch);
            batch.dispatch();
        }

        cached.into_deferred()
    }

    /// Load several values at once. The result lists the values in the same
    /// order as `keys`, and is rejected if any of them fails to load.
    pub fn load_many(&self, keys: impl IntoIterator<Item = Key>) -> Deferred<Vec<Value>> {
        Deferred::all(keys.into_iter().map(|key| self.load(key))).bind(&self.inner.scheduler)
    }

    /// [`load`](Loader::load) for callers whose key may be missing.
    pub fn try_load(&self, key: Option<Key>) -> Result<Deferred<Value>, LoadError> {
        key.map(|key| self.load(key)).ok_or(LoadError::InvalidKey)
    }

    /// [`load_many`](Loader::load_many) for callers whose list of keys, or
    /// any key in it, may be missing. Nothing is queued unless every key is
    /// present.
    pub fn try_load_many<I>(&self, keys: Option<I>) -> Result<Deferred<Vec<Value>>, LoadError>
    where
        I: IntoIterator<Item = Option<Key>>,
    {
        let keys: Vec<Key> = keys
            .ok_or(LoadError::InvalidInput)?
            .into_iter()
            .collect::<Option<_>>()
            .ok_or(LoadError::InvalidKey)?;

        Ok(self.load_many(keys))
    }

    /// Run the batch function for this loader's open batch right now, without
    /// draining the scheduler. Batches opened by the batch function itself
    /// still wait for the next drain.
    pub fn dispatch(&self) {
        let batch = mem::take(&mut *self.inner.current.lock()).upgrade();

        if let Some(batch) = batch {
            self.inner.scheduler.unregister(&batch);
            batch.dispatch();
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn max_batch_size(&self) -> Option<NonZeroUsize> {
        self.inner.max_batch_size
    }

    /// The cache this loader is currently using.
    pub fn cache(&self) -> SharedCache<CacheKey, Value> {
        let cache = self.inner.cache.load();
        Arc::clone(&**cache)
    }

    /// Replace the cache. Loads already in progress keep their values; later
    /// loads only see the new cache.
    pub fn set_cache(&self, cache: SharedCache<CacheKey, Value>) {
        self.inner.cache.store(Arc::new(cache));
    }

    /// Replace the cache with one that remembers nothing.
    pub fn disable_cache(&self) {
        self.set_cache(Arc::new(NoCache));
    }
}

impl<Key, Value, CacheKey> Clone for Loader<Key, Value, CacheKey> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Key, Value, CacheKey> Debug for Loader<Key, Value, CacheKey> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("batcher", &"<closure>")
            .field("max_batch_size", &self.inner.max_batch_size)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}
