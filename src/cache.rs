//! Key deduplication for loaders.

use std::{
    fmt::{self, Debug, Formatter},
    hash::Hash,
};

use dashmap::{mapref::entry::Entry, DashMap};

use crate::deferred::Deferred;

/// The fallback a [`Cache`] calls when it has nothing for a key. Calling it
/// queues the key into the loader's open batch.
pub type Compute<'a, Value> = Box<dyn FnOnce() -> Deferred<Value> + 'a>;

/// A cache entry: either a plain value (typically primed from outside the
/// loader) or a deferred value that is still on its way.
#[derive(Debug, Clone)]
pub enum Cached<Value> {
    Value(Value),
    Deferred(Deferred<Value>),
}

impl<Value: Clone + Send + 'static> Cached<Value> {
    pub fn into_deferred(self) -> Deferred<Value> {
        match self {
            Cached::Value(value) => Deferred::fulfilled(value),
            Cached::Deferred(deferred) => deferred,
        }
    }
}

impl<Value> From<Deferred<Value>> for Cached<Value> {
    fn from(deferred: Deferred<Value>) -> Self {
        Cached::Deferred(deferred)
    }
}

/// Storage for the values a loader has handed out, by cache key.
///
/// Implementations must call `compute` at most once per distinct key for as
/// long as that key has an entry, even when `get_or_insert` races with itself
/// on several threads. `compute` never calls into user code, so it's fine to
/// hold a lock while calling it.
pub trait Cache<CacheKey, Value>: Send + Sync {
    fn get_or_insert(&self, key: CacheKey, compute: Compute<'_, Value>) -> Cached<Value>;
}

/// The default cache: a concurrent map that keeps every entry for the life of
/// the cache. To start over, give the loader a new cache.
pub struct MapCache<CacheKey: Eq + Hash, Value> {
    entries: DashMap<CacheKey, Cached<Value>>,
}

impl<CacheKey: Eq + Hash, Value> MapCache<CacheKey, Value> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store a known value for a key, so that loading it never reaches the
    /// batch function. Returns false, leaving the existing entry in place, if
    /// the key already has one.
    pub fn prime(&self, key: CacheKey, value: Value) -> bool {
        self.insert_if_absent(key, Cached::Value(value))
    }

    /// Like [`prime`](MapCache::prime), with a value that isn't ready yet.
    pub fn prime_deferred(&self, key: CacheKey, value: Deferred<Value>) -> bool {
        self.insert_if_absent(key, Cached::Deferred(value))
    }

    fn insert_if_absent(&self, key: CacheKey, entry: Cached<Value>) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(..) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        }
    }

    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<CacheKey: Eq + Hash, Value> Default for MapCache<CacheKey, Value> {
    fn default() -> Self {
        Self::new()
    }
}

impl<CacheKey: Eq + Hash, Value> FromIterator<(CacheKey, Value)> for MapCache<CacheKey, Value> {
    fn from_iter<I: IntoIterator<Item = (CacheKey, Value)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key, Cached::Value(value)))
                .collect(),
        }
    }
}

impl<CacheKey: Eq + Hash, Value> Debug for MapCache<CacheKey, Value> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl<CacheKey, Value> Cache<CacheKey, Value> for MapCache<CacheKey, Value>
where
    CacheKey: Eq + Hash + Send + Sync,
    Value: Clone + Send + Sync,
{
    fn get_or_insert(&self, key: CacheKey, compute: Compute<'_, Value>) -> Cached<Value> {
        // The entry holds its shard's write lock until it's dropped, which is
        // what makes `compute` run at most once per key.
        self.entries
            .entry(key)
            .or_insert_with(move || Cached::Deferred(compute()))
            .value()
            .clone()
    }
}

/// A cache that remembers nothing. Every load queues its key, so the batch
/// function may see the same key more than once.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl<CacheKey, Value> Cache<CacheKey, Value> for NoCache {
    fn get_or_insert(&self, _key: CacheKey, compute: Compute<'_, Value>) -> Cached<Value> {
        Cached::Deferred(compute())
    }
}
