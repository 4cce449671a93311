//! Data structures for passing values out of a batch function and matching
//! them back up with the keys that were queued.

use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use crate::{deferred::Deferred, error::LoadError};

/// The values a batch function produced for its keys.
#[derive(Debug, Clone)]
pub enum Values<Key, Value> {
    /// One value per key, in the same order as the keys the batch function
    /// was given.
    List(Vec<Value>),

    /// Values by key, in any order.
    Map(HashMap<Key, Value>),

    /// Values paired with their keys, in any order. Each key may appear only
    /// once.
    Entries(Vec<(Key, Value)>),
}

/// Trait for values that know their own key, such as database rows. Use it
/// with [`Values::from_keyed`] when your data source doesn't return results
/// in request order.
pub trait KeyedEntry<Key> {
    fn get_key(&self) -> &Key;
}

impl<Key: Clone, Value: KeyedEntry<Key>> Values<Key, Value> {
    pub fn from_keyed(values: impl IntoIterator<Item = Value>) -> Self {
        Values::Entries(
            values
                .into_iter()
                .map(|value| (value.get_key().clone(), value))
                .collect(),
        )
    }
}

impl<Key, Value> Values<Key, Value> {
    pub fn len(&self) -> usize {
        match self {
            Values::List(values) => values.len(),
            Values::Map(values) => values.len(),
            Values::Entries(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Key, Value> Values<Key, Value>
where
    Key: Eq + Hash + Clone + Debug,
{
    /// Match these values with the keys that produced them.
    ///
    /// A list has to have exactly one value per queued key, and is zipped
    /// with them by position. A keyed result has to have exactly one value
    /// per distinct queued key, and must resolve every one of them. When
    /// caching is disabled the same key can be queued more than once; a list
    /// must still repeat its value, but a keyed result lists it once.
    ///
    /// Any failure here poisons the entire batch: once the shape is wrong,
    /// no individual value can be trusted to belong to its key.
    pub(crate) fn reconcile(self, keys: &[Key]) -> Result<HashMap<Key, Value>, LoadError> {
        let values = match self {
            Values::List(values) => {
                if values.len() != keys.len() {
                    return Err(LoadError::SizeMismatch {
                        expected: keys.len(),
                        actual: values.len(),
                    });
                }

                return Ok(keys.iter().cloned().zip(values).collect());
            }
            Values::Map(values) => values,
            Values::Entries(entries) => {
                let mut values = HashMap::with_capacity(entries.len());
                for (key, value) in entries {
                    match values.entry(key) {
                        Entry::Vacant(entry) => {
                            entry.insert(value);
                        }
                        Entry::Occupied(entry) => {
                            return Err(LoadError::Shape {
                                reason: format!("duplicate entry for key {:?}", entry.key()),
                            })
                        }
                    }
                }
                values
            }
        };

        let distinct: HashSet<&Key> = keys.iter().collect();
        if values.len() != distinct.len() {
            return Err(LoadError::SizeMismatch {
                expected: distinct.len(),
                actual: values.len(),
            });
        }

        match keys.iter().find(|key| !values.contains_key(*key)) {
            Some(missing) => Err(LoadError::missing_key(missing, values.keys())),
            None => Ok(values),
        }
    }
}

/// What a batch function hands back: either values it already has, or a
/// deferred value that settles with them later.
#[derive(Debug, Clone)]
pub enum Fetched<Key, Value> {
    Ready(Values<Key, Value>),
    Deferred(Deferred<Values<Key, Value>>),
}

impl<Key, Value> From<Values<Key, Value>> for Fetched<Key, Value> {
    fn from(values: Values<Key, Value>) -> Self {
        Fetched::Ready(values)
    }
}

impl<Key, Value> From<Vec<Value>> for Fetched<Key, Value> {
    fn from(values: Vec<Value>) -> Self {
        Fetched::Ready(Values::List(values))
    }
}

impl<Key, Value> From<HashMap<Key, Value>> for Fetched<Key, Value> {
    fn from(values: HashMap<Key, Value>) -> Self {
        Fetched::Ready(Values::Map(values))
    }
}

impl<Key, Value> From<Deferred<Values<Key, Value>>> for Fetched<Key, Value> {
    fn from(values: Deferred<Values<Key, Value>>) -> Self {
        Fetched::Deferred(values)
    }
}

impl<Key, Value> From<Deferred<Vec<Value>>> for Fetched<Key, Value>
where
    Key: Clone + Send + 'static,
    Value: Clone + Send + 'static,
{
    fn from(values: Deferred<Vec<Value>>) -> Self {
        Fetched::Deferred(values.map(Values::List))
    }
}
