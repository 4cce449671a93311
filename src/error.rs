use std::{error::Error, fmt::Debug, sync::Arc};

use thiserror::Error;

/// Every way a load can fail.
///
/// Errors are `Clone` because a single batch failure is observed by every
/// handle that queued a key into that batch.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// `try_load` was called without a key.
    #[error("load must be called with a key, but got: None")]
    InvalidKey,

    /// `try_load_many` was called without a list of keys.
    #[error("load_many must be called with a list of keys, but got: None")]
    InvalidInput,

    /// A key was queued into a batch that had already been dispatched.
    #[error("cannot queue elements after batch is dispatched. Queued key: {key}")]
    AlreadyDispatched { key: String },

    /// The batch function returned data that can't be matched to keys.
    #[error("batch function returned a malformed result: {reason}")]
    Shape { reason: String },

    /// The batch function returned the wrong number of values.
    #[error(
        "batch function must return as many values as it was given keys \
         (expected {expected}, got {actual})"
    )]
    SizeMismatch { expected: usize, actual: usize },

    /// The batch function returned a keyed result that omits a queued key.
    #[error("batch function didn't resolve a key: {key}. Resolved keys: {}", .resolved.join(" "))]
    MissingKey { key: String, resolved: Vec<String> },

    /// The batch function itself failed.
    #[error("batch function failed: {0}")]
    Fetch(Arc<dyn Error + Send + Sync + 'static>),

    /// The resolver for a deferred value was dropped before settling it.
    #[error("deferred value was abandoned before being settled")]
    Canceled,
}

impl LoadError {
    /// Wrap an arbitrary error returned by a batch function.
    pub fn fetch(err: impl Error + Send + Sync + 'static) -> Self {
        LoadError::Fetch(Arc::new(err))
    }

    pub(crate) fn missing_key<'a, K: Debug + 'a>(
        key: &K,
        resolved: impl IntoIterator<Item = &'a K>,
    ) -> Self {
        LoadError::MissingKey {
            key: format!("{:?}", key),
            resolved: resolved
                .into_iter()
                .map(|key| format!("{:?}", key))
                .collect(),
        }
    }
}
