//! Dataloader is a Rust implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader) originally
//! created by Facebook. It lets application code ask for values one key at a
//! time, while the data source behind it receives a few wide, batched
//! requests. The common use case is resolving a graph of objects where every
//! object refers to others by id, but it can be used anywhere it'd be useful
//! to hide batching logic from the code that needs the data.
//!
//! ## Overview
//!
//! A [`Loader`] wraps a batch function: a function that takes a list of keys
//! and returns the values for all of them. Calling [`Loader::load`] doesn't
//! run anything; it queues the key and hands back a [`Deferred`] value. All
//! the keys loaded before somebody actually needs a value are collected into
//! one batch, and the batch function runs once for all of them.
//!
//! ```
//! use dataloader::{LoadError, Loader, Scheduler};
//!
//! # fn main() -> Result<(), LoadError> {
//! let scheduler = Scheduler::new();
//! let names: Loader<u32, String> = Loader::new(&scheduler, |ids: &[u32]| {
//!     Ok(ids.iter().map(|id| format!("v{}", id)).collect::<Vec<_>>().into())
//! });
//!
//! let one = names.load(1);
//! let many = names.load_many(vec![1, 2]);
//!
//! // Nothing has been loaded yet. Waiting on either value runs the batch
//! // function, once, with the keys [1, 2].
//! assert_eq!(one.wait()?, "v1");
//! assert_eq!(many.wait()?, ["v1", "v2"]);
//! # Ok(())
//! # }
//! ```
//!
//! A batch function may return its values in one of three shapes (see
//! [`Values`]): a list in the same order as the keys it was given, a map by
//! key, or a list of key-value pairs. If the shape doesn't match the keys, for
//! instance because the list is too short, every value in the batch is
//! rejected with a [`LoadError`]. A batch function that isn't ready yet can
//! return a [`Deferred`] instead, created with [`Deferred::channel`] or
//! derived from another loader.
//!
//! ## The scheduler
//!
//! Every loader is built against a [`Scheduler`]. The scheduler keeps the
//! list of batches that have been opened but not yet dispatched. When a
//! deferred value is forced, with [`Deferred::wait`] or by polling it as a
//! [`Future`](std::future::Future), its scheduler is drained first: every
//! pending batch is dispatched, across every loader that shares the
//! scheduler.
//!
//! Batch functions are allowed to load from other loaders. Those loads open
//! new batches, which the drain picks up and dispatches in turn, until there
//! is nothing left. A loader that depends on another loader is therefore
//! resolved by a single wait, and the inner loader sees every key requested
//! through the outer one in the same batch:
//!
//! ```
//! use dataloader::{LoadError, Loader, Scheduler};
//!
//! # fn main() -> Result<(), LoadError> {
//! let scheduler = Scheduler::new();
//!
//! let records: Loader<u32, String> = Loader::new(&scheduler, |ids: &[u32]| {
//!     Ok(ids.iter().map(|id| format!("bar {}", id)).collect::<Vec<_>>().into())
//! });
//!
//! let inner = records.clone();
//! let names: Loader<u32, String> = Loader::new(&scheduler, move |ids: &[u32]| {
//!     Ok(inner
//!         .load_many(ids.to_vec())
//!         .map(|records| records.into_iter().map(|r| format!("foo {}", r)).collect::<Vec<_>>())
//!         .into())
//! });
//!
//! let direct = records.load(1);
//! let indirect = names.load_many(vec![2, 3]);
//!
//! assert_eq!(indirect.wait()?, ["foo bar 2", "foo bar 3"]);
//! assert_eq!(direct.wait()?, "bar 1");
//! # Ok(())
//! # }
//! ```
//!
//! A scheduler is not global or thread-local. Whatever executes
//! a unit of work (a request handler, a thread, a task) should create one and
//! build its loaders against it. Loaders and their deferred values are
//! `Send` and `Sync`, so keys can be loaded from several threads into the
//! same batch.
//!
//! ## Design notes
//!
//! ### Pull-driven scheduling
//!
//! There is no background thread and no timer. The batching window for a
//! loader lasts exactly until somebody needs a result, and the batch function
//! runs on the thread that asked for it. The one exception is
//! [`LoaderBuilder::max_batch_size`]: a batch that reaches the limit is
//! dispatched immediately by the `load` call that filled it.
//!
//! ### Caching
//!
//! Each loader owns a [`Cache`], which maps a cache key (by default, the key
//! itself) to the value for that key. Loading a key twice returns the same
//! value, and the batch function sees the key only once. The default
//! [`MapCache`] keeps everything for as long as it lives; it can be primed
//! with known values, or swapped for a new one to start over.
//! [`NoCache`] turns deduplication off entirely.
//!
//! ### Errors
//!
//! Errors are values. A failing batch function, or one that returns data of
//! the wrong shape, rejects every deferred value in its batch, and forcing one
//! of those values returns the error. One failing batch never stops the
//! scheduler from dispatching the others.

mod batch;
mod cache;
mod data;
mod deferred;
mod error;
mod loader;
mod scheduler;
mod wakerset;


pub use cache::{Cache, Cached, Compute, MapCache, NoCache};
pub use data::{Fetched, KeyedEntry, Values};
pub use deferred::{Deferred, Resolver};
pub use error::LoadError;
pub use loader::{Loader, LoaderBuilder, SharedCache};
pub use scheduler::Scheduler;
