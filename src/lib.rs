#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! The rill crate is a crate for propagating fine-grained changes
//! through keyed collections. You push mutations into a root
//! [`SourceCache`] inside edit sessions; the cache publishes each
//! session as an atomic [`ChangeSet`] (a batch of per-key add, update,
//! remove, refresh and move events) which flows through composable
//! operators — filter, transform, sort, group, join, merge, paging,
//! expiration, tree building — and is finally materialized into a
//! derived cache, a bound ordered list, or a side effect.
//!
//! ```
//! use rill::{ChangeStreamExt, ObservableExt, SourceCache};
//!
//! let cache: SourceCache<u32, String> = SourceCache::new();
//! let _sub = cache
//!     .connect()
//!     .filter(|name: &String| name.len() > 3)
//!     .subscribe(|changes| {
//!         for change in changes.iter() {
//!             println!("{:?} {}", change.reason(), change.current());
//!         }
//!     });
//!
//! cache.edit(|updater| {
//!     updater.add_or_update(1, "alpha".to_string());
//!     updater.add_or_update(2, "io".to_string()); // filtered out
//! });
//! ```
//!
//! Streams here are a minimal push-based observer protocol, not a full
//! reactive runtime: see [`stream`] for the primitives and [`ops`] for
//! the operator combinators. Time-based operators take an injected
//! [`scheduler::Scheduler`], so tests run on virtual time.

pub mod cache;
mod change;
mod error;
pub mod ops;
mod query;
pub mod scheduler;
mod sorted;
pub mod stream;

pub use crate::cache::{Connect, DerivedCache, SourceCache, Updater};
pub use crate::change::{Change, ChangeReason, ChangeSet, NO_INDEX};
pub use crate::error::Error;
pub use crate::ops::{ChangeStreamExt, SortedStreamExt};
pub use crate::query::QuerySnapshot;
pub use crate::sorted::{comparing, comparing_by, Comparer, SortReason, SortedChangeSet};
pub use crate::stream::{Observable, ObservableExt, Observer, Subject, Subscription};

use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

pub(crate) type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// Bounds an item identity must satisfy: total equality, hashing, and
/// the ability to travel between threads. Blanket-implemented; never
/// implement it by hand.
pub trait Key: Clone + Eq + std::hash::Hash + Send + 'static {}

impl<T> Key for T where T: Clone + Eq + std::hash::Hash + Send + 'static {}

/// Bounds a cached value must satisfy. Blanket-implemented; never
/// implement it by hand.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + 'static {}
