//! Caches: the root [`SourceCache`], the upstream-driven
//! [`DerivedCache`], and the shared publication core both sit on.

mod change_aware;
mod derived;
mod reader_writer;
mod source;

pub use change_aware::ChangeAwareCache;
pub use derived::DerivedCache;
pub use reader_writer::Updater;
pub use source::{Connect, CountChanged, Preview, SourceCache, Watch};

use crate::change::ChangeSet;
use crate::error::Error;
use crate::query::QuerySnapshot;
use crate::stream::Subject;
use crate::{Key, Value};
use crossbeam_utils::atomic::AtomicCell;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::Arc;

/// Key selector deriving an item's identity from its value.
pub type KeySelector<K, V> = Arc<dyn Fn(&V) -> K + Send + Sync>;

pub(crate) struct CoreState<K, V> {
    pub(crate) cache: ChangeAwareCache<K, V>,
    pub(crate) key_selector: Option<KeySelector<K, V>>,
    pub(crate) edit_depth: usize,
    pub(crate) last_count: Option<usize>,
}

/// Shared state of one cache: the dictionary, its mutex, and the
/// subjects every handle publishes through.
///
/// The mutex is reentrant: all edits and all change-set dispatches of
/// one cache are serialized on it, and an edit issued from inside a
/// dispatch callback on the same thread re-enters instead of
/// deadlocking (its batch is queued after the in-flight one by the
/// subject).
pub(crate) struct CacheCore<K: Key, V: Value> {
    pub(crate) state: ReentrantMutex<RefCell<CoreState<K, V>>>,
    pub(crate) changes: Subject<ChangeSet<K, V>>,
    pub(crate) previews: Subject<ChangeSet<K, V>>,
    pub(crate) counts: Subject<usize>,
    completed: AtomicCell<bool>,
}

impl<K: Key, V: Value> CacheCore<K, V> {
    pub(crate) fn new(
        cache: ChangeAwareCache<K, V>,
        key_selector: Option<KeySelector<K, V>>,
    ) -> Arc<Self> {
        Arc::new(CacheCore {
            state: ReentrantMutex::new(RefCell::new(CoreState {
                cache,
                key_selector,
                edit_depth: 0,
                last_count: None,
            })),
            changes: Subject::new(),
            previews: Subject::new(),
            counts: Subject::new(),
            completed: AtomicCell::new(false),
        })
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load()
    }

    /// Signals completion to every subscriber. State is retained for
    /// late snapshot readers, but nothing further is published.
    pub(crate) fn complete(&self) {
        if !self.completed.swap(true) {
            self.changes.complete();
            self.previews.complete();
            self.counts.complete();
        }
    }

    /// Propagates an upstream fault to every subscriber.
    pub(crate) fn fail(&self, error: &Error) {
        if !self.completed.swap(true) {
            self.changes.fail(error.clone());
            self.previews.fail(error.clone());
            self.counts.fail(error.clone());
        }
    }

    pub(crate) fn snapshot(&self) -> QuerySnapshot<K, V> {
        let guard = self.state.lock();
        let snapshot = guard.borrow().cache.snapshot();
        snapshot
    }

    pub(crate) fn count(&self) -> usize {
        let guard = self.state.lock();
        let count = guard.borrow().cache.count();
        count
    }

    pub(crate) fn lookup(&self, key: &K) -> Option<V> {
        let guard = self.state.lock();
        let value = guard.borrow().cache.lookup(key).cloned();
        value
    }
}
