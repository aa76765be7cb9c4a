//! A cache driven solely by an upstream change-set stream.

use super::source::{Connect, CountChanged, Preview, Watch};
use super::{CacheCore, ChangeAwareCache};
use crate::change::ChangeSet;
use crate::error::Error;
use crate::query::QuerySnapshot;
use crate::stream::{Observable, Observer, Subscription};
use crate::{Key, Value};
use std::sync::Arc;

/// A cache materialized from an upstream stream.
///
/// It is never edited externally: every batch the upstream publishes is
/// folded in and re-published, so downstream subscribers get replay,
/// watch and count semantics identical to a root cache. Dropping the
/// derived cache unsubscribes from the upstream and completes its own
/// subscribers.
pub struct DerivedCache<K: Key, V: Value> {
    core: Arc<CacheCore<K, V>>,
    upstream: Option<Subscription>,
}

struct FeedObserver<K: Key, V: Value> {
    core: Arc<CacheCore<K, V>>,
}

impl<K: Key, V: Value> Observer<ChangeSet<K, V>> for FeedObserver<K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        self.core.edit(|updater| updater.clone_changes(changes));
    }

    fn on_completed(&mut self) {
        self.core.complete();
    }

    fn on_error(&mut self, error: &Error) {
        self.core.fail(error);
    }
}

impl<K: Key, V: Value> DerivedCache<K, V> {
    /// Materializes `upstream` into a cache, subscribing immediately.
    pub fn from_stream<S>(upstream: &S) -> Self
    where
        S: Observable<ChangeSet<K, V>> + ?Sized,
    {
        let core = CacheCore::new(ChangeAwareCache::new(), None);
        let feed = FeedObserver { core: core.clone() };
        let upstream = upstream.subscribe_with(Box::new(feed));
        DerivedCache {
            core,
            upstream: Some(upstream),
        }
    }

    /// A cold stream of this cache's change sets, replaying current
    /// state on subscribe.
    pub fn connect(&self) -> Connect<K, V> {
        Connect::new(self.core.clone(), true)
    }

    /// [`connect`](Self::connect) restricted to values matching
    /// `predicate`.
    pub fn connect_filtered<P>(&self, predicate: P) -> crate::ops::Filter<Connect<K, V>, K, V>
    where
        P: Fn(&V) -> bool + Send + Sync + 'static,
    {
        use crate::ops::ChangeStreamExt;
        self.connect().filter(predicate)
    }

    /// The pre-commit stream.
    pub fn preview(&self) -> Preview<K, V> {
        Preview::new(self.core.clone())
    }

    /// The changes affecting one key, with a synthetic initial `Add`.
    pub fn watch(&self, key: K) -> Watch<K, V> {
        Watch::new(self.core.clone(), key)
    }

    /// Distinct cache sizes, starting with the current one.
    pub fn count_changed(&self) -> CountChanged<K, V> {
        CountChanged::new(self.core.clone())
    }

    /// A detached read-only copy of the current state.
    pub fn snapshot(&self) -> QuerySnapshot<K, V> {
        self.core.snapshot()
    }

    /// Number of items currently held.
    pub fn count(&self) -> usize {
        self.core.count()
    }

    /// The value for `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.core.lookup(key)
    }
}

impl<K: Key, V: Value> Drop for DerivedCache<K, V> {
    fn drop(&mut self) {
        self.upstream = None;
        self.core.complete();
    }
}
