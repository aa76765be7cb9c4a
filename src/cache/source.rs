//! The root cache: externally edited, observed by everything else.

use super::{CacheCore, ChangeAwareCache, KeySelector, Updater};
use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::query::QuerySnapshot;
use crate::scheduler::{SharedScheduler, Timestamp};
use crate::stream::{BoxObserver, Observable, ObservableExt, Observer, Subscription};
use crate::{Key, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The root source of a pipeline: a keyed cache mutated through
/// [`edit`](Self::edit) sessions and observed through
/// [`connect`](Self::connect), [`watch`](Self::watch),
/// [`preview`](Self::preview) and [`count_changed`](Self::count_changed).
///
/// The cache is owned uniquely; dropping it signals completion to every
/// subscriber. Handles to its streams (and snapshots) stay valid after
/// the drop but observe nothing further.
pub struct SourceCache<K: Key, V: Value> {
    core: Arc<CacheCore<K, V>>,
}

impl<K: Key, V: Value> SourceCache<K, V> {
    /// An empty cache.
    pub fn new() -> Self {
        SourceCache {
            core: CacheCore::new(ChangeAwareCache::new(), None),
        }
    }

    /// An empty cache whose edits may derive keys from values via
    /// `selector` (see [`Updater::add_or_update_value`]).
    pub fn with_key_selector(selector: impl Fn(&V) -> K + Send + Sync + 'static) -> Self {
        SourceCache {
            core: CacheCore::new(ChangeAwareCache::new(), Some(Arc::new(selector) as KeySelector<K, V>)),
        }
    }

    /// A cache seeded with `items`. The initial contents do not produce
    /// a change set; subscribers see them as replayed state.
    pub fn from_iter(items: impl IntoIterator<Item = (K, V)>) -> Self {
        let mut cache: ChangeAwareCache<K, V> = items.into_iter().collect();
        // Seeding is not an edit session; discard the recording.
        let _ = cache.capture_changes();
        SourceCache {
            core: CacheCore::new(cache, None),
        }
    }

    /// Runs an edit session. All mutations made through the session's
    /// [`Updater`] commit atomically as one change set when the
    /// outermost session ends; nested calls on the same cache merge
    /// into the outer batch.
    pub fn edit<F>(&self, session: F)
    where
        F: FnOnce(&mut Updater<'_, K, V>),
    {
        self.core.edit(session);
    }

    /// A cold stream of change sets. On subscribe it atomically
    /// captures current state and emits it as an initial batch of
    /// `Add`s, then forwards every future batch in commit order. An
    /// empty initial batch is suppressed.
    pub fn connect(&self) -> Connect<K, V> {
        Connect::new(self.core.clone(), true)
    }

    /// [`connect`](Self::connect) with control over whether an empty
    /// initial batch is emitted.
    pub fn connect_with(&self, suppress_empty: bool) -> Connect<K, V> {
        Connect::new(self.core.clone(), suppress_empty)
    }

    /// [`connect`](Self::connect) restricted to values matching
    /// `predicate`: the initial batch contains only matching items and
    /// future batches are filtered with full update/refresh transition
    /// semantics.
    pub fn connect_filtered<P>(&self, predicate: P) -> crate::ops::Filter<Connect<K, V>, K, V>
    where
        P: Fn(&V) -> bool + Send + Sync + 'static,
    {
        use crate::ops::ChangeStreamExt;
        self.connect().filter(predicate)
    }

    /// A stream of change sets observed *before* they are committed to
    /// downstream subscribers. No state replay.
    pub fn preview(&self) -> Preview<K, V> {
        Preview {
            core: self.core.clone(),
        }
    }

    /// A stream of the changes affecting one key. On subscribe a
    /// synthetic `Add` is emitted if the key is currently present.
    pub fn watch(&self, key: K) -> Watch<K, V> {
        Watch {
            core: self.core.clone(),
            key,
        }
    }

    /// A stream of distinct cache sizes, starting with the current
    /// size.
    pub fn count_changed(&self) -> CountChanged<K, V> {
        CountChanged {
            core: self.core.clone(),
        }
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

    /// Evicts items by per-item time-to-live.
    ///
    /// `ttl` is consulted on every add, update and refresh; `None`
    /// means the item never expires. With `poll_interval` set, a single
    /// periodic timer batches expirations at that cadence (accuracy
    /// degrades gracefully to the interval); otherwise a one-shot timer
    /// tracks the earliest due item. Expired items are removed through
    /// the ordinary edit path and surface as plain `Remove` changes.
    ///
    /// Dropping the returned guard stops all future expiry.
    pub fn expire_after<F>(
        &self,
        ttl: F,
        poll_interval: Option<Duration>,
        scheduler: SharedScheduler,
    ) -> Subscription
    where
        F: Fn(&V) -> Option<Duration> + Send + Sync + 'static,
    {
        let state = Arc::new(Mutex::new(ExpireState {
            due: FxHashMap::default(),
            timer: None,
            timer_target: None,
        }));
        let core = Arc::downgrade(&self.core);
        let shared = ExpireShared {
            state,
            core,
            scheduler,
            poll_interval,
        };

        let feed = shared.clone();
        let ttl = Arc::new(ttl);
        let connect_sub = self.connect().subscribe(move |changes: &ChangeSet<K, V>| {
            feed.apply(changes, &*ttl);
        });

        let teardown = shared;
        connect_sub.and(Subscription::new(move || {
            let mut state = teardown.state.lock();
            state.due.clear();
            state.timer = None;
        }))
    }

    /// Caps the cache at `limit` items: after every commit the oldest
    /// `size - limit` items (insertion order; updates do not refresh an
    /// item's age) are removed through the ordinary edit path.
    ///
    /// Dropping the returned guard stops future trimming.
    pub fn limit_size_to(&self, limit: usize) -> Subscription {
        let core = Arc::downgrade(&self.core);
        self.connect().subscribe(move |_changes: &ChangeSet<K, V>| {
            let core = match core.upgrade() {
                Some(core) => core,
                None => return,
            };
            let overflow: Vec<K> = {
                let guard = core.state.lock();
                let state = guard.borrow();
                let count = state.cache.count();
                if count <= limit {
                    Vec::new()
                } else {
                    state
                        .cache
                        .data()
                        .keys()
                        .take(count - limit)
                        .cloned()
                        .collect()
                }
            };
            if overflow.is_empty() {
                return;
            }
            log::debug!("size cap {} exceeded; evicting {} oldest items", limit, overflow.len());
            core.edit(|updater| {
                for key in &overflow {
                    updater.remove(key);
                }
            });
        })
    }

    pub(crate) fn core(&self) -> &Arc<CacheCore<K, V>> {
        &self.core
    }
}

impl<K: Key, V: Value> Default for SourceCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value> Drop for SourceCache<K, V> {
    fn drop(&mut self) {
        self.core.complete();
    }
}

struct ExpireState<K> {
    due: FxHashMap<K, Timestamp>,
    timer: Option<Subscription>,
    timer_target: Option<Timestamp>,
}

struct ExpireShared<K: Key, V: Value> {
    state: Arc<Mutex<ExpireState<K>>>,
    core: Weak<CacheCore<K, V>>,
    scheduler: SharedScheduler,
    poll_interval: Option<Duration>,
}

impl<K: Key, V: Value> Clone for ExpireShared<K, V> {
    fn clone(&self) -> Self {
        ExpireShared {
            state: self.state.clone(),
            core: self.core.clone(),
            scheduler: self.scheduler.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

impl<K: Key, V: Value> ExpireShared<K, V> {
    fn apply(&self, changes: &ChangeSet<K, V>, ttl: &(dyn Fn(&V) -> Option<Duration> + Send + Sync)) {
        use crate::change::ChangeReason;

        let now = self.scheduler.now();
        let mut state = self.state.lock();
        for change in changes.iter() {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                    match ttl(change.current()) {
                        Some(life) => {
                            state.due.insert(change.key().clone(), now + life);
                        }
                        None => {
                            state.due.remove(change.key());
                        }
                    }
                }
                ChangeReason::Remove => {
                    state.due.remove(change.key());
                }
                ChangeReason::Moved => {}
            }
        }
        self.reschedule(&mut state);
    }

    fn reschedule(&self, state: &mut ExpireState<K>) {
        if let Some(period) = self.poll_interval {
            if state.timer.is_none() {
                let shared = self.clone();
                state.timer = Some(
                    self.scheduler
                        .schedule_periodic(period, Box::new(move || shared.fire())),
                );
            }
            return;
        }

        let earliest = state.due.values().min().copied();
        match earliest {
            Some(target) => {
                if state.timer_target == Some(target) && state.timer.is_some() {
                    return;
                }
                let shared = self.clone();
                state.timer_target = Some(target);
                state.timer = Some(
                    self.scheduler
                        .schedule_at(target, Box::new(move || shared.fire())),
                );
            }
            None => {
                state.timer = None;
                state.timer_target = None;
            }
        }
    }

    fn fire(&self) {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return,
        };
        let now = self.scheduler.now();
        let expired: Vec<K> = {
            let mut state = self.state.lock();
            if self.poll_interval.is_none() {
                state.timer = None;
                state.timer_target = None;
            }
            let expired: Vec<K> = state
                .due
                .iter()
                .filter(|(_, due)| **due <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                state.due.remove(key);
            }
            expired
        };
        if !expired.is_empty() {
            log::debug!("expiring {} items", expired.len());
            core.edit(|updater| {
                for key in &expired {
                    updater.remove(key);
                }
            });
        }
        // Removal feedback through our own connect subscription also
        // re-arms the one-shot timer for the next earliest item; cover
        // the case where nothing was removed but items remain.
        let mut state = self.state.lock();
        self.reschedule(&mut state);
    }
}

/// The cold change-set stream of a cache. See [`SourceCache::connect`].
pub struct Connect<K: Key, V: Value> {
    core: Arc<CacheCore<K, V>>,
    suppress_empty: bool,
}

impl<K: Key, V: Value> Connect<K, V> {
    pub(crate) fn new(core: Arc<CacheCore<K, V>>, suppress_empty: bool) -> Self {
        Connect {
            core,
            suppress_empty,
        }
    }
}

impl<K: Key, V: Value> Clone for Connect<K, V> {
    fn clone(&self) -> Self {
        Connect {
            core: self.core.clone(),
            suppress_empty: self.suppress_empty,
        }
    }
}

impl<K: Key, V: Value> Observable<ChangeSet<K, V>> for Connect<K, V> {
    fn subscribe_with(&self, mut observer: BoxObserver<ChangeSet<K, V>>) -> Subscription {
        // Holding the cache mutex makes snapshot-then-subscribe atomic:
        // no batch can slip between the replayed state and the live
        // stream.
        let guard = self.core.state.lock();
        let initial: ChangeSet<K, V> = {
            let state = guard.borrow();
            let mut set = ChangeSet::with_capacity(state.cache.count());
            for (key, value) in state.cache.data() {
                set.push(Change::add(key.clone(), value.clone()));
            }
            set
        };
        if !(initial.is_empty() && self.suppress_empty) {
            observer.on_next(&initial);
        }
        if self.core.is_completed() {
            observer.on_completed();
            return Subscription::empty();
        }
        self.core.changes.subscribe_with(observer)
    }
}

/// The pre-commit stream of a cache. See [`SourceCache::preview`].
pub struct Preview<K: Key, V: Value> {
    core: Arc<CacheCore<K, V>>,
}

impl<K: Key, V: Value> Preview<K, V> {
    pub(crate) fn new(core: Arc<CacheCore<K, V>>) -> Self {
        Preview { core }
    }
}

impl<K: Key, V: Value> Clone for Preview<K, V> {
    fn clone(&self) -> Self {
        Preview {
            core: self.core.clone(),
        }
    }
}

impl<K: Key, V: Value> Observable<ChangeSet<K, V>> for Preview<K, V> {
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, V>>) -> Subscription {
        self.core.previews.subscribe_with(observer)
    }
}

/// The per-key change stream of a cache. See [`SourceCache::watch`].
pub struct Watch<K: Key, V: Value> {
    core: Arc<CacheCore<K, V>>,
    key: K,
}

impl<K: Key, V: Value> Watch<K, V> {
    pub(crate) fn new(core: Arc<CacheCore<K, V>>, key: K) -> Self {
        Watch { core, key }
    }
}

impl<K: Key, V: Value> Clone for Watch<K, V> {
    fn clone(&self) -> Self {
        Watch {
            core: self.core.clone(),
            key: self.key.clone(),
        }
    }
}

struct WatchAdapter<K: Key, V: Value> {
    key: K,
    downstream: BoxObserver<Change<K, V>>,
}

impl<K: Key, V: Value> Observer<ChangeSet<K, V>> for WatchAdapter<K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        for change in changes.iter() {
            if change.key() == &self.key {
                self.downstream.on_next(change);
            }
        }
    }

    fn on_completed(&mut self) {
        self.downstream.on_completed();
    }

    fn on_error(&mut self, error: &Error) {
        self.downstream.on_error(error);
    }
}

impl<K: Key, V: Value> Observable<Change<K, V>> for Watch<K, V> {
    fn subscribe_with(&self, mut observer: BoxObserver<Change<K, V>>) -> Subscription {
        let guard = self.core.state.lock();
        let present = guard.borrow().cache.lookup(&self.key).cloned();
        if let Some(value) = present {
            observer.on_next(&Change::add(self.key.clone(), value));
        }
        if self.core.is_completed() {
            observer.on_completed();
            return Subscription::empty();
        }
        self.core.changes.subscribe_with(Box::new(WatchAdapter {
            key: self.key.clone(),
            downstream: observer,
        }))
    }
}

/// The distinct-size stream of a cache. See
/// [`SourceCache::count_changed`].
pub struct CountChanged<K: Key, V: Value> {
    core: Arc<CacheCore<K, V>>,
}

impl<K: Key, V: Value> CountChanged<K, V> {
    pub(crate) fn new(core: Arc<CacheCore<K, V>>) -> Self {
        CountChanged { core }
    }
}

impl<K: Key, V: Value> Clone for CountChanged<K, V> {
    fn clone(&self) -> Self {
        CountChanged {
            core: self.core.clone(),
        }
    }
}

impl<K: Key, V: Value> Observable<usize> for CountChanged<K, V> {
    fn subscribe_with(&self, mut observer: BoxObserver<usize>) -> Subscription {
        let guard = self.core.state.lock();
        let count = guard.borrow().cache.count();
        observer.on_next(&count);
        if self.core.is_completed() {
            observer.on_completed();
            return Subscription::empty();
        }
        self.core.counts.subscribe_with(observer)
    }
}
