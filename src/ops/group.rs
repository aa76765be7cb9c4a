//! Partitioning a stream into per-group sub-caches.

use crate::cache::{CacheCore, ChangeAwareCache, Connect};
use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::query::QuerySnapshot;
use crate::stream::{
    BoxObservable, BoxObserver, KeyedSubscriptions, Observable, ObservableExt, Observer,
    SharedObserver, Subscription,
};
use crate::{FxIndexMap, Key, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// One partition of a grouped stream: a group key plus its own cache of
/// members.
///
/// The handle is cheap to clone; all clones observe the same member
/// cache. When the group loses its last member it is removed from the
/// group stream and its cache completes.
pub struct Group<G, K: Key, V: Value> {
    key: G,
    core: Arc<CacheCore<K, V>>,
}

impl<G: Clone, K: Key, V: Value> Clone for Group<G, K, V> {
    fn clone(&self) -> Self {
        Group {
            key: self.key.clone(),
            core: self.core.clone(),
        }
    }
}

impl<G, K: Key, V: Value> Group<G, K, V> {
    pub(crate) fn new(key: G) -> Self {
        Group {
            key,
            core: CacheCore::new(ChangeAwareCache::new(), None),
        }
    }

    pub(crate) fn edit<F>(&self, session: F)
    where
        F: FnOnce(&mut crate::cache::Updater<'_, K, V>),
    {
        self.core.edit(session);
    }

    pub(crate) fn complete_members(&self) {
        self.core.complete();
    }

    /// The group key.
    pub fn key(&self) -> &G {
        &self.key
    }

    /// The member cache's cold change stream (replays current members
    /// on subscribe).
    pub fn connect(&self) -> Connect<K, V> {
        Connect::new(self.core.clone(), true)
    }

    /// A detached copy of the current members.
    pub fn snapshot(&self) -> QuerySnapshot<K, V> {
        self.core.snapshot()
    }

    /// Number of members.
    pub fn count(&self) -> usize {
        self.core.count()
    }

    /// The member under `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.core.lookup(key)
    }
}

/// The grouping operator. Built by
/// [`ChangeStreamExt::group`](super::ChangeStreamExt::group).
pub struct GroupBy<S, K, V, G> {
    upstream: S,
    selector: Arc<dyn Fn(&K, &V) -> G + Send + Sync>,
    regroup: Option<BoxObservable<()>>,
    _marker: PhantomData<fn() -> (K, V, G)>,
}

impl<S, K, V, G> GroupBy<S, K, V, G> {
    pub(crate) fn new(upstream: S, selector: Arc<dyn Fn(&K, &V) -> G + Send + Sync>) -> Self {
        GroupBy {
            upstream,
            selector,
            regroup: None,
            _marker: PhantomData,
        }
    }

    /// Re-evaluates the group of every key whenever `trigger` emits.
    pub fn with_regroup<R>(mut self, trigger: R) -> Self
    where
        R: Observable<()> + Send + Sync + 'static,
    {
        self.regroup = Some(Arc::new(trigger));
        self
    }
}

struct GroupState<G, K: Key, V: Value> {
    groups: FxIndexMap<G, Group<G, K, V>>,
    membership: FxHashMap<K, G>,
    values: FxHashMap<K, V>,
}

struct GroupWork<G: Key, K: Key, V: Value> {
    state: Mutex<GroupState<G, K, V>>,
    downstream: SharedObserver<ChangeSet<G, Group<G, K, V>>>,
}

impl<G: Key, K: Key, V: Value> GroupWork<G, K, V> {
    /// Routes one member mutation; child batches accumulate per group,
    /// group creations are recorded for later announcement.
    fn route(
        state: &mut GroupState<G, K, V>,
        child_batches: &mut FxIndexMap<G, ChangeSet<K, V>>,
        created: &mut Vec<G>,
        key: &K,
        value: &V,
        target: G,
        reason: ChangeReason,
    ) {
        let previous_group = state.membership.get(key).cloned();
        state.values.insert(key.clone(), value.clone());
        match previous_group {
            Some(old) if old == target => {
                let change = match reason {
                    ChangeReason::Refresh => Change::refresh(key.clone(), value.clone()),
                    ChangeReason::Add => Change::add(key.clone(), value.clone()),
                    _ => Change::update(key.clone(), value.clone(), value.clone()),
                };
                child_batches.entry(old).or_default().push(change);
            }
            Some(old) => {
                child_batches
                    .entry(old)
                    .or_default()
                    .push(Change::remove(key.clone(), value.clone()));
                Self::ensure_group(state, created, &target);
                state.membership.insert(key.clone(), target.clone());
                child_batches
                    .entry(target)
                    .or_default()
                    .push(Change::add(key.clone(), value.clone()));
            }
            None => {
                Self::ensure_group(state, created, &target);
                state.membership.insert(key.clone(), target.clone());
                child_batches
                    .entry(target)
                    .or_default()
                    .push(Change::add(key.clone(), value.clone()));
            }
        }
    }

    fn ensure_group(state: &mut GroupState<G, K, V>, created: &mut Vec<G>, group: &G) {
        if !state.groups.contains_key(group) {
            state
                .groups
                .insert(group.clone(), Group::new(group.clone()));
            created.push(group.clone());
        }
    }

    /// Feeds accumulated child batches, announces created groups, and
    /// retires emptied ones.
    fn flush(
        &self,
        state: &mut GroupState<G, K, V>,
        child_batches: FxIndexMap<G, ChangeSet<K, V>>,
        created: Vec<G>,
    ) {
        let mut touched: Vec<G> = Vec::with_capacity(child_batches.len());
        for (group_key, batch) in child_batches {
            if let Some(group) = state.groups.get(&group_key) {
                group.core.edit(|updater| updater.clone_changes(&batch));
            }
            touched.push(group_key);
        }

        let mut out: ChangeSet<G, Group<G, K, V>> = ChangeSet::new();
        for group_key in created {
            if let Some(group) = state.groups.get(&group_key) {
                if group.count() > 0 {
                    out.push(Change::add(group_key, group.clone()));
                }
            }
        }
        for group_key in touched {
            let emptied = state
                .groups
                .get(&group_key)
                .map(|g| g.count() == 0)
                .unwrap_or(false);
            if emptied {
                let group = state
                    .groups
                    .shift_remove(&group_key)
                    .expect("emptied group vanished");
                group.core.complete();
                out.push(Change::remove(group_key, group));
            }
        }
        if !out.is_empty() {
            self.downstream.lock().on_next(&out);
        }
    }

    fn apply_batch(
        &self,
        changes: &ChangeSet<K, V>,
        selector: &(dyn Fn(&K, &V) -> G + Send + Sync),
    ) {
        let mut state = self.state.lock();
        let mut child_batches: FxIndexMap<G, ChangeSet<K, V>> = FxIndexMap::default();
        let mut created = Vec::new();

        for change in changes.iter() {
            let key = change.key();
            let value = change.current();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                    let target = selector(key, value);
                    Self::route(
                        &mut state,
                        &mut child_batches,
                        &mut created,
                        key,
                        value,
                        target,
                        change.reason(),
                    );
                }
                ChangeReason::Remove => {
                    state.values.remove(key);
                    if let Some(group) = state.membership.remove(key) {
                        child_batches
                            .entry(group)
                            .or_default()
                            .push(Change::remove(key.clone(), value.clone()));
                    }
                }
                // Group output is unordered; positions carry no meaning.
                ChangeReason::Moved => {}
            }
        }
        self.flush(&mut state, child_batches, created);
    }

    /// Re-evaluates the group of every key.
    fn regroup(&self, selector: &(dyn Fn(&K, &V) -> G + Send + Sync)) {
        log::debug!("regroup triggered; re-evaluating all memberships");
        let mut state = self.state.lock();
        let mut child_batches: FxIndexMap<G, ChangeSet<K, V>> = FxIndexMap::default();
        let mut created = Vec::new();

        let snapshot: Vec<(K, V)> = state
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in snapshot {
            let target = selector(&key, &value);
            let current = state.membership.get(&key).cloned();
            if current.as_ref() != Some(&target) {
                Self::route(
                    &mut state,
                    &mut child_batches,
                    &mut created,
                    &key,
                    &value,
                    target,
                    ChangeReason::Update,
                );
            }
        }
        self.flush(&mut state, child_batches, created);
    }

    fn complete(&self) {
        let state = self.state.lock();
        for group in state.groups.values() {
            group.core.complete();
        }
        drop(state);
        self.downstream.lock().on_completed();
    }

    fn fail(&self, error: &Error) {
        let state = self.state.lock();
        for group in state.groups.values() {
            group.core.fail(error);
        }
        drop(state);
        self.downstream.lock().on_error(error);
    }
}

struct GroupAdapter<G: Key, K: Key, V: Value> {
    work: Arc<GroupWork<G, K, V>>,
    selector: Arc<dyn Fn(&K, &V) -> G + Send + Sync>,
}

impl<G: Key, K: Key, V: Value> Observer<ChangeSet<K, V>> for GroupAdapter<G, K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        self.work.apply_batch(changes, &*self.selector);
    }

    fn on_completed(&mut self) {
        self.work.complete();
    }

    fn on_error(&mut self, error: &Error) {
        self.work.fail(error);
    }
}

struct RegroupAdapter<G: Key, K: Key, V: Value> {
    work: Arc<GroupWork<G, K, V>>,
    selector: Arc<dyn Fn(&K, &V) -> G + Send + Sync>,
}

impl<G: Key, K: Key, V: Value> Observer<()> for RegroupAdapter<G, K, V> {
    fn on_next(&mut self, _trigger: &()) {
        self.work.regroup(&*self.selector);
    }
}

impl<S, K, V, G> Observable<ChangeSet<G, Group<G, K, V>>> for GroupBy<S, K, V, G>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
    G: Key,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<G, Group<G, K, V>>>) -> Subscription {
        let work = Arc::new(GroupWork {
            state: Mutex::new(GroupState {
                groups: FxIndexMap::default(),
                membership: FxHashMap::default(),
                values: FxHashMap::default(),
            }),
            downstream: Arc::new(Mutex::new(observer)),
        });

        let mut subscription = self.upstream.subscribe_with(Box::new(GroupAdapter {
            work: work.clone(),
            selector: self.selector.clone(),
        }));
        if let Some(regroup) = &self.regroup {
            let sub = regroup.subscribe_with(Box::new(RegroupAdapter {
                work,
                selector: self.selector.clone(),
            }));
            subscription = subscription.and(sub);
        }
        subscription
    }
}

/// Grouping driven by a per-item group stream. Built by
/// [`ChangeStreamExt::group_on_observable`](super::ChangeStreamExt::group_on_observable).
///
/// Each item supplies its own observable of group keys; the item moves
/// between groups as the latest key changes and its inner subscription
/// is released when the item is removed.
pub struct GroupOnObservable<S, K, V, G> {
    upstream: S,
    factory: Arc<dyn Fn(&K, &V) -> BoxObservable<G> + Send + Sync>,
    _marker: PhantomData<fn() -> (K, V, G)>,
}

impl<S, K, V, G> GroupOnObservable<S, K, V, G> {
    pub(crate) fn new(
        upstream: S,
        factory: Arc<dyn Fn(&K, &V) -> BoxObservable<G> + Send + Sync>,
    ) -> Self {
        GroupOnObservable {
            upstream,
            factory,
            _marker: PhantomData,
        }
    }
}

struct ObservableGroupShared<G: Key, K: Key, V: Value> {
    work: Arc<GroupWork<G, K, V>>,
    subs: Mutex<KeyedSubscriptions<K>>,
}

impl<G: Key, K: Key, V: Value> ObservableGroupShared<G, K, V> {
    /// Places `key` into `target`, announcing and retiring groups as
    /// needed.
    fn assign(&self, key: &K, target: G) {
        let work = &self.work;
        let mut state = work.state.lock();
        let value = match state.values.get(key) {
            Some(value) => value.clone(),
            // Removed while the group notice was in flight.
            None => return,
        };
        let mut child_batches: FxIndexMap<G, ChangeSet<K, V>> = FxIndexMap::default();
        let mut created = Vec::new();
        GroupWork::route(
            &mut state,
            &mut child_batches,
            &mut created,
            key,
            &value,
            target,
            ChangeReason::Update,
        );
        work.flush(&mut state, child_batches, created);
    }

    fn forward(&self, key: &K, value: &V, reason: ChangeReason) {
        let work = &self.work;
        let mut state = work.state.lock();
        state.values.insert(key.clone(), value.clone());
        if let Some(group) = state.membership.get(key).cloned() {
            let mut child_batches: FxIndexMap<G, ChangeSet<K, V>> = FxIndexMap::default();
            let change = match reason {
                ChangeReason::Refresh => Change::refresh(key.clone(), value.clone()),
                _ => Change::update(key.clone(), value.clone(), value.clone()),
            };
            child_batches.entry(group).or_default().push(change);
            work.flush(&mut state, child_batches, Vec::new());
        }
    }

    fn discard(&self, key: &K) {
        self.subs.lock().remove(key);
        let work = &self.work;
        let mut state = work.state.lock();
        let value = state.values.remove(key);
        if let Some(group) = state.membership.remove(key) {
            let value = value.expect("membership without a stored value");
            let mut child_batches: FxIndexMap<G, ChangeSet<K, V>> = FxIndexMap::default();
            child_batches
                .entry(group)
                .or_default()
                .push(Change::remove(key.clone(), value));
            work.flush(&mut state, child_batches, Vec::new());
        }
    }
}

struct ObservableGroupAdapter<G: Key, K: Key, V: Value> {
    shared: Arc<ObservableGroupShared<G, K, V>>,
    factory: Arc<dyn Fn(&K, &V) -> BoxObservable<G> + Send + Sync>,
}

impl<G: Key, K: Key, V: Value> Observer<ChangeSet<K, V>> for ObservableGroupAdapter<G, K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        for change in changes.iter() {
            let key = change.key();
            let value = change.current();
            match change.reason() {
                ChangeReason::Add => {
                    self.shared
                        .work
                        .state
                        .lock()
                        .values
                        .insert(key.clone(), value.clone());
                    let groups = (self.factory)(key, value);
                    let shared = self.shared.clone();
                    let watched = key.clone();
                    let sub = groups
                        .subscribe(move |group: &G| shared.assign(&watched, group.clone()));
                    self.shared.subs.lock().insert(key.clone(), sub);
                }
                ChangeReason::Update | ChangeReason::Refresh => {
                    self.shared.forward(key, value, change.reason());
                }
                ChangeReason::Remove => self.shared.discard(key),
                ChangeReason::Moved => {}
            }
        }
    }

    fn on_completed(&mut self) {
        self.shared.subs.lock().clear();
        self.shared.work.complete();
    }

    fn on_error(&mut self, error: &Error) {
        self.shared.subs.lock().clear();
        self.shared.work.fail(error);
    }
}

impl<S, K, V, G> Observable<ChangeSet<G, Group<G, K, V>>> for GroupOnObservable<S, K, V, G>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
    G: Key,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<G, Group<G, K, V>>>) -> Subscription {
        let shared = Arc::new(ObservableGroupShared {
            work: Arc::new(GroupWork {
                state: Mutex::new(GroupState {
                    groups: FxIndexMap::default(),
                    membership: FxHashMap::default(),
                    values: FxHashMap::default(),
                }),
                downstream: Arc::new(Mutex::new(observer)),
            }),
            subs: Mutex::new(KeyedSubscriptions::new()),
        });

        let upstream = self.upstream.subscribe_with(Box::new(ObservableGroupAdapter {
            shared: shared.clone(),
            factory: self.factory.clone(),
        }));

        upstream.and(Subscription::new(move || {
            shared.subs.lock().clear();
        }))
    }
}
