//! Merging several change-set streams into one, resolving key
//! collisions between sources.

use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::sorted::Comparer;
use crate::stream::{
    BoxObservable, BoxObserver, KeyedSubscriptions, Observable, ObservableExt, Observer,
    SharedObserver, Subscription,
};
use crate::{FxIndexMap, Key, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

/// Value-equality used to suppress no-op updates.
pub type EqualityComparer<V> = Arc<dyn Fn(&V, &V) -> bool + Send + Sync>;

/// Collision policy for merges.
///
/// With a comparer, the source whose current value compares greatest
/// wins the key; without one, the most recent writer wins. An equality
/// comparer additionally suppresses updates whose winning value is
/// unchanged.
pub struct MergeOptions<V> {
    equality: Option<EqualityComparer<V>>,
    comparer: Option<Comparer<V>>,
}

impl<V> Default for MergeOptions<V> {
    fn default() -> Self {
        MergeOptions {
            equality: None,
            comparer: None,
        }
    }
}

impl<V> Clone for MergeOptions<V> {
    fn clone(&self) -> Self {
        MergeOptions {
            equality: self.equality.clone(),
            comparer: self.comparer.clone(),
        }
    }
}

impl<V> MergeOptions<V> {
    /// Suppresses updates whose old and new winning values are equal.
    pub fn with_equality<F>(mut self, equality: F) -> Self
    where
        F: Fn(&V, &V) -> bool + Send + Sync + 'static,
    {
        self.equality = Some(Arc::new(equality));
        self
    }

    /// Resolves collisions toward the greatest-comparing value.
    pub fn with_comparer(mut self, comparer: Comparer<V>) -> Self {
        self.comparer = Some(comparer);
        self
    }
}

struct Slot<V> {
    value: V,
    stamp: u64,
}

/// What downstream last saw for a key.
struct Published<V, Id> {
    value: V,
    source: Id,
    stamp: u64,
}

struct Resolver<K, V, Id> {
    published: FxHashMap<K, Published<V, Id>>,
    options: MergeOptions<V>,
    _marker: PhantomData<Id>,
}

impl<K: Key, V: Value, Id: Clone + PartialEq> Resolver<K, V, Id> {
    fn new(options: MergeOptions<V>) -> Self {
        Resolver {
            published: FxHashMap::default(),
            options,
            _marker: PhantomData,
        }
    }

    /// Re-derives the winner for `key` from `candidates` and pushes
    /// the net transition, if any, onto `out`.
    ///
    /// `refresh_from` marks the source whose `Refresh` prompted this
    /// resolution; a retained winner from that source surfaces as
    /// `Refresh` downstream.
    fn resolve<'a>(
        &mut self,
        key: &K,
        candidates: impl Iterator<Item = (Id, &'a Slot<V>)>,
        refresh_from: Option<&Id>,
        out: &mut ChangeSet<K, V>,
    ) where
        V: 'a,
    {
        let winner = self.pick(candidates);
        let previous = self.published.remove(key);
        match (previous, winner) {
            (None, None) => {}
            (None, Some((source, slot))) => {
                self.published.insert(
                    key.clone(),
                    Published {
                        value: slot.value.clone(),
                        source,
                        stamp: slot.stamp,
                    },
                );
                out.push(Change::add(key.clone(), slot.value.clone()));
            }
            (Some(old), None) => {
                out.push(Change::remove(key.clone(), old.value));
            }
            (Some(old), Some((source, slot))) => {
                let retained = old.source == source && old.stamp == slot.stamp;
                let value = slot.value.clone();
                self.published.insert(
                    key.clone(),
                    Published {
                        value: value.clone(),
                        source: source.clone(),
                        stamp: slot.stamp,
                    },
                );
                if retained {
                    return;
                }
                if refresh_from == Some(&source) && old.source == source {
                    out.push(Change::refresh(key.clone(), value));
                    return;
                }
                if let Some(equality) = &self.options.equality {
                    if equality(&old.value, &value) {
                        log::debug!("merge: suppressing no-op update");
                        return;
                    }
                }
                out.push(Change::update(key.clone(), value, old.value));
            }
        }
    }

    fn pick<'a>(
        &self,
        candidates: impl Iterator<Item = (Id, &'a Slot<V>)>,
    ) -> Option<(Id, &'a Slot<V>)>
    where
        V: 'a,
    {
        let mut best: Option<(Id, &Slot<V>)> = None;
        for (id, slot) in candidates {
            let better = match &best {
                None => true,
                Some((_, current)) => match &self.options.comparer {
                    Some(comparer) => {
                        comparer(&slot.value, &current.value) == Ordering::Greater
                    }
                    None => slot.stamp > current.stamp,
                },
            };
            if better {
                best = Some((id, slot));
            }
        }
        best
    }
}

struct MergeState<K: Key, V: Value> {
    shadows: Vec<FxIndexMap<K, Slot<V>>>,
    resolver: Resolver<K, V, usize>,
    next_stamp: u64,
    live_sources: usize,
    faulted: bool,
}

struct MergeWork<K: Key, V: Value> {
    state: Mutex<MergeState<K, V>>,
    downstream: SharedObserver<ChangeSet<K, V>>,
}

impl<K: Key, V: Value> MergeWork<K, V> {
    fn apply(&self, index: usize, changes: &ChangeSet<K, V>) {
        let mut out = ChangeSet::new();
        {
            let mut state = self.state.lock();
            if state.faulted {
                return;
            }
            for change in changes.iter() {
                let key = change.key();
                let mut refresh_from = None;
                match change.reason() {
                    ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                        let stamp = state.next_stamp;
                        state.next_stamp += 1;
                        state.shadows[index].insert(
                            key.clone(),
                            Slot {
                                value: change.current().clone(),
                                stamp,
                            },
                        );
                        if change.reason() == ChangeReason::Refresh {
                            refresh_from = Some(index);
                        }
                    }
                    ChangeReason::Remove => {
                        state.shadows[index].shift_remove(key);
                    }
                    ChangeReason::Moved => continue,
                }
                let MergeState {
                    shadows, resolver, ..
                } = &mut *state;
                resolver.resolve(
                    key,
                    shadows
                        .iter()
                        .enumerate()
                        .filter_map(|(i, shadow)| shadow.get(key).map(|slot| (i, slot))),
                    refresh_from.as_ref(),
                    &mut out,
                );
            }
        }
        if !out.is_empty() {
            self.downstream.lock().on_next(&out);
        }
    }

    fn source_finished(&self) {
        let done = {
            let mut state = self.state.lock();
            state.live_sources -= 1;
            state.live_sources == 0
        };
        if done {
            self.downstream.lock().on_completed();
        }
    }

    fn fail(&self, error: &Error) {
        let first = {
            let mut state = self.state.lock();
            let first = !state.faulted;
            state.faulted = true;
            first
        };
        if first {
            self.downstream.lock().on_error(error);
        }
    }
}

struct MergeAdapter<K: Key, V: Value> {
    work: Arc<MergeWork<K, V>>,
    index: usize,
}

impl<K: Key, V: Value> Observer<ChangeSet<K, V>> for MergeAdapter<K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        self.work.apply(self.index, changes);
    }

    fn on_completed(&mut self) {
        self.work.source_finished();
    }

    fn on_error(&mut self, error: &Error) {
        self.work.fail(error);
    }
}

/// A merge over a fixed set of sources. Built by
/// [`merge_change_sets`].
pub struct Merge<K: Key, V: Value> {
    sources: Vec<BoxObservable<ChangeSet<K, V>>>,
    options: MergeOptions<V>,
}

/// Merges `sources` into one stream under `options`' collision policy.
pub fn merge_change_sets<K: Key, V: Value>(
    sources: Vec<BoxObservable<ChangeSet<K, V>>>,
    options: MergeOptions<V>,
) -> Merge<K, V> {
    Merge { sources, options }
}

impl<K: Key, V: Value> Observable<ChangeSet<K, V>> for Merge<K, V> {
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, V>>) -> Subscription {
        let work = Arc::new(MergeWork {
            state: Mutex::new(MergeState {
                shadows: (0..self.sources.len())
                    .map(|_| FxIndexMap::default())
                    .collect(),
                resolver: Resolver::new(self.options.clone()),
                next_stamp: 0,
                live_sources: self.sources.len(),
                faulted: false,
            }),
            downstream: Arc::new(Mutex::new(observer)),
        });

        let mut subscription = Subscription::empty();
        for (index, source) in self.sources.iter().enumerate() {
            let sub = source.subscribe_with(Box::new(MergeAdapter {
                work: work.clone(),
                index,
            }));
            subscription = subscription.and(sub);
        }
        subscription
    }
}

/// Parent-ranking policy for [`MergeMany`].
pub struct ParentRank<PV> {
    comparer: Comparer<PV>,
    resort_on_source_refresh: bool,
}

impl<PV> Clone for ParentRank<PV> {
    fn clone(&self) -> Self {
        ParentRank {
            comparer: self.comparer.clone(),
            resort_on_source_refresh: self.resort_on_source_refresh,
        }
    }
}

impl<PV> ParentRank<PV> {
    /// Ranks sources by their parent values; ties fall back to the
    /// child value comparer (or recency).
    pub fn new(comparer: Comparer<PV>, resort_on_source_refresh: bool) -> Self {
        ParentRank {
            comparer,
            resort_on_source_refresh,
        }
    }
}

struct ManyState<PK: Key, PV: Value, K: Key, V: Value> {
    parents: FxIndexMap<PK, PV>,
    shadows: FxHashMap<PK, FxIndexMap<K, Slot<V>>>,
    resolver: Resolver<K, V, PK>,
    next_stamp: u64,
    faulted: bool,
}

struct ManyWork<PK: Key, PV: Value, K: Key, V: Value> {
    state: Mutex<ManyState<PK, PV, K, V>>,
    rank: Option<ParentRank<PV>>,
    downstream: SharedObserver<ChangeSet<K, V>>,
}

impl<PK: Key, PV: Value, K: Key, V: Value> ManyWork<PK, PV, K, V> {
    /// Winner selection with optional parent ranking layered over the
    /// child policy.
    fn resolve_key(
        state: &mut ManyState<PK, PV, K, V>,
        rank: &Option<ParentRank<PV>>,
        key: &K,
        refresh_from: Option<&PK>,
        out: &mut ChangeSet<K, V>,
    ) {
        let ManyState {
            parents,
            shadows,
            resolver,
            ..
        } = state;
        match rank {
            Some(rank) => {
                // Restrict candidates to the best-ranked parent that
                // holds the key, then let the child policy break ties.
                let mut best_parent: Option<&PK> = None;
                for (parent_key, shadow) in shadows.iter() {
                    if !shadow.contains_key(key) {
                        continue;
                    }
                    let better = match best_parent {
                        None => true,
                        Some(current) => match (parents.get(parent_key), parents.get(current)) {
                            (Some(a), Some(b)) => {
                                (rank.comparer)(a, b) == Ordering::Greater
                            }
                            (Some(_), None) => true,
                            _ => false,
                        },
                    };
                    if better {
                        best_parent = Some(parent_key);
                    }
                }
                let best_parent = best_parent.cloned();
                resolver.resolve(
                    key,
                    shadows
                        .iter()
                        .filter(|(parent_key, _)| Some(*parent_key) == best_parent.as_ref())
                        .filter_map(|(parent_key, shadow)| {
                            shadow.get(key).map(|slot| (parent_key.clone(), slot))
                        }),
                    refresh_from,
                    out,
                );
            }
            None => {
                resolver.resolve(
                    key,
                    shadows.iter().filter_map(|(parent_key, shadow)| {
                        shadow.get(key).map(|slot| (parent_key.clone(), slot))
                    }),
                    refresh_from,
                    out,
                );
            }
        }
    }

    fn apply_child(&self, parent: &PK, changes: &ChangeSet<K, V>) {
        let mut out = ChangeSet::new();
        {
            let mut state = self.state.lock();
            if state.faulted {
                return;
            }
            for change in changes.iter() {
                let key = change.key();
                let mut refresh_from = None;
                match change.reason() {
                    ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                        let stamp = state.next_stamp;
                        state.next_stamp += 1;
                        state.shadows.entry(parent.clone()).or_default().insert(
                            key.clone(),
                            Slot {
                                value: change.current().clone(),
                                stamp,
                            },
                        );
                        if change.reason() == ChangeReason::Refresh {
                            refresh_from = Some(parent.clone());
                        }
                    }
                    ChangeReason::Remove => {
                        if let Some(shadow) = state.shadows.get_mut(parent) {
                            shadow.shift_remove(key);
                        }
                    }
                    ChangeReason::Moved => continue,
                }
                Self::resolve_key(&mut state, &self.rank, key, refresh_from.as_ref(), &mut out);
            }
        }
        if !out.is_empty() {
            self.downstream.lock().on_next(&out);
        }
    }

    /// Re-resolves every key held by `parent`'s shadow.
    fn reresolve_parent(&self, parent: &PK, drop_shadow: bool) {
        let mut out = ChangeSet::new();
        {
            let mut state = self.state.lock();
            let keys: Vec<K> = match state.shadows.get(parent) {
                Some(shadow) => shadow.keys().cloned().collect(),
                None => Vec::new(),
            };
            if drop_shadow {
                state.shadows.remove(parent);
            }
            for key in &keys {
                Self::resolve_key(&mut state, &self.rank, key, None, &mut out);
            }
        }
        if !out.is_empty() {
            self.downstream.lock().on_next(&out);
        }
    }
}

/// Per-parent child-stream merge. Built by
/// [`ChangeStreamExt::merge_many`](super::ChangeStreamExt::merge_many)
/// and [`merge_many_ranked`](super::ChangeStreamExt::merge_many_ranked).
pub struct MergeMany<S, PK, PV, K, V>
where
    PK: Key,
    PV: Value,
    K: Key,
    V: Value,
{
    parent: S,
    selector: Arc<dyn Fn(&PK, &PV) -> BoxObservable<ChangeSet<K, V>> + Send + Sync>,
    options: MergeOptions<V>,
    rank: Option<ParentRank<PV>>,
}

impl<S, PK, PV, K, V> MergeMany<S, PK, PV, K, V>
where
    PK: Key,
    PV: Value,
    K: Key,
    V: Value,
{
    pub(crate) fn new(
        parent: S,
        selector: Arc<dyn Fn(&PK, &PV) -> BoxObservable<ChangeSet<K, V>> + Send + Sync>,
        options: MergeOptions<V>,
        rank: Option<ParentRank<PV>>,
    ) -> Self {
        MergeMany {
            parent,
            selector,
            options,
            rank,
        }
    }
}

struct ParentAdapter<PK: Key, PV: Value, K: Key, V: Value> {
    work: Arc<ManyWork<PK, PV, K, V>>,
    selector: Arc<dyn Fn(&PK, &PV) -> BoxObservable<ChangeSet<K, V>> + Send + Sync>,
    subs: Arc<Mutex<KeyedSubscriptions<PK>>>,
}

impl<PK: Key, PV: Value, K: Key, V: Value> ParentAdapter<PK, PV, K, V> {
    fn attach(&self, parent_key: &PK, parent_value: &PV) {
        let stream = (self.selector)(parent_key, parent_value);
        let work = self.work.clone();
        let source = parent_key.clone();
        let fail_work = self.work.clone();
        let sub = stream.subscribe_all(
            move |changes: &ChangeSet<K, V>| work.apply_child(&source, changes),
            || {},
            move |error: &Error| {
                let first = {
                    let mut state = fail_work.state.lock();
                    let first = !state.faulted;
                    state.faulted = true;
                    first
                };
                if first {
                    fail_work.downstream.lock().on_error(error);
                }
            },
        );
        self.subs.lock().insert(parent_key.clone(), sub);
    }
}

impl<PK: Key, PV: Value, K: Key, V: Value> Observer<ChangeSet<PK, PV>>
    for ParentAdapter<PK, PV, K, V>
{
    fn on_next(&mut self, changes: &ChangeSet<PK, PV>) {
        for change in changes.iter() {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add => {
                    self.work
                        .state
                        .lock()
                        .parents
                        .insert(key.clone(), change.current().clone());
                    self.attach(key, change.current());
                }
                ChangeReason::Update => {
                    self.work
                        .state
                        .lock()
                        .parents
                        .insert(key.clone(), change.current().clone());
                    // The child stream subscription is retained; only
                    // ranking may shift.
                    if self.work.rank.is_some() {
                        self.work.reresolve_parent(key, false);
                    }
                }
                ChangeReason::Refresh => {
                    self.work
                        .state
                        .lock()
                        .parents
                        .insert(key.clone(), change.current().clone());
                    let resort = self
                        .work
                        .rank
                        .as_ref()
                        .map(|rank| rank.resort_on_source_refresh)
                        .unwrap_or(false);
                    if resort {
                        log::debug!("merge_many: parent refresh re-runs ranking");
                        self.work.reresolve_parent(key, false);
                    }
                }
                ChangeReason::Remove => {
                    self.subs.lock().remove(key);
                    self.work.state.lock().parents.shift_remove(key);
                    self.work.reresolve_parent(key, true);
                }
                ChangeReason::Moved => {}
            }
        }
    }

    fn on_completed(&mut self) {
        self.subs.lock().clear();
        self.work.downstream.lock().on_completed();
    }

    fn on_error(&mut self, error: &Error) {
        self.subs.lock().clear();
        let first = {
            let mut state = self.work.state.lock();
            let first = !state.faulted;
            state.faulted = true;
            first
        };
        if first {
            self.work.downstream.lock().on_error(error);
        }
    }
}

impl<S, PK, PV, K, V> Observable<ChangeSet<K, V>> for MergeMany<S, PK, PV, K, V>
where
    S: Observable<ChangeSet<PK, PV>>,
    PK: Key,
    PV: Value,
    K: Key,
    V: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, V>>) -> Subscription {
        let work = Arc::new(ManyWork {
            state: Mutex::new(ManyState {
                parents: FxIndexMap::default(),
                shadows: FxHashMap::default(),
                resolver: Resolver::new(self.options.clone()),
                next_stamp: 0,
                faulted: false,
            }),
            rank: self.rank.clone(),
            downstream: Arc::new(Mutex::new(observer)),
        });
        let subs = Arc::new(Mutex::new(KeyedSubscriptions::new()));

        let upstream = self.parent.subscribe_with(Box::new(ParentAdapter {
            work,
            selector: self.selector.clone(),
            subs: subs.clone(),
        }));
        upstream.and(Subscription::new(move || subs.lock().clear()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sorted::comparing_by;
    use crate::stream::Subject;

    fn sources(
        count: usize,
    ) -> (Vec<Subject<ChangeSet<u32, i32>>>, Vec<BoxObservable<ChangeSet<u32, i32>>>) {
        let subjects: Vec<Subject<ChangeSet<u32, i32>>> =
            (0..count).map(|_| Subject::new()).collect();
        let boxed = subjects
            .iter()
            .map(|s| Arc::new(s.clone()) as BoxObservable<ChangeSet<u32, i32>>)
            .collect();
        (subjects, boxed)
    }

    #[test]
    fn last_writer_wins_without_comparer() {
        let (subjects, boxed) = sources(2);
        let merged = merge_change_sets(boxed, MergeOptions::default());
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = merged.subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

        subjects[0].publish(&ChangeSet::single(Change::add(1, 10)));
        subjects[1].publish(&ChangeSet::single(Change::add(1, 20)));

        let seen = seen.lock();
        assert_eq!(seen[0][0].reason(), ChangeReason::Add);
        assert_eq!(seen[0][0].current(), &10);
        assert_eq!(seen[1][0].reason(), ChangeReason::Update);
        assert_eq!(seen[1][0].current(), &20);
    }

    #[test]
    fn comparer_keeps_the_greatest_value() {
        let (subjects, boxed) = sources(2);
        let merged = merge_change_sets(
            boxed,
            MergeOptions::default().with_comparer(comparing_by(|v: &i32| *v)),
        );
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = merged.subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

        subjects[0].publish(&ChangeSet::single(Change::add(1, 50)));
        // A lesser value from another source does not usurp the key.
        subjects[1].publish(&ChangeSet::single(Change::add(1, 20)));
        assert_eq!(seen.lock().len(), 1);

        // Removing the greater value hands the key to the remaining
        // source.
        subjects[0].publish(&ChangeSet::single(Change::remove(1, 50)));
        let seen = seen.lock();
        assert_eq!(seen[1][0].reason(), ChangeReason::Update);
        assert_eq!(seen[1][0].current(), &20);
    }

    #[test]
    fn removal_of_winner_falls_back_or_removes() {
        let (subjects, boxed) = sources(2);
        let merged = merge_change_sets(boxed, MergeOptions::default());
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = merged.subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

        subjects[0].publish(&ChangeSet::single(Change::add(1, 10)));
        subjects[1].publish(&ChangeSet::single(Change::add(1, 20)));
        subjects[1].publish(&ChangeSet::single(Change::remove(1, 20)));
        subjects[0].publish(&ChangeSet::single(Change::remove(1, 10)));

        let seen = seen.lock();
        assert_eq!(seen[2][0].reason(), ChangeReason::Update);
        assert_eq!(seen[2][0].current(), &10);
        assert_eq!(seen[3][0].reason(), ChangeReason::Remove);
    }

    #[test]
    fn equality_comparer_suppresses_noop_updates() {
        let (subjects, boxed) = sources(2);
        let merged = merge_change_sets(
            boxed,
            MergeOptions::default().with_equality(|a: &i32, b: &i32| a == b),
        );
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = merged.subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

        subjects[0].publish(&ChangeSet::single(Change::add(1, 10)));
        subjects[1].publish(&ChangeSet::single(Change::add(1, 10)));
        assert_eq!(seen.lock().len(), 1);
    }
}
