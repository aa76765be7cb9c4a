//! Stateful filtering with a dynamic predicate and an explicit
//! re-evaluate trigger.

use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::stream::{
    BoxObservable, BoxObserver, Observable, Observer, SharedObserver, Subscription,
};
use crate::{FxIndexMap, Key, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::marker::PhantomData;
use std::sync::Arc;

/// A runtime-supplied filter predicate.
pub type Predicate<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

/// Wraps a closure into a [`Predicate`].
pub fn predicate<V, F>(f: F) -> Predicate<V>
where
    F: Fn(&V) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The stateful filter operator. Built by
/// [`ChangeStreamExt::filter`](super::ChangeStreamExt::filter) and
/// friends.
pub struct Filter<S, K, V> {
    upstream: S,
    initial: Predicate<V>,
    predicates: Option<BoxObservable<Predicate<V>>>,
    reevaluate: Option<BoxObservable<()>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> Filter<S, K, V> {
    pub(crate) fn new(
        upstream: S,
        initial: Predicate<V>,
        predicates: Option<BoxObservable<Predicate<V>>>,
        reevaluate: Option<BoxObservable<()>>,
    ) -> Self {
        Filter {
            upstream,
            initial,
            predicates,
            reevaluate,
            _marker: PhantomData,
        }
    }
}

struct FilterState<K, V> {
    predicate: Predicate<V>,
    /// Last-known upstream state; maintained only when a predicate
    /// stream or re-evaluate trigger can force a rescan.
    universe: Option<FxIndexMap<K, V>>,
    /// Keys currently passing the filter.
    mirror: FxHashSet<K>,
}

impl<K: Key, V: Value> FilterState<K, V> {
    fn apply(&mut self, change: &Change<K, V>, out: &mut ChangeSet<K, V>) {
        let key = change.key();
        let value = change.current();
        match change.reason() {
            ChangeReason::Add => {
                if let Some(universe) = &mut self.universe {
                    universe.insert(key.clone(), value.clone());
                }
                if (self.predicate)(value) {
                    if self.mirror.insert(key.clone()) {
                        out.push(Change::add(key.clone(), value.clone()));
                    }
                } else if self.mirror.remove(key) {
                    out.push(Change::remove(key.clone(), value.clone()));
                }
            }
            ChangeReason::Update => {
                if let Some(universe) = &mut self.universe {
                    universe.insert(key.clone(), value.clone());
                }
                let was = self.mirror.contains(key);
                let now = (self.predicate)(value);
                match (was, now) {
                    (true, true) => {
                        let previous = change
                            .previous()
                            .expect("Update change must carry a previous value")
                            .clone();
                        out.push(Change::update(key.clone(), value.clone(), previous));
                    }
                    (true, false) => {
                        self.mirror.remove(key);
                        out.push(Change::remove(key.clone(), value.clone()));
                    }
                    (false, true) => {
                        self.mirror.insert(key.clone());
                        out.push(Change::add(key.clone(), value.clone()));
                    }
                    (false, false) => {}
                }
            }
            ChangeReason::Remove => {
                if let Some(universe) = &mut self.universe {
                    universe.shift_remove(key);
                }
                if self.mirror.remove(key) {
                    out.push(Change::remove(key.clone(), value.clone()));
                }
            }
            ChangeReason::Refresh => {
                if let Some(universe) = &mut self.universe {
                    universe.insert(key.clone(), value.clone());
                }
                let was = self.mirror.contains(key);
                let now = (self.predicate)(value);
                match (was, now) {
                    (true, true) => out.push(Change::refresh(key.clone(), value.clone())),
                    (true, false) => {
                        self.mirror.remove(key);
                        out.push(Change::remove(key.clone(), value.clone()));
                    }
                    (false, true) => {
                        self.mirror.insert(key.clone());
                        out.push(Change::add(key.clone(), value.clone()));
                    }
                    (false, false) => {}
                }
            }
            ChangeReason::Moved => {
                // Positional information is forwarded only for keys we
                // mirror; everything else is invisible downstream.
                if self.mirror.contains(key) {
                    out.push(change.clone());
                }
            }
        }
    }

    /// Re-tests every last-known item and emits the net transitions.
    fn rescan(&mut self, out: &mut ChangeSet<K, V>) {
        let universe = self
            .universe
            .as_ref()
            .expect("rescan requires universe tracking");
        for (key, value) in universe {
            let was = self.mirror.contains(key);
            let now = (self.predicate)(value);
            match (was, now) {
                (true, false) => {
                    self.mirror.remove(key);
                    out.push(Change::remove(key.clone(), value.clone()));
                }
                (false, true) => {
                    self.mirror.insert(key.clone());
                    out.push(Change::add(key.clone(), value.clone()));
                }
                _ => {}
            }
        }
    }
}

struct FilterAdapter<K: Key, V: Value> {
    state: Arc<Mutex<FilterState<K, V>>>,
    downstream: SharedObserver<ChangeSet<K, V>>,
}

impl<K: Key, V: Value> Observer<ChangeSet<K, V>> for FilterAdapter<K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        let mut out = ChangeSet::new();
        {
            let mut state = self.state.lock();
            for change in changes.iter() {
                state.apply(change, &mut out);
            }
        }
        if !out.is_empty() {
            self.downstream.lock().on_next(&out);
        }
    }

    fn on_completed(&mut self) {
        self.downstream.lock().on_completed();
    }

    fn on_error(&mut self, error: &Error) {
        self.downstream.lock().on_error(error);
    }
}

struct RescanAdapter<K: Key, V: Value, T> {
    state: Arc<Mutex<FilterState<K, V>>>,
    downstream: SharedObserver<ChangeSet<K, V>>,
    _marker: PhantomData<fn(&T)>,
}

impl<K: Key, V: Value> RescanAdapter<K, V, Predicate<V>> {
    fn rescan_with(&mut self, predicate: Option<Predicate<V>>) {
        let mut out = ChangeSet::new();
        {
            let mut state = self.state.lock();
            if let Some(predicate) = predicate {
                state.predicate = predicate;
            }
            state.rescan(&mut out);
        }
        if !out.is_empty() {
            self.downstream.lock().on_next(&out);
        }
    }
}

impl<K: Key, V: Value> Observer<Predicate<V>> for RescanAdapter<K, V, Predicate<V>> {
    fn on_next(&mut self, predicate: &Predicate<V>) {
        log::debug!("filter predicate changed; rescanning");
        self.rescan_with(Some(predicate.clone()));
    }
}

impl<K: Key, V: Value> Observer<()> for RescanAdapter<K, V, Predicate<V>> {
    fn on_next(&mut self, _trigger: &()) {
        log::debug!("filter re-evaluate triggered; rescanning");
        self.rescan_with(None);
    }
}

impl<S, K, V> Observable<ChangeSet<K, V>> for Filter<S, K, V>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, V>>) -> Subscription {
        let track_universe = self.predicates.is_some() || self.reevaluate.is_some();
        let state = Arc::new(Mutex::new(FilterState {
            predicate: self.initial.clone(),
            universe: if track_universe {
                Some(FxIndexMap::default())
            } else {
                None
            },
            mirror: FxHashSet::default(),
        }));
        let downstream: SharedObserver<ChangeSet<K, V>> = Arc::new(Mutex::new(observer));

        let mut subscription = self.upstream.subscribe_with(Box::new(FilterAdapter {
            state: state.clone(),
            downstream: downstream.clone(),
        }));
        if let Some(predicates) = &self.predicates {
            let adapter: RescanAdapter<K, V, Predicate<V>> = RescanAdapter {
                state: state.clone(),
                downstream: downstream.clone(),
                _marker: PhantomData,
            };
            let sub: Subscription =
                predicates.subscribe_with(Box::new(adapter) as BoxObserver<Predicate<V>>);
            subscription = subscription.and(sub);
        }
        if let Some(reevaluate) = &self.reevaluate {
            let adapter: RescanAdapter<K, V, Predicate<V>> = RescanAdapter {
                state,
                downstream,
                _marker: PhantomData,
            };
            let sub: Subscription = reevaluate.subscribe_with(Box::new(adapter) as BoxObserver<()>);
            subscription = subscription.and(sub);
        }
        subscription
    }
}

/// The stateless filter fast path.
///
/// Valid only when items are immutable and the predicate is pure: no
/// mirror is kept, the predicate is evaluated per change, and `Refresh`
/// is dropped entirely. Behavior is undefined if the precondition is
/// violated.
pub struct FilterImmutable<S, K, V> {
    upstream: S,
    predicate: Predicate<V>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> FilterImmutable<S, K, V> {
    pub(crate) fn new(upstream: S, predicate: Predicate<V>) -> Self {
        FilterImmutable {
            upstream,
            predicate,
            _marker: PhantomData,
        }
    }
}

struct FilterImmutableAdapter<K: Key, V: Value> {
    predicate: Predicate<V>,
    downstream: BoxObserver<ChangeSet<K, V>>,
}

impl<K: Key, V: Value> Observer<ChangeSet<K, V>> for FilterImmutableAdapter<K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        let mut out = ChangeSet::new();
        for change in changes.iter() {
            let value = change.current();
            match change.reason() {
                ChangeReason::Add => {
                    if (self.predicate)(value) {
                        out.push(change.clone());
                    }
                }
                ChangeReason::Update => {
                    let previous = change
                        .previous()
                        .expect("Update change must carry a previous value");
                    let was = (self.predicate)(previous);
                    let now = (self.predicate)(value);
                    match (was, now) {
                        (true, true) => out.push(change.clone()),
                        (true, false) => out.push(Change::remove(
                            change.key().clone(),
                            value.clone(),
                        )),
                        (false, true) => {
                            out.push(Change::add(change.key().clone(), value.clone()))
                        }
                        (false, false) => {}
                    }
                }
                ChangeReason::Remove => {
                    if (self.predicate)(value) {
                        out.push(change.clone());
                    }
                }
                ChangeReason::Refresh => {}
                ChangeReason::Moved => {
                    if (self.predicate)(value) {
                        out.push(change.clone());
                    }
                }
            }
        }
        if !out.is_empty() {
            self.downstream.on_next(&out);
        }
    }

    fn on_completed(&mut self) {
        self.downstream.on_completed();
    }

    fn on_error(&mut self, error: &Error) {
        self.downstream.on_error(error);
    }
}

impl<S, K, V> Observable<ChangeSet<K, V>> for FilterImmutable<S, K, V>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, V>>) -> Subscription {
        self.upstream.subscribe_with(Box::new(FilterImmutableAdapter {
            predicate: self.predicate.clone(),
            downstream: observer,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ChangeStreamExt;
    use crate::stream::{ObservableExt, Subject};

    fn collect<K: Key, V: Value>(
    ) -> (Arc<Mutex<Vec<ChangeSet<K, V>>>>, impl FnMut(&ChangeSet<K, V>) + Send + 'static) {
        let seen: Arc<Mutex<Vec<ChangeSet<K, V>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |changes: &ChangeSet<K, V>| {
            sink.lock().push(changes.clone())
        })
    }

    #[test]
    fn update_transitions_follow_the_state_machine() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let (seen, sink) = collect();
        let _sub = upstream.clone().filter(|v: &i32| *v >= 10).subscribe(sink);

        // In via add, out via update, back in via update.
        upstream.publish(&ChangeSet::single(Change::add(1, 10)));
        upstream.publish(&ChangeSet::single(Change::update(1, 5, 10)));
        upstream.publish(&ChangeSet::single(Change::update(1, 25, 5)));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0][0].reason(), ChangeReason::Add);
        assert_eq!(seen[1][0].reason(), ChangeReason::Remove);
        assert_eq!(seen[1][0].current(), &5);
        assert_eq!(seen[2][0].reason(), ChangeReason::Add);
    }

    #[test]
    fn refresh_of_a_matching_item_stays_refresh() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let (seen, sink) = collect();
        let _sub = upstream.clone().filter(|v: &i32| *v >= 10).subscribe(sink);

        upstream.publish(&ChangeSet::single(Change::add(1, 10)));
        upstream.publish(&ChangeSet::single(Change::refresh(1, 12)));
        upstream.publish(&ChangeSet::single(Change::refresh(1, 2)));

        let seen = seen.lock();
        assert_eq!(seen[1][0].reason(), ChangeReason::Refresh);
        assert_eq!(seen[2][0].reason(), ChangeReason::Remove);
    }

    #[test]
    fn nonmatching_changes_are_suppressed_entirely() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let (seen, sink) = collect();
        let _sub = upstream.clone().filter(|v: &i32| *v >= 10).subscribe(sink);

        upstream.publish(&ChangeSet::single(Change::add(1, 1)));
        upstream.publish(&ChangeSet::single(Change::update(1, 2, 1)));
        upstream.publish(&ChangeSet::single(Change::remove(1, 2)));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn moved_passes_only_when_mirrored() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let (seen, sink) = collect();
        let _sub = upstream.clone().filter(|v: &i32| *v >= 10).subscribe(sink);

        upstream.publish(&ChangeSet::single(Change::add(1, 10)));
        upstream.publish(&ChangeSet::single(Change::moved(1, 10, 2, 0)));
        upstream.publish(&ChangeSet::single(Change::moved(2, 3, 1, 0)));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1][0].reason(), ChangeReason::Moved);
        assert_eq!(seen[1][0].key(), &1);
    }

    #[test]
    fn immutable_variant_drops_refresh() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let (seen, sink) = collect();
        let _sub = upstream
            .clone()
            .filter_immutable(|v: &i32| *v >= 10)
            .subscribe(sink);

        upstream.publish(&ChangeSet::single(Change::add(1, 10)));
        upstream.publish(&ChangeSet::single(Change::refresh(1, 10)));
        assert_eq!(seen.lock().len(), 1);
    }
}
