//! Per-item side effects: resource subscription and add/remove hooks.

use crate::change::{ChangeReason, ChangeSet};
use crate::error::Error;
use crate::stream::{
    BoxObserver, KeyedSubscriptions, Observable, Observer, SharedObserver, Subscription,
};
use crate::{FxIndexMap, Key, Value};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;

type ResourceFactory<K, V> =
    Arc<dyn Fn(&K, &V) -> Result<Subscription, Error> + Send + Sync>;

/// Acquires one resource per item, releasing it when the item leaves
/// (or on teardown). The change stream passes through untouched.
///
/// A factory failure is surfaced to the stream observer; the item stays
/// in the upstream cache (stream failure does not roll back cache
/// state). Built by
/// [`ChangeStreamExt::subscribe_many`](super::ChangeStreamExt::subscribe_many).
pub struct SubscribeMany<S, K, V> {
    upstream: S,
    factory: ResourceFactory<K, V>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> SubscribeMany<S, K, V> {
    pub(crate) fn new(upstream: S, factory: ResourceFactory<K, V>) -> Self {
        SubscribeMany {
            upstream,
            factory,
            _marker: PhantomData,
        }
    }
}

struct SubscribeManyAdapter<K: Key, V: Value> {
    factory: ResourceFactory<K, V>,
    subs: Arc<Mutex<KeyedSubscriptions<K>>>,
    downstream: SharedObserver<ChangeSet<K, V>>,
    faulted: bool,
}

impl<K: Key, V: Value> Observer<ChangeSet<K, V>> for SubscribeManyAdapter<K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        if self.faulted {
            return;
        }
        for change in changes.iter() {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    // Re-acquire on update: the resource belongs to the
                    // item value, not just the key.
                    self.subs.lock().remove(change.key());
                    match (self.factory)(change.key(), change.current()) {
                        Ok(resource) => {
                            self.subs.lock().insert(change.key().clone(), resource)
                        }
                        Err(error) => {
                            self.faulted = true;
                            self.subs.lock().clear();
                            self.downstream.lock().on_error(&error);
                            return;
                        }
                    }
                }
                ChangeReason::Remove => self.subs.lock().remove(change.key()),
                ChangeReason::Refresh | ChangeReason::Moved => {}
            }
        }
        self.downstream.lock().on_next(changes);
    }

    fn on_completed(&mut self) {
        self.subs.lock().clear();
        self.downstream.lock().on_completed();
    }

    fn on_error(&mut self, error: &Error) {
        self.subs.lock().clear();
        self.downstream.lock().on_error(error);
    }
}

impl<S, K, V> Observable<ChangeSet<K, V>> for SubscribeMany<S, K, V>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, V>>) -> Subscription {
        let subs = Arc::new(Mutex::new(KeyedSubscriptions::new()));
        let upstream = self.upstream.subscribe_with(Box::new(SubscribeManyAdapter {
            factory: self.factory.clone(),
            subs: subs.clone(),
            downstream: Arc::new(Mutex::new(observer)),
            faulted: false,
        }));
        upstream.and(Subscription::new(move || subs.lock().clear()))
    }
}

type ItemAction<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

/// Invokes an action for every added item; the stream passes through.
/// Built by
/// [`ChangeStreamExt::on_item_added`](super::ChangeStreamExt::on_item_added).
pub struct OnItemAdded<S, K, V> {
    upstream: S,
    action: ItemAction<K, V>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> OnItemAdded<S, K, V> {
    pub(crate) fn new(upstream: S, action: ItemAction<K, V>) -> Self {
        OnItemAdded {
            upstream,
            action,
            _marker: PhantomData,
        }
    }
}

struct OnAddedAdapter<K: Key, V: Value> {
    action: ItemAction<K, V>,
    downstream: BoxObserver<ChangeSet<K, V>>,
}

impl<K: Key, V: Value> Observer<ChangeSet<K, V>> for OnAddedAdapter<K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        for change in changes.iter() {
            if change.reason() == ChangeReason::Add {
                (self.action)(change.key(), change.current());
            }
        }
        self.downstream.on_next(changes);
    }

    fn on_completed(&mut self) {
        self.downstream.on_completed();
    }

    fn on_error(&mut self, error: &Error) {
        self.downstream.on_error(error);
    }
}

impl<S, K, V> Observable<ChangeSet<K, V>> for OnItemAdded<S, K, V>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, V>>) -> Subscription {
        self.upstream.subscribe_with(Box::new(OnAddedAdapter {
            action: self.action.clone(),
            downstream: observer,
        }))
    }
}

/// Invokes an action for every removed item; optionally also for every
/// still-held item at teardown. The stream passes through. Built by
/// [`ChangeStreamExt::on_item_removed`](super::ChangeStreamExt::on_item_removed).
pub struct OnItemRemoved<S, K, V> {
    upstream: S,
    action: ItemAction<K, V>,
    invoke_on_unsubscribe: bool,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> OnItemRemoved<S, K, V> {
    pub(crate) fn new(upstream: S, action: ItemAction<K, V>, invoke_on_unsubscribe: bool) -> Self {
        OnItemRemoved {
            upstream,
            action,
            invoke_on_unsubscribe,
            _marker: PhantomData,
        }
    }
}

struct OnRemovedAdapter<K: Key, V: Value> {
    action: ItemAction<K, V>,
    held: Arc<Mutex<FxIndexMap<K, V>>>,
    downstream: BoxObserver<ChangeSet<K, V>>,
}

impl<K: Key, V: Value> Observer<ChangeSet<K, V>> for OnRemovedAdapter<K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        for change in changes.iter() {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                    self.held
                        .lock()
                        .insert(key.clone(), change.current().clone());
                }
                ChangeReason::Remove => {
                    self.held.lock().shift_remove(key);
                    (self.action)(key, change.current());
                }
                ChangeReason::Moved => {}
            }
        }
        self.downstream.on_next(changes);
    }

    fn on_completed(&mut self) {
        self.downstream.on_completed();
    }

    fn on_error(&mut self, error: &Error) {
        self.downstream.on_error(error);
    }
}

impl<S, K, V> Observable<ChangeSet<K, V>> for OnItemRemoved<S, K, V>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, V>>) -> Subscription {
        let held: Arc<Mutex<FxIndexMap<K, V>>> = Arc::new(Mutex::new(FxIndexMap::default()));
        let upstream = self.upstream.subscribe_with(Box::new(OnRemovedAdapter {
            action: self.action.clone(),
            held: held.clone(),
            downstream: observer,
        }));
        if !self.invoke_on_unsubscribe {
            return upstream;
        }
        let action = self.action.clone();
        upstream.and(Subscription::new(move || {
            let held = std::mem::take(&mut *held.lock());
            for (key, value) in held {
                action(&key, &value);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Change;
    use crate::ops::ChangeStreamExt;
    use crate::stream::{ObservableExt, Subject};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn resources_follow_item_lifetimes() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let released = Arc::new(AtomicUsize::new(0));

        let counter = released.clone();
        let sub = upstream
            .clone()
            .subscribe_many(move |_k: &u32, _v: &i32| {
                let counter = counter.clone();
                Ok(Subscription::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .subscribe(|_: &ChangeSet<u32, i32>| {});

        upstream.publish(&ChangeSet::single(Change::add(1, 1)));
        upstream.publish(&ChangeSet::single(Change::add(2, 2)));
        upstream.publish(&ChangeSet::single(Change::remove(1, 1)));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        // Teardown releases the rest.
        drop(sub);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn factory_failure_faults_the_stream() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let faults = Arc::new(AtomicUsize::new(0));

        let counter = faults.clone();
        let _sub = upstream
            .clone()
            .subscribe_many(|_k: &u32, v: &i32| {
                if *v < 0 {
                    Err(Error::new("resource refused"))
                } else {
                    Ok(Subscription::empty())
                }
            })
            .subscribe_all(
                |_: &ChangeSet<u32, i32>| {},
                || {},
                move |_e: &Error| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            );

        upstream.publish(&ChangeSet::single(Change::add(1, -1)));
        assert_eq!(faults.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_hook_runs_at_teardown_when_requested() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let removed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        let log = removed.clone();
        let sub = upstream
            .clone()
            .on_item_removed(move |k: &u32, _v: &i32| log.lock().push(*k), true)
            .subscribe(|_: &ChangeSet<u32, i32>| {});

        upstream.publish(&ChangeSet::single(Change::add(1, 1)));
        upstream.publish(&ChangeSet::single(Change::add(2, 2)));
        upstream.publish(&ChangeSet::single(Change::remove(1, 1)));
        assert_eq!(*removed.lock(), vec![1]);

        drop(sub);
        assert_eq!(*removed.lock(), vec![1, 2]);
    }
}
