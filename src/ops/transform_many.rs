//! Flattening transform: one upstream item projects to many children.

use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::stream::{BoxObserver, Observable, Observer, Subscription};
use crate::{FxIndexMap, Key, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::marker::PhantomData;
use std::sync::Arc;

type ChildFactory<K, V, CK, CU> = Arc<dyn Fn(&K, &V) -> Vec<(CK, CU)> + Send + Sync>;

type ChildKeys<CK> = SmallVec<[CK; 4]>;

/// The flattening transform operator. Built by
/// [`ChangeStreamExt::transform_many`](super::ChangeStreamExt::transform_many).
///
/// Child keys must be globally unique across parents; a child key
/// produced by two different parents is a programmer error and panics.
pub struct TransformMany<S, K, V, CK, CU> {
    upstream: S,
    children: ChildFactory<K, V, CK, CU>,
    _marker: PhantomData<fn() -> (K, V, CK, CU)>,
}

impl<S, K, V, CK, CU> TransformMany<S, K, V, CK, CU> {
    pub(crate) fn new(upstream: S, children: ChildFactory<K, V, CK, CU>) -> Self {
        TransformMany {
            upstream,
            children,
            _marker: PhantomData,
        }
    }
}

struct ManyState<K, CK, CU> {
    parent_children: FxHashMap<K, ChildKeys<CK>>,
    owners: FxHashMap<CK, K>,
    values: FxIndexMap<CK, CU>,
}

struct ManyAdapter<K: Key, V: Value, CK: Key, CU: Value> {
    children: ChildFactory<K, V, CK, CU>,
    state: Arc<Mutex<ManyState<K, CK, CU>>>,
    downstream: BoxObserver<ChangeSet<CK, CU>>,
}

impl<K: Key, V: Value, CK: Key, CU: Value> ManyAdapter<K, V, CK, CU> {
    /// Replaces `parent`'s children with a fresh projection, emitting
    /// the diff. `kept_reason` decides what surviving children emit.
    fn project(
        &self,
        parent: &K,
        value: &V,
        kept_reason: ChangeReason,
        out: &mut ChangeSet<CK, CU>,
    ) {
        let fresh = (self.children)(parent, value);
        let mut state = self.state.lock();
        let old: ChildKeys<CK> = state
            .parent_children
            .get(parent)
            .cloned()
            .unwrap_or_default();

        let fresh_keys: ChildKeys<CK> = fresh.iter().map(|(ck, _)| ck.clone()).collect();
        for stale in old.iter().filter(|ck| !fresh_keys.contains(ck)) {
            state.owners.remove(stale);
            if let Some(removed) = state.values.shift_remove(stale) {
                out.push(Change::remove(stale.clone(), removed));
            }
        }

        for (child_key, child_value) in fresh {
            match state.owners.get(&child_key) {
                Some(owner) if owner != parent => panic!(
                    "transform_many produced a child key owned by another parent; \
                     child keys must be globally unique"
                ),
                _ => {}
            }
            state.owners.insert(child_key.clone(), parent.clone());
            let existed = state
                .values
                .insert(child_key.clone(), child_value.clone());
            match existed {
                Some(old_value) => match kept_reason {
                    ChangeReason::Refresh => {
                        out.push(Change::refresh(child_key, child_value))
                    }
                    _ => out.push(Change::update(child_key, child_value, old_value)),
                },
                None => out.push(Change::add(child_key, child_value)),
            }
        }
        state.parent_children.insert(parent.clone(), fresh_keys);
    }

    fn drop_parent(&self, parent: &K, out: &mut ChangeSet<CK, CU>) {
        let mut state = self.state.lock();
        if let Some(children) = state.parent_children.remove(parent) {
            for child_key in children {
                state.owners.remove(&child_key);
                if let Some(removed) = state.values.shift_remove(&child_key) {
                    out.push(Change::remove(child_key, removed));
                }
            }
        }
    }
}

impl<K: Key, V: Value, CK: Key, CU: Value> Observer<ChangeSet<K, V>>
    for ManyAdapter<K, V, CK, CU>
{
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        let mut out = ChangeSet::new();
        for change in changes.iter() {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    self.project(change.key(), change.current(), ChangeReason::Update, &mut out)
                }
                ChangeReason::Refresh => self.project(
                    change.key(),
                    change.current(),
                    ChangeReason::Refresh,
                    &mut out,
                ),
                ChangeReason::Remove => self.drop_parent(change.key(), &mut out),
                // Child keys define no order of their own.
                ChangeReason::Moved => {}
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

impl<S, K, V, CK, CU> Observable<ChangeSet<CK, CU>> for TransformMany<S, K, V, CK, CU>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
    CK: Key,
    CU: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<CK, CU>>) -> Subscription {
        self.upstream.subscribe_with(Box::new(ManyAdapter {
            children: self.children.clone(),
            state: Arc::new(Mutex::new(ManyState {
                parent_children: FxHashMap::default(),
                owners: FxHashMap::default(),
                values: FxIndexMap::default(),
            })),
            downstream: observer,
        }))
    }
}
