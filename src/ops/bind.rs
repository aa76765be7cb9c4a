//! Binding a sorted projection to an external ordered list.

use crate::change::ChangeReason;
use crate::error::Error;
use crate::sorted::SortedChangeSet;
use crate::stream::{Observable, Observer, Subscription};
use crate::{Key, Value};
use parking_lot::RwLock;
use std::sync::Arc;

/// Receives indexed mutations derived from a sorted stream.
///
/// Implementations mirror the projection into whatever list type the
/// host UI uses. After every batch the target list is strictly
/// consistent with the cache ordered by the active comparer.
pub trait ListAdapter<K: Key, V: Value>: Send {
    /// Insert `value` at `index`.
    fn insert(&mut self, index: usize, key: &K, value: &V);

    /// Remove the item at `index`.
    fn remove(&mut self, index: usize);

    /// Replace the item at `index`.
    fn replace(&mut self, index: usize, key: &K, value: &V);

    /// Move the item at `from` to `to` (indices before/after removal).
    fn move_item(&mut self, from: usize, to: usize, key: &K, value: &V);

    /// The item at `index` changed in place.
    fn refresh(&mut self, index: usize, key: &K, value: &V) {
        self.replace(index, key, value);
    }

    /// Discard the mirror and reload it from `items`.
    fn reset(&mut self, items: &[(K, V)]);
}

/// A shared `Vec` mirror of a sorted projection.
///
/// Reads never block writers for long: the mirror is guarded by a
/// read-write lock and writes happen only during batch application.
pub struct BoundList<V> {
    inner: Arc<RwLock<Vec<V>>>,
}

impl<V> Clone for BoundList<V> {
    fn clone(&self) -> Self {
        BoundList {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone> BoundList<V> {
    /// An empty mirror.
    pub fn new() -> Self {
        BoundList {
            inner: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Current length.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the mirror is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Copies the current contents out.
    pub fn to_vec(&self) -> Vec<V> {
        self.inner.read().clone()
    }

    /// Runs `f` against the current contents without copying.
    pub fn with<R>(&self, f: impl FnOnce(&[V]) -> R) -> R {
        f(&self.inner.read())
    }
}

impl<V: Clone> Default for BoundList<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The [`ListAdapter`] backing a [`BoundList`].
pub struct VecAdapter<V> {
    list: Arc<RwLock<Vec<V>>>,
}

impl<K: Key, V: Value> ListAdapter<K, V> for VecAdapter<V> {
    fn insert(&mut self, index: usize, _key: &K, value: &V) {
        self.list.write().insert(index, value.clone());
    }

    fn remove(&mut self, index: usize) {
        self.list.write().remove(index);
    }

    fn replace(&mut self, index: usize, _key: &K, value: &V) {
        self.list.write()[index] = value.clone();
    }

    fn move_item(&mut self, from: usize, to: usize, _key: &K, _value: &V) {
        let mut list = self.list.write();
        let item = list.remove(from);
        list.insert(to, item);
    }

    fn reset(&mut self, items: &[(K, V)]) {
        let mut list = self.list.write();
        list.clear();
        list.extend(items.iter().map(|(_, v)| v.clone()));
    }
}

pub(crate) struct BindObserver<K: Key, V: Value, A: ListAdapter<K, V>> {
    pub(crate) adapter: A,
    pub(crate) _marker: std::marker::PhantomData<fn() -> (K, V)>,
}

impl<K: Key, V: Value, A: ListAdapter<K, V>> Observer<SortedChangeSet<K, V>>
    for BindObserver<K, V, A>
{
    fn on_next(&mut self, sorted: &SortedChangeSet<K, V>) {
        if sorted.reason().is_reload() {
            self.adapter.reset(sorted.sorted());
            return;
        }
        for change in sorted.changes().iter() {
            let key = change.key();
            let value = change.current();
            match change.reason() {
                ChangeReason::Add => {
                    self.adapter.insert(change.current_index() as usize, key, value)
                }
                ChangeReason::Remove => self.adapter.remove(change.current_index() as usize),
                ChangeReason::Update => {
                    let current = change.current_index();
                    let previous = change.previous_index();
                    if current == previous {
                        self.adapter.replace(current as usize, key, value);
                    } else {
                        self.adapter.remove(previous as usize);
                        self.adapter.insert(current as usize, key, value);
                    }
                }
                ChangeReason::Refresh => {
                    self.adapter.refresh(change.current_index() as usize, key, value)
                }
                ChangeReason::Moved => self.adapter.move_item(
                    change.previous_index() as usize,
                    change.current_index() as usize,
                    key,
                    value,
                ),
            }
        }
    }

    fn on_completed(&mut self) {}

    fn on_error(&mut self, error: &Error) {
        log::warn!("bound list upstream faulted: {}", error);
    }
}

/// Subscribes `adapter` to `sorted_stream` immediately.
pub fn bind_adapter<K, V, A, S>(sorted_stream: &S, adapter: A) -> Subscription
where
    K: Key,
    V: Value,
    A: ListAdapter<K, V> + 'static,
    S: Observable<SortedChangeSet<K, V>> + ?Sized,
{
    sorted_stream.subscribe_with(Box::new(BindObserver {
        adapter,
        _marker: std::marker::PhantomData,
    }))
}

/// Materializes `sorted_stream` into a [`BoundList`] mirror.
pub fn bind_list<K, V, S>(sorted_stream: &S) -> (BoundList<V>, Subscription)
where
    K: Key,
    V: Value,
    S: Observable<SortedChangeSet<K, V>> + ?Sized,
{
    let list = BoundList::new();
    let adapter = VecAdapter {
        list: list.inner.clone(),
    };
    let subscription = bind_adapter(sorted_stream, adapter);
    (list, subscription)
}
