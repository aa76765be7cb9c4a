//! The mutation-recording dictionary at the heart of every cache.

use crate::change::{Change, ChangeReason, ChangeSet};
use crate::query::QuerySnapshot;
use crate::{FxIndexMap, Key, Value};

/// A map from `K` to `V` that records every mutation into a pending
/// change buffer.
///
/// Nothing is published until [`capture_changes`](Self::capture_changes)
/// is called; that swap is the sole commit point. Iteration order is
/// insertion order (updates keep an item's original slot), which backs
/// replay order on subscribe, `clear` order, and oldest-first eviction.
pub struct ChangeAwareCache<K, V> {
    data: FxIndexMap<K, V>,
    pending: Vec<Change<K, V>>,
}

impl<K: Key, V: Value> ChangeAwareCache<K, V> {
    /// An empty cache.
    pub fn new() -> Self {
        ChangeAwareCache {
            data: FxIndexMap::default(),
            pending: Vec::new(),
        }
    }

    /// An empty cache with room for `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        ChangeAwareCache {
            data: FxIndexMap::with_capacity_and_hasher(capacity, Default::default()),
            pending: Vec::new(),
        }
    }

    /// Number of items.
    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// The value for `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.data.get(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    /// Inserts or replaces `key`, recording `Add` or `Update`.
    pub fn add_or_update(&mut self, key: K, value: V) {
        match self.data.get_mut(&key) {
            Some(slot) => {
                let previous = std::mem::replace(slot, value.clone());
                self.pending.push(Change::update(key, value, previous));
            }
            None => {
                self.data.insert(key.clone(), value.clone());
                self.pending.push(Change::add(key, value));
            }
        }
    }

    /// Deletes `key` if present, recording `Remove`. Absent keys are a
    /// no-op.
    pub fn remove(&mut self, key: &K) {
        if let Some(value) = self.data.shift_remove(key) {
            self.pending.push(Change::remove(key.clone(), value));
        }
    }

    /// Records `Refresh` for `key` if present. Absent keys are a no-op.
    pub fn refresh(&mut self, key: &K) {
        if let Some(value) = self.data.get(key) {
            self.pending
                .push(Change::refresh(key.clone(), value.clone()));
        }
    }

    /// Records `Refresh` for every present key, in iteration order.
    pub fn refresh_all(&mut self) {
        for (key, value) in &self.data {
            self.pending
                .push(Change::refresh(key.clone(), value.clone()));
        }
    }

    /// Records `Remove` for every present key in iteration order, then
    /// empties the map.
    pub fn clear(&mut self) {
        for (key, value) in self.data.drain(..) {
            self.pending.push(Change::remove(key, value));
        }
    }

    /// Folds an external change set into this cache: `Add`/`Update`
    /// apply as add-or-update, `Remove` and `Refresh` apply as
    /// themselves, `Moved` is ignored (this cache defines no order of
    /// its own).
    ///
    /// A `Refresh` adopts the incoming value (the upstream item changed
    /// in place) before recording the refresh.
    pub fn clone_changes(&mut self, changes: &ChangeSet<K, V>) {
        for change in changes.iter() {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    self.add_or_update(change.key().clone(), change.current().clone());
                }
                ChangeReason::Remove => self.remove(change.key()),
                ChangeReason::Refresh => {
                    if let Some(slot) = self.data.get_mut(change.key()) {
                        *slot = change.current().clone();
                        self.pending
                            .push(Change::refresh(change.key().clone(), change.current().clone()));
                    }
                }
                ChangeReason::Moved => {}
            }
        }
    }

    /// Whether uncommitted changes are pending.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Commits: swaps the pending buffer for an empty successor and
    /// returns the batch. With nothing pending, returns the empty
    /// batch without allocating.
    pub fn capture_changes(&mut self) -> ChangeSet<K, V> {
        if self.pending.is_empty() {
            return ChangeSet::new();
        }
        std::mem::take(&mut self.pending).into()
    }

    /// A detached read-only copy of the current state.
    pub fn snapshot(&self) -> QuerySnapshot<K, V> {
        QuerySnapshot::new(self.data.clone())
    }

    /// Borrows the underlying map, in iteration order.
    pub(crate) fn data(&self) -> &FxIndexMap<K, V> {
        &self.data
    }
}

impl<K: Key, V: Value> Default for ChangeAwareCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value> std::iter::FromIterator<(K, V)> for ChangeAwareCache<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut cache = ChangeAwareCache::new();
        for (key, value) in iter {
            cache.add_or_update(key, value);
        }
        cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_update_records_both() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update(1, "a");
        cache.add_or_update(1, "A");

        let changes = cache.capture_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].reason(), ChangeReason::Add);
        assert_eq!(changes[1].reason(), ChangeReason::Update);
        assert_eq!(changes[1].previous(), Some(&"a"));
        assert_eq!(cache.lookup(&1), Some(&"A"));
    }

    #[test]
    fn remove_of_absent_key_is_a_no_op() {
        let mut cache: ChangeAwareCache<u32, &str> = ChangeAwareCache::new();
        cache.remove(&9);
        assert!(!cache.has_pending());
        assert!(cache.capture_changes().is_empty());
    }

    #[test]
    fn capture_is_the_sole_commit_point() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update(1, "a");
        assert!(cache.has_pending());

        let first = cache.capture_changes();
        assert_eq!(first.len(), 1);

        // Nothing new pending: the shared empty batch comes back.
        let second = cache.capture_changes();
        assert!(second.is_empty());
    }

    #[test]
    fn clear_removes_in_iteration_order() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update(3, "c");
        cache.add_or_update(1, "a");
        cache.add_or_update(2, "b");
        cache.capture_changes();

        cache.clear();
        let changes = cache.capture_changes();
        let keys: Vec<u32> = changes.iter().map(|c| *c.key()).collect();
        assert_eq!(keys, vec![3, 1, 2]);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn clone_changes_ignores_moved() {
        let mut source = ChangeAwareCache::new();
        source.add_or_update(1, "a");
        source.add_or_update(2, "b");
        let mut upstream = source.capture_changes();
        upstream.push(Change::moved(1, "a", 1, 0));

        let mut mirror = ChangeAwareCache::new();
        mirror.clone_changes(&upstream);
        let applied = mirror.capture_changes();
        assert_eq!(applied.len(), 2);
        assert_eq!(mirror.count(), 2);
    }

    #[test]
    fn refresh_via_clone_adopts_the_new_value() {
        let mut mirror = ChangeAwareCache::new();
        mirror.add_or_update(1, 10);
        mirror.capture_changes();

        let refresh = ChangeSet::single(Change::refresh(1, 11));
        mirror.clone_changes(&refresh);
        assert_eq!(mirror.lookup(&1), Some(&11));
        let changes = mirror.capture_changes();
        assert_eq!(changes[0].reason(), ChangeReason::Refresh);
    }
}
