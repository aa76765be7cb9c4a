//! Read-only snapshots of cache state.

use crate::FxIndexMap;

/// A point-in-time, read-only view of a cache.
///
/// Snapshots are detached copies: once taken they do not observe later
/// edits. Iteration order is the cache's iteration order (insertion
/// order for root caches).
#[derive(Clone)]
pub struct QuerySnapshot<K, V> {
    items: FxIndexMap<K, V>,
}

impl<K, V> QuerySnapshot<K, V>
where
    K: std::hash::Hash + Eq,
{
    pub(crate) fn new(items: FxIndexMap<K, V>) -> Self {
        QuerySnapshot { items }
    }

    /// Number of items in the snapshot.
    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// Whether the snapshot holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The value for `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.items.get(key)
    }

    /// Iterates keys in cache order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.items.keys()
    }

    /// Iterates values in cache order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.items.values()
    }

    /// Iterates `(key, value)` pairs in cache order.
    pub fn pairs(&self) -> impl Iterator<Item = (&K, &V)> {
        self.items.iter()
    }
}

impl<K, V> QuerySnapshot<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    /// Copies the snapshot out as a vector of pairs in cache order.
    pub fn to_vec(&self) -> Vec<(K, V)> {
        self.items
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for QuerySnapshot<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.items.iter()).finish()
    }
}
