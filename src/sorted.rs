//! Sorted context attached to change sets published by sort operators.

use crate::change::ChangeSet;
use std::cmp::Ordering;
use std::sync::Arc;

/// A total order over values, supplied at runtime.
///
/// Comparers are reference-counted callables so a pipeline can hand the
/// active comparer to mirrors and snapshots without copying it.
pub type Comparer<V> = Arc<dyn Fn(&V, &V) -> Ordering + Send + Sync>;

/// Wraps a closure into a [`Comparer`].
pub fn comparing<V, F>(f: F) -> Comparer<V>
where
    F: Fn(&V, &V) -> Ordering + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A [`Comparer`] ordering values by a derived sort key.
pub fn comparing_by<V, T, F>(f: F) -> Comparer<V>
where
    T: Ord,
    F: Fn(&V) -> T + Send + Sync + 'static,
{
    Arc::new(move |a, b| f(a).cmp(&f(b)))
}

/// Why a sorted emission was produced.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SortReason {
    /// First emission after subscribing; the snapshot is the whole
    /// initial state.
    Initial,

    /// The active comparer was switched; the projection was rebuilt.
    Comparer,

    /// The batch exceeded the reset threshold; consumers should reload
    /// from the snapshot rather than replay the changes.
    Reset,

    /// Ordinary incremental emission driven by upstream data changes.
    DataChanged,

    /// A reorder trigger re-evaluated positions under the unchanged
    /// comparer.
    Reorder,
}

impl SortReason {
    /// Whether consumers should discard their mirror and reload from
    /// the attached snapshot.
    pub fn is_reload(self) -> bool {
        !matches!(self, SortReason::DataChanged)
    }
}

/// A change set with the ordered state of the cache after the batch,
/// the comparer that produced the order, and the reason the emission
/// happened.
#[derive(Clone)]
pub struct SortedChangeSet<K, V> {
    changes: ChangeSet<K, V>,
    sorted: Arc<Vec<(K, V)>>,
    comparer: Comparer<V>,
    reason: SortReason,
}

impl<K, V> SortedChangeSet<K, V> {
    pub(crate) fn new(
        changes: ChangeSet<K, V>,
        sorted: Arc<Vec<(K, V)>>,
        comparer: Comparer<V>,
        reason: SortReason,
    ) -> Self {
        SortedChangeSet {
            changes,
            sorted,
            comparer,
            reason,
        }
    }

    /// The indexed changes of this emission. Empty when
    /// [`SortReason::is_reload`] holds and the snapshot should be used
    /// instead.
    pub fn changes(&self) -> &ChangeSet<K, V> {
        &self.changes
    }

    /// The full ordered state after the batch.
    pub fn sorted(&self) -> &[(K, V)] {
        &self.sorted
    }

    pub(crate) fn sorted_arc(&self) -> Arc<Vec<(K, V)>> {
        self.sorted.clone()
    }

    /// The comparer that produced [`sorted`](Self::sorted)'s order.
    pub fn comparer(&self) -> &Comparer<V> {
        &self.comparer
    }

    /// Why this emission was produced.
    pub fn reason(&self) -> SortReason {
        self.reason
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for SortedChangeSet<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedChangeSet")
            .field("reason", &self.reason)
            .field("changes", &self.changes)
            .field("len", &self.sorted.len())
            .finish()
    }
}
