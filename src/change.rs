//! The change algebra: every mutation that flows through the library is
//! described by a [`Change`], and every commit is published as a
//! [`ChangeSet`] — an ordered batch applied atomically by an edit
//! session.

use std::fmt;

/// Sentinel index meaning "no index"; unsorted contexts carry it for
/// both index fields.
pub const NO_INDEX: isize = -1;

/// Why a [`Change`] happened.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChangeReason {
    /// The key was inserted.
    Add,

    /// The key's value was replaced; the change carries the previous
    /// value.
    Update,

    /// The key was deleted; the change carries the removed value.
    Remove,

    /// The value changed in place. Consumers should re-evaluate
    /// anything derived from it; there is no structural change and no
    /// previous value.
    Refresh,

    /// The item moved to a new position within a sorted projection.
    /// Only sort operators originate this reason.
    Moved,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeReason::Add => "Add",
            ChangeReason::Update => "Update",
            ChangeReason::Remove => "Remove",
            ChangeReason::Refresh => "Refresh",
            ChangeReason::Moved => "Moved",
        };
        f.write_str(name)
    }
}

/// One mutation to one key.
///
/// Invariants are enforced by the constructors and fail fast on
/// violation:
///
/// * `Add` never carries a previous value.
/// * `Update` always carries a previous value.
/// * `Moved` carries two non-negative, distinct indices.
#[derive(Clone, PartialEq, Eq)]
pub struct Change<K, V> {
    reason: ChangeReason,
    key: K,
    current: V,
    previous: Option<V>,
    current_index: isize,
    previous_index: isize,
}

impl<K, V> Change<K, V> {
    /// An `Add` with no index.
    pub fn add(key: K, current: V) -> Self {
        Self::add_at(key, current, NO_INDEX)
    }

    /// An `Add` at a known position within a sorted projection.
    pub fn add_at(key: K, current: V, index: isize) -> Self {
        Change {
            reason: ChangeReason::Add,
            key,
            current,
            previous: None,
            current_index: index,
            previous_index: NO_INDEX,
        }
    }

    /// An `Update` carrying the replaced value.
    pub fn update(key: K, current: V, previous: V) -> Self {
        Self::update_at(key, current, previous, NO_INDEX, NO_INDEX)
    }

    /// An indexed `Update`.
    pub fn update_at(
        key: K,
        current: V,
        previous: V,
        current_index: isize,
        previous_index: isize,
    ) -> Self {
        Change {
            reason: ChangeReason::Update,
            key,
            current,
            previous: Some(previous),
            current_index,
            previous_index,
        }
    }

    /// A `Remove` carrying the deleted value.
    pub fn remove(key: K, current: V) -> Self {
        Self::remove_at(key, current, NO_INDEX)
    }

    /// An indexed `Remove`.
    pub fn remove_at(key: K, current: V, index: isize) -> Self {
        Change {
            reason: ChangeReason::Remove,
            key,
            current,
            previous: None,
            current_index: index,
            previous_index: NO_INDEX,
        }
    }

    /// A `Refresh` carrying the current value only.
    pub fn refresh(key: K, current: V) -> Self {
        Self::refresh_at(key, current, NO_INDEX)
    }

    /// An indexed `Refresh`.
    pub fn refresh_at(key: K, current: V, index: isize) -> Self {
        Change {
            reason: ChangeReason::Refresh,
            key,
            current,
            previous: None,
            current_index: index,
            previous_index: NO_INDEX,
        }
    }

    /// A `Moved` between two positions of a sorted projection.
    ///
    /// Both indices must be non-negative and distinct; anything else is
    /// a programmer error and panics.
    pub fn moved(key: K, current: V, current_index: isize, previous_index: isize) -> Self {
        if current_index < 0 || previous_index < 0 {
            panic!(
                "it is not legal to construct a Moved change with a negative index \
                 (current {}, previous {})",
                current_index, previous_index
            );
        }
        if current_index == previous_index {
            panic!(
                "it is not legal to construct a Moved change with equal indices ({})",
                current_index
            );
        }
        Change {
            reason: ChangeReason::Moved,
            key,
            current,
            previous: None,
            current_index,
            previous_index,
        }
    }

    /// The reason for this change.
    #[inline]
    pub fn reason(&self) -> ChangeReason {
        self.reason
    }

    /// The affected key.
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The value after the change. For `Remove` this is the removed
    /// value.
    #[inline]
    pub fn current(&self) -> &V {
        &self.current
    }

    /// The replaced value; present only for `Update`.
    #[inline]
    pub fn previous(&self) -> Option<&V> {
        self.previous.as_ref()
    }

    /// Position after the change, or [`NO_INDEX`] in unsorted contexts.
    #[inline]
    pub fn current_index(&self) -> isize {
        self.current_index
    }

    /// Position before the change, or [`NO_INDEX`].
    #[inline]
    pub fn previous_index(&self) -> isize {
        self.previous_index
    }

    /// Decomposes the change into its key and current value.
    pub fn into_parts(self) -> (K, V, Option<V>) {
        (self.key, self.current, self.previous)
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Change<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Change");
        dbg.field("reason", &self.reason).field("key", &self.key);
        dbg.field("current", &self.current);
        if let Some(previous) = &self.previous {
            dbg.field("previous", previous);
        }
        if self.current_index != NO_INDEX || self.previous_index != NO_INDEX {
            dbg.field("current_index", &self.current_index)
                .field("previous_index", &self.previous_index);
        }
        dbg.finish()
    }
}

/// An ordered batch of changes committed atomically.
///
/// Order within the batch is the order mutations were applied by the
/// edit session. A batch is immutable once published; operators build a
/// fresh batch rather than mutating one they received.
#[derive(Clone, PartialEq, Eq)]
pub struct ChangeSet<K, V> {
    changes: Vec<Change<K, V>>,
}

impl<K, V> Default for ChangeSet<K, V> {
    fn default() -> Self {
        ChangeSet {
            changes: Vec::new(),
        }
    }
}

impl<K, V> ChangeSet<K, V> {
    /// An empty batch. Does not allocate.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty batch with room for `capacity` changes.
    pub fn with_capacity(capacity: usize) -> Self {
        ChangeSet {
            changes: Vec::with_capacity(capacity),
        }
    }

    /// A batch holding a single change.
    pub fn single(change: Change<K, V>) -> Self {
        ChangeSet {
            changes: vec![change],
        }
    }

    /// Appends a change to the batch.
    pub fn push(&mut self, change: Change<K, V>) {
        self.changes.push(change);
    }

    /// Appends every change of `other`.
    pub fn extend(&mut self, other: ChangeSet<K, V>) {
        self.changes.extend(other.changes);
    }

    /// Number of changes in the batch.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether the batch holds no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Iterates the changes in application order.
    pub fn iter(&self) -> std::slice::Iter<'_, Change<K, V>> {
        self.changes.iter()
    }

    /// Count of `Add` changes.
    pub fn adds(&self) -> usize {
        self.count_of(ChangeReason::Add)
    }

    /// Count of `Update` changes.
    pub fn updates(&self) -> usize {
        self.count_of(ChangeReason::Update)
    }

    /// Count of `Remove` changes.
    pub fn removes(&self) -> usize {
        self.count_of(ChangeReason::Remove)
    }

    /// Count of `Refresh` changes.
    pub fn refreshes(&self) -> usize {
        self.count_of(ChangeReason::Refresh)
    }

    /// Count of `Moved` changes.
    pub fn moves(&self) -> usize {
        self.count_of(ChangeReason::Moved)
    }

    fn count_of(&self, reason: ChangeReason) -> usize {
        self.changes.iter().filter(|c| c.reason() == reason).count()
    }
}

impl<K, V> From<Vec<Change<K, V>>> for ChangeSet<K, V> {
    fn from(changes: Vec<Change<K, V>>) -> Self {
        ChangeSet { changes }
    }
}

impl<K, V> std::ops::Deref for ChangeSet<K, V> {
    type Target = [Change<K, V>];

    fn deref(&self) -> &Self::Target {
        &self.changes
    }
}

impl<K, V> IntoIterator for ChangeSet<K, V> {
    type Item = Change<K, V>;
    type IntoIter = std::vec::IntoIter<Change<K, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a, K, V> IntoIterator for &'a ChangeSet<K, V> {
    type Item = &'a Change<K, V>;
    type IntoIter = std::slice::Iter<'a, Change<K, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for ChangeSet<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.changes.iter()).finish()
    }
}
