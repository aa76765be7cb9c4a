//! Ordered projection of a keyed stream.

use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::sorted::{Comparer, SortReason, SortedChangeSet};
use crate::stream::{
    BoxObservable, BoxObserver, Observable, Observer, SharedObserver, Subscription,
};
use crate::{Key, Value};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

/// Tuning for the sort operator, in the spirit of a copyable builder.
#[derive(Copy, Clone, Debug)]
pub struct SortOptions {
    /// Mutations-per-batch limit beyond which the operator emits a
    /// wholesale reset instead of incremental indexed changes.
    pub reset_threshold: usize,

    /// Locate insert positions by binary search. Safe only for pure
    /// comparers; the caller asserts purity by enabling it.
    pub use_binary_search: bool,

    /// Whether an update whose position is unchanged emits a single
    /// replace-at-index `Update` (true) or a `Remove` plus `Add` pair
    /// (false).
    pub use_replace_for_updates: bool,

    /// Initial capacity for the ordered mirror.
    pub initial_capacity: usize,
}

impl Default for SortOptions {
    fn default() -> Self {
        SortOptions {
            reset_threshold: 100,
            use_binary_search: false,
            use_replace_for_updates: true,
            initial_capacity: 0,
        }
    }
}

impl SortOptions {
    /// Overrides the reset threshold.
    pub fn with_reset_threshold(self, reset_threshold: usize) -> Self {
        SortOptions {
            reset_threshold,
            ..self
        }
    }

    /// Enables binary-search positioning; the caller asserts the
    /// comparer is pure.
    pub fn with_binary_search(self) -> Self {
        SortOptions {
            use_binary_search: true,
            ..self
        }
    }

    /// Chooses remove-plus-add emission for in-place updates.
    pub fn without_replace_for_updates(self) -> Self {
        SortOptions {
            use_replace_for_updates: false,
            ..self
        }
    }

    /// Pre-sizes the ordered mirror.
    pub fn with_initial_capacity(self, initial_capacity: usize) -> Self {
        SortOptions {
            initial_capacity,
            ..self
        }
    }
}

/// The sort operator. Built by
/// [`ChangeStreamExt::sort`](super::ChangeStreamExt::sort).
pub struct Sort<S, K, V> {
    upstream: S,
    comparer: Comparer<V>,
    comparers: Option<BoxObservable<Comparer<V>>>,
    reorder: Option<BoxObservable<()>>,
    options: SortOptions,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> Sort<S, K, V> {
    pub(crate) fn new(
        upstream: S,
        comparer: Comparer<V>,
        options: SortOptions,
    ) -> Self {
        Sort {
            upstream,
            comparer,
            comparers: None,
            reorder: None,
            options,
            _marker: PhantomData,
        }
    }

    /// Switches the active comparer whenever `comparers` emits; each
    /// switch rebuilds the projection and emits a
    /// [`SortReason::Comparer`] reload.
    pub fn with_comparer_stream<C>(mut self, comparers: C) -> Self
    where
        C: Observable<Comparer<V>> + Send + Sync + 'static,
    {
        self.comparers = Some(Arc::new(comparers));
        self
    }

    /// Re-evaluates every position under the unchanged comparer when
    /// `reorder` emits ([`SortReason::Reorder`]).
    pub fn with_reorder_trigger<R>(mut self, reorder: R) -> Self
    where
        R: Observable<()> + Send + Sync + 'static,
    {
        self.reorder = Some(Arc::new(reorder));
        self
    }
}

struct SortState<K, V> {
    list: Vec<(K, V)>,
    comparer: Comparer<V>,
    emitted_initial: bool,
}

struct SortWork<K, V> {
    state: Arc<Mutex<SortState<K, V>>>,
    options: SortOptions,
    downstream: SharedObserver<SortedChangeSet<K, V>>,
}

impl<K: Key, V: Value> SortWork<K, V> {
    fn index_of(list: &[(K, V)], key: &K) -> Option<usize> {
        list.iter().position(|(k, _)| k == key)
    }

    fn insert_position(&self, state: &SortState<K, V>, value: &V) -> usize {
        let comparer = &state.comparer;
        if self.options.use_binary_search {
            match state
                .list
                .binary_search_by(|(_, existing)| comparer(existing, value))
            {
                Ok(position) | Err(position) => position,
            }
        } else {
            state
                .list
                .iter()
                .position(|(_, existing)| comparer(existing, value) == Ordering::Greater)
                .unwrap_or(state.list.len())
        }
    }

    fn emit(&self, state: &mut SortState<K, V>, changes: ChangeSet<K, V>, reason: SortReason) {
        state.emitted_initial = true;
        let snapshot = Arc::new(state.list.clone());
        let sorted = SortedChangeSet::new(changes, snapshot, state.comparer.clone(), reason);
        self.downstream.lock().on_next(&sorted);
    }

    fn apply_batch(&self, changes: &ChangeSet<K, V>) {
        let mut state = self.state.lock();
        let first = !state.emitted_initial;

        if changes.len() > self.options.reset_threshold {
            log::debug!(
                "batch of {} exceeds reset threshold {}; rebuilding",
                changes.len(),
                self.options.reset_threshold
            );
            self.rebuild(&mut state, changes);
            let reason = if first {
                SortReason::Initial
            } else {
                SortReason::Reset
            };
            self.emit(&mut state, ChangeSet::new(), reason);
            return;
        }

        let mut out = ChangeSet::new();
        for change in changes.iter() {
            self.apply(&mut state, change, &mut out);
        }
        if out.is_empty() {
            return;
        }
        let reason = if first {
            SortReason::Initial
        } else {
            SortReason::DataChanged
        };
        self.emit(&mut state, out, reason);
    }

    /// Applies the batch keyed-only, then sorts wholesale.
    fn rebuild(&self, state: &mut SortState<K, V>, changes: &ChangeSet<K, V>) {
        for change in changes.iter() {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                    match Self::index_of(&state.list, key) {
                        Some(position) => state.list[position].1 = change.current().clone(),
                        None => state.list.push((key.clone(), change.current().clone())),
                    }
                }
                ChangeReason::Remove => {
                    if let Some(position) = Self::index_of(&state.list, key) {
                        state.list.remove(position);
                    }
                }
                ChangeReason::Moved => {}
            }
        }
        let comparer = state.comparer.clone();
        state.list.sort_by(|a, b| comparer(&a.1, &b.1));
    }

    fn apply(&self, state: &mut SortState<K, V>, change: &Change<K, V>, out: &mut ChangeSet<K, V>) {
        let key = change.key();
        let value = change.current();
        match change.reason() {
            ChangeReason::Add => {
                let position = self.insert_position(state, value);
                state.list.insert(position, (key.clone(), value.clone()));
                out.push(Change::add_at(key.clone(), value.clone(), position as isize));
            }
            ChangeReason::Update => {
                let old_position = match Self::index_of(&state.list, key) {
                    Some(position) => position,
                    None => {
                        let position = self.insert_position(state, value);
                        state.list.insert(position, (key.clone(), value.clone()));
                        out.push(Change::add_at(key.clone(), value.clone(), position as isize));
                        return;
                    }
                };
                let (_, previous) = state.list.remove(old_position);
                let new_position = self.insert_position(state, value);
                if new_position == old_position && self.options.use_replace_for_updates {
                    state
                        .list
                        .insert(new_position, (key.clone(), value.clone()));
                    out.push(Change::update_at(
                        key.clone(),
                        value.clone(),
                        previous,
                        new_position as isize,
                        old_position as isize,
                    ));
                } else {
                    state
                        .list
                        .insert(new_position, (key.clone(), value.clone()));
                    out.push(Change::remove_at(key.clone(), previous, old_position as isize));
                    out.push(Change::add_at(key.clone(), value.clone(), new_position as isize));
                }
            }
            ChangeReason::Remove => {
                if let Some(position) = Self::index_of(&state.list, key) {
                    state.list.remove(position);
                    out.push(Change::remove_at(key.clone(), value.clone(), position as isize));
                }
            }
            ChangeReason::Refresh => {
                let position = match Self::index_of(&state.list, key) {
                    Some(position) => position,
                    None => return,
                };
                state.list[position].1 = value.clone();
                let comparer = state.comparer.clone();
                let ordered_left = position == 0
                    || comparer(&state.list[position - 1].1, value) != Ordering::Greater;
                let ordered_right = position + 1 == state.list.len()
                    || comparer(value, &state.list[position + 1].1) != Ordering::Greater;
                if ordered_left && ordered_right {
                    out.push(Change::refresh_at(key.clone(), value.clone(), position as isize));
                } else {
                    state.list.remove(position);
                    let new_position = self.insert_position(state, value);
                    state
                        .list
                        .insert(new_position, (key.clone(), value.clone()));
                    if new_position == position {
                        out.push(Change::refresh_at(
                            key.clone(),
                            value.clone(),
                            position as isize,
                        ));
                    } else {
                        out.push(Change::moved(
                            key.clone(),
                            value.clone(),
                            new_position as isize,
                            position as isize,
                        ));
                    }
                }
            }
            // The sort operator defines the order; upstream positions
            // are meaningless here.
            ChangeReason::Moved => {}
        }
    }

    fn resort(&self, reason: SortReason, comparer: Option<Comparer<V>>) {
        let mut state = self.state.lock();
        if let Some(comparer) = comparer {
            state.comparer = comparer;
        }
        if state.list.is_empty() && !state.emitted_initial {
            return;
        }
        let comparer = state.comparer.clone();
        state.list.sort_by(|a, b| comparer(&a.1, &b.1));
        self.emit(&mut state, ChangeSet::new(), reason);
    }
}

struct SortAdapter<K: Key, V: Value> {
    work: Arc<SortWork<K, V>>,
}

impl<K: Key, V: Value> Observer<ChangeSet<K, V>> for SortAdapter<K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        self.work.apply_batch(changes);
    }

    fn on_completed(&mut self) {
        self.work.downstream.lock().on_completed();
    }

    fn on_error(&mut self, error: &Error) {
        self.work.downstream.lock().on_error(error);
    }
}

struct ComparerAdapter<K: Key, V: Value> {
    work: Arc<SortWork<K, V>>,
}

impl<K: Key, V: Value> Observer<Comparer<V>> for ComparerAdapter<K, V> {
    fn on_next(&mut self, comparer: &Comparer<V>) {
        log::debug!("comparer switched; rebuilding sorted projection");
        self.work.resort(SortReason::Comparer, Some(comparer.clone()));
    }
}

struct ReorderAdapter<K: Key, V: Value> {
    work: Arc<SortWork<K, V>>,
}

impl<K: Key, V: Value> Observer<()> for ReorderAdapter<K, V> {
    fn on_next(&mut self, _trigger: &()) {
        self.work.resort(SortReason::Reorder, None);
    }
}

impl<S, K, V> Observable<SortedChangeSet<K, V>> for Sort<S, K, V>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<SortedChangeSet<K, V>>) -> Subscription {
        let work = Arc::new(SortWork {
            state: Arc::new(Mutex::new(SortState {
                list: Vec::with_capacity(self.options.initial_capacity),
                comparer: self.comparer.clone(),
                emitted_initial: false,
            })),
            options: self.options,
            downstream: Arc::new(Mutex::new(observer)),
        });

        let mut subscription = self
            .upstream
            .subscribe_with(Box::new(SortAdapter { work: work.clone() }));
        if let Some(comparers) = &self.comparers {
            let sub = comparers.subscribe_with(Box::new(ComparerAdapter { work: work.clone() }));
            subscription = subscription.and(sub);
        }
        if let Some(reorder) = &self.reorder {
            let sub = reorder.subscribe_with(Box::new(ReorderAdapter { work }));
            subscription = subscription.and(sub);
        }
        subscription
    }
}
