//! The grouped join family: the right side is delivered as a live
//! sub-cache per left key.

use super::group::Group;
use super::join::ForeignKey;
use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::stream::{BoxObserver, Observable, Observer, SharedObserver, Subscription};
use crate::{FxIndexMap, Key, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::marker::PhantomData;
use std::sync::Arc;

type ManySelector<LK, L, RK, R, O> =
    Arc<dyn Fn(&L, &Group<LK, RK, R>) -> O + Send + Sync>;

/// A join whose result rows carry a [`Group`] of all matching right
/// items. Built by
/// [`ChangeStreamExt::left_join_many`](super::ChangeStreamExt::left_join_many)
/// and [`inner_join_many`](super::ChangeStreamExt::inner_join_many).
///
/// With `require_members = false` (left form) one row exists per left
/// key and membership changes flow only through the group's own stream;
/// with `require_members = true` (inner form) a row exists only while
/// the group is non-empty.
pub struct JoinMany<SL, SR, LK, L, RK, R, O>
where
    LK: Key,
    RK: Key,
    R: Value,
{
    left: SL,
    right: SR,
    foreign_key: ForeignKey<R, LK>,
    selector: ManySelector<LK, L, RK, R, O>,
    require_members: bool,
    _marker: PhantomData<fn() -> (L, O)>,
}

impl<SL, SR, LK, L, RK, R, O> JoinMany<SL, SR, LK, L, RK, R, O>
where
    LK: Key,
    L: Value,
    RK: Key,
    R: Value,
    O: Value,
{
    pub(crate) fn new(
        left: SL,
        right: SR,
        foreign_key: ForeignKey<R, LK>,
        selector: ManySelector<LK, L, RK, R, O>,
        require_members: bool,
    ) -> Self {
        JoinMany {
            left,
            right,
            foreign_key,
            selector,
            require_members,
            _marker: PhantomData,
        }
    }
}

struct ManyJoinState<LK: Key, L: Value, RK: Key, R: Value, O: Value> {
    left: FxIndexMap<LK, L>,
    right_fk: FxHashMap<RK, LK>,
    groups: FxHashMap<LK, Group<LK, RK, R>>,
    rows: FxHashMap<LK, O>,
    left_done: bool,
    right_done: bool,
}

struct ManyJoinWork<LK: Key, L: Value, RK: Key, R: Value, O: Value> {
    state: Mutex<ManyJoinState<LK, L, RK, R, O>>,
    selector: ManySelector<LK, L, RK, R, O>,
    require_members: bool,
    downstream: SharedObserver<ChangeSet<LK, O>>,
}

impl<LK: Key, L: Value, RK: Key, R: Value, O: Value> ManyJoinWork<LK, L, RK, R, O> {
    fn ensure_group(state: &mut ManyJoinState<LK, L, RK, R, O>, lk: &LK) -> Group<LK, RK, R> {
        state
            .groups
            .entry(lk.clone())
            .or_insert_with(|| Group::new(lk.clone()))
            .clone()
    }

    /// Reconciles the row for `lk` after either side moved.
    ///
    /// `left_changed` marks a left-value mutation: only those re-emit
    /// an `Update` for an already-present row, so membership churn does
    /// not spam row updates (the group stream carries it).
    fn reconcile(
        &self,
        state: &mut ManyJoinState<LK, L, RK, R, O>,
        lk: &LK,
        left_changed: bool,
        out: &mut ChangeSet<LK, O>,
    ) {
        let group = Self::ensure_group(state, lk);
        let left_value = state.left.get(lk).cloned();
        let exists = left_value.is_some() && (!self.require_members || group.count() > 0);
        let present = state.rows.contains_key(lk);
        match (present, exists) {
            (false, true) => {
                let value = (self.selector)(left_value.as_ref().expect("row without left"), &group);
                state.rows.insert(lk.clone(), value.clone());
                out.push(Change::add(lk.clone(), value));
            }
            (true, false) => {
                let old = state.rows.remove(lk).expect("present row vanished");
                out.push(Change::remove(lk.clone(), old));
            }
            (true, true) if left_changed => {
                let value = (self.selector)(left_value.as_ref().expect("row without left"), &group);
                let old = state
                    .rows
                    .insert(lk.clone(), value.clone())
                    .expect("present row vanished");
                out.push(Change::update(lk.clone(), value, old));
            }
            _ => {}
        }
    }

    fn emit(&self, out: ChangeSet<LK, O>) {
        if !out.is_empty() {
            self.downstream.lock().on_next(&out);
        }
    }

    fn complete_side(&self, left: bool) {
        let finished = {
            let mut state = self.state.lock();
            if left {
                state.left_done = true;
            } else {
                state.right_done = true;
            }
            state.left_done && state.right_done
        };
        if finished {
            let state = self.state.lock();
            for group in state.groups.values() {
                group.complete_members();
            }
            drop(state);
            self.downstream.lock().on_completed();
        }
    }
}

struct ManyLeftAdapter<LK: Key, L: Value, RK: Key, R: Value, O: Value> {
    work: Arc<ManyJoinWork<LK, L, RK, R, O>>,
}

impl<LK: Key, L: Value, RK: Key, R: Value, O: Value> Observer<ChangeSet<LK, L>>
    for ManyLeftAdapter<LK, L, RK, R, O>
{
    fn on_next(&mut self, changes: &ChangeSet<LK, L>) {
        let mut out = ChangeSet::new();
        {
            let mut state = self.work.state.lock();
            for change in changes.iter() {
                let key = change.key();
                match change.reason() {
                    ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                        state.left.insert(key.clone(), change.current().clone());
                        self.work.reconcile(&mut state, key, true, &mut out);
                    }
                    ChangeReason::Remove => {
                        state.left.shift_remove(key);
                        self.work.reconcile(&mut state, key, false, &mut out);
                    }
                    ChangeReason::Moved => {}
                }
            }
        }
        self.work.emit(out);
    }

    fn on_completed(&mut self) {
        self.work.complete_side(true);
    }

    fn on_error(&mut self, error: &Error) {
        self.work.downstream.lock().on_error(error);
    }
}

struct ManyRightAdapter<LK: Key, L: Value, RK: Key, R: Value, O: Value> {
    work: Arc<ManyJoinWork<LK, L, RK, R, O>>,
    foreign_key: ForeignKey<R, LK>,
}

impl<LK: Key, L: Value, RK: Key, R: Value, O: Value> Observer<ChangeSet<RK, R>>
    for ManyRightAdapter<LK, L, RK, R, O>
{
    fn on_next(&mut self, changes: &ChangeSet<RK, R>) {
        let mut out = ChangeSet::new();
        {
            let mut state = self.work.state.lock();
            for change in changes.iter() {
                let key = change.key();
                match change.reason() {
                    ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                        let target = (self.foreign_key)(change.current());
                        let previous = state.right_fk.get(key).cloned();
                        if let Some(old) = previous.filter(|old| *old != target) {
                            let group = ManyJoinWork::ensure_group(&mut state, &old);
                            group.edit(|updater| updater.remove(key));
                            self.work.reconcile(&mut state, &old, false, &mut out);
                        }
                        state.right_fk.insert(key.clone(), target.clone());
                        let group = ManyJoinWork::ensure_group(&mut state, &target);
                        group.edit(|updater| {
                            updater.add_or_update(key.clone(), change.current().clone())
                        });
                        self.work.reconcile(&mut state, &target, false, &mut out);
                    }
                    ChangeReason::Remove => {
                        if let Some(old) = state.right_fk.remove(key) {
                            let group = ManyJoinWork::ensure_group(&mut state, &old);
                            group.edit(|updater| updater.remove(key));
                            self.work.reconcile(&mut state, &old, false, &mut out);
                        }
                    }
                    ChangeReason::Moved => {}
                }
            }
        }
        self.work.emit(out);
    }

    fn on_completed(&mut self) {
        self.work.complete_side(false);
    }

    fn on_error(&mut self, error: &Error) {
        self.work.downstream.lock().on_error(error);
    }
}

impl<SL, SR, LK, L, RK, R, O> Observable<ChangeSet<LK, O>> for JoinMany<SL, SR, LK, L, RK, R, O>
where
    SL: Observable<ChangeSet<LK, L>>,
    SR: Observable<ChangeSet<RK, R>>,
    LK: Key,
    L: Value,
    RK: Key,
    R: Value,
    O: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<LK, O>>) -> Subscription {
        let work = Arc::new(ManyJoinWork {
            state: Mutex::new(ManyJoinState {
                left: FxIndexMap::default(),
                right_fk: FxHashMap::default(),
                groups: FxHashMap::default(),
                rows: FxHashMap::default(),
                left_done: false,
                right_done: false,
            }),
            selector: self.selector.clone(),
            require_members: self.require_members,
            downstream: Arc::new(Mutex::new(observer)),
        });

        let left_sub = self
            .left
            .subscribe_with(Box::new(ManyLeftAdapter { work: work.clone() }));
        let right_sub = self.right.subscribe_with(Box::new(ManyRightAdapter {
            work,
            foreign_key: self.foreign_key.clone(),
        }));
        left_sub.and(right_sub)
    }
}
