//! The one-to-one join family: inner, left, right and full joins over
//! two keyed streams related by a foreign key on the right side.

use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::stream::{BoxObserver, Observable, Observer, SharedObserver, Subscription};
use crate::{FxIndexMap, Key, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::marker::PhantomData;
use std::sync::Arc;

/// Extracts the left key a right value refers to.
pub type ForeignKey<R, LK> = Arc<dyn Fn(&R) -> LK + Send + Sync>;

/// Output key of a full join: every left key and every unmatched right
/// key owns a row.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FullKey<LK, RK> {
    /// A row rooted at a left item (matched or not).
    Left(LK),
    /// A row for a right item whose foreign key has no left match.
    Right(RK),
}

/// The mirrored state both sides of a join maintain.
pub(crate) struct JoinState<LK: Key, L: Value, RK: Key, R: Value> {
    pub(crate) left: FxIndexMap<LK, L>,
    pub(crate) right: FxIndexMap<RK, R>,
    right_fk: FxHashMap<RK, LK>,
    pub(crate) by_fk: FxHashMap<LK, SmallVec<[RK; 2]>>,
}

impl<LK: Key, L: Value, RK: Key, R: Value> JoinState<LK, L, RK, R> {
    fn new() -> Self {
        JoinState {
            left: FxIndexMap::default(),
            right: FxIndexMap::default(),
            right_fk: FxHashMap::default(),
            by_fk: FxHashMap::default(),
        }
    }

    /// The latest right value whose foreign key is `lk`, if any.
    pub(crate) fn latest_right(&self, lk: &LK) -> Option<&R> {
        self.by_fk
            .get(lk)
            .and_then(|rks| rks.last())
            .and_then(|rk| self.right.get(rk))
    }

    fn unlink(&mut self, rk: &RK) -> Option<LK> {
        let lk = self.right_fk.remove(rk)?;
        if let Some(rks) = self.by_fk.get_mut(&lk) {
            rks.retain(|existing| existing != rk);
            if rks.is_empty() {
                self.by_fk.remove(&lk);
            }
        }
        Some(lk)
    }

    fn link(&mut self, rk: RK, lk: LK) {
        self.right_fk.insert(rk.clone(), lk.clone());
        let rks = self.by_fk.entry(lk).or_default();
        if !rks.contains(&rk) {
            rks.push(rk);
        }
    }

    /// Applies one left-side change and returns the affected scope.
    fn apply_left(&mut self, change: &Change<LK, L>) -> SmallVec<[LK; 2]> {
        let key = change.key();
        match change.reason() {
            ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                self.left.insert(key.clone(), change.current().clone());
                SmallVec::from_iter(Some(key.clone()))
            }
            ChangeReason::Remove => {
                self.left.shift_remove(key);
                SmallVec::from_iter(Some(key.clone()))
            }
            ChangeReason::Moved => SmallVec::new(),
        }
    }

    /// Applies one right-side change and returns the affected scopes
    /// (the old and new foreign keys, when they differ).
    fn apply_right(
        &mut self,
        change: &Change<RK, R>,
        foreign_key: &ForeignKey<R, LK>,
    ) -> SmallVec<[LK; 2]> {
        let key = change.key();
        match change.reason() {
            ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                let target = foreign_key(change.current());
                let previous = self.right_fk.get(key).cloned();
                self.right.insert(key.clone(), change.current().clone());
                let mut scopes: SmallVec<[LK; 2]> = SmallVec::new();
                match previous {
                    Some(old) if old == target => {}
                    Some(old) => {
                        self.unlink(key);
                        scopes.push(old);
                    }
                    None => {}
                }
                self.link(key.clone(), target.clone());
                if !scopes.contains(&target) {
                    scopes.push(target);
                }
                scopes
            }
            ChangeReason::Remove => {
                self.right.shift_remove(key);
                match self.unlink(key) {
                    Some(old) => SmallVec::from_iter(Some(old)),
                    None => SmallVec::new(),
                }
            }
            ChangeReason::Moved => SmallVec::new(),
        }
    }
}

/// Derives the rows a given left-key scope should currently hold.
type RowDerive<LK, L, RK, R, OK, OV> =
    Arc<dyn Fn(&JoinState<LK, L, RK, R>, &LK) -> Vec<(OK, OV)> + Send + Sync>;

struct JoinEngine<LK: Key, L: Value, RK: Key, R: Value, OK: Key, OV: Value> {
    state: JoinState<LK, L, RK, R>,
    rows: FxHashMap<OK, OV>,
    scope_rows: FxHashMap<LK, SmallVec<[OK; 2]>>,
    left_done: bool,
    right_done: bool,
    faulted: bool,
}

struct JoinWork<LK: Key, L: Value, RK: Key, R: Value, OK: Key, OV: Value> {
    engine: Mutex<JoinEngine<LK, L, RK, R, OK, OV>>,
    derive: RowDerive<LK, L, RK, R, OK, OV>,
    downstream: SharedObserver<ChangeSet<OK, OV>>,
}

impl<LK: Key, L: Value, RK: Key, R: Value, OK: Key, OV: Value + PartialEq>
    JoinWork<LK, L, RK, R, OK, OV>
{
    /// Recomputes the rows of each scope and emits the minimal diff of
    /// row existence and row value.
    fn recompute(
        &self,
        engine: &mut JoinEngine<LK, L, RK, R, OK, OV>,
        scopes: impl IntoIterator<Item = LK>,
        out: &mut ChangeSet<OK, OV>,
    ) {
        for scope in scopes {
            let fresh = (self.derive)(&engine.state, &scope);
            let fresh_keys: SmallVec<[OK; 2]> =
                fresh.iter().map(|(key, _)| key.clone()).collect();
            let stale = engine.scope_rows.remove(&scope).unwrap_or_default();
            for row_key in stale.iter().filter(|k| !fresh_keys.contains(k)) {
                if let Some(old) = engine.rows.remove(row_key) {
                    out.push(Change::remove(row_key.clone(), old));
                }
            }
            for (row_key, row_value) in fresh {
                match engine.rows.insert(row_key.clone(), row_value.clone()) {
                    Some(old) => {
                        if old != row_value {
                            out.push(Change::update(row_key, row_value, old));
                        }
                    }
                    None => out.push(Change::add(row_key, row_value)),
                }
            }
            if !fresh_keys.is_empty() {
                engine.scope_rows.insert(scope, fresh_keys);
            }
        }
    }

    fn emit(&self, out: ChangeSet<OK, OV>) {
        if !out.is_empty() {
            self.downstream.lock().on_next(&out);
        }
    }

    fn complete_side(&self, left: bool) {
        let finished = {
            let mut engine = self.engine.lock();
            if left {
                engine.left_done = true;
            } else {
                engine.right_done = true;
            }
            engine.left_done && engine.right_done
        };
        if finished {
            self.downstream.lock().on_completed();
        }
    }

    fn fail(&self, error: &Error) {
        let first = {
            let mut engine = self.engine.lock();
            let first = !engine.faulted;
            engine.faulted = true;
            first
        };
        if first {
            self.downstream.lock().on_error(error);
        }
    }
}

struct LeftAdapter<LK: Key, L: Value, RK: Key, R: Value, OK: Key, OV: Value> {
    work: Arc<JoinWork<LK, L, RK, R, OK, OV>>,
}

impl<LK: Key, L: Value, RK: Key, R: Value, OK: Key, OV: Value + PartialEq>
    Observer<ChangeSet<LK, L>> for LeftAdapter<LK, L, RK, R, OK, OV>
{
    fn on_next(&mut self, changes: &ChangeSet<LK, L>) {
        let mut out = ChangeSet::new();
        {
            let mut engine = self.work.engine.lock();
            if engine.faulted {
                return;
            }
            for change in changes.iter() {
                let scopes = engine.state.apply_left(change);
                self.work.recompute(&mut engine, scopes, &mut out);
            }
        }
        self.work.emit(out);
    }

    fn on_completed(&mut self) {
        self.work.complete_side(true);
    }

    fn on_error(&mut self, error: &Error) {
        self.work.fail(error);
    }
}

struct RightAdapter<LK: Key, L: Value, RK: Key, R: Value, OK: Key, OV: Value> {
    work: Arc<JoinWork<LK, L, RK, R, OK, OV>>,
    foreign_key: ForeignKey<R, LK>,
}

impl<LK: Key, L: Value, RK: Key, R: Value, OK: Key, OV: Value + PartialEq>
    Observer<ChangeSet<RK, R>> for RightAdapter<LK, L, RK, R, OK, OV>
{
    fn on_next(&mut self, changes: &ChangeSet<RK, R>) {
        let mut out = ChangeSet::new();
        {
            let mut engine = self.work.engine.lock();
            if engine.faulted {
                return;
            }
            for change in changes.iter() {
                let scopes = engine.state.apply_right(change, &self.foreign_key);
                self.work.recompute(&mut engine, scopes, &mut out);
            }
        }
        self.work.emit(out);
    }

    fn on_completed(&mut self) {
        self.work.complete_side(false);
    }

    fn on_error(&mut self, error: &Error) {
        self.work.fail(error);
    }
}

/// A join over two keyed streams. Construction chooses the variant by
/// installing the row-derivation rule; see
/// [`ChangeStreamExt::inner_join`](super::ChangeStreamExt::inner_join)
/// and friends.
pub struct Join<SL, SR, LK, L, RK, R, OK, OV>
where
    LK: Key,
    L: Value,
    RK: Key,
    R: Value,
    OK: Key,
    OV: Value,
{
    left: SL,
    right: SR,
    foreign_key: ForeignKey<R, LK>,
    derive: RowDerive<LK, L, RK, R, OK, OV>,
    _marker: PhantomData<fn() -> (LK, L, RK, R, OK, OV)>,
}

impl<SL, SR, LK, L, RK, R, OK, OV> Join<SL, SR, LK, L, RK, R, OK, OV>
where
    LK: Key,
    L: Value,
    RK: Key,
    R: Value,
    OK: Key,
    OV: Value,
{
    fn with_derive(
        left: SL,
        right: SR,
        foreign_key: ForeignKey<R, LK>,
        derive: RowDerive<LK, L, RK, R, OK, OV>,
    ) -> Self {
        Join {
            left,
            right,
            foreign_key,
            derive,
            _marker: PhantomData,
        }
    }
}

impl<SL, SR, LK, L, RK, R, OV> Join<SL, SR, LK, L, RK, R, (LK, RK), OV>
where
    LK: Key,
    L: Value,
    RK: Key,
    R: Value,
    OV: Value,
{
    /// A row exists iff both sides are present for the composite key
    /// `(left_key, right_key)`.
    pub(crate) fn inner(
        left: SL,
        right: SR,
        foreign_key: ForeignKey<R, LK>,
        selector: Arc<dyn Fn(&L, &R) -> OV + Send + Sync>,
    ) -> Self {
        let derive: RowDerive<LK, L, RK, R, (LK, RK), OV> =
            Arc::new(move |state, lk| match state.left.get(lk) {
                Some(l) => state
                    .by_fk
                    .get(lk)
                    .into_iter()
                    .flatten()
                    .filter_map(|rk| {
                        let r = state.right.get(rk)?;
                        Some(((lk.clone(), rk.clone()), selector(l, r)))
                    })
                    .collect(),
                None => Vec::new(),
            });
        Self::with_derive(left, right, foreign_key, derive)
    }
}

impl<SL, SR, LK, L, RK, R, OV> Join<SL, SR, LK, L, RK, R, LK, OV>
where
    LK: Key,
    L: Value,
    RK: Key,
    R: Value,
    OV: Value,
{
    /// One row per left key; the right side is optional (the latest
    /// right value per foreign key when several exist).
    pub(crate) fn left_outer(
        left: SL,
        right: SR,
        foreign_key: ForeignKey<R, LK>,
        selector: Arc<dyn Fn(&LK, &L, Option<&R>) -> OV + Send + Sync>,
    ) -> Self {
        let derive: RowDerive<LK, L, RK, R, LK, OV> =
            Arc::new(move |state, lk| match state.left.get(lk) {
                Some(l) => vec![(lk.clone(), selector(lk, l, state.latest_right(lk)))],
                None => Vec::new(),
            });
        Self::with_derive(left, right, foreign_key, derive)
    }
}

impl<SL, SR, LK, L, RK, R, OV> Join<SL, SR, LK, L, RK, R, RK, OV>
where
    LK: Key,
    L: Value,
    RK: Key,
    R: Value,
    OV: Value,
{
    /// One row per right key; the left side is optional.
    pub(crate) fn right_outer(
        left: SL,
        right: SR,
        foreign_key: ForeignKey<R, LK>,
        selector: Arc<dyn Fn(&RK, Option<&L>, &R) -> OV + Send + Sync>,
    ) -> Self {
        let derive: RowDerive<LK, L, RK, R, RK, OV> = Arc::new(move |state, lk| {
            let l = state.left.get(lk);
            state
                .by_fk
                .get(lk)
                .into_iter()
                .flatten()
                .filter_map(|rk| {
                    let r = state.right.get(rk)?;
                    Some((rk.clone(), selector(rk, l, r)))
                })
                .collect()
        });
        Self::with_derive(left, right, foreign_key, derive)
    }
}

impl<SL, SR, LK, L, RK, R, OV> Join<SL, SR, LK, L, RK, R, FullKey<LK, RK>, OV>
where
    LK: Key,
    L: Value,
    RK: Key,
    R: Value,
    OV: Value,
{
    /// One row per left key and per unmatched right key; both sides
    /// optional.
    pub(crate) fn full_outer(
        left: SL,
        right: SR,
        foreign_key: ForeignKey<R, LK>,
        selector: Arc<dyn Fn(Option<&L>, Option<&R>) -> OV + Send + Sync>,
    ) -> Self {
        let derive: RowDerive<LK, L, RK, R, FullKey<LK, RK>, OV> =
            Arc::new(move |state, lk| match state.left.get(lk) {
                Some(l) => vec![(
                    FullKey::Left(lk.clone()),
                    selector(Some(l), state.latest_right(lk)),
                )],
                None => state
                    .by_fk
                    .get(lk)
                    .into_iter()
                    .flatten()
                    .filter_map(|rk| {
                        let r = state.right.get(rk)?;
                        Some((FullKey::Right(rk.clone()), selector(None, Some(r))))
                    })
                    .collect(),
            });
        Self::with_derive(left, right, foreign_key, derive)
    }
}

impl<SL, SR, LK, L, RK, R, OK, OV> Observable<ChangeSet<OK, OV>>
    for Join<SL, SR, LK, L, RK, R, OK, OV>
where
    SL: Observable<ChangeSet<LK, L>>,
    SR: Observable<ChangeSet<RK, R>>,
    LK: Key,
    L: Value,
    RK: Key,
    R: Value,
    OK: Key,
    OV: Value + PartialEq,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<OK, OV>>) -> Subscription {
        let work = Arc::new(JoinWork {
            engine: Mutex::new(JoinEngine {
                state: JoinState::new(),
                rows: FxHashMap::default(),
                scope_rows: FxHashMap::default(),
                left_done: false,
                right_done: false,
                faulted: false,
            }),
            derive: self.derive.clone(),
            downstream: Arc::new(Mutex::new(observer)),
        });

        let left_sub = self
            .left
            .subscribe_with(Box::new(LeftAdapter { work: work.clone() }));
        let right_sub = self.right.subscribe_with(Box::new(RightAdapter {
            work,
            foreign_key: self.foreign_key.clone(),
        }));
        left_sub.and(right_sub)
    }
}
