//! Keyed projection of one value type into another.

use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::stream::{
    BoxObservable, BoxObserver, Observable, Observer, SharedObserver, Subscription,
};
use crate::{FxIndexMap, Key, Value};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;

/// The projection function: `(key, current, previous) -> U`, fallible.
pub type TransformFactory<K, V, U> =
    Arc<dyn Fn(&K, &V, Option<&V>) -> Result<U, Error> + Send + Sync>;

/// Selects which items a force-transform event recomputes.
pub type ForcePredicate<K, V> = Arc<dyn Fn(&K, &V) -> bool + Send + Sync>;

/// Receives `(key, source_value, error)` when the factory fails and an
/// error handler is installed; the offending change is dropped.
pub type TransformErrorHandler<K, V> = Arc<dyn Fn(&K, &V, &Error) + Send + Sync>;

enum UpdateMode<V, U> {
    /// Recreate the projected value through the factory.
    Recreate,
    /// Mutate the previously produced value in place and emit
    /// `Refresh` instead of `Update`.
    InPlace(Arc<dyn Fn(&mut U, &V) + Send + Sync>),
}

impl<V, U> Clone for UpdateMode<V, U> {
    fn clone(&self) -> Self {
        match self {
            UpdateMode::Recreate => UpdateMode::Recreate,
            UpdateMode::InPlace(action) => UpdateMode::InPlace(action.clone()),
        }
    }
}

/// The keyed transform operator. Built by
/// [`ChangeStreamExt::transform`](super::ChangeStreamExt::transform)
/// and refined with the builder methods here.
pub struct Transform<S, K, V, U> {
    upstream: S,
    factory: TransformFactory<K, V, U>,
    transform_on_refresh: bool,
    force: Option<BoxObservable<ForcePredicate<K, V>>>,
    error_handler: Option<TransformErrorHandler<K, V>>,
    update_mode: UpdateMode<V, U>,
    _marker: PhantomData<fn() -> (K, V, U)>,
}

impl<S, K: Key, V: Value, U: Value> Transform<S, K, V, U> {
    pub(crate) fn new(upstream: S, factory: TransformFactory<K, V, U>) -> Self {
        Transform {
            upstream,
            factory,
            transform_on_refresh: false,
            force: None,
            error_handler: None,
            update_mode: UpdateMode::Recreate,
            _marker: PhantomData,
        }
    }

    pub(crate) fn in_place(mut self, action: impl Fn(&mut U, &V) + Send + Sync + 'static) -> Self {
        self.update_mode = UpdateMode::InPlace(Arc::new(action));
        self
    }

    /// Recompute (rather than forward) on upstream `Refresh`.
    pub fn retransform_on_refresh(mut self, enabled: bool) -> Self {
        self.transform_on_refresh = enabled;
        self
    }

    /// Recompute every item matched by each predicate the stream
    /// emits.
    pub fn with_force<F>(mut self, force: F) -> Self
    where
        F: Observable<ForcePredicate<K, V>> + Send + Sync + 'static,
    {
        self.force = Some(Arc::new(force));
        self
    }

    /// Install an error handler: factory failures drop the offending
    /// change instead of faulting the stream.
    pub fn with_error_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn(&K, &V, &Error) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}

struct TransformState<K, V, U> {
    mirror: FxIndexMap<K, U>,
    /// Source values, kept only when a force stream can recompute.
    universe: Option<FxIndexMap<K, V>>,
    faulted: bool,
}

struct TransformWork<K, V, U> {
    factory: TransformFactory<K, V, U>,
    transform_on_refresh: bool,
    error_handler: Option<TransformErrorHandler<K, V>>,
    update_mode: UpdateMode<V, U>,
    state: Arc<Mutex<TransformState<K, V, U>>>,
    downstream: SharedObserver<ChangeSet<K, U>>,
}

impl<K: Key, V: Value, U: Value> TransformWork<K, V, U> {
    /// Runs the factory; `Ok(None)` means the change was dropped by the
    /// error handler, `Err` means the stream faulted.
    fn produce(&self, key: &K, value: &V, previous: Option<&V>) -> Result<Option<U>, ()> {
        match (self.factory)(key, value, previous) {
            Ok(projected) => Ok(Some(projected)),
            Err(error) => match &self.error_handler {
                Some(handler) => {
                    handler(key, value, &error);
                    Ok(None)
                }
                None => {
                    self.state.lock().faulted = true;
                    self.downstream.lock().on_error(&error);
                    Err(())
                }
            },
        }
    }

    fn apply_batch(&self, changes: &ChangeSet<K, V>) {
        if self.state.lock().faulted {
            return;
        }
        let mut out = ChangeSet::new();
        for change in changes.iter() {
            if self.apply(change, &mut out).is_err() {
                return;
            }
        }
        if !out.is_empty() {
            self.downstream.lock().on_next(&out);
        }
    }

    fn apply(&self, change: &Change<K, V>, out: &mut ChangeSet<K, U>) -> Result<(), ()> {
        let key = change.key();
        let value = change.current();
        match change.reason() {
            ChangeReason::Add => {
                let projected = match self.produce(key, value, None)? {
                    Some(projected) => projected,
                    None => return Ok(()),
                };
                let mut state = self.state.lock();
                if let Some(universe) = &mut state.universe {
                    universe.insert(key.clone(), value.clone());
                }
                match state.mirror.insert(key.clone(), projected.clone()) {
                    Some(old) => out.push(Change::update(key.clone(), projected, old)),
                    None => out.push(Change::add(key.clone(), projected)),
                }
            }
            ChangeReason::Update => match self.update_mode.clone() {
                UpdateMode::Recreate => {
                    let projected = match self.produce(key, value, change.previous())? {
                        Some(projected) => projected,
                        None => return Ok(()),
                    };
                    let mut state = self.state.lock();
                    if let Some(universe) = &mut state.universe {
                        universe.insert(key.clone(), value.clone());
                    }
                    match state.mirror.insert(key.clone(), projected.clone()) {
                        Some(old) => out.push(Change::update(key.clone(), projected, old)),
                        None => out.push(Change::add(key.clone(), projected)),
                    }
                }
                UpdateMode::InPlace(action) => {
                    let mut state = self.state.lock();
                    if let Some(universe) = &mut state.universe {
                        universe.insert(key.clone(), value.clone());
                    }
                    match state.mirror.get_mut(key) {
                        Some(existing) => {
                            action(existing, value);
                            let refreshed = existing.clone();
                            out.push(Change::refresh(key.clone(), refreshed));
                        }
                        None => {
                            drop(state);
                            let projected = match self.produce(key, value, change.previous())? {
                                Some(projected) => projected,
                                None => return Ok(()),
                            };
                            self.state
                                .lock()
                                .mirror
                                .insert(key.clone(), projected.clone());
                            out.push(Change::add(key.clone(), projected));
                        }
                    }
                }
            },
            ChangeReason::Remove => {
                let mut state = self.state.lock();
                if let Some(universe) = &mut state.universe {
                    universe.shift_remove(key);
                }
                if let Some(old) = state.mirror.shift_remove(key) {
                    out.push(Change::remove(key.clone(), old));
                }
            }
            ChangeReason::Refresh => {
                if self.transform_on_refresh {
                    match self.update_mode.clone() {
                        UpdateMode::Recreate => {
                            let projected = match self.produce(key, value, None)? {
                                Some(projected) => projected,
                                None => return Ok(()),
                            };
                            let mut state = self.state.lock();
                            if let Some(universe) = &mut state.universe {
                                universe.insert(key.clone(), value.clone());
                            }
                            match state.mirror.insert(key.clone(), projected.clone()) {
                                Some(old) => {
                                    out.push(Change::update(key.clone(), projected, old))
                                }
                                None => out.push(Change::add(key.clone(), projected)),
                            }
                        }
                        UpdateMode::InPlace(action) => {
                            let mut state = self.state.lock();
                            if let Some(universe) = &mut state.universe {
                                universe.insert(key.clone(), value.clone());
                            }
                            if let Some(existing) = state.mirror.get_mut(key) {
                                action(existing, value);
                                let refreshed = existing.clone();
                                out.push(Change::refresh(key.clone(), refreshed));
                            }
                        }
                    }
                } else {
                    let mut state = self.state.lock();
                    if let Some(universe) = &mut state.universe {
                        universe.insert(key.clone(), value.clone());
                    }
                    if let Some(existing) = state.mirror.get(key) {
                        out.push(Change::refresh(key.clone(), existing.clone()));
                    }
                }
            }
            ChangeReason::Moved => {
                let state = self.state.lock();
                if let Some(existing) = state.mirror.get(key) {
                    out.push(Change::moved(
                        key.clone(),
                        existing.clone(),
                        change.current_index(),
                        change.previous_index(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Recomputes every item matched by `which` and emits the updates.
    fn force(&self, which: &ForcePredicate<K, V>) {
        if self.state.lock().faulted {
            return;
        }
        let targets: Vec<(K, V)> = {
            let state = self.state.lock();
            let universe = state
                .universe
                .as_ref()
                .expect("force-transform requires universe tracking");
            universe
                .iter()
                .filter(|(k, v)| which(k, v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        log::debug!("force-transform recomputing {} items", targets.len());
        let mut out = ChangeSet::new();
        for (key, value) in targets {
            let projected = match self.produce(&key, &value, None) {
                Ok(Some(projected)) => projected,
                Ok(None) => continue,
                Err(()) => return,
            };
            let mut state = self.state.lock();
            match state.mirror.insert(key.clone(), projected.clone()) {
                Some(old) => out.push(Change::update(key, projected, old)),
                None => out.push(Change::add(key, projected)),
            }
        }
        if !out.is_empty() {
            self.downstream.lock().on_next(&out);
        }
    }
}

struct TransformAdapter<K: Key, V: Value, U: Value> {
    work: Arc<TransformWork<K, V, U>>,
}

impl<K: Key, V: Value, U: Value> Observer<ChangeSet<K, V>> for TransformAdapter<K, V, U> {
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

struct ForceAdapter<K: Key, V: Value, U: Value> {
    work: Arc<TransformWork<K, V, U>>,
}

impl<K: Key, V: Value, U: Value> Observer<ForcePredicate<K, V>> for ForceAdapter<K, V, U> {
    fn on_next(&mut self, which: &ForcePredicate<K, V>) {
        self.work.force(which);
    }
}

impl<S, K, V, U> Observable<ChangeSet<K, U>> for Transform<S, K, V, U>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
    U: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, U>>) -> Subscription {
        let state = Arc::new(Mutex::new(TransformState {
            mirror: FxIndexMap::default(),
            universe: if self.force.is_some() {
                Some(FxIndexMap::default())
            } else {
                None
            },
            faulted: false,
        }));
        let work = Arc::new(TransformWork {
            factory: self.factory.clone(),
            transform_on_refresh: self.transform_on_refresh,
            error_handler: self.error_handler.clone(),
            update_mode: self.update_mode.clone(),
            state,
            downstream: Arc::new(Mutex::new(observer)),
        });

        let mut subscription = self
            .upstream
            .subscribe_with(Box::new(TransformAdapter { work: work.clone() }));
        if let Some(force) = &self.force {
            let sub = force.subscribe_with(Box::new(ForceAdapter { work }));
            subscription = subscription.and(sub);
        }
        subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ChangeStreamExt;
    use crate::stream::{ObservableExt, Subject};

    #[test]
    fn projects_adds_updates_and_removes() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let seen: Arc<Mutex<Vec<ChangeSet<u32, String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = upstream
            .clone()
            .transform(|v: &i32| format!("#{}", v))
            .subscribe(move |c: &ChangeSet<u32, String>| sink.lock().push(c.clone()));

        upstream.publish(&ChangeSet::single(Change::add(1, 5)));
        upstream.publish(&ChangeSet::single(Change::update(1, 6, 5)));
        upstream.publish(&ChangeSet::single(Change::remove(1, 6)));

        let seen = seen.lock();
        assert_eq!(seen[0][0].current(), "#5");
        assert_eq!(seen[1][0].reason(), ChangeReason::Update);
        assert_eq!(seen[1][0].current(), "#6");
        assert_eq!(seen[1][0].previous(), Some(&"#5".to_string()));
        assert_eq!(seen[2][0].reason(), ChangeReason::Remove);
        assert_eq!(seen[2][0].current(), "#6");
    }

    #[test]
    fn refresh_forwards_old_projection_unless_opted_in() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = upstream
            .clone()
            .transform(|v: &i32| v * 10)
            .subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

        upstream.publish(&ChangeSet::single(Change::add(1, 1)));
        upstream.publish(&ChangeSet::single(Change::refresh(1, 2)));

        let seen = seen.lock();
        assert_eq!(seen[1][0].reason(), ChangeReason::Refresh);
        // The stale projection is forwarded untouched.
        assert_eq!(seen[1][0].current(), &10);
    }

    #[test]
    fn refresh_recomputes_when_opted_in() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = upstream
            .clone()
            .transform(|v: &i32| v * 10)
            .retransform_on_refresh(true)
            .subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

        upstream.publish(&ChangeSet::single(Change::add(1, 1)));
        upstream.publish(&ChangeSet::single(Change::refresh(1, 2)));

        let seen = seen.lock();
        assert_eq!(seen[1][0].reason(), ChangeReason::Update);
        assert_eq!(seen[1][0].current(), &20);
    }

    #[test]
    fn error_handler_drops_the_offending_change() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let handled: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let errors = handled.clone();
        let _sub = upstream
            .clone()
            .try_transform(|_k: &u32, v: &i32, _prev: Option<&i32>| {
                if *v < 0 {
                    Err(Error::new("negative input"))
                } else {
                    Ok(*v * 2)
                }
            })
            .with_error_handler(move |k: &u32, _v: &i32, _e: &Error| errors.lock().push(*k))
            .subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

        upstream.publish(&ChangeSet::single(Change::add(1, 3)));
        upstream.publish(&ChangeSet::single(Change::add(2, -1)));
        upstream.publish(&ChangeSet::single(Change::add(3, 4)));

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(*handled.lock(), vec![2]);
    }

    #[test]
    fn factory_failure_without_handler_faults_the_stream() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let faults = Arc::new(Mutex::new(Vec::new()));
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let errs = faults.clone();
        let _sub = upstream
            .clone()
            .try_transform(|_k: &u32, _v: &i32, _prev: Option<&i32>| {
                Err(Error::new("always fails"))
            })
            .subscribe_all(
                move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()),
                || {},
                move |e: &Error| errs.lock().push(e.clone()),
            );

        upstream.publish(&ChangeSet::single(Change::add(1, 1)));
        upstream.publish(&ChangeSet::single(Change::add(2, 2)));

        assert!(seen.lock().is_empty());
        assert_eq!(faults.lock().len(), 1);
    }

    #[test]
    fn in_place_variant_emits_refresh() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let seen: Arc<Mutex<Vec<ChangeSet<u32, Vec<i32>>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = upstream
            .clone()
            .transform_in_place(
                |v: &i32| vec![*v],
                |acc: &mut Vec<i32>, v: &i32| acc.push(*v),
            )
            .subscribe(move |c: &ChangeSet<u32, Vec<i32>>| sink.lock().push(c.clone()));

        upstream.publish(&ChangeSet::single(Change::add(1, 1)));
        upstream.publish(&ChangeSet::single(Change::update(1, 2, 1)));

        let seen = seen.lock();
        assert_eq!(seen[1][0].reason(), ChangeReason::Refresh);
        assert_eq!(seen[1][0].current(), &vec![1, 2]);
    }

    #[test]
    fn moved_is_remapped() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = upstream
            .clone()
            .transform(|v: &i32| v + 100)
            .subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

        upstream.publish(&ChangeSet::single(Change::add(1, 1)));
        upstream.publish(&ChangeSet::single(Change::moved(1, 1, 3, 0)));

        let seen = seen.lock();
        assert_eq!(seen[1][0].reason(), ChangeReason::Moved);
        assert_eq!(seen[1][0].current(), &101);
        assert_eq!(seen[1][0].current_index(), 3);
        assert_eq!(seen[1][0].previous_index(), 0);
    }
}
