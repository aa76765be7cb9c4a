//! Minimal push-based stream primitives.
//!
//! The library does not sit on a full reactive runtime; it needs only
//! these pieces: an [`Observer`] receiving pushed values, an
//! [`Observable`] that observers subscribe to, a multicasting
//! [`Subject`], and an RAII [`Subscription`] guaranteeing release.
//!
//! [`Subject`] dispatch is re-entrancy safe: a value published from
//! inside a callback on the same thread is queued and delivered after
//! the in-flight dispatch finishes, so commit order is preserved and no
//! observer is ever entered recursively.

use crate::error::Error;
use parking_lot::{Mutex, ReentrantMutex};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Receives values pushed by an [`Observable`].
///
/// `on_completed` and `on_error` are terminal; a well-behaved producer
/// calls at most one of them, once, and nothing afterwards.
pub trait Observer<T>: Send {
    /// Called for every published value.
    fn on_next(&mut self, value: &T);

    /// Called when the producer finishes normally.
    fn on_completed(&mut self) {}

    /// Called when the producer faults.
    fn on_error(&mut self, error: &Error) {
        let _ = error;
    }
}

/// A boxed observer, the object-safe currency of [`Observable`].
pub type BoxObserver<T> = Box<dyn Observer<T>>;

/// An observer shared between several internal adapters.
pub(crate) type SharedObserver<T> = Arc<Mutex<BoxObserver<T>>>;

/// A source of pushed values.
///
/// Streams in this library are *cold* unless documented otherwise: each
/// subscription wires its own state to the upstream. Subscribing twice
/// yields two independent propagations.
pub trait Observable<T> {
    /// Registers `observer` and returns the guard that releases it.
    fn subscribe_with(&self, observer: BoxObserver<T>) -> Subscription;
}

/// A reference-counted, type-erased observable, used wherever a stream
/// must be stored dynamically (predicate streams, triggers, requests).
pub type BoxObservable<T> = Arc<dyn Observable<T> + Send + Sync>;

impl<T, S> Observable<T> for Arc<S>
where
    S: Observable<T> + ?Sized,
{
    fn subscribe_with(&self, observer: BoxObserver<T>) -> Subscription {
        (**self).subscribe_with(observer)
    }
}

/// Convenience subscription helpers for every observable.
pub trait ObservableExt<T: 'static>: Observable<T> {
    /// Subscribes with a value callback only.
    fn subscribe<F>(&self, next: F) -> Subscription
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.subscribe_with(Box::new(FnObserver {
            next,
            completed: None::<fn()>,
            error: None::<fn(&Error)>,
            _marker: PhantomData,
        }))
    }

    /// Subscribes with value, completion and error callbacks.
    fn subscribe_all<F, C, E>(&self, next: F, completed: C, error: E) -> Subscription
    where
        F: FnMut(&T) + Send + 'static,
        C: FnMut() + Send + 'static,
        E: FnMut(&Error) + Send + 'static,
    {
        self.subscribe_with(Box::new(FnObserver {
            next,
            completed: Some(completed),
            error: Some(error),
            _marker: PhantomData,
        }))
    }
}

impl<T: 'static, S: Observable<T> + ?Sized> ObservableExt<T> for S {}

struct FnObserver<T, F, C, E> {
    next: F,
    completed: Option<C>,
    error: Option<E>,
    _marker: PhantomData<fn(&T)>,
}

impl<T, F, C, E> Observer<T> for FnObserver<T, F, C, E>
where
    F: FnMut(&T) + Send,
    C: FnMut() + Send,
    E: FnMut(&Error) + Send,
{
    fn on_next(&mut self, value: &T) {
        (self.next)(value)
    }

    fn on_completed(&mut self) {
        if let Some(completed) = &mut self.completed {
            completed()
        }
    }

    fn on_error(&mut self, error: &Error) {
        if let Some(handler) = &mut self.error {
            handler(error)
        }
    }
}

/// An RAII guard for a subscribed resource.
///
/// Dropping the guard (or calling [`unsubscribe`](Self::unsubscribe))
/// releases the resource exactly once: the observer is removed, and any
/// per-item inner subscriptions the operator held are released too.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps a release action.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            action: Some(Box::new(action)),
        }
    }

    /// A guard that releases nothing.
    pub fn empty() -> Self {
        Subscription { action: None }
    }

    /// Releases the resource now.
    pub fn unsubscribe(mut self) {
        self.run();
    }

    /// Combines two guards into one releasing both, in order.
    pub fn and(mut self, mut other: Subscription) -> Subscription {
        let first = self.action.take();
        let second = other.action.take();
        Subscription::new(move || {
            if let Some(f) = first {
                f();
            }
            if let Some(f) = second {
                f();
            }
        })
    }

    /// Keeps the resource subscribed for the rest of the process
    /// lifetime.
    pub fn detach(mut self) {
        self.action = None;
    }

    fn run(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("live", &self.action.is_some())
            .finish()
    }
}

enum Terminal {
    Completed,
    Failed(Error),
}

enum QueueItem<T> {
    Next(T),
    Complete,
    Fail(Error),
}

struct Entry<T> {
    id: u64,
    observer: Arc<Mutex<BoxObserver<T>>>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Entry {
            id: self.id,
            observer: self.observer.clone(),
        }
    }
}

struct Registry<T> {
    observers: Vec<Entry<T>>,
    queue: VecDeque<QueueItem<T>>,
    next_id: u64,
    dispatching: bool,
    terminal: Option<Terminal>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Registry {
            observers: Vec::new(),
            queue: VecDeque::new(),
            next_id: 0,
            dispatching: false,
            terminal: None,
        }
    }
}

type SubjectInner<T> = ReentrantMutex<RefCell<Registry<T>>>;

/// A multicasting hot stream.
///
/// Observers are notified in registration order. A panicking observer
/// is isolated: it is dropped from the registry with a warning and its
/// peers are unaffected. Terminal state is sticky; late subscribers are
/// notified immediately.
pub struct Subject<T> {
    inner: Arc<SubjectInner<T>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Subject {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Subject<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subject<T>
where
    T: Send + 'static,
{
    /// Creates a subject with no observers.
    pub fn new() -> Self {
        Subject {
            inner: Arc::new(ReentrantMutex::new(RefCell::new(Registry::new()))),
        }
    }

    /// Publishes a value to every observer.
    ///
    /// Publishing from inside a callback of this same subject (on the
    /// same thread) queues the value; it is delivered after the
    /// in-flight dispatch, preserving publication order.
    pub fn publish(&self, value: &T)
    where
        T: Clone,
    {
        self.enqueue(QueueItem::Next(value.clone()));
    }

    /// Completes the subject. Idempotent.
    pub fn complete(&self) {
        self.enqueue(QueueItem::Complete);
    }

    /// Faults the subject. Idempotent with respect to other terminals.
    pub fn fail(&self, error: Error) {
        self.enqueue(QueueItem::Fail(error));
    }

    /// Number of registered observers (for diagnostics and tests).
    pub fn observer_count(&self) -> usize {
        let guard = self.inner.lock();
        let count = guard.borrow().observers.len();
        count
    }

    /// Whether at least one observer is registered.
    pub fn has_observers(&self) -> bool {
        self.observer_count() > 0
    }

    fn enqueue(&self, item: QueueItem<T>) {
        let guard = self.inner.lock();
        {
            let mut registry = guard.borrow_mut();
            if registry.terminal.is_some() {
                return;
            }
            registry.queue.push_back(item);
            if registry.dispatching {
                // A dispatch is already draining the queue further up
                // this thread's stack; it will pick this item up.
                return;
            }
            registry.dispatching = true;
        }

        loop {
            let item = {
                let mut registry = guard.borrow_mut();
                match registry.queue.pop_front() {
                    Some(item) => item,
                    None => {
                        registry.dispatching = false;
                        break;
                    }
                }
            };
            match item {
                QueueItem::Next(value) => {
                    let entries: Vec<Entry<T>> = guard.borrow().observers.clone();
                    for entry in entries {
                        let still_subscribed =
                            guard.borrow().observers.iter().any(|e| e.id == entry.id);
                        if !still_subscribed {
                            continue;
                        }
                        let outcome = catch_unwind(AssertUnwindSafe(|| {
                            entry.observer.lock().on_next(&value)
                        }));
                        if outcome.is_err() {
                            log::warn!("observer panicked during on_next; unsubscribing it");
                            guard.borrow_mut().observers.retain(|e| e.id != entry.id);
                        }
                    }
                }
                QueueItem::Complete => {
                    let entries = {
                        let mut registry = guard.borrow_mut();
                        registry.terminal = Some(Terminal::Completed);
                        registry.queue.clear();
                        std::mem::take(&mut registry.observers)
                    };
                    for entry in entries {
                        let _ = catch_unwind(AssertUnwindSafe(|| {
                            entry.observer.lock().on_completed()
                        }));
                    }
                }
                QueueItem::Fail(error) => {
                    let entries = {
                        let mut registry = guard.borrow_mut();
                        registry.terminal = Some(Terminal::Failed(error.clone()));
                        registry.queue.clear();
                        std::mem::take(&mut registry.observers)
                    };
                    for entry in entries {
                        let _ = catch_unwind(AssertUnwindSafe(|| {
                            entry.observer.lock().on_error(&error)
                        }));
                    }
                }
            }
        }
    }
}

impl<T> Observable<T> for Subject<T>
where
    T: Send + 'static,
{
    fn subscribe_with(&self, mut observer: BoxObserver<T>) -> Subscription {
        let guard = self.inner.lock();
        let terminal_notice = {
            let registry = guard.borrow();
            match &registry.terminal {
                Some(Terminal::Completed) => Some(None),
                Some(Terminal::Failed(error)) => Some(Some(error.clone())),
                None => None,
            }
        };
        if let Some(failure) = terminal_notice {
            match failure {
                Some(error) => observer.on_error(&error),
                None => observer.on_completed(),
            }
            return Subscription::empty();
        }

        let id = {
            let mut registry = guard.borrow_mut();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.observers.push(Entry {
                id,
                observer: Arc::new(Mutex::new(observer)),
            });
            id
        };

        let weak: Weak<SubjectInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let guard = inner.lock();
                guard.borrow_mut().observers.retain(|e| e.id != id);
            }
        })
    }
}

/// A scoped-resource map keyed by `K`.
///
/// Each slot owns one [`Subscription`]; inserting over an existing key
/// releases the previous resource, and removing a key (or dropping the
/// whole map) releases deterministically. Operators use this for
/// per-item inner subscriptions.
pub struct KeyedSubscriptions<K> {
    slots: FxHashMap<K, Subscription>,
}

impl<K: Hash + Eq> KeyedSubscriptions<K> {
    /// An empty map.
    pub fn new() -> Self {
        KeyedSubscriptions {
            slots: FxHashMap::default(),
        }
    }

    /// Stores `subscription` under `key`, releasing any previous one.
    pub fn insert(&mut self, key: K, subscription: Subscription) {
        self.slots.insert(key, subscription);
    }

    /// Releases and removes the resource under `key`, if any.
    pub fn remove(&mut self, key: &K) {
        self.slots.remove(key);
    }

    /// Releases everything.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the map holds no resources.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K: Hash + Eq> Default for KeyedSubscriptions<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// A cold observable produced by a factory at subscription time.
pub struct Defer<T, S, F>
where
    S: Observable<T>,
    F: Fn() -> S,
{
    factory: F,
    _marker: PhantomData<fn() -> (T, S)>,
}

/// Defers creation of a stream until an observer subscribes.
pub fn defer<T, S, F>(factory: F) -> Defer<T, S, F>
where
    S: Observable<T>,
    F: Fn() -> S,
{
    Defer {
        factory,
        _marker: PhantomData,
    }
}

impl<T, S, F> Observable<T> for Defer<T, S, F>
where
    S: Observable<T>,
    F: Fn() -> S,
{
    fn subscribe_with(&self, observer: BoxObserver<T>) -> Subscription {
        (self.factory)().subscribe_with(observer)
    }
}

/// A shared (multicast) view over a cold upstream.
///
/// The upstream is subscribed when the first observer arrives and
/// released when the last observer leaves; observers in between share
/// one propagation.
pub struct Share<T> {
    upstream: BoxObservable<T>,
    state: Arc<Mutex<ShareState<T>>>,
}

struct ShareState<T> {
    subject: Subject<T>,
    upstream_sub: Option<Subscription>,
    observers: usize,
}

impl<T> Share<T>
where
    T: Clone + Send + 'static,
{
    /// Wraps `upstream` in a reference-counted multicast.
    pub fn new(upstream: BoxObservable<T>) -> Self {
        Share {
            upstream,
            state: Arc::new(Mutex::new(ShareState {
                subject: Subject::new(),
                upstream_sub: None,
                observers: 0,
            })),
        }
    }
}

impl<T> Observable<T> for Share<T>
where
    T: Clone + Send + 'static,
{
    fn subscribe_with(&self, observer: BoxObserver<T>) -> Subscription {
        let mut state = self.state.lock();
        let inner = state.subject.subscribe_with(observer);
        state.observers += 1;
        if state.observers == 1 {
            let subject = state.subject.clone();
            let complete_subject = subject.clone();
            let fail_subject = subject.clone();
            state.upstream_sub = Some(self.upstream.subscribe_all(
                move |value: &T| subject.publish(value),
                move || complete_subject.complete(),
                move |error: &Error| fail_subject.fail(error.clone()),
            ));
        }
        drop(state);

        let shared = self.state.clone();
        let countdown = Subscription::new(move || {
            let mut state = shared.lock();
            state.observers = state.observers.saturating_sub(1);
            if state.observers == 0 {
                state.upstream_sub = None;
            }
        });
        inner.and(countdown)
    }
}

/// Serializes an arbitrary stream onto its own mutex, so observers see
/// non-overlapping callbacks even when the upstream publishes from
/// multiple threads.
pub struct Synchronize<S> {
    upstream: S,
}

impl<S> Synchronize<S> {
    /// Wraps `upstream`.
    pub fn new(upstream: S) -> Self {
        Synchronize { upstream }
    }
}

impl<T: 'static, S> Observable<T> for Synchronize<S>
where
    S: Observable<T>,
{
    fn subscribe_with(&self, observer: BoxObserver<T>) -> Subscription {
        let downstream: SharedObserver<T> = Arc::new(Mutex::new(observer));
        let next = downstream.clone();
        let completed = downstream.clone();
        let failed = downstream;
        self.upstream.subscribe_all(
            move |value: &T| next.lock().on_next(value),
            move || completed.lock().on_completed(),
            move |error: &Error| failed.lock().on_error(error),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subject_notifies_in_registration_order() {
        let subject: Subject<u32> = Subject::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        let _a = subject.subscribe(move |v: &u32| first.lock().push(("a", *v)));
        let second = seen.clone();
        let _b = subject.subscribe(move |v: &u32| second.lock().push(("b", *v)));

        subject.publish(&7);
        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let subject: Subject<u32> = Subject::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = subject.subscribe(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        subject.publish(&1);
        drop(sub);
        subject.publish(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_publish_is_queued_not_recursive() {
        let subject: Subject<u32> = Subject::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let reentrant = subject.clone();
        let log = seen.clone();
        let _sub = subject.subscribe(move |v: &u32| {
            log.lock().push(*v);
            if *v == 1 {
                // Must not recurse into this observer; delivered after.
                reentrant.publish(&2);
            }
        });

        subject.publish(&1);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn panicking_observer_is_isolated() {
        let subject: Subject<u32> = Subject::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = subject.subscribe(|v: &u32| {
            if *v == 1 {
                panic!("observer bug");
            }
        });
        let counter = hits.clone();
        let _good = subject.subscribe(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        subject.publish(&1);
        subject.publish(&2);
        // The good observer saw both values; the bad one was dropped.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(subject.observer_count(), 1);
    }

    #[test]
    fn terminal_state_is_sticky() {
        let subject: Subject<u32> = Subject::new();
        subject.complete();

        let completed = Arc::new(AtomicUsize::new(0));
        let counter = completed.clone();
        let _sub = subject.subscribe_all(
            |_: &u32| {},
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        );
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        // Publishing after completion is a no-op.
        subject.publish(&1);
    }

    #[test]
    fn keyed_subscriptions_release_on_replace_and_clear() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut map = KeyedSubscriptions::new();

        let track = |released: &Arc<AtomicUsize>| {
            let counter = released.clone();
            Subscription::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        map.insert(1, track(&released));
        map.insert(2, track(&released));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        map.insert(1, track(&released));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        map.remove(&2);
        assert_eq!(released.load(Ordering::SeqCst), 2);

        map.clear();
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn share_subscribes_upstream_once() {
        let source: Subject<u32> = Subject::new();
        let shared = Share::new(Arc::new(source.clone()) as BoxObservable<u32>);

        let a_hits = Arc::new(AtomicUsize::new(0));
        let b_hits = Arc::new(AtomicUsize::new(0));
        let a = a_hits.clone();
        let b = b_hits.clone();
        let sub_a = shared.subscribe(move |_: &u32| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let sub_b = shared.subscribe(move |_: &u32| {
            b.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(source.observer_count(), 1);

        source.publish(&1);
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b_hits.load(Ordering::SeqCst), 1);

        drop(sub_a);
        drop(sub_b);
        assert_eq!(source.observer_count(), 0);
    }
}
