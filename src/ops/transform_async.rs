//! Asynchronous keyed projection: the factory returns a future and
//! results are emitted in completion order.

use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::stream::{BoxObserver, Observable, Observer, SharedObserver, Subscription};
use crate::{FxIndexMap, Key, Value};
use futures_channel::mpsc;
use futures_util::stream::{FuturesUnordered, Stream, StreamExt};
use futures_util::task::ArcWake;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::Thread;

/// A boxed future used by the async transform factory.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type AsyncFactory<K, V, U> =
    Arc<dyn Fn(K, V, Option<V>) -> BoxFuture<'static, U> + Send + Sync>;

/// The asynchronous transform operator. Built by
/// [`ChangeStreamExt::transform_async`](super::ChangeStreamExt::transform_async).
///
/// Contract mirrors the synchronous transform, except:
/// emission order is completion order; at most `max_concurrency`
/// factory futures are in flight per subscription; a completion that
/// was superseded (the key was re-transformed or removed meanwhile) is
/// discarded, and in-flight work for removed keys is dropped.
pub struct TransformAsync<S, K, V, U> {
    upstream: S,
    factory: AsyncFactory<K, V, U>,
    max_concurrency: usize,
    _marker: PhantomData<fn() -> (K, V, U)>,
}

impl<S, K, V, U> TransformAsync<S, K, V, U> {
    pub(crate) fn new(upstream: S, factory: AsyncFactory<K, V, U>, max_concurrency: usize) -> Self {
        TransformAsync {
            upstream,
            factory,
            max_concurrency: max_concurrency.max(1),
            _marker: PhantomData,
        }
    }
}

struct AsyncState<K, U> {
    /// Latest issued generation per key; completions from older
    /// generations are stale and dropped.
    epochs: FxHashMap<K, u64>,
    mirror: FxIndexMap<K, U>,
    upstream_done: bool,
    cancelled: bool,
}

struct Job<K, U> {
    key: K,
    epoch: u64,
    future: BoxFuture<'static, U>,
}

struct Tagged<K, U> {
    key: Option<K>,
    epoch: u64,
    inner: BoxFuture<'static, U>,
}

impl<K: Unpin, U> Future for Tagged<K, U> {
    type Output = (K, u64, U);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.inner.as_mut().poll(cx) {
            Poll::Ready(value) => {
                let key = this.key.take().expect("future polled after completion");
                Poll::Ready((key, this.epoch, value))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

struct ThreadWaker {
    thread: Thread,
}

impl ArcWake for ThreadWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.thread.unpark();
    }
}

fn worker<K: Key + Unpin, U: Value>(
    mut jobs: mpsc::UnboundedReceiver<Job<K, U>>,
    state: Arc<Mutex<AsyncState<K, U>>>,
    downstream: SharedObserver<ChangeSet<K, U>>,
    max_concurrency: usize,
) {
    let waker = futures_util::task::waker(Arc::new(ThreadWaker {
        thread: std::thread::current(),
    }));
    let mut cx = Context::from_waker(&waker);
    let mut in_flight: FuturesUnordered<Tagged<K, U>> = FuturesUnordered::new();
    let mut backlog: VecDeque<Job<K, U>> = VecDeque::new();
    let mut inbox_closed = false;

    loop {
        if state.lock().cancelled {
            return;
        }

        // Pull new work while the inbox has any.
        while !inbox_closed {
            match Pin::new(&mut jobs).poll_next(&mut cx) {
                Poll::Ready(Some(job)) => backlog.push_back(job),
                Poll::Ready(None) => {
                    inbox_closed = true;
                }
                Poll::Pending => break,
            }
        }
        while in_flight.len() < max_concurrency {
            match backlog.pop_front() {
                Some(job) => in_flight.push(Tagged {
                    key: Some(job.key),
                    epoch: job.epoch,
                    inner: job.future,
                }),
                None => break,
            }
        }

        let mut progressed = false;
        while let Poll::Ready(next) = Pin::new(&mut in_flight).poll_next_unpin(&mut cx) {
            match next {
                Some((key, epoch, value)) => {
                    progressed = true;
                    let emission = {
                        let mut state = state.lock();
                        if state.cancelled {
                            return;
                        }
                        if state.epochs.get(&key) != Some(&epoch) {
                            log::debug!("discarding stale async transform result");
                            None
                        } else {
                            match state.mirror.insert(key.clone(), value.clone()) {
                                Some(old) => Some(Change::update(key, value, old)),
                                None => Some(Change::add(key, value)),
                            }
                        }
                    };
                    if let Some(change) = emission {
                        downstream.lock().on_next(&ChangeSet::single(change));
                    }
                }
                None => break,
            }
        }
        if progressed {
            // Free slots may admit backlog immediately.
            continue;
        }

        if inbox_closed && in_flight.is_empty() && backlog.is_empty() {
            let done = state.lock().upstream_done;
            if done {
                downstream.lock().on_completed();
            }
            return;
        }
        std::thread::park();
    }
}

struct AsyncAdapter<K: Key, V: Value, U: Value> {
    factory: AsyncFactory<K, V, U>,
    state: Arc<Mutex<AsyncState<K, U>>>,
    downstream: SharedObserver<ChangeSet<K, U>>,
    sender: Option<mpsc::UnboundedSender<Job<K, U>>>,
    worker: Thread,
}

impl<K: Key, V: Value, U: Value> AsyncAdapter<K, V, U> {
    fn issue(&mut self, key: &K, value: &V, previous: Option<&V>) {
        let epoch = {
            let mut state = self.state.lock();
            let epoch = state.epochs.entry(key.clone()).or_insert(0);
            *epoch += 1;
            *epoch
        };
        let future = (self.factory)(key.clone(), value.clone(), previous.cloned());
        if let Some(sender) = &self.sender {
            let _ = sender.unbounded_send(Job {
                key: key.clone(),
                epoch,
                future,
            });
            self.worker.unpark();
        }
    }
}

impl<K: Key, V: Value, U: Value> Observer<ChangeSet<K, V>> for AsyncAdapter<K, V, U> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        for change in changes.iter() {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add => self.issue(key, change.current(), None),
                ChangeReason::Update => self.issue(key, change.current(), change.previous()),
                // The value changed in place; recompute from it.
                ChangeReason::Refresh => self.issue(key, change.current(), None),
                ChangeReason::Remove => {
                    let removed = {
                        let mut state = self.state.lock();
                        state.epochs.remove(key);
                        state.mirror.shift_remove(key)
                    };
                    if let Some(old) = removed {
                        self.downstream
                            .lock()
                            .on_next(&ChangeSet::single(Change::remove(key.clone(), old)));
                    }
                }
                ChangeReason::Moved => {}
            }
        }
    }

    fn on_completed(&mut self) {
        self.state.lock().upstream_done = true;
        // Closing the inbox lets the worker finish in-flight work and
        // then complete downstream.
        self.sender = None;
        self.worker.unpark();
    }

    fn on_error(&mut self, error: &Error) {
        self.state.lock().cancelled = true;
        self.sender = None;
        self.worker.unpark();
        self.downstream.lock().on_error(error);
    }
}

impl<S, K, V, U> Observable<ChangeSet<K, U>> for TransformAsync<S, K, V, U>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key + Unpin,
    V: Value,
    U: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, U>>) -> Subscription {
        let state = Arc::new(Mutex::new(AsyncState {
            epochs: FxHashMap::default(),
            mirror: FxIndexMap::default(),
            upstream_done: false,
            cancelled: false,
        }));
        let downstream: SharedObserver<ChangeSet<K, U>> = Arc::new(Mutex::new(observer));
        let (sender, receiver) = mpsc::unbounded();

        let worker_state = state.clone();
        let worker_downstream = downstream.clone();
        let max_concurrency = self.max_concurrency;
        let handle = std::thread::Builder::new()
            .name("rill-transform-async".into())
            .spawn(move || worker(receiver, worker_state, worker_downstream, max_concurrency))
            .expect("failed to spawn async transform worker");
        let worker_thread = handle.thread().clone();

        let upstream = self.upstream.subscribe_with(Box::new(AsyncAdapter {
            factory: self.factory.clone(),
            state: state.clone(),
            downstream,
            sender: Some(sender),
            worker: worker_thread.clone(),
        }));

        upstream.and(Subscription::new(move || {
            state.lock().cancelled = true;
            worker_thread.unpark();
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ChangeStreamExt;
    use crate::stream::{ObservableExt, Subject};
    use std::time::Duration;

    fn eventually<T>(seen: &Arc<Mutex<Vec<T>>>, count: usize) {
        for _ in 0..200 {
            if seen.lock().len() >= count {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("async transform produced {} results, wanted {}", seen.lock().len(), count);
    }

    #[test]
    fn results_arrive_as_futures_complete() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = upstream
            .clone()
            .transform_async(
                |_k: u32, v: i32, _prev: Option<i32>| {
                    Box::pin(futures_util::future::ready(v * 2)) as BoxFuture<'static, i32>
                },
                4,
            )
            .subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

        upstream.publish(&ChangeSet::single(Change::add(1, 10)));
        upstream.publish(&ChangeSet::single(Change::add(2, 20)));
        eventually(&seen, 2);

        let mut values: Vec<i32> = seen
            .lock()
            .iter()
            .map(|set| *set[0].current())
            .collect();
        values.sort_unstable();
        assert_eq!(values, vec![20, 40]);
    }

    #[test]
    fn removal_before_completion_discards_the_result() {
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        // A future that never resolves keeps the key permanently in
        // flight; removing the key discards it.
        let _sub = upstream
            .clone()
            .transform_async(
                |_k: u32, v: i32, _prev: Option<i32>| {
                    if v < 0 {
                        Box::pin(futures_util::future::pending()) as BoxFuture<'static, i32>
                    } else {
                        Box::pin(futures_util::future::ready(v)) as BoxFuture<'static, i32>
                    }
                },
                4,
            )
            .subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

        upstream.publish(&ChangeSet::single(Change::add(1, -1)));
        upstream.publish(&ChangeSet::single(Change::remove(1, -1)));
        upstream.publish(&ChangeSet::single(Change::add(2, 7)));
        eventually(&seen, 1);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0].key(), &2);
    }
}
