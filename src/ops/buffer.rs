//! Time-window batching of change sets.

use crate::change::ChangeSet;
use crate::error::Error;
use crate::scheduler::SharedScheduler;
use crate::stream::{BoxObserver, Observable, Observer, SharedObserver, Subscription};
use crate::{Key, Value};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Coalesces every batch arriving within a time window into one batch.
/// Built by [`ChangeStreamExt::buffer`](super::ChangeStreamExt::buffer).
pub struct Buffer<S, K, V> {
    upstream: S,
    period: Duration,
    scheduler: SharedScheduler,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> Buffer<S, K, V> {
    pub(crate) fn new(upstream: S, period: Duration, scheduler: SharedScheduler) -> Self {
        Buffer {
            upstream,
            period,
            scheduler,
            _marker: PhantomData,
        }
    }
}

struct BufferState<K, V> {
    pending: ChangeSet<K, V>,
    done: bool,
}

struct BufferAdapter<K: Key, V: Value> {
    state: Arc<Mutex<BufferState<K, V>>>,
    downstream: SharedObserver<ChangeSet<K, V>>,
}

fn flush<K: Key, V: Value>(
    state: &Mutex<BufferState<K, V>>,
    downstream: &SharedObserver<ChangeSet<K, V>>,
) {
    let pending = {
        let mut state = state.lock();
        if state.pending.is_empty() {
            return;
        }
        std::mem::take(&mut state.pending)
    };
    downstream.lock().on_next(&pending);
}

impl<K: Key, V: Value> Observer<ChangeSet<K, V>> for BufferAdapter<K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.pending.extend(changes.clone());
    }

    fn on_completed(&mut self) {
        self.state.lock().done = true;
        flush(&self.state, &self.downstream);
        self.downstream.lock().on_completed();
    }

    fn on_error(&mut self, error: &Error) {
        self.state.lock().done = true;
        self.downstream.lock().on_error(error);
    }
}

impl<S, K, V> Observable<ChangeSet<K, V>> for Buffer<S, K, V>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, V>>) -> Subscription {
        let state = Arc::new(Mutex::new(BufferState {
            pending: ChangeSet::new(),
            done: false,
        }));
        let downstream: SharedObserver<ChangeSet<K, V>> = Arc::new(Mutex::new(observer));

        let timer_state = state.clone();
        let timer_downstream = downstream.clone();
        let timer = self.scheduler.schedule_periodic(
            self.period,
            Box::new(move || {
                if timer_state.lock().done {
                    return;
                }
                flush(&timer_state, &timer_downstream);
            }),
        );

        let upstream = self.upstream.subscribe_with(Box::new(BufferAdapter {
            state,
            downstream,
        }));
        upstream.and(timer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Change;
    use crate::ops::ChangeStreamExt;
    use crate::scheduler::VirtualScheduler;
    use crate::stream::{ObservableExt, Subject};

    #[test]
    fn batches_coalesce_until_the_window_closes() {
        let scheduler = VirtualScheduler::new();
        let upstream: Subject<ChangeSet<u32, i32>> = Subject::new();
        let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _sub = upstream
            .clone()
            .buffer(Duration::from_millis(100), Arc::new(scheduler.clone()))
            .subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

        upstream.publish(&ChangeSet::single(Change::add(1, 1)));
        upstream.publish(&ChangeSet::single(Change::add(2, 2)));
        assert!(seen.lock().is_empty());

        scheduler.advance_by(Duration::from_millis(100));
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].len(), 2);
        }

        // An empty window flushes nothing.
        scheduler.advance_by(Duration::from_millis(100));
        assert_eq!(seen.lock().len(), 1);
    }
}
