//! Injected time.
//!
//! Operator code never reads the OS clock directly; everything
//! time-based (expiration, buffering) takes a [`Scheduler`]. Production
//! code uses [`ThreadScheduler`]; tests use [`VirtualScheduler`] and
//! advance time deterministically.

use crate::stream::Subscription;
use crossbeam_utils::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// An instant on a scheduler's clock, measured from the scheduler's
/// epoch (its creation time).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// The scheduler's epoch.
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    /// A timestamp `offset` after the epoch.
    pub fn from_epoch(offset: Duration) -> Self {
        Timestamp(offset)
    }

    /// Offset from the epoch.
    pub fn as_duration(self) -> Duration {
        self.0
    }

    /// Time remaining until `later`, zero if already past.
    pub fn until(self, later: Timestamp) -> Duration {
        later.0.saturating_sub(self.0)
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

/// A one-shot scheduled action.
pub type Task = Box<dyn FnOnce() + Send>;

/// A repeatedly scheduled action.
pub type PeriodicTask = Box<dyn FnMut() + Send>;

/// The clock and timer abstraction injected into time-based operators.
pub trait Scheduler: Send + Sync {
    /// The current time on this scheduler's clock.
    fn now(&self) -> Timestamp;

    /// Runs `task` once at (or as soon as possible after) `due`.
    /// Dropping the returned guard cancels a task that has not fired.
    fn schedule_at(&self, due: Timestamp, task: Task) -> Subscription;

    /// Runs `task` every `period`, starting one period from now.
    /// Dropping the returned guard stops the repetition.
    fn schedule_periodic(&self, period: Duration, task: PeriodicTask) -> Subscription;
}

/// A shared scheduler handle.
pub type SharedScheduler = Arc<dyn Scheduler>;

enum TimerKind {
    Once(Option<Task>),
    Periodic { period: Duration, task: PeriodicTask },
}

struct TimerEntry {
    due: Timestamp,
    seq: u64,
    cancelled: Arc<AtomicCell<bool>>,
    kind: TimerKind,
}

// Min-heap order: the entry due soonest compares greatest.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.due.cmp(&self.due).then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct TimerState {
    entries: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerState {
    fn push(&mut self, due: Timestamp, kind: TimerKind) -> Arc<AtomicCell<bool>> {
        let cancelled = Arc::new(AtomicCell::new(false));
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(TimerEntry {
            due,
            seq,
            cancelled: cancelled.clone(),
            kind,
        });
        cancelled
    }
}

struct TimerInner {
    epoch: Instant,
    state: Mutex<TimerState>,
    condvar: Condvar,
}

/// A wall-clock scheduler backed by one timer thread.
///
/// The thread exits shortly after the last handle is dropped.
#[derive(Clone)]
pub struct ThreadScheduler {
    inner: Arc<TimerInner>,
}

impl ThreadScheduler {
    /// Starts the timer thread and returns a handle.
    pub fn new() -> Self {
        let inner = Arc::new(TimerInner {
            epoch: Instant::now(),
            state: Mutex::new(TimerState {
                entries: BinaryHeap::new(),
                next_seq: 0,
            }),
            condvar: Condvar::new(),
        });
        let weak = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name("rill-timer".into())
            .spawn(move || Self::run(weak))
            .expect("failed to spawn timer thread");
        ThreadScheduler { inner }
    }

    fn run(weak: Weak<TimerInner>) {
        // Cap each sleep so the thread notices when every handle has
        // been dropped.
        const LIVENESS_CHECK: Duration = Duration::from_millis(500);
        loop {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            let now = Timestamp(inner.epoch.elapsed());
            let mut state = inner.state.lock();

            let mut due = Vec::new();
            while let Some(top) = state.entries.peek() {
                if top.cancelled.load() {
                    state.entries.pop();
                    continue;
                }
                if top.due <= now {
                    due.push(state.entries.pop().expect("peeked entry vanished"));
                } else {
                    break;
                }
            }

            if due.is_empty() {
                let sleep = state
                    .entries
                    .peek()
                    .map(|e| now.until(e.due))
                    .unwrap_or(LIVENESS_CHECK)
                    .min(LIVENESS_CHECK);
                inner.condvar.wait_for(&mut state, sleep);
                continue;
            }
            drop(state);

            for entry in due {
                if entry.cancelled.load() {
                    continue;
                }
                match entry.kind {
                    TimerKind::Once(mut task) => {
                        if let Some(task) = task.take() {
                            task();
                        }
                    }
                    TimerKind::Periodic { period, mut task } => {
                        task();
                        if !entry.cancelled.load() {
                            let mut state = inner.state.lock();
                            let seq = state.next_seq;
                            state.next_seq += 1;
                            state.entries.push(TimerEntry {
                                due: entry.due + period,
                                seq,
                                cancelled: entry.cancelled,
                                kind: TimerKind::Periodic { period, task },
                            });
                        }
                    }
                }
            }
        }
    }

    fn schedule(&self, due: Timestamp, kind: TimerKind) -> Subscription {
        let cancelled = self.inner.state.lock().push(due, kind);
        self.inner.condvar.notify_one();
        Subscription::new(move || cancelled.store(true))
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn now(&self) -> Timestamp {
        Timestamp(self.inner.epoch.elapsed())
    }

    fn schedule_at(&self, due: Timestamp, task: Task) -> Subscription {
        self.schedule(due, TimerKind::Once(Some(task)))
    }

    fn schedule_periodic(&self, period: Duration, task: PeriodicTask) -> Subscription {
        self.schedule(self.now() + period, TimerKind::Periodic { period, task })
    }
}

struct VirtualState {
    now: Timestamp,
    timers: TimerState,
}

/// A deterministic scheduler for tests.
///
/// Time stands still until [`advance_by`](Self::advance_by) or
/// [`advance_to`](Self::advance_to) is called; due tasks then run on
/// the calling thread in due-time order.
#[derive(Clone)]
pub struct VirtualScheduler {
    inner: Arc<Mutex<VirtualState>>,
}

impl VirtualScheduler {
    /// A scheduler starting at [`Timestamp::ZERO`].
    pub fn new() -> Self {
        VirtualScheduler {
            inner: Arc::new(Mutex::new(VirtualState {
                now: Timestamp::ZERO,
                timers: TimerState {
                    entries: BinaryHeap::new(),
                    next_seq: 0,
                },
            })),
        }
    }

    /// Moves the clock forward by `delta`, running due tasks.
    pub fn advance_by(&self, delta: Duration) {
        let target = self.now() + delta;
        self.advance_to(target);
    }

    /// Moves the clock to `target`, running due tasks in order.
    pub fn advance_to(&self, target: Timestamp) {
        loop {
            let entry = {
                let mut state = self.inner.lock();
                loop {
                    match state.timers.entries.peek() {
                        Some(top) if top.cancelled.load() => {
                            state.timers.entries.pop();
                        }
                        Some(top) if top.due <= target => {
                            let entry = state.timers.entries.pop().expect("peeked entry vanished");
                            state.now = state.now.max(entry.due);
                            break Some(entry);
                        }
                        _ => {
                            state.now = state.now.max(target);
                            break None;
                        }
                    }
                }
            };
            let entry = match entry {
                Some(entry) => entry,
                None => return,
            };
            // Run outside the lock so tasks may schedule again.
            match entry.kind {
                TimerKind::Once(mut task) => {
                    if let Some(task) = task.take() {
                        task();
                    }
                }
                TimerKind::Periodic { period, mut task } => {
                    task();
                    if !entry.cancelled.load() {
                        let mut state = self.inner.lock();
                        let seq = state.timers.next_seq;
                        state.timers.next_seq += 1;
                        state.timers.entries.push(TimerEntry {
                            due: entry.due + period,
                            seq,
                            cancelled: entry.cancelled,
                            kind: TimerKind::Periodic { period, task },
                        });
                    }
                }
            }
        }
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for VirtualScheduler {
    fn now(&self) -> Timestamp {
        self.inner.lock().now
    }

    fn schedule_at(&self, due: Timestamp, task: Task) -> Subscription {
        let cancelled = self.inner.lock().timers.push(due, TimerKind::Once(Some(task)));
        Subscription::new(move || cancelled.store(true))
    }

    fn schedule_periodic(&self, period: Duration, task: PeriodicTask) -> Subscription {
        let due = self.now() + period;
        let cancelled = self
            .inner
            .lock()
            .timers
            .push(due, TimerKind::Periodic { period, task });
        Subscription::new(move || cancelled.store(true))
    }
}
