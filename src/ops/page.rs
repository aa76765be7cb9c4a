//! Windowing an ordered projection: virtualization and paging.

use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::sorted::{SortReason, SortedChangeSet};
use crate::stream::{
    BoxObservable, BoxObserver, Observable, Observer, SharedObserver, Subscription,
};
use crate::{Key, Value};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;

/// A window request over an ordered projection, by offset and length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VirtualRequest {
    /// First item index of the window.
    pub start: usize,
    /// Window length.
    pub size: usize,
}

/// A window request over an ordered projection, by page number
/// (1-based) and page size.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number; clamped to the available pages.
    pub page: usize,
    /// Items per page.
    pub page_size: usize,
}

/// Describes the window an emission covers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageResponse {
    /// Effective 1-based page number after clamping.
    pub page: usize,
    /// Total number of pages at the current size.
    pub pages: usize,
    /// Items per page.
    pub page_size: usize,
    /// Items in the whole projection, including those outside the
    /// window.
    pub total_size: usize,
}

/// A windowed emission: the in-window changes, the window snapshot and
/// the response descriptor.
#[derive(Clone)]
pub struct PagedChangeSet<K, V> {
    changes: ChangeSet<K, V>,
    items: Vec<(K, V)>,
    response: PageResponse,
    reason: SortReason,
}

impl<K, V> PagedChangeSet<K, V> {
    /// Window-relative indexed changes; empty when
    /// [`reason`](Self::reason) asks for a reload.
    pub fn changes(&self) -> &ChangeSet<K, V> {
        &self.changes
    }

    /// The items currently inside the window, in order.
    pub fn items(&self) -> &[(K, V)] {
        &self.items
    }

    /// The window descriptor.
    pub fn response(&self) -> PageResponse {
        self.response
    }

    /// Whether consumers should reload from
    /// [`items`](Self::items) (window moved, projection reset) or may
    /// apply [`changes`](Self::changes) incrementally.
    pub fn reason(&self) -> SortReason {
        self.reason
    }
}

enum WindowSpec {
    Offset(VirtualRequest),
    Paged(PageRequest),
}

impl WindowSpec {
    fn bounds(&self, total: usize) -> (usize, usize, PageResponse) {
        match self {
            WindowSpec::Offset(request) => {
                let start = request.start.min(total);
                let end = (start + request.size).min(total);
                let pages = if request.size == 0 {
                    1
                } else {
                    (total + request.size - 1) / request.size.max(1)
                };
                let response = PageResponse {
                    page: if request.size == 0 {
                        1
                    } else {
                        start / request.size.max(1) + 1
                    },
                    pages: pages.max(1),
                    page_size: request.size,
                    total_size: total,
                };
                (start, end, response)
            }
            WindowSpec::Paged(request) => {
                let size = request.page_size.max(1);
                let pages = ((total + size - 1) / size).max(1);
                let page = request.page.clamp(1, pages);
                let start = ((page - 1) * size).min(total);
                let end = (start + size).min(total);
                let response = PageResponse {
                    page,
                    pages,
                    page_size: request.page_size,
                    total_size: total,
                };
                (start, end, response)
            }
        }
    }
}

struct WindowState<K, V> {
    sorted: Vec<(K, V)>,
    spec: WindowSpec,
    window: Vec<(K, V)>,
    emitted: bool,
}

struct WindowWork<K: Key, V: Value> {
    state: Mutex<WindowState<K, V>>,
    downstream: SharedObserver<PagedChangeSet<K, V>>,
}

impl<K: Key, V: Value> WindowWork<K, V> {
    /// Recomputes the window after a projection emission; incremental
    /// upstream batches translate into window-relative changes, while
    /// reloads and window movement emit a reset-equivalent.
    fn refresh_window(&self, upstream: Option<&SortedChangeSet<K, V>>, window_moved: bool) {
        let mut state = self.state.lock();
        if let Some(sorted) = upstream {
            state.sorted = sorted.sorted().to_vec();
        }
        let total = state.sorted.len();
        let (start, end, response) = state.spec.bounds(total);
        let fresh: Vec<(K, V)> = state.sorted[start..end].to_vec();

        let upstream_reload = upstream.map(|set| set.reason().is_reload()).unwrap_or(false);
        let first = !state.emitted;
        if first || window_moved || upstream_reload {
            state.window = fresh.clone();
            state.emitted = true;
            drop(state);
            let reason = if first {
                SortReason::Initial
            } else {
                SortReason::Reset
            };
            self.downstream.lock().on_next(&PagedChangeSet {
                changes: ChangeSet::new(),
                items: fresh,
                response,
                reason,
            });
            return;
        }

        let mut out = ChangeSet::new();
        let old = std::mem::take(&mut state.window);
        for (position, (key, _)) in old.iter().enumerate() {
            if !fresh.iter().any(|(fresh_key, _)| fresh_key == key) {
                // The stored value is what downstream last saw.
                out.push(Change::remove_at(
                    key.clone(),
                    old[position].1.clone(),
                    position as isize,
                ));
            }
        }
        for (position, (key, value)) in fresh.iter().enumerate() {
            if !old.iter().any(|(old_key, _)| old_key == key) {
                out.push(Change::add_at(key.clone(), value.clone(), position as isize));
            }
        }
        if let Some(set) = upstream {
            for change in set.changes().iter() {
                let key = change.key();
                let new_position = fresh.iter().position(|(k, _)| k == key);
                let old_position = old.iter().position(|(k, _)| k == key);
                let (new_position, old_position) = match (new_position, old_position) {
                    (Some(new_position), Some(old_position)) => (new_position, old_position),
                    // Membership transitions were handled above.
                    _ => continue,
                };
                match change.reason() {
                    ChangeReason::Update => out.push(Change::update_at(
                        key.clone(),
                        change.current().clone(),
                        change
                            .previous()
                            .expect("Update change must carry a previous value")
                            .clone(),
                        new_position as isize,
                        old_position as isize,
                    )),
                    ChangeReason::Refresh => out.push(Change::refresh_at(
                        key.clone(),
                        change.current().clone(),
                        new_position as isize,
                    )),
                    ChangeReason::Moved => {
                        if new_position != old_position {
                            out.push(Change::moved(
                                key.clone(),
                                change.current().clone(),
                                new_position as isize,
                                old_position as isize,
                            ));
                        }
                    }
                    // Handled by the membership diff.
                    ChangeReason::Add | ChangeReason::Remove => {}
                }
            }
        }
        state.window = fresh.clone();
        drop(state);
        if out.is_empty() && upstream.is_some() {
            // Out-of-window change: total_size may still have moved, so
            // publish the descriptor with no changes.
            self.downstream.lock().on_next(&PagedChangeSet {
                changes: ChangeSet::new(),
                items: fresh,
                response,
                reason: SortReason::DataChanged,
            });
            return;
        }
        self.downstream.lock().on_next(&PagedChangeSet {
            changes: out,
            items: fresh,
            response,
            reason: SortReason::DataChanged,
        });
    }
}

struct WindowUpstreamAdapter<K: Key, V: Value> {
    work: Arc<WindowWork<K, V>>,
}

impl<K: Key, V: Value> Observer<SortedChangeSet<K, V>> for WindowUpstreamAdapter<K, V> {
    fn on_next(&mut self, sorted: &SortedChangeSet<K, V>) {
        self.work.refresh_window(Some(sorted), false);
    }

    fn on_completed(&mut self) {
        self.work.downstream.lock().on_completed();
    }

    fn on_error(&mut self, error: &Error) {
        self.work.downstream.lock().on_error(error);
    }
}

struct VirtualRequestAdapter<K: Key, V: Value> {
    work: Arc<WindowWork<K, V>>,
}

impl<K: Key, V: Value> Observer<VirtualRequest> for VirtualRequestAdapter<K, V> {
    fn on_next(&mut self, request: &VirtualRequest) {
        let moved = {
            let mut state = self.work.state.lock();
            match &state.spec {
                WindowSpec::Offset(current) if current == request => false,
                _ => {
                    state.spec = WindowSpec::Offset(*request);
                    true
                }
            }
        };
        if moved {
            log::debug!("virtual window moved to start={} size={}", request.start, request.size);
            self.work.refresh_window(None, true);
        }
    }
}

struct PageRequestAdapter<K: Key, V: Value> {
    work: Arc<WindowWork<K, V>>,
}

impl<K: Key, V: Value> Observer<PageRequest> for PageRequestAdapter<K, V> {
    fn on_next(&mut self, request: &PageRequest) {
        let moved = {
            let mut state = self.work.state.lock();
            match &state.spec {
                WindowSpec::Paged(current) if current == request => false,
                _ => {
                    state.spec = WindowSpec::Paged(*request);
                    true
                }
            }
        };
        if moved {
            self.work.refresh_window(None, true);
        }
    }
}

/// The virtualization operator. Built by
/// [`SortedStreamExt::virtualize`](super::SortedStreamExt::virtualize).
pub struct Virtualize<S, K, V> {
    upstream: S,
    initial: VirtualRequest,
    requests: Option<BoxObservable<VirtualRequest>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> Virtualize<S, K, V> {
    pub(crate) fn new(upstream: S, initial: VirtualRequest) -> Self {
        Virtualize {
            upstream,
            initial,
            requests: None,
            _marker: PhantomData,
        }
    }

    /// Moves the window whenever `requests` emits.
    pub fn with_requests<R>(mut self, requests: R) -> Self
    where
        R: Observable<VirtualRequest> + Send + Sync + 'static,
    {
        self.requests = Some(Arc::new(requests));
        self
    }
}

impl<S, K, V> Observable<PagedChangeSet<K, V>> for Virtualize<S, K, V>
where
    S: Observable<SortedChangeSet<K, V>>,
    K: Key,
    V: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<PagedChangeSet<K, V>>) -> Subscription {
        let work = Arc::new(WindowWork {
            state: Mutex::new(WindowState {
                sorted: Vec::new(),
                spec: WindowSpec::Offset(self.initial),
                window: Vec::new(),
                emitted: false,
            }),
            downstream: Arc::new(Mutex::new(observer)),
        });
        let mut subscription = self
            .upstream
            .subscribe_with(Box::new(WindowUpstreamAdapter { work: work.clone() }));
        if let Some(requests) = &self.requests {
            let sub = requests.subscribe_with(Box::new(VirtualRequestAdapter { work }));
            subscription = subscription.and(sub);
        }
        subscription
    }
}

/// The paging operator. Built by
/// [`SortedStreamExt::page`](super::SortedStreamExt::page).
pub struct Page<S, K, V> {
    upstream: S,
    initial: PageRequest,
    requests: Option<BoxObservable<PageRequest>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> Page<S, K, V> {
    pub(crate) fn new(upstream: S, initial: PageRequest) -> Self {
        Page {
            upstream,
            initial,
            requests: None,
            _marker: PhantomData,
        }
    }

    /// Turns the page whenever `requests` emits.
    pub fn with_requests<R>(mut self, requests: R) -> Self
    where
        R: Observable<PageRequest> + Send + Sync + 'static,
    {
        self.requests = Some(Arc::new(requests));
        self
    }
}

impl<S, K, V> Observable<PagedChangeSet<K, V>> for Page<S, K, V>
where
    S: Observable<SortedChangeSet<K, V>>,
    K: Key,
    V: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<PagedChangeSet<K, V>>) -> Subscription {
        let work = Arc::new(WindowWork {
            state: Mutex::new(WindowState {
                sorted: Vec::new(),
                spec: WindowSpec::Paged(self.initial),
                window: Vec::new(),
                emitted: false,
            }),
            downstream: Arc::new(Mutex::new(observer)),
        });
        let mut subscription = self
            .upstream
            .subscribe_with(Box::new(WindowUpstreamAdapter { work: work.clone() }));
        if let Some(requests) = &self.requests {
            let sub = requests.subscribe_with(Box::new(PageRequestAdapter { work }));
            subscription = subscription.and(sub);
        }
        subscription
    }
}
