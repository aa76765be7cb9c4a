//! Operators over change-set streams.
//!
//! Every operator is exposed as a combinator on [`ChangeStreamExt`]
//! (for `Observable<ChangeSet<K, V>>`) or [`SortedStreamExt`] (for the
//! ordered projections produced by [`sort`](ChangeStreamExt::sort)).
//! Combinators consume `self` and return a new cold stream; nothing is
//! wired until an observer subscribes. Fan-out happens at cache
//! boundaries ([`as_cache`](ChangeStreamExt::as_cache)) or through
//! [`share`](ChangeStreamExt::share).

mod bind;
mod buffer;
mod filter;
mod group;
mod join;
mod join_many;
mod merge;
mod page;
mod sort;
mod transform;
#[cfg(feature = "async")]
mod transform_async;
mod transform_many;
mod tree;
mod watch;

pub use bind::{bind_adapter, bind_list, BoundList, ListAdapter, VecAdapter};
pub use buffer::Buffer;
pub use filter::{predicate, Filter, FilterImmutable, Predicate};
pub use group::{Group, GroupBy, GroupOnObservable};
pub use join::{ForeignKey, FullKey, Join};
pub use join_many::JoinMany;
pub use merge::{merge_change_sets, EqualityComparer, Merge, MergeMany, MergeOptions, ParentRank};
pub use page::{Page, PagedChangeSet, PageRequest, PageResponse, VirtualRequest, Virtualize};
pub use sort::{Sort, SortOptions};
pub use transform::{ForcePredicate, Transform, TransformErrorHandler, TransformFactory};
#[cfg(feature = "async")]
pub use transform_async::{BoxFuture, TransformAsync};
pub use transform_many::TransformMany;
pub use tree::{Node, TreeBuilder};
pub use watch::{OnItemAdded, OnItemRemoved, SubscribeMany};

use crate::cache::DerivedCache;
use crate::change::ChangeSet;
use crate::error::Error;
use crate::scheduler::SharedScheduler;
use crate::sorted::{Comparer, SortedChangeSet};
use crate::stream::{BoxObservable, Observable, Share, Subscription, Synchronize};
use crate::{Key, Value};
use std::sync::Arc;
use std::time::Duration;

/// Combinators available on every change-set stream.
pub trait ChangeStreamExt<K: Key, V: Value>: Observable<ChangeSet<K, V>> + Sized {
    /// Filters with a static predicate (see §filter state machine in
    /// the module docs of [`filter`](self::Filter)).
    fn filter<P>(self, predicate: P) -> Filter<Self, K, V>
    where
        P: Fn(&V) -> bool + Send + Sync + 'static,
    {
        Filter::new(self, Arc::new(predicate), None, None)
    }

    /// Filters with a predicate that changes over time: each value the
    /// stream emits replaces the active predicate and rescans the
    /// last-known upstream state.
    fn filter_dynamic<PS>(self, initial: Predicate<V>, predicates: PS) -> Filter<Self, K, V>
    where
        PS: Observable<Predicate<V>> + Send + Sync + 'static,
    {
        Filter::new(self, initial, Some(Arc::new(predicates)), None)
    }

    /// The fully general filter: dynamic predicate stream and explicit
    /// re-evaluate trigger, either optional.
    fn filter_full(
        self,
        initial: Predicate<V>,
        predicates: Option<BoxObservable<Predicate<V>>>,
        reevaluate: Option<BoxObservable<()>>,
    ) -> Filter<Self, K, V> {
        Filter::new(self, initial, predicates, reevaluate)
    }

    /// The stateless filter fast path; valid only for immutable items
    /// and a pure predicate.
    fn filter_immutable<P>(self, predicate: P) -> FilterImmutable<Self, K, V>
    where
        P: Fn(&V) -> bool + Send + Sync + 'static,
    {
        FilterImmutable::new(self, Arc::new(predicate))
    }

    /// Projects values through `f`, maintaining a keyed mirror of the
    /// projections.
    fn transform<U, F>(self, f: F) -> Transform<Self, K, V, U>
    where
        U: Value,
        F: Fn(&V) -> U + Send + Sync + 'static,
    {
        Transform::new(self, Arc::new(move |_key: &K, value: &V, _prev: Option<&V>| Ok(f(value))))
    }

    /// Projects with access to the key and the previous value.
    fn transform_full<U, F>(self, f: F) -> Transform<Self, K, V, U>
    where
        U: Value,
        F: Fn(&K, &V, Option<&V>) -> U + Send + Sync + 'static,
    {
        Transform::new(
            self,
            Arc::new(move |key: &K, value: &V, prev: Option<&V>| Ok(f(key, value, prev))),
        )
    }

    /// A fallible projection. Failures fault the stream unless an
    /// error handler is installed with
    /// [`Transform::with_error_handler`], in which case the offending
    /// change is dropped.
    fn try_transform<U, F>(self, f: F) -> Transform<Self, K, V, U>
    where
        U: Value,
        F: Fn(&K, &V, Option<&V>) -> Result<U, Error> + Send + Sync + 'static,
    {
        Transform::new(self, Arc::new(f))
    }

    /// Projection that mutates the previously produced value in place
    /// on updates and emits `Refresh` instead of `Update`.
    fn transform_in_place<U, C, A>(self, create: C, update: A) -> Transform<Self, K, V, U>
    where
        U: Value,
        C: Fn(&V) -> U + Send + Sync + 'static,
        A: Fn(&mut U, &V) + Send + Sync + 'static,
    {
        Transform::new(
            self,
            Arc::new(move |_key: &K, value: &V, _prev: Option<&V>| Ok(create(value))),
        )
        .in_place(update)
    }

    /// Flattens each item into child items with their own keys; child
    /// keys must be globally unique across parents.
    fn transform_many<CK, CU, F>(self, children: F) -> TransformMany<Self, K, V, CK, CU>
    where
        CK: Key,
        CU: Value,
        F: Fn(&K, &V) -> Vec<(CK, CU)> + Send + Sync + 'static,
    {
        TransformMany::new(self, Arc::new(children))
    }

    /// Projects through an asynchronous factory; results are emitted
    /// in completion order within `max_concurrency` in-flight futures.
    #[cfg(feature = "async")]
    fn transform_async<U, F>(self, f: F, max_concurrency: usize) -> TransformAsync<Self, K, V, U>
    where
        K: Unpin,
        U: Value,
        F: Fn(K, V, Option<V>) -> BoxFuture<'static, U> + Send + Sync + 'static,
    {
        TransformAsync::new(self, Arc::new(f), max_concurrency)
    }

    /// Maintains an ordered projection of the stream.
    fn sort(self, comparer: Comparer<V>, options: SortOptions) -> Sort<Self, K, V> {
        Sort::new(self, comparer, options)
    }

    /// Sorts and immediately binds the projection to a shared `Vec`
    /// mirror.
    fn sort_and_bind(
        self,
        comparer: Comparer<V>,
        options: SortOptions,
    ) -> (BoundList<V>, Subscription) {
        self.sort(comparer, options).bind()
    }

    /// Partitions items into sub-caches by a group selector.
    fn group<G, F>(self, selector: F) -> GroupBy<Self, K, V, G>
    where
        G: Key,
        F: Fn(&K, &V) -> G + Send + Sync + 'static,
    {
        GroupBy::new(self, Arc::new(selector))
    }

    /// Partitions items by a per-item stream of group keys.
    fn group_on_observable<G, F>(self, factory: F) -> GroupOnObservable<Self, K, V, G>
    where
        G: Key,
        F: Fn(&K, &V) -> BoxObservable<G> + Send + Sync + 'static,
    {
        GroupOnObservable::new(self, Arc::new(factory))
    }

    /// Joins with `right`; a row exists per `(left, right)` pair iff
    /// both sides are present.
    fn inner_join<SR, RK, R, FK, SEL, O>(
        self,
        right: SR,
        foreign_key: FK,
        selector: SEL,
    ) -> Join<Self, SR, K, V, RK, R, (K, RK), O>
    where
        SR: Observable<ChangeSet<RK, R>>,
        RK: Key,
        R: Value,
        O: Value + PartialEq,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        SEL: Fn(&V, &R) -> O + Send + Sync + 'static,
    {
        Join::inner(self, right, Arc::new(foreign_key), Arc::new(selector))
    }

    /// Joins with `right`; one row per left key, right side optional.
    fn left_join<SR, RK, R, FK, SEL, O>(
        self,
        right: SR,
        foreign_key: FK,
        selector: SEL,
    ) -> Join<Self, SR, K, V, RK, R, K, O>
    where
        SR: Observable<ChangeSet<RK, R>>,
        RK: Key,
        R: Value,
        O: Value + PartialEq,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        SEL: Fn(&K, &V, Option<&R>) -> O + Send + Sync + 'static,
    {
        Join::left_outer(self, right, Arc::new(foreign_key), Arc::new(selector))
    }

    /// Joins with `right`; one row per right key, left side optional.
    fn right_join<SR, RK, R, FK, SEL, O>(
        self,
        right: SR,
        foreign_key: FK,
        selector: SEL,
    ) -> Join<Self, SR, K, V, RK, R, RK, O>
    where
        SR: Observable<ChangeSet<RK, R>>,
        RK: Key,
        R: Value,
        O: Value + PartialEq,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        SEL: Fn(&RK, Option<&V>, &R) -> O + Send + Sync + 'static,
    {
        Join::right_outer(self, right, Arc::new(foreign_key), Arc::new(selector))
    }

    /// Joins with `right`; one row per left key and per unmatched
    /// right key, both sides optional.
    fn full_join<SR, RK, R, FK, SEL, O>(
        self,
        right: SR,
        foreign_key: FK,
        selector: SEL,
    ) -> Join<Self, SR, K, V, RK, R, FullKey<K, RK>, O>
    where
        SR: Observable<ChangeSet<RK, R>>,
        RK: Key,
        R: Value,
        O: Value + PartialEq,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        SEL: Fn(Option<&V>, Option<&R>) -> O + Send + Sync + 'static,
    {
        Join::full_outer(self, right, Arc::new(foreign_key), Arc::new(selector))
    }

    /// One row per left key; the matching right items arrive as a live
    /// [`Group`] sub-cache.
    fn left_join_many<SR, RK, R, FK, SEL, O>(
        self,
        right: SR,
        foreign_key: FK,
        selector: SEL,
    ) -> JoinMany<Self, SR, K, V, RK, R, O>
    where
        SR: Observable<ChangeSet<RK, R>>,
        RK: Key,
        R: Value,
        O: Value,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        SEL: Fn(&V, &Group<K, RK, R>) -> O + Send + Sync + 'static,
    {
        JoinMany::new(self, right, Arc::new(foreign_key), Arc::new(selector), false)
    }

    /// Like [`left_join_many`](Self::left_join_many), but a row exists
    /// only while its group has members.
    fn inner_join_many<SR, RK, R, FK, SEL, O>(
        self,
        right: SR,
        foreign_key: FK,
        selector: SEL,
    ) -> JoinMany<Self, SR, K, V, RK, R, O>
    where
        SR: Observable<ChangeSet<RK, R>>,
        RK: Key,
        R: Value,
        O: Value,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        SEL: Fn(&V, &Group<K, RK, R>) -> O + Send + Sync + 'static,
    {
        JoinMany::new(self, right, Arc::new(foreign_key), Arc::new(selector), true)
    }

    /// Subscribes one child change-set stream per item of this stream
    /// and merges them while the parent item exists.
    fn merge_many<CK, CV, F>(
        self,
        selector: F,
        options: MergeOptions<CV>,
    ) -> MergeMany<Self, K, V, CK, CV>
    where
        CK: Key,
        CV: Value,
        F: Fn(&K, &V) -> BoxObservable<ChangeSet<CK, CV>> + Send + Sync + 'static,
    {
        MergeMany::new(self, Arc::new(selector), options, None)
    }

    /// [`merge_many`](Self::merge_many) with sources ranked by a
    /// parent comparer.
    fn merge_many_ranked<CK, CV, F>(
        self,
        selector: F,
        options: MergeOptions<CV>,
        rank: ParentRank<V>,
    ) -> MergeMany<Self, K, V, CK, CV>
    where
        CK: Key,
        CV: Value,
        F: Fn(&K, &V) -> BoxObservable<ChangeSet<CK, CV>> + Send + Sync + 'static,
    {
        MergeMany::new(self, Arc::new(selector), options, Some(rank))
    }

    /// Reshapes parent-child key relations into a forest of
    /// [`Node`]s.
    fn transform_to_tree<F>(self, parent_selector: F) -> TreeBuilder<Self, K, V>
    where
        F: Fn(&V) -> Option<K> + Send + Sync + 'static,
    {
        TreeBuilder::new(self, Arc::new(parent_selector))
    }

    /// Coalesces batches arriving within `period` into one.
    fn buffer(self, period: Duration, scheduler: SharedScheduler) -> Buffer<Self, K, V> {
        Buffer::new(self, period, scheduler)
    }

    /// Acquires one resource per item; released when the item leaves
    /// or on teardown.
    fn subscribe_many<F>(self, factory: F) -> SubscribeMany<Self, K, V>
    where
        F: Fn(&K, &V) -> Result<Subscription, Error> + Send + Sync + 'static,
    {
        SubscribeMany::new(self, Arc::new(factory))
    }

    /// Runs `action` for every added item; the stream passes through.
    fn on_item_added<F>(self, action: F) -> OnItemAdded<Self, K, V>
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        OnItemAdded::new(self, Arc::new(action))
    }

    /// Runs `action` for every removed item; with
    /// `invoke_on_unsubscribe` also for every held item at teardown.
    fn on_item_removed<F>(self, action: F, invoke_on_unsubscribe: bool) -> OnItemRemoved<Self, K, V>
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        OnItemRemoved::new(self, Arc::new(action), invoke_on_unsubscribe)
    }

    /// Materializes the stream into a cache, subscribing immediately.
    fn as_cache(self) -> DerivedCache<K, V> {
        DerivedCache::from_stream(&self)
    }

    /// Multicasts the stream: the upstream is subscribed once for any
    /// number of observers.
    fn share(self) -> Share<ChangeSet<K, V>>
    where
        Self: Send + Sync + 'static,
    {
        Share::new(Arc::new(self))
    }

    /// Re-serializes dispatch onto a private mutex.
    fn synchronize(self) -> Synchronize<Self> {
        Synchronize::new(self)
    }
}

impl<K: Key, V: Value, S> ChangeStreamExt<K, V> for S where S: Observable<ChangeSet<K, V>> + Sized {}

/// Combinators available on sorted (ordered-projection) streams.
pub trait SortedStreamExt<K: Key, V: Value>:
    Observable<SortedChangeSet<K, V>> + Sized
{
    /// Materializes the projection into a shared `Vec` mirror,
    /// subscribing immediately.
    fn bind(self) -> (BoundList<V>, Subscription) {
        bind_list(&self)
    }

    /// Drives a custom [`ListAdapter`], subscribing immediately.
    fn bind_to<A>(self, adapter: A) -> Subscription
    where
        A: ListAdapter<K, V> + 'static,
    {
        bind_adapter(&self, adapter)
    }

    /// Publishes only the window of the projection covered by the
    /// request.
    fn virtualize(self, initial: VirtualRequest) -> Virtualize<Self, K, V> {
        Virtualize::new(self, initial)
    }

    /// Publishes one page of the projection at a time.
    fn page(self, initial: PageRequest) -> Page<Self, K, V> {
        Page::new(self, initial)
    }
}

impl<K: Key, V: Value, S> SortedStreamExt<K, V> for S where
    S: Observable<SortedChangeSet<K, V>> + Sized
{
}
