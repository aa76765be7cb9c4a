//! Root-cache behavior: edit sessions, replay, watch, preview and the
//! self-trimming helpers.

use parking_lot::Mutex;
use rill::{
    Change, ChangeReason, ChangeSet, ChangeStreamExt, Observable, ObservableExt, SourceCache,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Collected<K, V> = Arc<Mutex<Vec<ChangeSet<K, V>>>>;

fn collect<K, V>(
    stream: &impl Observable<ChangeSet<K, V>>,
) -> (Collected<K, V>, rill::Subscription)
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    let seen: Collected<K, V> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = stream.subscribe(move |changes: &ChangeSet<K, V>| sink.lock().push(changes.clone()));
    (seen, sub)
}

#[test]
fn edit_session_commits_one_batch_in_application_order() {
    let cache: SourceCache<u32, &'static str> = SourceCache::new();
    let (seen, _sub) = collect(&cache.connect());

    cache.edit(|updater| {
        updater.add_or_update(1, "a");
        updater.add_or_update(2, "b");
        updater.add_or_update(1, "A");
        updater.remove(&2);
    });

    let seen = seen.lock();
    assert_eq!(seen.len(), 1, "one session must commit exactly one batch");
    let batch = &seen[0];
    assert_eq!(batch.len(), 4);

    assert_eq!(batch[0].reason(), ChangeReason::Add);
    assert_eq!((batch[0].key(), batch[0].current()), (&1, &"a"));
    assert_eq!(batch[1].reason(), ChangeReason::Add);
    assert_eq!((batch[1].key(), batch[1].current()), (&2, &"b"));
    assert_eq!(batch[2].reason(), ChangeReason::Update);
    assert_eq!(batch[2].current(), &"A");
    assert_eq!(batch[2].previous(), Some(&"a"));
    assert_eq!(batch[3].reason(), ChangeReason::Remove);
    assert_eq!((batch[3].key(), batch[3].current()), (&2, &"b"));

    assert_eq!(cache.count(), 1);
    assert_eq!(cache.lookup(&1), Some("A"));
}

#[test]
fn connect_replays_state_as_adds_in_insertion_order() {
    let cache = SourceCache::from_iter(vec![(1, "a"), (2, "b")]);
    let (seen, _sub) = collect(&cache.connect());

    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let initial = &seen[0];
        assert_eq!(initial.len(), 2);
        assert!(initial.iter().all(|c| c.reason() == ChangeReason::Add));
        let keys: Vec<u32> = initial.iter().map(|c| *c.key()).collect();
        assert_eq!(keys, vec![1, 2]);
    }

    // No further emission until another edit.
    assert_eq!(seen.lock().len(), 1);
    cache.edit(|updater| updater.add_or_update(3, "c"));
    assert_eq!(seen.lock().len(), 2);
}

#[test]
fn empty_edits_are_suppressed() {
    let cache: SourceCache<u32, &'static str> = SourceCache::new();
    let (seen, _sub) = collect(&cache.connect());

    cache.edit(|_updater| {});
    cache.edit(|updater| updater.remove(&99));
    assert!(seen.lock().is_empty());
}

#[test]
fn nested_edits_commit_a_single_outer_batch() {
    let cache: SourceCache<u32, &'static str> = SourceCache::new();
    let (seen, _sub) = collect(&cache.connect());

    cache.edit(|updater| {
        updater.add_or_update(1, "a");
        cache.edit(|inner| {
            inner.add_or_update(2, "b");
        });
        updater.add_or_update(3, "c");
    });

    let seen = seen.lock();
    assert_eq!(seen.len(), 1, "nested edits must not publish separately");
    assert_eq!(seen[0].len(), 3);
    let keys: Vec<u32> = seen[0].iter().map(|c| *c.key()).collect();
    assert_eq!(keys, vec![1, 2, 3]);
}

#[test]
fn preview_fires_before_the_main_stream() {
    let cache: SourceCache<u32, i32> = SourceCache::new();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let previews = order.clone();
    let _preview = cache
        .preview()
        .subscribe(move |_: &ChangeSet<u32, i32>| previews.lock().push("preview"));
    let mains = order.clone();
    let _main = cache
        .connect()
        .subscribe(move |_: &ChangeSet<u32, i32>| mains.lock().push("main"));

    cache.edit(|updater| updater.add_or_update(1, 1));
    assert_eq!(*order.lock(), vec!["preview", "main"]);
}

#[test]
fn watch_tracks_one_key_with_a_synthetic_initial_add() {
    let cache = SourceCache::from_iter(vec![(1, "a"), (2, "b")]);
    let seen: Arc<Mutex<Vec<(ChangeReason, &'static str)>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    let _sub = cache
        .watch(1)
        .subscribe(move |change: &Change<u32, &'static str>| {
            sink.lock().push((change.reason(), *change.current()))
        });

    cache.edit(|updater| {
        updater.add_or_update(1, "A");
        updater.add_or_update(2, "B"); // not watched
    });
    cache.edit(|updater| updater.remove(&1));

    let seen = seen.lock();
    assert_eq!(
        *seen,
        vec![
            (ChangeReason::Add, "a"),
            (ChangeReason::Update, "A"),
            (ChangeReason::Remove, "A"),
        ]
    );
}

#[test]
fn count_changed_emits_distinct_sizes_only() {
    let cache: SourceCache<u32, i32> = SourceCache::new();
    let counts: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = counts.clone();
    let _sub = cache
        .count_changed()
        .subscribe(move |count: &usize| sink.lock().push(*count));

    cache.edit(|updater| updater.add_or_update(1, 1));
    // An update leaves the size untouched: no emission.
    cache.edit(|updater| updater.add_or_update(1, 2));
    cache.edit(|updater| updater.add_or_update(2, 2));
    cache.edit(|updater| updater.clear());

    assert_eq!(*counts.lock(), vec![0, 1, 2, 0]);
}

#[test]
fn clear_removes_in_iteration_order() {
    let cache = SourceCache::from_iter(vec![(3, "c"), (1, "a"), (2, "b")]);
    let (seen, _sub) = collect(&cache.connect());

    cache.edit(|updater| updater.clear());
    let seen = seen.lock();
    let removed: Vec<u32> = seen[1].iter().map(|c| *c.key()).collect();
    assert_eq!(removed, vec![3, 1, 2]);
    assert_eq!(cache.count(), 0);
}

#[test]
fn key_selector_derives_identity_from_values() {
    #[derive(Clone, PartialEq, Debug)]
    struct Person {
        id: u32,
        name: &'static str,
    }

    let cache: SourceCache<u32, Person> = SourceCache::with_key_selector(|p: &Person| p.id);
    cache.edit(|updater| {
        updater.add_or_update_value(Person { id: 7, name: "ann" });
        updater.add_or_update_value(Person { id: 7, name: "anne" });
    });
    assert_eq!(cache.count(), 1);
    assert_eq!(cache.lookup(&7).map(|p| p.name), Some("anne"));
}

#[test]
fn materialized_cache_mirrors_the_source_through_every_commit() {
    let source: SourceCache<u32, i32> = SourceCache::new();
    let mirror = source.connect().as_cache();

    source.edit(|updater| {
        updater.add_or_update(1, 10);
        updater.add_or_update(2, 20);
    });
    source.edit(|updater| {
        updater.add_or_update(1, 11);
        updater.remove(&2);
        updater.add_or_update(3, 30);
    });

    assert_eq!(mirror.count(), source.count());
    for (key, value) in source.snapshot().pairs() {
        assert_eq!(mirror.lookup(key), Some(*value));
    }
}

#[test]
fn dropping_the_cache_completes_every_stream() {
    let cache: SourceCache<u32, i32> = SourceCache::new();
    let completions = Arc::new(AtomicUsize::new(0));

    let connect_done = completions.clone();
    let _main = cache.connect_with(false).subscribe_all(
        |_: &ChangeSet<u32, i32>| {},
        move || {
            connect_done.fetch_add(1, Ordering::SeqCst);
        },
        |_| {},
    );
    let watch_done = completions.clone();
    let _watch = cache.watch(1).subscribe_all(
        |_: &Change<u32, i32>| {},
        move || {
            watch_done.fetch_add(1, Ordering::SeqCst);
        },
        |_| {},
    );

    drop(cache);
    assert_eq!(completions.load(Ordering::SeqCst), 2);
}

#[test]
fn reentrant_edit_from_an_observer_queues_a_second_batch() {
    let cache: SourceCache<u32, i32> = SourceCache::new();
    let cache = Arc::new(cache);
    let (seen, _sub) = collect(&cache.connect());

    // An observer that echoes every added key back as key + 100, once.
    let echo = cache.clone();
    let _echo_sub = cache.connect().subscribe(move |changes: &ChangeSet<u32, i32>| {
        for change in changes.iter() {
            if change.reason() == ChangeReason::Add && *change.key() < 100 {
                let key = *change.key() + 100;
                let value = *change.current();
                echo.edit(|updater| updater.add_or_update(key, value));
            }
        }
    });

    cache.edit(|updater| updater.add_or_update(1, 5));

    let seen = seen.lock();
    assert_eq!(seen.len(), 2, "the reentrant edit commits as its own batch");
    assert_eq!(seen[0][0].key(), &1);
    assert_eq!(seen[1][0].key(), &101);
    assert_eq!(cache.count(), 2);
}
