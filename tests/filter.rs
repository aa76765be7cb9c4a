//! Filtering over a root cache, including dynamic predicate swaps.

use parking_lot::Mutex;
use rill::ops::{predicate, Predicate};
use rill::{ChangeReason, ChangeSet, ChangeStreamExt, ObservableExt, SourceCache, Subject};
use std::sync::Arc;

#[test]
fn static_filter_tracks_the_matching_subset() {
    let cache: SourceCache<u32, i32> = SourceCache::new();
    let filtered = cache.connect().filter(|v: &i32| v % 2 == 0).as_cache();

    cache.edit(|updater| {
        for i in 1..=10 {
            updater.add_or_update(i, i as i32);
        }
    });
    assert_eq!(filtered.count(), 5);

    cache.edit(|updater| {
        updater.add_or_update(2, 3); // leaves the subset
        updater.add_or_update(1, 4); // enters the subset
        updater.remove(&6);
    });

    let expected = cache
        .snapshot()
        .values()
        .filter(|v| *v % 2 == 0)
        .count();
    assert_eq!(filtered.count(), expected);
    assert_eq!(filtered.lookup(&1), Some(4));
    assert_eq!(filtered.lookup(&2), None);
}

#[test]
fn predicate_change_emits_net_transitions() {
    let cache = SourceCache::from_iter(vec![(1, 1), (2, 2), (3, 3)]);
    let predicates: Subject<Predicate<i32>> = Subject::new();

    let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = cache
        .connect()
        .filter_dynamic(predicate(|v: &i32| *v >= 2), predicates.clone())
        .subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].adds(), 2);
        let keys: Vec<u32> = seen[0].iter().map(|c| *c.key()).collect();
        assert_eq!(keys, vec![2, 3]);
    }

    predicates.publish(&predicate(|v: &i32| v % 2 == 1));

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    let transition = &seen[1];
    assert_eq!(transition.adds(), 1);
    assert_eq!(transition.removes(), 1);
    let added = transition
        .iter()
        .find(|c| c.reason() == ChangeReason::Add)
        .expect("expected key 1 to enter");
    assert_eq!((added.key(), added.current()), (&1, &1));
    let removed = transition
        .iter()
        .find(|c| c.reason() == ChangeReason::Remove)
        .expect("expected key 2 to leave");
    assert_eq!((removed.key(), removed.current()), (&2, &2));
}

#[test]
fn reevaluate_rescans_without_changing_the_predicate() {
    use std::sync::atomic::{AtomicI32, Ordering};

    let threshold = Arc::new(AtomicI32::new(5));
    let cache = SourceCache::from_iter(vec![(1, 3), (2, 8)]);
    let trigger: Subject<()> = Subject::new();

    let gate = threshold.clone();
    let filtered = cache
        .connect()
        .filter_full(
            predicate(move |v: &i32| *v >= gate.load(Ordering::SeqCst)),
            None,
            Some(Arc::new(trigger.clone())),
        )
        .as_cache();
    assert_eq!(filtered.count(), 1);

    threshold.store(2, Ordering::SeqCst);
    trigger.publish(&());
    assert_eq!(filtered.count(), 2);
}

#[test]
fn connect_filtered_replays_only_matching_items() {
    let cache = SourceCache::from_iter(vec![(1, 5), (2, 50), (3, 500)]);
    let seen: Arc<Mutex<Vec<ChangeSet<u32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = cache
        .connect_filtered(|v: &i32| *v >= 50)
        .subscribe(move |c: &ChangeSet<u32, i32>| sink.lock().push(c.clone()));

    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let keys: Vec<u32> = seen[0].iter().map(|c| *c.key()).collect();
        assert_eq!(keys, vec![2, 3]);
    }

    // Transitions across the boundary surface as add/remove.
    cache.edit(|updater| {
        updater.add_or_update(1, 60);
        updater.add_or_update(2, 4);
    });
    let seen = seen.lock();
    assert_eq!(seen[1].adds(), 1);
    assert_eq!(seen[1].removes(), 1);
}

#[test]
fn filtered_count_matches_a_direct_scan_after_random_churn() {
    let cache: SourceCache<u32, i32> = SourceCache::new();
    let filtered = cache.connect().filter(|v: &i32| *v > 50).as_cache();

    // Deterministic churn covering add, update, refresh and remove.
    cache.edit(|updater| {
        for i in 0..100u32 {
            updater.add_or_update(i, (i as i32 * 37) % 101);
        }
    });
    cache.edit(|updater| {
        for i in (0..100u32).step_by(3) {
            updater.add_or_update(i, (i as i32 * 53) % 101);
        }
        for i in (0..100u32).step_by(7) {
            updater.remove(&i);
        }
        for i in (1..100u32).step_by(11) {
            updater.refresh(&i);
        }
    });

    let expected = cache.snapshot().values().filter(|v| **v > 50).count();
    assert_eq!(filtered.count(), expected);
}
