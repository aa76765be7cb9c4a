//! Sorted projections bound to ordered lists, and the reset-threshold
//! heuristic.

use parking_lot::Mutex;
use rill::ops::{ListAdapter, SortOptions, SortedStreamExt};
use rill::{comparing_by, ChangeStreamExt, SourceCache};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Records every adapter callback so tests can assert on notification
/// shape rather than just final content.
struct RecordingAdapter {
    list: Arc<Mutex<Vec<i32>>>,
    resets: Arc<AtomicUsize>,
    inserts: Arc<AtomicUsize>,
}

impl ListAdapter<u32, i32> for RecordingAdapter {
    fn insert(&mut self, index: usize, _key: &u32, value: &i32) {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.list.lock().insert(index, *value);
    }

    fn remove(&mut self, index: usize) {
        self.list.lock().remove(index);
    }

    fn replace(&mut self, index: usize, _key: &u32, value: &i32) {
        self.list.lock()[index] = *value;
    }

    fn move_item(&mut self, from: usize, to: usize, _key: &u32, _value: &i32) {
        let mut list = self.list.lock();
        let item = list.remove(from);
        list.insert(to, item);
    }

    fn reset(&mut self, items: &[(u32, i32)]) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        let mut list = self.list.lock();
        list.clear();
        list.extend(items.iter().map(|(_, v)| *v));
    }
}

#[test]
fn threshold_decides_between_reset_and_incremental() {
    let cache: SourceCache<u32, i32> = SourceCache::new();
    let list = Arc::new(Mutex::new(Vec::new()));
    let resets = Arc::new(AtomicUsize::new(0));
    let inserts = Arc::new(AtomicUsize::new(0));

    let _sub = cache
        .connect()
        .sort(
            comparing_by(|v: &i32| *v),
            SortOptions::default().with_reset_threshold(3),
        )
        .bind_to(RecordingAdapter {
            list: list.clone(),
            resets: resets.clone(),
            inserts: inserts.clone(),
        });

    // Five adds in one batch exceed the threshold: one reset, no
    // per-item inserts.
    cache.edit(|updater| {
        for i in 0..5u32 {
            updater.add_or_update(i, 50 - i as i32);
        }
    });
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert_eq!(inserts.load(Ordering::SeqCst), 0);
    assert_eq!(*list.lock(), vec![46, 47, 48, 49, 50]);

    // Two adds stay incremental: two inserts, no further reset.
    cache.edit(|updater| {
        updater.add_or_update(10, 0);
        updater.add_or_update(11, 100);
    });
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert_eq!(inserts.load(Ordering::SeqCst), 2);
    assert_eq!(*list.lock(), vec![0, 46, 47, 48, 49, 50, 100]);
}

#[test]
fn bound_list_stays_consistent_with_the_sorted_cache() {
    let cache: SourceCache<u32, i32> = SourceCache::new();
    let (list, _sub) = cache
        .connect()
        .sort_and_bind(comparing_by(|v: &i32| *v), SortOptions::default());

    cache.edit(|updater| {
        updater.add_or_update(1, 30);
        updater.add_or_update(2, 10);
        updater.add_or_update(3, 20);
    });
    assert_eq!(list.to_vec(), vec![10, 20, 30]);

    cache.edit(|updater| {
        updater.add_or_update(2, 40); // relocates to the end
        updater.remove(&3);
        updater.add_or_update(4, 5);
    });

    let mut expected: Vec<i32> = cache.snapshot().values().copied().collect();
    expected.sort_unstable();
    assert_eq!(list.to_vec(), expected);
}

#[test]
fn binary_search_positioning_matches_linear() {
    let linear_cache: SourceCache<u32, i32> = SourceCache::new();
    let binary_cache: SourceCache<u32, i32> = SourceCache::new();

    let (linear, _sub_a) = linear_cache
        .connect()
        .sort_and_bind(comparing_by(|v: &i32| *v), SortOptions::default());
    let (binary, _sub_b) = binary_cache.connect().sort_and_bind(
        comparing_by(|v: &i32| *v),
        SortOptions::default().with_binary_search(),
    );

    for (i, value) in [7, 3, 9, 1, 4, 8, 2, 6, 5, 0].iter().enumerate() {
        linear_cache.edit(|updater| updater.add_or_update(i as u32, *value));
        binary_cache.edit(|updater| updater.add_or_update(i as u32, *value));
    }
    assert_eq!(linear.to_vec(), binary.to_vec());
    assert_eq!(linear.to_vec(), (0..10).collect::<Vec<i32>>());
}

#[test]
fn replace_for_updates_keeps_in_place_updates_single() {
    let cache: SourceCache<u32, i32> = SourceCache::new();
    let list = Arc::new(Mutex::new(Vec::new()));
    let resets = Arc::new(AtomicUsize::new(0));
    let inserts = Arc::new(AtomicUsize::new(0));

    let _sub = cache
        .connect()
        .sort(comparing_by(|v: &i32| *v), SortOptions::default())
        .bind_to(RecordingAdapter {
            list: list.clone(),
            resets: resets.clone(),
            inserts: inserts.clone(),
        });

    cache.edit(|updater| {
        updater.add_or_update(1, 10);
        updater.add_or_update(2, 20);
    });
    let inserts_before = inserts.load(Ordering::SeqCst);

    // An in-place update replaces at index; no insert happens.
    cache.edit(|updater| updater.add_or_update(1, 12));
    assert_eq!(inserts.load(Ordering::SeqCst), inserts_before);
    assert_eq!(*list.lock(), vec![12, 20]);
}
