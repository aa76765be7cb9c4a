//! Time- and size-based eviction through the source's edit path.

use parking_lot::Mutex;
use rill::scheduler::{Scheduler, VirtualScheduler};
use rill::{ChangeReason, ChangeSet, ObservableExt, SourceCache};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, PartialEq, Debug)]
struct Entry {
    ttl: Option<Duration>,
    label: &'static str,
}

fn entry(ttl_ms: Option<u64>, label: &'static str) -> Entry {
    Entry {
        ttl: ttl_ms.map(Duration::from_millis),
        label,
    }
}

#[test]
fn items_expire_at_their_deadline() {
    let scheduler = VirtualScheduler::new();
    let cache: SourceCache<u32, Entry> = SourceCache::new();

    let removed: Arc<Mutex<Vec<(u32, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = removed.clone();
    let tick = scheduler.clone();
    let _watch = cache.connect().subscribe(move |changes: &ChangeSet<u32, Entry>| {
        for change in changes.iter() {
            if change.reason() == ChangeReason::Remove {
                log.lock()
                    .push((*change.key(), tick.now().as_duration().as_millis() as u64));
            }
        }
    });

    let _expiry = cache.expire_after(
        |e: &Entry| e.ttl,
        None,
        Arc::new(scheduler.clone()),
    );

    cache.edit(|updater| {
        updater.add_or_update(1, entry(Some(100), "short"));
        updater.add_or_update(2, entry(Some(200), "long"));
    });

    scheduler.advance_by(Duration::from_millis(100));
    assert_eq!(*removed.lock(), vec![(1, 100)]);
    assert_eq!(cache.count(), 1);

    scheduler.advance_by(Duration::from_millis(100));
    assert_eq!(*removed.lock(), vec![(1, 100), (2, 200)]);
    assert_eq!(cache.count(), 0);
}

#[test]
fn no_ttl_means_no_expiry() {
    let scheduler = VirtualScheduler::new();
    let cache: SourceCache<u32, Entry> = SourceCache::new();
    let _expiry = cache.expire_after(|e: &Entry| e.ttl, None, Arc::new(scheduler.clone()));

    cache.edit(|updater| {
        updater.add_or_update(1, entry(None, "immortal"));
        updater.add_or_update(2, entry(Some(50), "mortal"));
    });

    scheduler.advance_by(Duration::from_secs(3600));
    assert_eq!(cache.count(), 1);
    assert_eq!(cache.lookup(&1).map(|e| e.label), Some("immortal"));
}

#[test]
fn updates_retime_their_item() {
    let scheduler = VirtualScheduler::new();
    let cache: SourceCache<u32, Entry> = SourceCache::new();
    let _expiry = cache.expire_after(|e: &Entry| e.ttl, None, Arc::new(scheduler.clone()));

    cache.edit(|updater| updater.add_or_update(1, entry(Some(100), "a")));
    scheduler.advance_by(Duration::from_millis(60));

    // Re-writing the item restarts its clock.
    cache.edit(|updater| updater.add_or_update(1, entry(Some(100), "a2")));
    scheduler.advance_by(Duration::from_millis(60));
    assert_eq!(cache.count(), 1);

    scheduler.advance_by(Duration::from_millis(40));
    assert_eq!(cache.count(), 0);
}

#[test]
fn polled_expiry_batches_at_the_interval() {
    let scheduler = VirtualScheduler::new();
    let cache: SourceCache<u32, Entry> = SourceCache::new();
    let _expiry = cache.expire_after(
        |e: &Entry| e.ttl,
        Some(Duration::from_millis(100)),
        Arc::new(scheduler.clone()),
    );

    cache.edit(|updater| {
        updater.add_or_update(1, entry(Some(10), "a"));
        updater.add_or_update(2, entry(Some(60), "b"));
    });

    // Nothing fires before the first poll even though both are due.
    scheduler.advance_by(Duration::from_millis(99));
    assert_eq!(cache.count(), 2);

    scheduler.advance_by(Duration::from_millis(1));
    assert_eq!(cache.count(), 0);
}

#[test]
fn size_cap_evicts_oldest_first() {
    let cache: SourceCache<u32, i32> = SourceCache::new();
    let _cap = cache.limit_size_to(3);

    cache.edit(|updater| {
        for i in 1..=5u32 {
            updater.add_or_update(i, i as i32);
        }
    });

    assert_eq!(cache.count(), 3);
    let survivors: Vec<u32> = cache.snapshot().keys().copied().collect();
    assert_eq!(survivors, vec![3, 4, 5]);
}

#[test]
fn size_cap_ignores_updates_at_capacity() {
    let cache: SourceCache<u32, i32> = SourceCache::new();
    let removals = Arc::new(Mutex::new(0usize));

    let counter = removals.clone();
    let _watch = cache.connect().subscribe(move |changes: &ChangeSet<u32, i32>| {
        *counter.lock() += changes.removes();
    });
    let _cap = cache.limit_size_to(3);

    cache.edit(|updater| {
        for i in 1..=3u32 {
            updater.add_or_update(i, 0);
        }
    });
    cache.edit(|updater| updater.add_or_update(2, 99));

    assert_eq!(cache.count(), 3);
    assert_eq!(*removals.lock(), 0);
    // An update must not refresh the item's age either: the next
    // overflow still evicts key 1.
    cache.edit(|updater| updater.add_or_update(4, 0));
    let survivors: Vec<u32> = cache.snapshot().keys().copied().collect();
    assert_eq!(survivors, vec![2, 3, 4]);
}
