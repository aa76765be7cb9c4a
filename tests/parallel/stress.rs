use rand::seq::SliceRandom;
use rand::Rng;

use rill::ops::SortOptions;
use rill::{comparing_by, ChangeStreamExt, SourceCache};
use std::sync::Arc;

// Number of operations each writer performs
const N_WRITERS: usize = 4;
const N_WRITER_OPS: usize = 250;
const KEY_SPACE: u32 = 40;

#[derive(Clone, Copy, Debug)]
enum WriteOp {
    Set(u32, u64),
    Remove(u32),
    Refresh(u32),
    Batch,
}

impl rand::distributions::Distribution<WriteOp> for rand::distributions::Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> WriteOp {
        let key = rng.gen::<u32>() % KEY_SPACE;
        match rng.gen_range(0..10) {
            0 => WriteOp::Remove(key),
            1 => WriteOp::Refresh(key),
            2 => WriteOp::Batch,
            _ => WriteOp::Set(key, rng.gen::<u64>() % 1000),
        }
    }
}

impl WriteOp {
    fn execute(self, cache: &SourceCache<u32, u64>, rng: &mut impl Rng) {
        match self {
            WriteOp::Set(key, value) => cache.edit(|updater| updater.add_or_update(key, value)),
            WriteOp::Remove(key) => cache.edit(|updater| updater.remove(&key)),
            WriteOp::Refresh(key) => cache.edit(|updater| updater.refresh(&key)),
            WriteOp::Batch => {
                // A multi-key session commits atomically as one batch.
                let keys: Vec<u32> = (0..KEY_SPACE).collect();
                let chosen: Vec<u32> = keys.choose_multiple(rng, 5).copied().collect();
                cache.edit(|updater| {
                    for key in chosen {
                        updater.add_or_update(key, u64::from(key) * 2);
                    }
                });
            }
        }
    }
}

#[test]
fn stress_test() {
    env_logger::try_init().ok();
    let cache: Arc<SourceCache<u32, u64>> = Arc::new(SourceCache::new());

    // One pipeline under test: filter -> transform -> derived cache,
    // plus an independent sorted binding.
    let evens = cache
        .connect()
        .filter(|v: &u64| v % 2 == 0)
        .transform(|v: &u64| v * 10)
        .as_cache();
    let (sorted, _sorted_sub) = cache
        .connect()
        .sort_and_bind(comparing_by(|v: &u64| *v), SortOptions::default());

    let mut writers = vec![];
    for seed in 0..N_WRITERS {
        let cache = cache.clone();
        writers.push(std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..N_WRITER_OPS {
                let op: WriteOp = rng.gen();
                // Stagger writers a little so interleavings vary.
                if seed % 2 == 0 {
                    std::thread::yield_now();
                }
                op.execute(&cache, &mut rng);
            }
        }));
    }
    for writer in writers {
        writer.join().unwrap();
    }

    // Universal invariants at the final commit point.
    let snapshot = cache.snapshot();
    assert_eq!(snapshot.count(), cache.count());

    // The filtered+transformed mirror agrees with a direct scan.
    let expected_evens: Vec<(u32, u64)> = snapshot
        .pairs()
        .filter(|(_, v)| *v % 2 == 0)
        .map(|(k, v)| (*k, v * 10))
        .collect();
    assert_eq!(evens.count(), expected_evens.len());
    for (key, value) in expected_evens {
        assert_eq!(evens.lookup(&key), Some(value));
    }

    // The bound list is exactly the cache ordered by the comparer.
    let mut expected_sorted: Vec<u64> = snapshot.values().copied().collect();
    expected_sorted.sort_unstable();
    assert_eq!(sorted.to_vec(), expected_sorted);
}
