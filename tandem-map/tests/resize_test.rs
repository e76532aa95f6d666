use foldhash::fast::FixedState;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tandem_map::{HashMap, MapOptions};

fn tiny() -> HashMap<u64, u64> {
    HashMap::with_options(MapOptions::new(4, 2)).unwrap()
}

#[test]
fn test_revision_moves_with_resizes_only() {
    let map = tiny();
    map.insert(1, 1);
    let revision = map.revision();
    map.insert(1, 2);
    map.remove(&1);
    assert_eq!(map.revision(), revision);

    let capacity = map.capacity();
    for i in 0..256 {
        map.insert(i, i);
    }
    assert!(map.capacity() > capacity);
    assert!(map.revision() > revision);
}

#[test]
fn test_lookups_stay_within_budget_after_resizes() {
    for seed in 0..20u64 {
        let map = HashMap::with_options_and_hasher(
            MapOptions::new(16, 2),
            FixedState::with_seed(seed),
        )
        .unwrap();
        for key in 0..4096u64 {
            map.insert(key, key);
        }
        assert!(map.capacity() > 16);
        assert!(
            map.extent() <= map.max_probing(),
            "seed {seed}: extent {} over budget {}",
            map.extent(),
            map.max_probing()
        );
        for key in 0..4096u64 {
            assert_eq!(map.get(&key), Some(key), "seed {seed}: key {key} lost");
        }
    }
}

#[test]
fn test_values_survive_many_resizes() {
    let map = tiny();
    for i in 0..5_000 {
        assert!(map.try_insert(i, i * 7));
    }
    for i in 0..5_000 {
        assert_eq!(map.get(&i), Some(i * 7), "key {i} lost in resize");
    }
    assert_eq!(map.len(), 5_000);
    assert_eq!(map.iter().count(), 5_000);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_readers_see_prefilled_keys_during_resizes() {
    let map = Arc::new(tiny());
    for i in 0..256 {
        map.insert(i, i);
    }
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let map = map.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    for i in 0..256 {
                        assert_eq!(map.get(&i), Some(i));
                    }
                }
            })
        })
        .collect();

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let map = map.clone();
            thread::spawn(move || {
                for i in 0..5_000 {
                    let key = 1_000_000 + t * 5_000 + i;
                    map.insert(key, key);
                }
            })
        })
        .collect();

    for h in writers {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for h in readers {
        h.join().unwrap();
    }

    assert_eq!(map.len(), 256 + 20_000);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_set_remove_counts_are_linearizable() {
    const KEYS: u64 = 64;
    let map = Arc::new(tiny());
    let inserted = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let map = map.clone();
            let inserted = inserted.clone();
            let removed = removed.clone();
            thread::spawn(move || {
                for i in 0..4_000u64 {
                    let key = (i * 31 + t * 7) % KEYS;
                    if (i + t) % 2 == 0 {
                        if map.set(key, i) {
                            inserted.fetch_add(1, Ordering::Relaxed);
                        }
                    } else if map.remove(&key).is_some() {
                        removed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let live = (0..KEYS).filter(|k| map.contains_key(k)).count();
    let net = inserted.load(Ordering::Relaxed) - removed.load(Ordering::Relaxed);
    assert_eq!(live, net);
    assert_eq!(map.len(), live);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_try_insert_single_winner_across_resizes() {
    let map = Arc::new(tiny());
    let wins = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let map = map.clone();
            let wins = wins.clone();
            thread::spawn(move || {
                for key in 0..2_000u64 {
                    if map.try_insert(key, t) {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(wins.load(Ordering::Relaxed), 2_000);
    assert_eq!(map.len(), 2_000);
    let mut keys: Vec<_> = map.keys().collect();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), 2_000);
}
