//! Slot cells under concurrent writers and readers.

use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tandem::{pin, Slot, SlotArray};

#[test]
#[cfg_attr(miri, ignore)]
fn test_readers_only_see_written_values() {
    const SLOTS: usize = 64;
    let slots = Arc::new(SlotArray::<(usize, usize)>::new(SLOTS));
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let slots = Arc::clone(&slots);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for round in 0..20_000 {
                    let index = rng.gen_range(0..SLOTS);
                    match rng.gen_range(0..3) {
                        0 => {
                            slots.try_insert(index, (index, round));
                        }
                        1 => {
                            slots.set(index, (index, round));
                        }
                        _ => {
                            slots.try_remove(index);
                        }
                    }
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let slots = Arc::clone(&slots);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let guard = pin();
                    for (index, value) in slots.iter(&guard) {
                        // Values are never torn or moved between cells.
                        assert_eq!(value.0, index);
                    }
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
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_remove_has_single_winner() {
    const ROUNDS: usize = 200;
    let slots = Arc::new(SlotArray::new(1));
    let removed = Arc::new(AtomicUsize::new(0));

    for round in 0..ROUNDS {
        assert!(slots.try_insert(0, round));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let slots = Arc::clone(&slots);
                let removed = Arc::clone(&removed);
                thread::spawn(move || {
                    if slots.try_remove(0) {
                        removed.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let guard = pin();
        assert_eq!(slots.get(0, &guard), Slot::Empty);
    }
    assert_eq!(removed.load(Ordering::Relaxed), ROUNDS);
}
