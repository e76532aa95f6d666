use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tandem_work::{Work, WorkContext, WorkError};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn spin_until(flag: &AtomicBool) {
    while !flag.load(Ordering::Acquire) {
        thread::yield_now();
    }
}

fn dedicated(threads: usize) -> WorkContext {
    WorkContext::builder()
        .name("test")
        .dedicated_threads(threads)
        .initial_capacity(4)
        .build()
        .unwrap()
}

#[test]
fn test_builder_rejects_zero_capacity() {
    let err = WorkContext::builder().initial_capacity(0).build().unwrap_err();
    assert_eq!(err, WorkError::Config(tandem::Error::ZeroCapacity));
}

#[test]
fn test_start_and_wait_contract() {
    let context = dedicated(1);
    let work = context.add_work(|| {}, false).unwrap();
    assert!(!work.is_exclusive());
    assert_eq!(work.wait(), Err(WorkError::NotStarted));

    work.start().unwrap();
    assert_eq!(work.start(), Err(WorkError::AlreadyStarted));
    work.wait().unwrap();
    assert!(work.is_completed());
    assert_eq!(work.error(), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_ambient_pool_runs_everything() {
    init_tracing();
    let context = WorkContext::new();
    assert_eq!(context.dedicated_threads(), 0);
    let counter = Arc::new(AtomicUsize::new(0));

    let work: Vec<Work> = (0..200)
        .map(|_| {
            let counter = Arc::clone(&counter);
            context
                .submit(
                    move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    },
                    false,
                )
                .unwrap()
        })
        .collect();
    for w in &work {
        w.wait().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 200);
    assert_eq!(context.active_threads(), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_workers_spawn_lazily() {
    init_tracing();
    let context = dedicated(3);
    assert_eq!(context.name(), "test");
    assert_eq!(context.active_threads(), 0);

    let work = context.submit(|| {}, false).unwrap();
    work.wait().unwrap();
    let active = context.active_threads();
    assert!((1..=3).contains(&active), "active = {active}");

    for _ in 0..50 {
        context.submit(|| thread::sleep(Duration::from_millis(1)), false).unwrap();
    }
    assert!(context.active_threads() <= 3);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_panic_is_reported_and_context_survives() {
    init_tracing();
    let context = dedicated(2);
    let failing = context.submit(|| panic!("boom"), false).unwrap();
    assert_eq!(failing.wait(), Err(WorkError::Panicked("boom".to_string())));
    assert!(failing.is_completed());

    let hit = Arc::new(AtomicBool::new(false));
    let after = {
        let hit = Arc::clone(&hit);
        context
            .submit(move || hit.store(true, Ordering::Release), false)
            .unwrap()
    };
    after.wait().unwrap();
    assert!(hit.load(Ordering::Acquire));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_wait_runs_queued_items() {
    init_tracing();
    // One worker: `inner` can only run if the waiting item helps.
    let context = dedicated(1);
    let inner = context.add_work(|| {}, false).unwrap();
    let inner_started = Arc::new(AtomicBool::new(false));

    let outer = {
        let inner = inner.clone();
        let inner_started = Arc::clone(&inner_started);
        context
            .submit(
                move || {
                    spin_until(&inner_started);
                    inner.wait().unwrap();
                },
                false,
            )
            .unwrap()
    };
    inner.start().unwrap();
    inner_started.store(true, Ordering::Release);

    outer.wait().unwrap();
    assert!(inner.is_completed());
}

fn check_exclusive_isolation(context: &WorkContext) {
    let running = Arc::new(AtomicUsize::new(0));
    let exclusive_active = Arc::new(AtomicBool::new(false));
    let mut work = Vec::new();

    for i in 0..300 {
        let running = Arc::clone(&running);
        let exclusive_active = Arc::clone(&exclusive_active);
        let w = if i % 50 == 25 {
            context.submit(
                move || {
                    exclusive_active.store(true, Ordering::SeqCst);
                    for _ in 0..20 {
                        assert_eq!(running.load(Ordering::SeqCst), 0);
                        thread::yield_now();
                    }
                    exclusive_active.store(false, Ordering::SeqCst);
                },
                true,
            )
        } else {
            context.submit(
                move || {
                    running.fetch_add(1, Ordering::SeqCst);
                    assert!(!exclusive_active.load(Ordering::SeqCst));
                    for _ in 0..100 {
                        std::hint::spin_loop();
                    }
                    assert!(!exclusive_active.load(Ordering::SeqCst));
                    running.fetch_sub(1, Ordering::SeqCst);
                },
                false,
            )
        };
        work.push(w.unwrap());
    }

    for w in &work {
        assert_eq!(w.wait(), Ok(()));
    }
    assert_eq!(work.iter().filter(|w| w.is_exclusive()).count(), 6);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_exclusive_isolation_dedicated() {
    init_tracing();
    let context = dedicated(4);
    check_exclusive_isolation(&context);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_exclusive_isolation_ambient() {
    init_tracing();
    let context = WorkContext::new();
    check_exclusive_isolation(&context);
}

/// Runs `body` on a helper thread and fails if it has not finished in time.
fn finishes_within(timeout: Duration, body: impl FnOnce() + Send + 'static) {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        body();
        let _ = tx.send(());
    });
    rx.recv_timeout(timeout)
        .expect("work did not finish; exclusive item starved");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_exclusive_waits_on_item_popped_by_worker() {
    init_tracing();
    finishes_within(Duration::from_secs(5), || {
        let context = Arc::new(dedicated(2));
        let exclusive = {
            let inner = Arc::clone(&context);
            context
                .submit(
                    move || {
                        let x = inner.submit(|| {}, false).unwrap();
                        // Let the second worker pop `x` and meet the gate.
                        thread::sleep(Duration::from_millis(50));
                        x.wait().unwrap();
                    },
                    true,
                )
                .unwrap()
        };
        exclusive.wait().unwrap();
        context.dispose();
    });
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_exclusive_waits_on_exclusive() {
    init_tracing();
    finishes_within(Duration::from_secs(5), || {
        let context = Arc::new(dedicated(2));
        let hits = Arc::new(AtomicUsize::new(0));
        let outer = {
            let inner = Arc::clone(&context);
            let hits = Arc::clone(&hits);
            context
                .submit(
                    move || {
                        let nested = {
                            let hits = Arc::clone(&hits);
                            inner
                                .submit(
                                    move || {
                                        hits.fetch_add(1, Ordering::SeqCst);
                                    },
                                    true,
                                )
                                .unwrap()
                        };
                        thread::sleep(Duration::from_millis(50));
                        nested.wait().unwrap();
                        hits.fetch_add(1, Ordering::SeqCst);
                    },
                    true,
                )
                .unwrap()
        };
        outer.wait().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        context.dispose();
    });
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_held_items_run_after_exclusive() {
    init_tracing();
    finishes_within(Duration::from_secs(5), || {
        let context = dedicated(3);
        let release = Arc::new(AtomicBool::new(false));
        let exclusive = {
            let release = Arc::clone(&release);
            context
                .submit(move || spin_until(&release), true)
                .unwrap()
        };
        let counter = Arc::new(AtomicUsize::new(0));
        let shared: Vec<Work> = (0..20)
            .map(|_| {
                let counter = Arc::clone(&counter);
                context
                    .submit(
                        move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        },
                        false,
                    )
                    .unwrap()
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        release.store(true, Ordering::Release);
        exclusive.wait().unwrap();
        for w in &shared {
            w.wait().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(context.pending(), 0);
    });
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_pending_counts_queued_items() {
    init_tracing();
    let context = dedicated(1);
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let blocker = {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        context
            .submit(
                move || {
                    started.store(true, Ordering::Release);
                    spin_until(&release);
                },
                false,
            )
            .unwrap()
    };
    spin_until(&started);

    let queued: Vec<_> = (0..3).map(|_| context.submit(|| {}, false).unwrap()).collect();
    assert_eq!(context.pending(), 3);

    release.store(true, Ordering::Release);
    blocker.wait().unwrap();
    for w in &queued {
        w.wait().unwrap();
    }
    assert_eq!(context.pending(), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_dispose_abandons_pending_work() {
    init_tracing();
    let context = Arc::new(dedicated(1));
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let blocker = {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        context
            .submit(
                move || {
                    started.store(true, Ordering::Release);
                    spin_until(&release);
                },
                false,
            )
            .unwrap()
    };
    spin_until(&started);
    let queued = context.submit(|| unreachable!(), false).unwrap();
    let unstarted = context.add_work(|| {}, false).unwrap();

    // Release the blocker only once disposal has begun, so the worker exits
    // instead of picking up the queued item.
    let releaser = {
        let context = Arc::clone(&context);
        let release = Arc::clone(&release);
        thread::spawn(move || {
            while !context.is_disposed() {
                thread::yield_now();
            }
            release.store(true, Ordering::Release);
        })
    };
    context.dispose();
    releaser.join().unwrap();

    assert!(context.is_disposed());
    assert_eq!(context.active_threads(), 0);
    assert_eq!(blocker.wait(), Ok(()));
    assert!(queued.is_completed());
    assert_eq!(queued.wait(), Err(WorkError::Disposed));
    assert_eq!(unstarted.start(), Err(WorkError::Disposed));
    assert_eq!(context.add_work(|| {}, false).err(), Some(WorkError::Disposed));

    // Idempotent.
    context.dispose();
}
