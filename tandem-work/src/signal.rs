//! Blocking primitives for the idle path.
//!
//! Workers and waiters only block here after spinning has failed to find
//! anything to do; the hot path never takes these locks.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

struct State {
    permits: usize,
    closed: bool,
}

/// A counting wake-up signal for idle workers.
///
/// Each `notify` leaves one permit, so a notification sent before the worker
/// blocks is not lost.
pub(crate) struct Signal {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                permits: 0,
                closed: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Leaves a permit and wakes one blocked thread.
    pub(crate) fn notify(&self) {
        let mut state = self.state.lock();
        state.permits += 1;
        self.condvar.notify_one();
    }

    /// Wakes every blocked thread; later waits return immediately.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.condvar.notify_all();
    }

    /// Blocks until a permit is available and consumes it.
    ///
    /// Returns `false` once the signal is closed.
    pub(crate) fn wait(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return false;
            }
            if state.permits > 0 {
                state.permits -= 1;
                return true;
            }
            self.condvar.wait(&mut state);
        }
    }
}

/// Broadcast of "some item completed" for threads blocked in `wait`.
pub(crate) struct Completion {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn notify_all(&self) {
        let _lock = self.lock.lock();
        self.condvar.notify_all();
    }

    /// Blocks until notified or `timeout` passes, unless `done` already holds.
    pub(crate) fn wait_for(&self, done: impl Fn() -> bool, timeout: Duration) {
        let mut lock = self.lock.lock();
        if !done() {
            self.condvar.wait_for(&mut lock, timeout);
        }
    }
}
