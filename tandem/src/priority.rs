//! Scheduling boost for the thread that swaps buffers in.
//!
//! While the swap waits for writers to leave and allocates the new buffer,
//! every other thread touching the container is spinning on it. The swapping
//! thread lowers its nice value for that window and puts it back on drop.
//!
//! The boost is best effort. Lowering a nice value needs `CAP_SYS_NICE` or a
//! permissive `RLIMIT_NICE`; without either the thread keeps its priority.
//! Outside Linux the guard does nothing.

/// Raises the calling thread's priority until dropped.
pub(crate) struct PriorityBoost {
    restore: Option<i32>,
}

impl PriorityBoost {
    pub(crate) fn raise() -> Self {
        Self {
            restore: imp::raise(),
        }
    }

    /// Returns `true` if the priority was actually raised.
    #[cfg(test)]
    pub(crate) fn is_raised(&self) -> bool {
        self.restore.is_some()
    }
}

impl Drop for PriorityBoost {
    fn drop(&mut self) {
        if let Some(nice) = self.restore.take() {
            imp::restore(nice);
        }
    }
}

#[cfg(all(target_os = "linux", not(miri)))]
mod imp {
    use tracing::{trace, warn};

    /// Nice steps taken off while boosted.
    const BOOST: libc::c_int = 5;
    const MIN_NICE: libc::c_int = -20;

    // With `who == 0`, PRIO_PROCESS addresses the calling thread on Linux.

    pub(super) fn current() -> Option<i32> {
        // getpriority may legitimately return -1, so errno tells failures apart.
        let nice = unsafe {
            *libc::__errno_location() = 0;
            libc::getpriority(libc::PRIO_PROCESS, 0)
        };
        if nice == -1 && std::io::Error::last_os_error().raw_os_error() != Some(0) {
            return None;
        }
        Some(nice)
    }

    pub(super) fn raise() -> Option<i32> {
        let nice = current()?;
        let boosted = (nice - BOOST).max(MIN_NICE);
        if boosted == nice {
            return None;
        }
        if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, boosted) } != 0 {
            trace!(
                nice,
                error = %std::io::Error::last_os_error(),
                "priority boost not permitted"
            );
            return None;
        }
        Some(nice)
    }

    pub(super) fn restore(nice: i32) {
        if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) } != 0 {
            warn!(
                nice,
                error = %std::io::Error::last_os_error(),
                "failed to restore thread priority"
            );
        }
    }
}

#[cfg(not(all(target_os = "linux", not(miri))))]
mod imp {
    #[allow(dead_code)]
    pub(super) fn current() -> Option<i32> {
        None
    }

    pub(super) fn raise() -> Option<i32> {
        None
    }

    pub(super) fn restore(_nice: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_restored_on_drop() {
        let before = imp::current();
        {
            let boost = PriorityBoost::raise();
            if boost.is_raised() {
                assert!(imp::current() < before);
            } else {
                assert_eq!(imp::current(), before);
            }
        }
        assert_eq!(imp::current(), before);
    }

    #[test]
    fn test_priority_restored_on_unwind() {
        let before = imp::current();
        let result = std::panic::catch_unwind(|| {
            let _boost = PriorityBoost::raise();
            panic!("swap failed");
        });
        assert!(result.is_err());
        assert_eq!(imp::current(), before);
    }
}
