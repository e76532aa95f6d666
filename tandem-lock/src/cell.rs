//! A single-writer, multi-reader cell locked through context slots.
//!
//! The writer holds the lock with a claimed [`LockSlot`] and publishes
//! values into that slot. Readers never block: they resolve the most recent
//! capture through [`LockContext::read`] and otherwise see the value last
//! committed by a released guard.

use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_epoch as epoch;
use crossbeam_utils::Backoff;
use std::sync::Arc;
use tandem::SlotCell;

use crate::context::{LockContext, LockSlot};
use crate::error::LockError;
use crate::flags::SlotFlags;

const UNLOCKED: usize = 0;

/// A value guarded by one slot of a shared [`LockContext`] at a time.
pub struct SlotLock<T: Send + Sync + 'static> {
    context: Arc<LockContext<T>>,
    /// Holder's slot id plus one, `UNLOCKED` when free.
    owner: AtomicUsize,
    captured: SlotFlags,
    committed: SlotCell<T>,
}

impl<T: Clone + Send + Sync + 'static> SlotLock<T> {
    /// Creates an unlocked cell holding `value`.
    pub fn new(context: Arc<LockContext<T>>, value: T) -> Self {
        let captured = context.flags();
        Self {
            context,
            owner: AtomicUsize::new(UNLOCKED),
            captured,
            committed: SlotCell::with_value(value),
        }
    }

    /// The context whose slots may hold this lock.
    pub fn context(&self) -> &Arc<LockContext<T>> {
        &self.context
    }

    /// Id of the slot holding the lock, if any.
    pub fn holder(&self) -> Option<usize> {
        self.owner.load(Ordering::Acquire).checked_sub(1)
    }

    /// Returns `true` while some slot holds the lock.
    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    /// Takes the lock for `slot` without waiting.
    ///
    /// A slot publishes one value, so it should hold one lock at a time.
    pub fn try_lock<'s, 'c>(
        &'s self,
        slot: &'s LockSlot<'c, T>,
    ) -> Result<SlotGuard<'s, 'c, T>, LockError> {
        if !core::ptr::eq(slot.context(), Arc::as_ptr(&self.context)) {
            return Err(LockError::ForeignSlot);
        }
        match self.owner.compare_exchange(
            UNLOCKED,
            slot.id() + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(SlotGuard { lock: self, slot }),
            Err(owner) => Err(LockError::Held { owner: owner - 1 }),
        }
    }

    /// Takes the lock for `slot`, spinning and then yielding while it is held.
    pub fn lock<'s, 'c>(
        &'s self,
        slot: &'s LockSlot<'c, T>,
    ) -> Result<SlotGuard<'s, 'c, T>, LockError> {
        let backoff = Backoff::new();
        loop {
            match self.try_lock(slot) {
                Err(LockError::Held { .. }) => backoff.snooze(),
                other => return other,
            }
        }
    }

    /// The current value: the latest capture of the holder, otherwise the
    /// last committed value.
    pub fn value(&self) -> Option<T> {
        if let Some(value) = self.context.read(&self.captured) {
            return Some(value);
        }
        let guard = epoch::pin();
        self.committed.load(&guard).into_option().cloned()
    }
}

impl<T: Send + Sync + 'static> core::fmt::Debug for SlotLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlotLock")
            .field("owner", &self.owner.load(Ordering::Relaxed).checked_sub(1))
            .field("captured", &self.captured)
            .finish()
    }
}

/// Exclusive write access to a [`SlotLock`].
///
/// Dropping the guard commits the captured value and releases the lock.
pub struct SlotGuard<'s, 'c, T: Clone + Send + Sync + 'static> {
    lock: &'s SlotLock<T>,
    slot: &'s LockSlot<'c, T>,
}

impl<T: Clone + Send + Sync + 'static> SlotGuard<'_, '_, T> {
    /// The holding slot.
    pub fn slot(&self) -> &LockSlot<'_, T> {
        self.slot
    }

    /// Publishes `value` to readers of the lock.
    pub fn capture(&self, value: T) {
        self.slot.set(value);
        self.lock.captured.set(self.slot.id());
    }

    /// Withdraws the capture; readers fall back to the committed value.
    pub fn uncapture(&self) {
        self.lock.captured.clear(self.slot.id());
    }

    /// The value published through this guard, if it is captured.
    pub fn captured(&self) -> Option<T> {
        if self.lock.captured.contains(self.slot.id()) {
            self.slot.value()
        } else {
            None
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for SlotGuard<'_, '_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.captured() {
            let guard = epoch::pin();
            self.lock.committed.set(value, &guard);
        }
        self.lock.captured.clear(self.slot.id());
        self.lock.owner.store(UNLOCKED, Ordering::Release);
    }
}
