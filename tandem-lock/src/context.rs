//! Lock slot arena.
//!
//! A [`LockContext`] preallocates a fixed pool of slots. Claimants take a
//! released slot from the free list first, otherwise the next never-used
//! slot. Every claim and every published value stamps the slot with a fresh
//! [`VersionToken`], so the latest publisher among several slots is always
//! identifiable.

use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_epoch as epoch;
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::{Backoff, CachePadded};
use portable_atomic::AtomicU64;
use tandem::{AtomicVersionToken, SlotCell, VersionProvider, VersionToken};
use tracing::{error, trace};

use crate::error::LockError;
use crate::flags::SlotFlags;

/// Upper bound on the slots of one context.
pub const MAX_SLOTS: usize = 4096;

/// Identity of the calling thread, stable for its lifetime and never zero.
pub(crate) fn current_thread() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

struct Entry<T> {
    token: AtomicVersionToken,
    /// Claiming thread, zero while the slot is free.
    owner: AtomicU64,
    value: SlotCell<T>,
}

/// A fixed pool of versioned, recyclable slots.
pub struct LockContext<T> {
    entries: Box<[Entry<T>]>,
    free: ArrayQueue<usize>,
    next: CachePadded<AtomicUsize>,
    versions: VersionProvider,
}

impl<T: Send + Sync + 'static> LockContext<T> {
    /// Creates a context with `capacity` slots, `1..=MAX_SLOTS`.
    pub fn new(capacity: usize) -> Result<Self, LockError> {
        Self::with_versions(capacity, VersionProvider::new())
    }

    /// Creates a context stamping claims from `versions`.
    pub fn with_versions(capacity: usize, versions: VersionProvider) -> Result<Self, LockError> {
        if capacity == 0 {
            return Err(tandem::Error::ZeroCapacity.into());
        }
        if capacity > MAX_SLOTS {
            return Err(LockError::TooManySlots {
                requested: capacity,
                max: MAX_SLOTS,
            });
        }
        let entries = (0..capacity)
            .map(|_| Entry {
                token: AtomicVersionToken::new(VersionToken::default()),
                owner: AtomicU64::new(0),
                value: SlotCell::new(),
            })
            .collect();
        Ok(Self {
            entries,
            free: ArrayQueue::new(capacity),
            next: CachePadded::new(AtomicUsize::new(0)),
            versions,
        })
    }

    /// Number of slots in the pool.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// A flag set sized for this context.
    pub fn flags(&self) -> SlotFlags {
        SlotFlags::new(self.capacity())
    }

    /// Claims a slot, or `None` if every slot is taken.
    pub fn try_claim(&self) -> Option<LockSlot<'_, T>> {
        let id = match self.free.pop() {
            Some(id) => id,
            None => self.claim_fresh()?,
        };
        let entry = &self.entries[id];
        let token = self.versions.advance_new_token();
        entry.token.store(token);
        entry.owner.store(current_thread(), Ordering::Release);
        trace!(id, epoch = token.epoch(), sequence = token.sequence(), "lock slot claimed");
        Some(LockSlot { context: self, id })
    }

    fn claim_fresh(&self) -> Option<usize> {
        let mut next = self.next.load(Ordering::Acquire);
        loop {
            if next >= self.entries.len() {
                return None;
            }
            match self
                .next
                .compare_exchange_weak(next, next + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(next),
                Err(actual) => next = actual,
            }
        }
    }

    /// Claims a slot, spinning and then yielding until one is released.
    pub fn claim(&self) -> LockSlot<'_, T> {
        let backoff = Backoff::new();
        loop {
            if let Some(slot) = self.try_claim() {
                return slot;
            }
            backoff.snooze();
        }
    }

    fn free(&self, id: usize) {
        let entry = &self.entries[id];
        let guard = epoch::pin();
        entry.value.try_remove(&guard);
        entry.owner.store(0, Ordering::Release);
        if self.free.push(id).is_err() {
            // Each id is pushed once per claim, so the queue has room.
            error!(id, "lock slot free list overflow");
        }
        trace!(id, "lock slot freed");
    }

    /// Among the slots flagged in `flags`, returns the value published most
    /// recently.
    ///
    /// Slots without a value are skipped.
    pub fn read(&self, flags: &SlotFlags) -> Option<T>
    where
        T: Clone,
    {
        let guard = epoch::pin();
        let mut newest: Option<(VersionToken, &T)> = None;
        for id in flags.iter() {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            let Some((token, value)) = Self::stable_value(entry, id, flags, &guard) else {
                continue;
            };
            if newest.map_or(true, |(best, _)| token > best) {
                newest = Some((token, value));
            }
        }
        newest.map(|(_, value)| value.clone())
    }

    /// Reads a flagged entry's value together with the token it was
    /// published under.
    fn stable_value<'g>(
        entry: &'g Entry<T>,
        id: usize,
        flags: &SlotFlags,
        guard: &'g epoch::Guard,
    ) -> Option<(VersionToken, &'g T)> {
        loop {
            let token = entry.token.load();
            let value = entry.value.load(guard);
            if !flags.contains(id) {
                return None;
            }
            if entry.token.load() == token {
                return value.into_option().map(|value| (token, value));
            }
        }
    }

    fn publish(&self, id: usize, value: T) {
        let entry = &self.entries[id];
        let guard = epoch::pin();
        entry.value.set(value, &guard);
        entry.token.store(self.versions.advance_new_token());
    }
}

impl<T> core::fmt::Debug for LockContext<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockContext")
            .field("capacity", &self.entries.len())
            .field("free", &self.free.len())
            .field("version", &self.versions.current())
            .finish()
    }
}

/// A claimed slot. Released back to its context on drop.
pub struct LockSlot<'a, T: Send + Sync + 'static> {
    context: &'a LockContext<T>,
    id: usize,
}

impl<'a, T: Send + Sync + 'static> LockSlot<'a, T> {
    /// Index of the slot in its context.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Token of the latest claim or publish through this slot.
    pub fn token(&self) -> VersionToken {
        self.context.entries[self.id].token.load()
    }

    /// Identity of the thread that claimed the slot.
    pub fn owner_thread(&self) -> u64 {
        self.context.entries[self.id].owner.load(Ordering::Acquire)
    }

    /// The context the slot came from.
    pub fn context(&self) -> &'a LockContext<T> {
        self.context
    }

    /// Stores the value this slot publishes to readers, stamping the slot
    /// with a fresh token.
    pub fn set(&self, value: T) {
        self.context.publish(self.id, value);
    }

    /// Clones the value this slot publishes.
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        let guard = epoch::pin();
        self.context.entries[self.id]
            .value
            .load(&guard)
            .into_option()
            .cloned()
    }

    /// Releases the slot, clearing its value.
    pub fn free(self) {}
}

impl<T: Send + Sync + 'static> Drop for LockSlot<'_, T> {
    fn drop(&mut self) {
        self.context.free(self.id);
    }
}

impl<T: Send + Sync + 'static> core::fmt::Debug for LockSlot<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockSlot")
            .field("id", &self.id)
            .field("token", &self.token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_bounds() {
        assert_eq!(
            LockContext::<u8>::new(0).err(),
            Some(LockError::Config(tandem::Error::ZeroCapacity))
        );
        assert_eq!(
            LockContext::<u8>::new(MAX_SLOTS + 1).err(),
            Some(LockError::TooManySlots {
                requested: MAX_SLOTS + 1,
                max: MAX_SLOTS
            })
        );
        assert_eq!(LockContext::<u8>::new(MAX_SLOTS).unwrap().capacity(), MAX_SLOTS);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let context = LockContext::<u32>::new(2).unwrap();
        let a = context.try_claim().unwrap();
        let b = context.try_claim().unwrap();
        assert_ne!(a.id(), b.id());
        assert!(context.try_claim().is_none());

        let freed = a.id();
        let old_token = a.token();
        a.free();
        let c = context.try_claim().unwrap();
        assert_eq!(c.id(), freed);
        assert!(c.token() > old_token);
        assert!(c.token() > b.token());
    }

    #[test]
    fn test_free_clears_value() {
        let context = LockContext::new(1).unwrap();
        let slot = context.try_claim().unwrap();
        slot.set(5);
        assert_eq!(slot.value(), Some(5));
        drop(slot);
        let slot = context.try_claim().unwrap();
        assert_eq!(slot.value(), None);
    }

    #[test]
    fn test_owner_thread() {
        let context = LockContext::<u8>::new(1).unwrap();
        let slot = context.claim();
        assert_eq!(slot.owner_thread(), current_thread());
        assert_ne!(slot.owner_thread(), 0);
    }

    #[test]
    fn test_read_picks_newest_claim() {
        let context = LockContext::new(4).unwrap();
        let flags = context.flags();
        let older = context.try_claim().unwrap();
        let newer = context.try_claim().unwrap();
        let unflagged = context.try_claim().unwrap();
        older.set("old");
        newer.set("new");
        unflagged.set("ignored");

        assert_eq!(context.read(&flags), None);
        flags.set(older.id());
        assert_eq!(context.read(&flags), Some("old"));
        flags.set(newer.id());
        assert_eq!(context.read(&flags), Some("new"));

        // A flagged slot without a value does not win.
        drop(newer);
        assert_eq!(context.read(&flags), Some("old"));
    }
}
