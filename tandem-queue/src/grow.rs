use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;
use tandem::{doubled, Error, Growable, ResizeProtocol};
use tracing::debug;

use crate::fixed::FixedQueue;

/// Initial capacity of a [`GrowQueue`].
pub const DEFAULT_CAPACITY: usize = 64;

/// Construction options for [`GrowQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Initial number of cells, rounded up to a power of two.
    pub capacity: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// An unbounded MPMC queue built on a ring that doubles when full.
///
/// Producers and consumers work directly on the current ring. A push that
/// finds the ring full asks for a resize; every thread that meets the resize
/// helps move the queued items into the doubled ring, in order.
pub struct GrowQueue<T> {
    current: Atomic<FixedQueue<T>>,
    previous: Atomic<FixedQueue<T>>,
    protocol: ResizeProtocol,
}

impl<T: Send + 'static> Default for GrowQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> GrowQueue<T> {
    /// Creates an empty queue with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty queue with room for `capacity` items before the
    /// first resize.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_ring(FixedQueue::new(capacity))
    }

    /// Creates an empty queue from validated options.
    pub fn with_options(options: QueueOptions) -> Result<Self, Error> {
        FixedQueue::try_new(options.capacity).map(Self::from_ring)
    }

    fn from_ring(ring: FixedQueue<T>) -> Self {
        Self {
            current: Atomic::new(ring),
            previous: Atomic::null(),
            protocol: ResizeProtocol::new(),
        }
    }

    #[inline]
    fn ring<'g>(&self, guard: &'g Guard) -> &'g FixedQueue<T> {
        // SAFETY: `current` is never null and superseded rings are released
        // through `defer_destroy`.
        unsafe { self.current.load(Ordering::Acquire, guard).deref() }
    }

    /// Appends an item, growing the queue if it is full.
    pub fn push(&self, mut value: T) {
        let backoff = Backoff::new();
        loop {
            let guard = epoch::pin();
            if let Some(working) = self.protocol.enter() {
                match self.ring(&guard).push(value) {
                    Ok(()) => return,
                    Err(rejected) => {
                        value = rejected;
                        let revision = working.revision();
                        drop(working);
                        self.protocol.request_grow(revision);
                    }
                }
            }
            self.protocol.cooperate(self, &backoff);
        }
    }

    /// Removes the oldest item.
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let guard = epoch::pin();
            if let Some(_working) = self.protocol.enter() {
                return self.ring(&guard).pop();
            }
            self.protocol.cooperate(self, &backoff);
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        let backoff = Backoff::new();
        loop {
            let guard = epoch::pin();
            if let Some(revision) = self.protocol.snapshot() {
                let len = self.ring(&guard).len();
                if self.protocol.validate(revision) {
                    return len;
                }
            }
            self.protocol.cooperate(self, &backoff);
        }
    }

    /// Returns `true` if no item is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cells in the current ring.
    pub fn capacity(&self) -> usize {
        let guard = epoch::pin();
        self.ring(&guard).capacity()
    }

    /// Revision of the ring structure, bumped by every resize step.
    pub fn revision(&self) -> u64 {
        self.protocol.revision()
    }

    /// Pops items until the queue is observed empty.
    pub fn drain(&self) -> Drain<'_, T> {
        Drain { queue: self }
    }
}

impl<T: Send + 'static> Growable for GrowQueue<T> {
    fn swap_buffers(&self, guard: &Guard) -> Result<usize, Error> {
        let old = self.current.load(Ordering::Acquire, guard);
        // SAFETY: `current` is never null.
        let old_ring = unsafe { old.deref() };
        let from = old_ring.capacity();
        let to = doubled(from)?;
        let ring = FixedQueue::try_new(to)?;
        let len = old_ring.len();
        self.previous.store(old, Ordering::Release);
        self.current.store(Owned::new(ring), Ordering::Release);
        debug!(from, to, len, "queue grown");
        Ok(len)
    }

    fn copy_index(&self, index: usize, guard: &Guard) {
        // SAFETY: `previous` stays published until `finish_copy`, and the
        // protocol hands out each index once with no push or pop running.
        unsafe {
            if let Some(previous) = self.previous.load(Ordering::Acquire, guard).as_ref() {
                previous.move_into(index, self.ring(guard));
            }
        }
    }

    fn finish_copy(&self, guard: &Guard) {
        let previous = self.previous.swap(Shared::null(), Ordering::AcqRel, guard);
        // SAFETY: every queued item of `previous` was moved into the current
        // ring, whose first `len` cells now hold them.
        unsafe {
            if let Some(old) = previous.as_ref() {
                self.ring(guard).adopt(old.len());
                old.forget_all();
                guard.defer_destroy(previous);
            }
        }
    }
}

impl<T> Drop for GrowQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread holds a reference.
        unsafe {
            let guard = epoch::unprotected();
            for ring in [&self.current, &self.previous] {
                let shared = ring.load(Ordering::Relaxed, guard);
                if !shared.is_null() {
                    drop(shared.into_owned());
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for GrowQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowQueue")
            .field("revision", &self.protocol.revision())
            .finish_non_exhaustive()
    }
}

/// Draining iterator returned by [`GrowQueue::drain`].
///
/// Ends at the first pop that finds the queue empty; items pushed
/// concurrently may or may not be yielded.
pub struct Drain<'a, T> {
    queue: &'a GrowQueue<T>,
}

impl<T: Send + 'static> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.queue.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_when_full() {
        let q = GrowQueue::with_capacity(2);
        let revision = q.revision();
        for i in 0..100 {
            q.push(i);
        }
        assert!(q.capacity() >= 100);
        assert!(q.revision() > revision);
        assert_eq!(q.len(), 100);
        assert_eq!(q.drain().collect::<Vec<_>>(), (0..100).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[test]
    fn test_with_options() {
        assert!(GrowQueue::<u8>::with_options(QueueOptions { capacity: 0 }).is_err());
        let q = GrowQueue::<u8>::with_options(QueueOptions::default()).unwrap();
        assert_eq!(q.capacity(), DEFAULT_CAPACITY);
    }
}
