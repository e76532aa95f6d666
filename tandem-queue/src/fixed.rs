use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};
use tandem::Error;

/// Largest power of two a `usize` holds.
const MAX_CAPACITY: usize = (usize::MAX >> 1) + 1;

fn rounded_capacity(capacity: usize) -> usize {
    capacity
        .max(1)
        .checked_next_power_of_two()
        .unwrap_or(MAX_CAPACITY)
}

/// Signed distance from `position` to the stamp of its cell.
#[inline]
fn lag(stamp: usize, position: usize) -> isize {
    stamp.wrapping_sub(position) as isize
}

/// A cell in the ring.
struct Cell<T> {
    /// Position this cell is ready for: `position` to push, `position + 1`
    /// to pop.
    stamp: AtomicUsize,

    /// The value in this cell.
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded multi-producer multi-consumer ring buffer.
///
/// Head and tail are unbounded positions; a position maps to cell
/// `position & mask`.
pub struct FixedQueue<T> {
    /// Next position to pop.
    head: CachePadded<AtomicUsize>,

    /// Next position to push.
    tail: CachePadded<AtomicUsize>,

    buffer: Box<[Cell<T>]>,

    mask: usize,
}

unsafe impl<T: Send> Send for FixedQueue<T> {}
unsafe impl<T: Send> Sync for FixedQueue<T> {}

impl<T> FixedQueue<T> {
    /// Creates a ring with room for `capacity` items, rounded up to a power
    /// of two and clamped to the largest one.
    ///
    /// # Panics
    ///
    /// Panics if the ring cannot be allocated; [`try_new`](Self::try_new)
    /// reports that as an error.
    pub fn new(capacity: usize) -> FixedQueue<T> {
        let capacity = rounded_capacity(capacity);
        let mut buffer = Vec::with_capacity(capacity);
        Self::fill(&mut buffer, capacity);
        Self::from_buffer(buffer)
    }

    /// Like [`new`](Self::new), reporting zero capacity and allocation
    /// failure instead of panicking.
    pub fn try_new(capacity: usize) -> Result<FixedQueue<T>, Error> {
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        let capacity = capacity
            .checked_next_power_of_two()
            .ok_or(Error::CapacityOverflow { capacity })?;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(|_| Error::AllocationFailed { capacity })?;
        Self::fill(&mut buffer, capacity);
        Ok(Self::from_buffer(buffer))
    }

    fn fill(buffer: &mut Vec<Cell<T>>, capacity: usize) {
        buffer.extend((0..capacity).map(|i| Cell {
            stamp: AtomicUsize::new(i),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }));
    }

    fn from_buffer(buffer: Vec<Cell<T>>) -> FixedQueue<T> {
        FixedQueue {
            mask: buffer.len() - 1,
            buffer: buffer.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    fn cell(&self, position: usize) -> &Cell<T> {
        &self.buffer[position & self.mask]
    }

    /// Pushes an item, handing it back if the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let cell = self.cell(tail);
            match lag(cell.stamp.load(Ordering::Acquire), tail) {
                0 => {
                    if self
                        .tail
                        .compare_exchange(tail, tail + 1, Ordering::SeqCst, Ordering::Relaxed)
                        .is_err()
                    {
                        continue;
                    }
                    // SAFETY: winning the tail CAS gives exclusive access to
                    // the cell until its stamp is published.
                    unsafe {
                        cell.value.get().write(MaybeUninit::new(value));
                    }
                    cell.stamp.store(tail + 1, Ordering::Release);
                    return Ok(());
                }
                // The cell still holds the item pushed one lap earlier.
                behind if behind < 0 => {
                    if tail >= self.head.load(Ordering::Relaxed) + self.buffer.len() {
                        return Err(value);
                    }
                }
                // Another producer already filled it.
                _ => {}
            }
            backoff.snooze();
        }
    }

    /// Pops the oldest item.
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let cell = self.cell(head);
            match lag(cell.stamp.load(Ordering::Acquire), head) {
                1 => {
                    if self
                        .head
                        .compare_exchange(head, head + 1, Ordering::SeqCst, Ordering::Relaxed)
                        .is_err()
                    {
                        continue;
                    }
                    // SAFETY: the stamp says the cell was written, and the
                    // head CAS makes us its only reader.
                    let value = unsafe { cell.value.get().read().assume_init() };
                    cell.stamp
                        .store(head + self.buffer.len(), Ordering::Release);
                    return Some(value);
                }
                // Nothing written here yet.
                0 => {
                    if self.tail.load(Ordering::Relaxed) == head {
                        return None;
                    }
                }
                _ => {}
            }
            backoff.snooze();
        }
    }

    /// Number of cells.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            let head = self.head.load(Ordering::SeqCst);
            if self.tail.load(Ordering::SeqCst) == tail {
                return tail.saturating_sub(head).min(self.buffer.len());
            }
        }
    }

    /// Returns `true` if the ring holds no items.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::SeqCst);
        head == tail
    }

    #[cfg(test)]
    fn is_full(&self) -> bool {
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::SeqCst);
        tail == head + self.buffer.len()
    }

    /// Moves the `offset`-th queued item of `self` into cell `offset` of
    /// `target`, ready to pop.
    ///
    /// # Safety
    ///
    /// No push or pop may run on either ring, `offset` must be below
    /// `self.len()` and below `target.capacity()`, and each `offset` may be
    /// moved only once.
    pub(crate) unsafe fn move_into(&self, offset: usize, target: &FixedQueue<T>) {
        let position = self.head.load(Ordering::Acquire) + offset;
        let from = &self.buffer[position & self.mask];
        let to = &target.buffer[offset];
        let value = from.value.get().read();
        to.value.get().write(value);
        to.stamp.store(offset + 1, Ordering::Release);
    }

    /// Publishes `len` moved items as the content of this ring.
    ///
    /// # Safety
    ///
    /// Cells `0..len` must have been filled by [`move_into`](Self::move_into)
    /// and the ring must otherwise be untouched.
    pub(crate) unsafe fn adopt(&self, len: usize) {
        self.tail.store(len, Ordering::Release);
    }

    /// Forgets every queued item without dropping it.
    ///
    /// # Safety
    ///
    /// Every queued item must have been moved out.
    pub(crate) unsafe fn forget_all(&self) {
        let tail = self.tail.load(Ordering::Acquire);
        self.head.store(tail, Ordering::Release);
    }
}

impl<T> Drop for FixedQueue<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        for position in head..tail {
            // SAFETY: positions in `head..tail` hold initialized values.
            unsafe {
                self.buffer[position & self.mask]
                    .value
                    .get_mut()
                    .assume_init_drop();
            }
        }
    }
}

impl<T> std::fmt::Debug for FixedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
