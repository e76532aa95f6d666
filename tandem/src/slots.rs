//! Wait-free slot cells.
//!
//! A [`SlotCell`] is a single heap pointer guarded by compare-and-swap. Every
//! operation is one atomic load, CAS or exchange: there are no retry loops, so
//! each call finishes in a bounded number of steps regardless of contention.
//!
//! Replaced and removed values are handed to `crossbeam-epoch` for deferred
//! destruction. References returned by the guard-scoped methods stay valid
//! for as long as the caller's [`Guard`] is alive, even when another thread
//! replaces the value in the meantime.

use core::sync::atomic::Ordering;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::error::{Error, Result};

/// State of a slot as observed by a load.
///
/// Storing "no value" is expressed by the value type (for example
/// `SlotCell<Option<V>>`), which keeps it distinct from an empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot<T> {
    /// Nothing was ever stored, or the value was removed.
    Empty,
    /// The slot holds a value.
    Occupied(T),
}

impl<T> Slot<T> {
    /// Returns `true` for [`Slot::Empty`].
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    /// Returns `true` for [`Slot::Occupied`].
    #[inline]
    pub fn is_occupied(&self) -> bool {
        !self.is_empty()
    }

    /// Converts into an `Option`.
    #[inline]
    pub fn into_option(self) -> Option<T> {
        match self {
            Slot::Empty => None,
            Slot::Occupied(value) => Some(value),
        }
    }

    /// Maps the occupied value.
    #[inline]
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Slot<U> {
        match self {
            Slot::Empty => Slot::Empty,
            Slot::Occupied(value) => Slot::Occupied(f(value)),
        }
    }
}

impl<T> From<Option<T>> for Slot<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Slot::Occupied(value),
            None => Slot::Empty,
        }
    }
}

/// A single CAS-protected cell.
pub struct SlotCell<T> {
    value: Atomic<T>,
}

impl<T> Default for SlotCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotCell<T> {
    /// Creates an empty cell.
    pub fn new() -> Self {
        Self {
            value: Atomic::null(),
        }
    }

    /// Creates a cell already holding `value`.
    pub fn with_value(value: T) -> Self {
        Self {
            value: Atomic::new(value),
        }
    }

    /// Loads the current state of the cell.
    #[inline]
    pub fn load<'g>(&'g self, guard: &'g Guard) -> Slot<&'g T> {
        let shared = self.value.load(Ordering::Acquire, guard);
        // SAFETY: non-null pointers only come from `Owned` and are released
        // through `defer_destroy`, which cannot run while `guard` is pinned.
        match unsafe { shared.as_ref() } {
            Some(value) => Slot::Occupied(value),
            None => Slot::Empty,
        }
    }

    /// Takes the value out through exclusive access.
    pub fn take(&mut self) -> Option<T> {
        // SAFETY: `&mut self` rules out concurrent readers.
        unsafe {
            let shared = self
                .value
                .swap(Shared::null(), Ordering::Relaxed, epoch::unprotected());
            if shared.is_null() {
                None
            } else {
                Some(*shared.into_owned().into_box())
            }
        }
    }
}

// Replaced values may be destroyed later on another thread.
impl<T: Send + 'static> SlotCell<T> {
    /// Stores `value` only if the cell is empty.
    ///
    /// On failure the value is handed back together with the occupant that
    /// won.
    pub fn try_insert<'g>(&'g self, value: T, guard: &'g Guard) -> Result<&'g T, (T, &'g T)> {
        match self.value.compare_exchange(
            Shared::null(),
            Owned::new(value),
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            // SAFETY: we just published this pointer; it is non-null.
            Ok(stored) => Ok(unsafe { stored.deref() }),
            Err(err) => {
                let value = *err.new.into_box();
                // SAFETY: a strong CAS against null only fails on a non-null
                // occupant, protected by `guard`.
                Err((value, unsafe { err.current.deref() }))
            }
        }
    }

    /// Stores `value` unconditionally and reports what it replaced.
    ///
    /// `Slot::Empty` means the value is new.
    pub fn set<'g>(&'g self, value: T, guard: &'g Guard) -> Slot<&'g T> {
        let old = self
            .value
            .swap(Owned::new(value), Ordering::AcqRel, guard);
        Self::retire(old, guard)
    }

    /// Empties the cell, returning the value that was removed.
    pub fn try_remove<'g>(&'g self, guard: &'g Guard) -> Option<&'g T> {
        let old = self.value.swap(Shared::null(), Ordering::AcqRel, guard);
        Self::retire(old, guard).into_option()
    }

    fn retire<'g>(old: Shared<'g, T>, guard: &'g Guard) -> Slot<&'g T> {
        if old.is_null() {
            return Slot::Empty;
        }
        // SAFETY: `old` was unlinked by our exchange, so no new reader can
        // reach it. Destruction waits for every pinned guard, ours included.
        unsafe {
            guard.defer_destroy(old);
            Slot::Occupied(old.deref())
        }
    }
}

impl<T> Drop for SlotCell<T> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// A fixed-capacity array of [`SlotCell`]s addressed by index.
pub struct SlotArray<T> {
    cells: Box<[SlotCell<T>]>,
}

impl<T> SlotArray<T> {
    /// Creates `len` empty slots.
    pub fn new(len: usize) -> Self {
        let mut cells = Vec::with_capacity(len);
        cells.resize_with(len, SlotCell::new);
        Self {
            cells: cells.into_boxed_slice(),
        }
    }

    /// Creates `len` empty slots, reporting allocation failure.
    pub fn try_new(len: usize) -> Result<Self> {
        let mut cells = Vec::new();
        cells
            .try_reserve_exact(len)
            .map_err(|_| Error::AllocationFailed { capacity: len })?;
        cells.resize_with(len, SlotCell::new);
        Ok(Self {
            cells: cells.into_boxed_slice(),
        })
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns `true` if the array has no slots.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The cell at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn cell(&self, index: usize) -> &SlotCell<T> {
        &self.cells[index]
    }

    /// Loads the slot at `index`.
    #[inline]
    pub fn get<'g>(&'g self, index: usize, guard: &'g Guard) -> Slot<&'g T> {
        self.cells[index].load(guard)
    }

    /// Iterates the occupied slots as `(index, value)` pairs.
    ///
    /// Slots changed during iteration may or may not be observed.
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> impl Iterator<Item = (usize, &'g T)> + 'g {
        self.cells
            .iter()
            .enumerate()
            .filter_map(move |(index, cell)| cell.load(guard).into_option().map(|v| (index, v)))
    }
}

impl<T: Send + 'static> SlotArray<T> {
    /// Stores `value` at `index` if the slot is empty.
    pub fn try_insert(&self, index: usize, value: T) -> bool {
        let guard = epoch::pin();
        self.cells[index].try_insert(value, &guard).is_ok()
    }

    /// Stores `value` at `index`, returning `true` if the slot was empty.
    pub fn set(&self, index: usize, value: T) -> bool {
        let guard = epoch::pin();
        self.cells[index].set(value, &guard).is_empty()
    }

    /// Empties the slot at `index`, returning `true` if it held a value.
    pub fn try_remove(&self, index: usize) -> bool {
        let guard = epoch::pin();
        self.cells[index].try_remove(&guard).is_some()
    }

    /// Clones the value at `index`, if any.
    pub fn try_get(&self, index: usize) -> Option<T>
    where
        T: Clone,
    {
        let guard = epoch::pin();
        self.cells[index].load(&guard).into_option().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_only_once() {
        let slots = SlotArray::new(4);
        assert!(slots.try_insert(1, "a"));
        assert!(!slots.try_insert(1, "b"));
        assert_eq!(slots.try_get(1), Some("a"));
        assert_eq!(slots.try_get(0), None);
    }

    #[test]
    fn test_set_reports_new() {
        let slots = SlotArray::new(2);
        assert!(slots.set(0, 1));
        assert!(!slots.set(0, 2));
        assert_eq!(slots.try_get(0), Some(2));
    }

    #[test]
    fn test_remove() {
        let slots = SlotArray::new(2);
        assert!(!slots.try_remove(0));
        slots.set(0, 10);
        assert!(slots.try_remove(0));
        assert_eq!(slots.try_get(0), None);
        // Removed slots accept a fresh value.
        assert!(slots.try_insert(0, 11));
    }

    #[test]
    fn test_stored_none_is_not_empty() {
        let cell: SlotCell<Option<u32>> = SlotCell::new();
        let guard = epoch::pin();
        assert_eq!(cell.load(&guard), Slot::Empty);
        assert!(cell.try_insert(None, &guard).is_ok());
        assert_eq!(cell.load(&guard), Slot::Occupied(&None));
        let (rejected, current) = cell.try_insert(Some(3), &guard).unwrap_err();
        assert_eq!(rejected, Some(3));
        assert_eq!(current, &None);
    }

    #[test]
    fn test_take_and_drop() {
        use std::sync::Arc;

        let tracked = Arc::new(());
        let mut cell = SlotCell::with_value(Arc::clone(&tracked));
        assert_eq!(Arc::strong_count(&tracked), 2);
        assert!(cell.take().is_some());
        assert_eq!(Arc::strong_count(&tracked), 1);

        let cell = SlotCell::with_value(Arc::clone(&tracked));
        drop(cell);
        assert_eq!(Arc::strong_count(&tracked), 1);
    }

    #[test]
    fn test_iter_skips_empty() {
        let slots = SlotArray::new(5);
        slots.set(1, 'x');
        slots.set(3, 'y');
        let guard = epoch::pin();
        let seen: Vec<_> = slots.iter(&guard).map(|(i, v)| (i, *v)).collect();
        assert_eq!(seen, vec![(1, 'x'), (3, 'y')]);
    }

    #[test]
    fn test_try_new_zero() {
        let slots: SlotArray<u8> = SlotArray::try_new(0).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_concurrent_insert_single_winner() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        let slots = Arc::new(SlotArray::new(1));
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let slots = Arc::clone(&slots);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if slots.try_insert(0, t) {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::Relaxed), 1);
    }
}
