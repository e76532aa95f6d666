//! Atomic bit set of slot ids.

use core::sync::atomic::Ordering;
use portable_atomic::AtomicU64;

const BITS: usize = u64::BITS as usize;

/// A fixed-size set of slot ids, one bit each.
///
/// Every operation touches a single word, so setting or clearing a flag is
/// one atomic read-modify-write.
pub struct SlotFlags {
    words: Box<[AtomicU64]>,
    capacity: usize,
}

impl SlotFlags {
    /// Creates an empty set able to hold ids `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        let words = (0..capacity.div_ceil(BITS)).map(|_| AtomicU64::new(0)).collect();
        Self { words, capacity }
    }

    /// Number of ids the set can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn locate(id: usize) -> (usize, u64) {
        (id / BITS, 1u64 << (id % BITS))
    }

    /// Adds `id`, returning `true` if it was absent.
    ///
    /// # Panics
    ///
    /// Panics if `id >= capacity`.
    pub fn set(&self, id: usize) -> bool {
        assert!(id < self.capacity, "slot id {id} out of range");
        let (word, bit) = Self::locate(id);
        self.words[word].fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Removes `id`, returning `true` if it was present.
    pub fn clear(&self, id: usize) -> bool {
        if id >= self.capacity {
            return false;
        }
        let (word, bit) = Self::locate(id);
        self.words[word].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Returns `true` if `id` is in the set.
    pub fn contains(&self, id: usize) -> bool {
        if id >= self.capacity {
            return false;
        }
        let (word, bit) = Self::locate(id);
        self.words[word].load(Ordering::Acquire) & bit != 0
    }

    /// Empties the set.
    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Returns `true` if no id is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    /// Iterates the ids currently set, in increasing order.
    ///
    /// Each word is read once; flags changed during iteration may or may not
    /// be observed.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(index, word)| {
            let mut bits = word.load(Ordering::Acquire);
            core::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let offset = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(index * BITS + offset)
            })
        })
    }
}

impl core::fmt::Debug for SlotFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_contains() {
        let flags = SlotFlags::new(130);
        assert!(flags.is_empty());
        assert!(flags.set(0));
        assert!(!flags.set(0));
        assert!(flags.set(64));
        assert!(flags.set(129));
        assert!(flags.contains(64));
        assert!(!flags.contains(65));
        assert_eq!(flags.iter().collect::<Vec<_>>(), vec![0, 64, 129]);

        assert!(flags.clear(64));
        assert!(!flags.clear(64));
        assert!(!flags.clear(500));
        assert_eq!(flags.iter().collect::<Vec<_>>(), vec![0, 129]);

        flags.clear_all();
        assert!(flags.is_empty());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_set_out_of_range() {
        SlotFlags::new(4).set(4);
    }
}
