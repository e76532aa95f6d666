//! Fixed-capacity open-addressing table.
//!
//! Slots are probed linearly from the key's hash. A slot, once bound to a
//! key, keeps that key for the lifetime of the table; removing an entry only
//! empties the bucket's value cell. Since a binding can never disappear, a
//! key is never bound past a vacant slot of its probe sequence and lookups
//! stop at the first vacancy.
//!
//! The table never grows. [`HashMap`](crate::HashMap) replaces it with a
//! doubled one when a writer runs out of probes.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_epoch::{self as epoch, Guard};
use foldhash::fast::FixedState;
use tandem::{Error, Slot, SlotArray, SlotCell};

/// A key bound to a slot, with its value cell.
pub struct Bucket<K, V> {
    hash: u64,
    key: K,
    value: SlotCell<V>,
}

impl<K, V> Bucket<K, V> {
    pub(crate) fn new(hash: u64, key: K) -> Self {
        Self {
            hash,
            key,
            value: SlotCell::new(),
        }
    }

    /// The bound key.
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Cached hash of the key.
    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Current value, `None` if removed or not yet stored.
    #[inline]
    pub fn value<'g>(&'g self, guard: &'g Guard) -> Option<&'g V> {
        self.value.load(guard).into_option()
    }

    /// The value cell.
    #[inline]
    pub fn cell(&self) -> &SlotCell<V> {
        &self.value
    }

    #[inline]
    fn matches<Q>(&self, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.hash == hash && self.key.borrow() == key
    }
}

/// Outcome of inspecting one probe position.
pub enum Probe<'g, K, V> {
    /// The slot is bound to the key.
    Found(usize, &'g Bucket<K, V>),
    /// Nothing is bound here; the key is not in the table.
    Vacant(usize),
    /// The slot is bound to a different key; try the next attempt.
    Collision(usize),
}

/// Outcome of trying to bind a key at one probe position.
pub enum Bind<'g, K, V> {
    /// The slot is bound to the key, by this call or an earlier one.
    Bound(usize, &'g Bucket<K, V>),
    /// The slot belongs to a different key. The bucket is handed back.
    Collision(usize, Bucket<K, V>),
}

/// A fixed-capacity lock-free hash table.
pub struct FixedTable<K, V, S = FixedState> {
    slots: SlotArray<Bucket<K, V>>,
    mask: usize,
    max_probing: usize,
    extent: AtomicUsize,
    hasher: S,
}

/// Rounds `capacity` up to a power of two and checks the probe budget.
pub(crate) fn checked_capacity(capacity: usize, max_probing: usize) -> Result<usize, Error> {
    if capacity == 0 {
        return Err(Error::ZeroCapacity);
    }
    let capacity = capacity
        .checked_next_power_of_two()
        .ok_or(Error::CapacityOverflow { capacity })?;
    if max_probing == 0 || max_probing >= capacity {
        return Err(Error::ProbingOutOfRange {
            max_probing,
            capacity,
        });
    }
    Ok(capacity)
}

impl<K, V> FixedTable<K, V, FixedState> {
    /// Creates a table with the default hasher.
    ///
    /// `capacity` is rounded up to a power of two; `max_probing` must then
    /// satisfy `1 <= max_probing < capacity`.
    pub fn new(capacity: usize, max_probing: usize) -> Result<Self, Error> {
        Self::with_hasher(capacity, max_probing, FixedState::default())
    }
}

impl<K, V, S> FixedTable<K, V, S> {
    /// Creates a table hashing with `hasher`.
    pub fn with_hasher(capacity: usize, max_probing: usize, hasher: S) -> Result<Self, Error> {
        let capacity = checked_capacity(capacity, max_probing)?;
        let slots = SlotArray::try_new(capacity)?;
        Ok(Self::from_slots(slots, max_probing, hasher))
    }

    /// Builds a table from a power-of-two slot array and a valid budget.
    pub(crate) fn from_slots(slots: SlotArray<Bucket<K, V>>, max_probing: usize, hasher: S) -> Self {
        debug_assert!(slots.len().is_power_of_two());
        debug_assert!(max_probing >= 1 && max_probing < slots.len());
        Self {
            mask: slots.len() - 1,
            slots,
            max_probing,
            extent: AtomicUsize::new(max_probing),
            hasher,
        }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Attempts a writer may spend before the table counts as full.
    #[inline]
    pub fn max_probing(&self) -> usize {
        self.max_probing
    }

    /// Attempts a lookup must consider.
    ///
    /// Equal to `max_probing` unless a resize copy placed an entry further
    /// out.
    #[inline]
    pub fn extent(&self) -> usize {
        self.extent.load(Ordering::Acquire)
    }

    /// The table's hasher.
    #[inline]
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    #[inline]
    fn index(&self, hash: u64, attempt: usize) -> usize {
        (hash as usize).wrapping_add(attempt) & self.mask
    }

    /// The bucket bound at `index`, if any.
    #[inline]
    pub fn bucket<'g>(&'g self, index: usize, guard: &'g Guard) -> Option<&'g Bucket<K, V>> {
        self.slots.get(index, guard).into_option()
    }

    /// Inspects the slot for `attempt` of the probe sequence of `hash`.
    pub fn probe<'g, Q>(
        &'g self,
        hash: u64,
        key: &Q,
        attempt: usize,
        guard: &'g Guard,
    ) -> Probe<'g, K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let index = self.index(hash, attempt);
        match self.slots.get(index, guard) {
            Slot::Empty => Probe::Vacant(index),
            Slot::Occupied(bucket) if bucket.matches(hash, key) => Probe::Found(index, bucket),
            Slot::Occupied(_) => Probe::Collision(index),
        }
    }

    /// Finds the bucket bound to `key`, whether or not it holds a value.
    pub fn find<'g, Q>(&'g self, hash: u64, key: &Q, guard: &'g Guard) -> Option<(usize, &'g Bucket<K, V>)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        for attempt in 0..self.extent() {
            match self.probe(hash, key, attempt, guard) {
                Probe::Found(index, bucket) => return Some((index, bucket)),
                Probe::Vacant(_) => return None,
                Probe::Collision(_) => {}
            }
        }
        None
    }

    /// Iterates live entries as `(index, key, value)`.
    ///
    /// Entries changed during iteration may or may not be observed.
    pub fn entries<'g>(&'g self, guard: &'g Guard) -> impl Iterator<Item = (usize, &'g K, &'g V)> + 'g {
        self.slots
            .iter(guard)
            .filter_map(move |(index, bucket)| bucket.value(guard).map(|value| (index, &bucket.key, value)))
    }
}

impl<K, V, S> FixedTable<K, V, S>
where
    K: Eq + Send + 'static,
    V: Send + Sync + 'static,
{
    /// Binds `bucket`'s key to the slot for `attempt`, with at most one CAS.
    pub fn bind<'g>(&'g self, mut bucket: Bucket<K, V>, attempt: usize, guard: &'g Guard) -> Bind<'g, K, V> {
        let index = self.index(bucket.hash, attempt);
        let cell = self.slots.cell(index);
        let existing = match cell.load(guard) {
            Slot::Occupied(existing) => existing,
            Slot::Empty => match cell.try_insert(bucket, guard) {
                Ok(bound) => return Bind::Bound(index, bound),
                Err((rejected, existing)) => {
                    bucket = rejected;
                    existing
                }
            },
        };
        if existing.matches(bucket.hash, &bucket.key) {
            Bind::Bound(index, existing)
        } else {
            Bind::Collision(index, bucket)
        }
    }

    /// Binds `bucket`'s key within the first `limit` attempts, or finds the
    /// slot it is already bound to.
    ///
    /// Hands the bucket back when every slot within `limit` belongs to
    /// another key.
    pub fn place<'g>(
        &'g self,
        mut bucket: Bucket<K, V>,
        limit: usize,
        guard: &'g Guard,
    ) -> Result<(usize, &'g Bucket<K, V>), Bucket<K, V>> {
        let limit = limit.min(self.capacity());
        for attempt in 0..limit {
            match self.bind(bucket, attempt, guard) {
                Bind::Bound(index, bound) => {
                    self.extent.fetch_max(attempt + 1, Ordering::AcqRel);
                    return Ok((index, bound));
                }
                Bind::Collision(_, rejected) => bucket = rejected,
            }
        }
        // A resize copy may have bound the key beyond `limit`.
        for attempt in limit..self.extent() {
            match self.probe(bucket.hash, &bucket.key, attempt, guard) {
                Probe::Found(index, bound) => return Ok((index, bound)),
                Probe::Vacant(_) => break,
                Probe::Collision(_) => {}
            }
        }
        Err(bucket)
    }
}

impl<K, V, S> FixedTable<K, V, S>
where
    K: Hash + Eq + Send + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    /// Adds `key` if it has no value. Returns the slot index, or `None` if
    /// the key is present or no slot is left within `max_probing`.
    pub fn add(&self, key: K, value: V) -> Option<usize> {
        let guard = epoch::pin();
        let bucket = Bucket::new(self.hasher.hash_one(&key), key);
        let (index, bound) = self.place(bucket, self.max_probing, &guard).ok()?;
        bound.value.try_insert(value, &guard).ok().map(|_| index)
    }

    /// Stores `value` under `key`. Returns the slot index, or `None` if no
    /// slot is left within `max_probing`.
    pub fn set(&self, key: K, value: V) -> Option<usize> {
        let guard = epoch::pin();
        let bucket = Bucket::new(self.hasher.hash_one(&key), key);
        let (index, bound) = self.place(bucket, self.max_probing, &guard).ok()?;
        bound.value.set(value, &guard);
        Some(index)
    }

    /// Removes the value under `key`, returning the slot it occupied.
    pub fn remove<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = epoch::pin();
        let (index, bucket) = self.find(self.hasher.hash_one(key), key, &guard)?;
        bucket.value.try_remove(&guard).map(|_| index)
    }

    /// Slot index of `key` if it currently holds a value.
    pub fn index_of<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = epoch::pin();
        let (index, bucket) = self.find(self.hasher.hash_one(key), key, &guard)?;
        bucket.value(&guard).map(|_| index)
    }

    /// Returns `true` if `key` currently holds a value.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index_of(key).is_some()
    }

    /// Clones the value under `key`.
    pub fn try_get_value<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let guard = epoch::pin();
        let (_, bucket) = self.find(self.hasher.hash_one(key), key, &guard)?;
        bucket.value(&guard).cloned()
    }
}
