//! Growable lock-free hash table.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::{AtomicIsize, Ordering};
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};
use foldhash::fast::FixedState;
use tandem::{doubled, Error, Growable, ResizeProtocol, Slot, SlotArray};
use tracing::{debug, error};

use crate::error::MapError;
use crate::fixed::{checked_capacity, Bucket, FixedTable};
use crate::iter::{Iter, Keys, Values};

/// Initial number of slots.
pub const DEFAULT_CAPACITY: usize = 16;

/// Default probe budget.
pub const DEFAULT_MAX_PROBING: usize = 8;

/// Construction options for [`HashMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    /// Initial number of slots, rounded up to a power of two.
    pub capacity: usize,
    /// Slots a writer probes before asking for a bigger table. Fixed for
    /// the lifetime of the map.
    pub max_probing: usize,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_probing: DEFAULT_MAX_PROBING,
        }
    }
}

impl MapOptions {
    /// Options with the given capacity and probe budget.
    pub const fn new(capacity: usize, max_probing: usize) -> Self {
        Self {
            capacity,
            max_probing,
        }
    }

    /// Checks `1 <= max_probing < capacity` after rounding.
    pub fn validate(&self) -> Result<(), Error> {
        checked_capacity(self.capacity, self.max_probing).map(|_| ())
    }
}

/// Lock-free hash map that grows by cooperative resizing.
///
/// Every key operation is linearizable. Writers work directly on the current
/// table; a writer that runs out of probes asks for a table of double
/// capacity, and every thread that runs into the resize helps to finish it.
///
/// Values are returned as clones.
///
/// # Example
///
/// ```rust
/// use tandem_map::HashMap;
///
/// let map = HashMap::new();
/// assert!(map.try_insert("a", 1));
/// assert!(!map.try_insert("a", 2));
/// assert_eq!(map.insert("a", 3), Some(1));
/// assert_eq!(map.get("a"), Some(3));
/// assert_eq!(map.remove("a"), Some(3));
/// assert!(map.is_empty());
/// ```
pub struct HashMap<K, V, S = FixedState> {
    current: Atomic<FixedTable<K, V, S>>,
    previous: Atomic<FixedTable<K, V, S>>,
    protocol: ResizeProtocol,
    count: CachePadded<AtomicIsize>,
    max_probing: usize,
    hasher: S,
}

/// Largest power of two a `usize` holds.
const MAX_CAPACITY: usize = (usize::MAX >> 1) + 1;

fn rounded_capacity(capacity: usize) -> usize {
    capacity
        .max(2)
        .checked_next_power_of_two()
        .unwrap_or(MAX_CAPACITY)
}

impl<K, V> HashMap<K, V, FixedState>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty map with default options.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty map with room for at least `capacity` slots.
    ///
    /// Capacities past the largest power of two are clamped to it.
    ///
    /// # Panics
    ///
    /// Panics if the slot array cannot be allocated. Use
    /// [`with_options`](Self::with_options) to get an error instead.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = rounded_capacity(capacity);
        let max_probing = DEFAULT_MAX_PROBING.min(capacity / 2);
        Self::build(SlotArray::new(capacity), max_probing, FixedState::default())
    }

    /// Creates an empty map from validated options.
    pub fn with_options(options: MapOptions) -> Result<Self, MapError> {
        Self::with_options_and_hasher(options, FixedState::default())
    }
}

impl<K, V> Default for HashMap<K, V, FixedState>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    /// Creates an empty map from validated options and a custom hasher.
    pub fn with_options_and_hasher(options: MapOptions, hasher: S) -> Result<Self, MapError> {
        let capacity = checked_capacity(options.capacity, options.max_probing)?;
        let slots = SlotArray::try_new(capacity)?;
        Ok(Self::build(slots, options.max_probing, hasher))
    }

    fn build(slots: SlotArray<Bucket<K, V>>, max_probing: usize, hasher: S) -> Self {
        let table = FixedTable::from_slots(slots, max_probing, hasher.clone());
        Self {
            current: Atomic::new(table),
            previous: Atomic::null(),
            protocol: ResizeProtocol::new(),
            count: CachePadded::new(AtomicIsize::new(0)),
            max_probing,
            hasher,
        }
    }

    #[inline]
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline]
    pub(crate) fn table<'g>(&self, guard: &'g Guard) -> &'g FixedTable<K, V, S> {
        // SAFETY: `current` is never null and superseded tables are released
        // through `defer_destroy`.
        unsafe { self.current.load(Ordering::Acquire, guard).deref() }
    }

    #[inline]
    fn added(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn removed(&self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Runs `op` on the bucket bound to `key` in the current table,
    /// binding the key first if needed. Grows the table when no slot is
    /// left within the probe budget.
    fn write<R, F>(&self, key: K, op: F) -> R
    where
        F: FnOnce(&Bucket<K, V>, &Guard) -> R,
    {
        let mut bucket = Bucket::new(self.hash(&key), key);
        let backoff = Backoff::new();
        loop {
            let guard = epoch::pin();
            if let Some(working) = self.protocol.enter() {
                match self.table(&guard).place(bucket, self.max_probing, &guard) {
                    Ok((_, bound)) => return op(bound, &guard),
                    Err(rejected) => {
                        bucket = rejected;
                        let revision = working.revision();
                        drop(working);
                        self.protocol.request_grow(revision);
                    }
                }
            }
            self.protocol.cooperate(self, &backoff);
        }
    }

    /// Runs `op` on the bucket bound to `key`, if any, and returns its
    /// result once no resize interfered.
    fn read<Q, R, F>(&self, key: &Q, op: F) -> R
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: Fn(Option<&Bucket<K, V>>, &Guard) -> R,
    {
        let hash = self.hash(key);
        let backoff = Backoff::new();
        loop {
            let guard = epoch::pin();
            if let Some(revision) = self.protocol.snapshot() {
                let found = self.table(&guard).find(hash, key, &guard);
                let result = op(found.map(|(_, bucket)| bucket), &guard);
                if self.protocol.validate(revision) {
                    return result;
                }
            }
            self.protocol.cooperate(self, &backoff);
        }
    }

    /// Inserts `value` only if `key` has none. Returns `true` on insertion.
    pub fn try_insert(&self, key: K, value: V) -> bool {
        self.write(key, |bucket, guard| {
            let inserted = bucket.cell().try_insert(value, guard).is_ok();
            if inserted {
                self.added();
            }
            inserted
        })
    }

    /// Inserts `value` under a key that must not be present yet.
    pub fn add(&self, key: K, value: V) -> Result<(), MapError> {
        if self.try_insert(key, value) {
            Ok(())
        } else {
            Err(MapError::DuplicateKey)
        }
    }

    /// Stores `value` under `key`, returning the value it replaced.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.write(key, |bucket, guard| match bucket.cell().set(value, guard) {
            Slot::Empty => {
                self.added();
                None
            }
            Slot::Occupied(old) => Some(old.clone()),
        })
    }

    /// Stores `value` under `key`. Returns `true` if the key was new.
    pub fn set(&self, key: K, value: V) -> bool {
        self.write(key, |bucket, guard| {
            let is_new = bucket.cell().set(value, guard).is_empty();
            if is_new {
                self.added();
            }
            is_new
        })
    }

    /// Returns the value under `key`, storing `value` first if there is
    /// none.
    pub fn get_or_insert(&self, key: K, value: V) -> V {
        self.write(key, |bucket, guard| match bucket.cell().try_insert(value, guard) {
            Ok(stored) => {
                self.added();
                stored.clone()
            }
            Err((_, current)) => current.clone(),
        })
    }

    /// Clones the value under `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.read(key, |bucket, guard| bucket.and_then(|b| b.value(guard)).cloned())
    }

    /// Returns `true` if `key` holds a value.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.read(key, |bucket, guard| bucket.and_then(|b| b.value(guard)).is_some())
    }

    /// Removes the value under `key` and returns it.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let backoff = Backoff::new();
        loop {
            let guard = epoch::pin();
            if let Some(_working) = self.protocol.enter() {
                let (_, bucket) = self.table(&guard).find(hash, key, &guard)?;
                return bucket.cell().try_remove(&guard).map(|old| {
                    self.removed();
                    old.clone()
                });
            }
            self.protocol.cooperate(self, &backoff);
        }
    }

    /// Removes every value.
    ///
    /// Not atomic: entries inserted concurrently may survive.
    pub fn clear(&self) {
        let backoff = Backoff::new();
        loop {
            let guard = epoch::pin();
            if let Some(_working) = self.protocol.enter() {
                let table = self.table(&guard);
                for index in 0..table.capacity() {
                    if let Some(bucket) = table.bucket(index, &guard) {
                        if bucket.cell().try_remove(&guard).is_some() {
                            self.removed();
                        }
                    }
                }
                return;
            }
            self.protocol.cooperate(self, &backoff);
        }
    }

    /// Number of entries.
    ///
    /// Maintained with relaxed counters, so it is approximate while writers
    /// are active.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed).max(0) as usize
    }

    /// Returns `true` if the map holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots in the current table.
    pub fn capacity(&self) -> usize {
        let guard = epoch::pin();
        self.table(&guard).capacity()
    }

    /// Probe budget given at construction.
    #[inline]
    pub fn max_probing(&self) -> usize {
        self.max_probing
    }

    /// Most slots a lookup in the current table may visit.
    ///
    /// Starts at [`max_probing`](Self::max_probing) and only grows when a
    /// resize copy had to place an entry past the budget.
    pub fn extent(&self) -> usize {
        let guard = epoch::pin();
        self.table(&guard).extent()
    }

    /// Revision of the table structure, bumped by every resize step.
    #[inline]
    pub fn revision(&self) -> u64 {
        self.protocol.revision()
    }

    /// Iterates `(key, value)` clones.
    ///
    /// Entries changed during iteration may or may not be observed.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter::new(self)
    }

    /// Iterates key clones.
    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys { inner: self.iter() }
    }

    /// Iterates value clones.
    pub fn values(&self) -> Values<'_, K, V, S> {
        Values { inner: self.iter() }
    }
}

impl<K, V, S> Growable for HashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    fn swap_buffers(&self, guard: &Guard) -> Result<usize, Error> {
        let old = self.current.load(Ordering::Acquire, guard);
        // SAFETY: `current` is never null.
        let from = unsafe { old.deref() }.capacity();
        let to = doubled(from)?;
        let table = FixedTable::with_hasher(to, self.max_probing, self.hasher.clone())?;
        self.previous.store(old, Ordering::Release);
        self.current.store(Owned::new(table), Ordering::Release);
        debug!(from, to, "hash table grown");
        Ok(from)
    }

    fn copy_index(&self, index: usize, guard: &Guard) {
        // SAFETY: `previous` stays published until `finish_copy`.
        let Some(previous) = (unsafe { self.previous.load(Ordering::Acquire, guard).as_ref() }) else {
            return;
        };
        let Some(bucket) = previous.bucket(index, guard) else {
            return;
        };
        let Some(value) = bucket.value(guard) else {
            return;
        };
        let table = self.table(guard);
        let copy = Bucket::new(bucket.hash(), bucket.key().clone());
        match table.place(copy, table.capacity(), guard) {
            Ok((_, bound)) => {
                bound.cell().set(value.clone(), guard);
            }
            Err(_) => error!(index, "no room for entry in doubled table"),
        }
    }

    fn finish_copy(&self, guard: &Guard) {
        let previous = self.previous.swap(Shared::null(), Ordering::AcqRel, guard);
        if !previous.is_null() {
            // SAFETY: no thread can reach the previous table once the status
            // leaves `Copying`.
            unsafe { guard.defer_destroy(previous) };
        }
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread holds a reference.
        unsafe {
            let guard = epoch::unprotected();
            for table in [&self.current, &self.previous] {
                let shared = table.load(Ordering::Relaxed, guard);
                if !shared.is_null() {
                    drop(shared.into_owned());
                }
            }
        }
    }
}

impl<K, V, S> core::fmt::Debug for HashMap<K, V, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HashMap")
            .field("len", &self.count.load(Ordering::Relaxed).max(0))
            .field("max_probing", &self.max_probing)
            .field("revision", &self.protocol.revision())
            .finish_non_exhaustive()
    }
}
