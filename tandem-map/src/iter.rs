//! Iterators over [`HashMap`].

use core::hash::{BuildHasher, Hash};
use crossbeam_epoch::{self as epoch, Guard};

use crate::map::HashMap;

/// Iterator over `(key, value)` clones of a [`HashMap`].
///
/// Walks the current table slot by slot. A resize in the middle of the walk
/// moves on to the new table at the same index, so entries may be skipped or
/// seen twice; every entry yielded was present at some point.
pub struct Iter<'a, K, V, S> {
    map: &'a HashMap<K, V, S>,
    guard: Guard,
    index: usize,
}

impl<'a, K, V, S> Iter<'a, K, V, S> {
    pub(crate) fn new(map: &'a HashMap<K, V, S>) -> Self {
        Self {
            map,
            guard: epoch::pin(),
            index: 0,
        }
    }
}

impl<K, V, S> Iterator for Iter<'_, K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let table = self.map.table(&self.guard);
            if self.index >= table.capacity() {
                return None;
            }
            let index = self.index;
            self.index += 1;
            if let Some(bucket) = table.bucket(index, &self.guard) {
                if let Some(value) = bucket.value(&self.guard) {
                    return Some((bucket.key().clone(), value.clone()));
                }
            }
        }
    }
}

/// Iterator over key clones of a [`HashMap`].
pub struct Keys<'a, K, V, S> {
    pub(crate) inner: Iter<'a, K, V, S>,
}

impl<K, V, S> Iterator for Keys<'_, K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    type Item = K;

    fn next(&mut self) -> Option<K> {
        self.inner.next().map(|(key, _)| key)
    }
}

/// Iterator over value clones of a [`HashMap`].
pub struct Values<'a, K, V, S> {
    pub(crate) inner: Iter<'a, K, V, S>,
}

impl<K, V, S> Iterator for Values<'_, K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    type Item = V;

    fn next(&mut self) -> Option<V> {
        self.inner.next().map(|(_, value)| value)
    }
}

impl<'a, K, V, S> IntoIterator for &'a HashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
