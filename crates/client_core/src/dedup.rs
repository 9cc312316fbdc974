use std::{hash::Hash, num::NonZeroUsize};

use lru::LruCache;

/// Bounded set that forgets its oldest entries once `capacity` is reached.
#[derive(Debug)]
pub struct SeenSet<T: Hash + Eq> {
    entries: LruCache<T, ()>,
}

impl<T: Hash + Eq> SeenSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Records `value`; returns `false` when it was already present.
    pub fn insert(&mut self, value: T) -> bool {
        if self.entries.contains(&value) {
            return false;
        }
        self.entries.put(value, ());
        true
    }

    pub fn contains(&self, value: &T) -> bool {
        self.entries.contains(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

#[cfg(test)]
#[path = "tests/dedup_tests.rs"]
mod tests;
