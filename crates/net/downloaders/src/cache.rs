use linked_hash_set::LinkedHashSet;
use std::{borrow::Borrow, hash::Hash, num::NonZeroUsize};

/// A minimal LRU set based on a `LinkedHashSet` with limited capacity.
///
/// Once the limit is reached, every newly inserted element evicts the oldest one.
#[derive(Debug, Clone)]
pub(crate) struct LruCache<T: Hash + Eq> {
    limit: NonZeroUsize,
    inner: LinkedHashSet<T>,
}

impl<T: Hash + Eq> LruCache<T> {
    /// Creates a new `LruCache` holding at most `limit` entries.
    pub(crate) fn new(limit: NonZeroUsize) -> Self {
        Self { inner: LinkedHashSet::new(), limit }
    }

    /// Creates a cache with the given limit, treating zero as one.
    pub(crate) fn with_limit(limit: usize) -> Self {
        Self::new(NonZeroUsize::new(limit).unwrap_or(NonZeroUsize::MIN))
    }

    /// Insert an element into the set.
    ///
    /// Returns `true` if the value was not present before.
    pub(crate) fn insert(&mut self, entry: T) -> bool {
        if self.inner.insert(entry) {
            if self.inner.len() > self.limit.get() {
                self.inner.pop_front();
            }
            return true
        }
        false
    }

    /// Returns `true` if the set contains a value.
    pub(crate) fn contains<Q: ?Sized>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.inner.contains(value)
    }

    /// Number of cached entries.
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    /// Forgets every entry.
    pub(crate) fn clear(&mut self) {
        self.inner.clear()
    }
}

impl<T> Extend<T> for LruCache<T>
where
    T: Eq + Hash,
{
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter.into_iter() {
            self.insert(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reports_new_entries() {
        let mut cache = LruCache::with_limit(5);
        assert!(cache.insert("entry"));
        assert!(!cache.insert("entry"));
        assert!(cache.contains("entry"));
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut cache = LruCache::with_limit(2);
        cache.extend(["old", "mid", "new"]);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("new"));
        assert!(cache.contains("mid"));
        assert!(!cache.contains("old"));
    }

    #[test]
    fn zero_limit_keeps_latest() {
        let mut cache = LruCache::with_limit(0);
        cache.extend([1, 2]);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&2));
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
