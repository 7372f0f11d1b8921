use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;

use crate::config::ConfigError;

/// Recency-ordered bounded map. Re-inserting a key moves it to the most-recent
/// position; inserting a new key at capacity evicts the least-recently-used one.
#[derive(Debug)]
pub struct RecencyCache<K: Hash + Eq, V = ()> {
    inner: LruCache<K, V>,
}

impl<K: Hash + Eq, V> RecencyCache<K, V> {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        let cap = NonZeroUsize::new(capacity)
            .ok_or(ConfigError::NonPositiveCapacity { name: "recency cache", capacity })?;
        Ok(Self::with_capacity(cap))
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self { inner: LruCache::new(capacity) }
    }

    /// Insert or refresh `key`. Returns the entry evicted to make room, if any.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        let existed = self.inner.contains(&key);
        let displaced = self.inner.push(key, value);
        if existed {
            None
        } else {
            displaced
        }
    }

    /// Mark `key` as most recently used without changing its value.
    pub fn touch(&mut self, key: &K) -> bool {
        self.inner.promote(key);
        self.inner.contains(key)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    /// Entries from least to most recently used.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter().rev()
    }

    pub fn values_oldest_first(&self) -> impl Iterator<Item = &V> {
        self.iter_oldest_first().map(|(_, v)| v)
    }
}

impl<K: Hash + Eq + Clone> RecencyCache<K, ()> {
    pub fn insert(&mut self, key: K) -> Option<K> {
        self.put(key, ()).map(|(k, _)| k)
    }

    /// Keys from least to most recently used.
    pub fn to_list(&self) -> Vec<K> {
        self.iter_oldest_first().map(|(k, _)| k.clone()).collect()
    }
}
