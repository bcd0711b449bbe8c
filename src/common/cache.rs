//! Concurrent keyed cache.
//!
//! Backed by moka's thread-safe cache. Used for run-scoped state: variable
//! bindings, committed step outputs, and the engine's active-run registry.

use moka::sync::Cache;

/// Thread-safe cache with a bounded capacity.
///
/// Entries are evicted LRU-style once capacity is exceeded; run-scoped maps
/// are sized well above any realistic pipeline so eviction never bites
/// mid-run.
#[derive(Clone)]
pub struct MemCache<K, V> {
    entries: Cache<K, V>,
}

#[allow(unused)]
impl<K, V> MemCache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Allocate a new [`MemCache`].
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Cache::new(capacity as u64),
        }
    }

    /// Insert or replace an entry.
    pub fn set(
        &self,
        key: K,
        value: V,
    ) {
        self.entries.insert(key, value);
    }

    /// Look up an entry by key.
    pub fn get(
        &self,
        key: &K,
    ) -> Option<V> {
        self.entries.get(key)
    }

    /// Whether a key is present.
    pub fn contains(
        &self,
        key: &K,
    ) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry by key.
    pub fn remove(
        &self,
        key: &K,
    ) {
        self.entries.remove(key);
    }

    /// Iterate over current entries.
    pub fn iter(&self) -> moka::sync::Iter<'_, K, V> {
        self.entries.iter()
    }
}
