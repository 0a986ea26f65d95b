//! Byte-budgeted strict-LRU storage.
//!
//! The ordered-map bookkeeping (hash lookup + recency list) comes from the
//! `lru` crate, used unbounded; this layer adds what the cache actually
//! budgets on: byte accounting (`len(key) + value.weight()` per entry), a
//! configurable byte ceiling, and an eviction hook. Eviction is strict LRU
//! by last access, where both `get` and an updating `add` count as access.
//!
//! This type is not synchronized. [`Group`](crate::cache::Group) wraps it in
//! a mutex and is the only concurrent entry point.

use lru::LruCache;

/// Values stored in the cache report their own byte size.
pub trait Weighted {
    /// Size of the value in bytes, as counted against the cache budget.
    fn weight(&self) -> usize;
}

/// Callback invoked once per evicted entry.
pub type EvictionHook<V> = Box<dyn FnMut(&str, &V) + Send>;

/// LRU cache bounded by total byte weight rather than entry count.
///
/// A `max_bytes` of zero disables the budget entirely.
pub struct Cache<V: Weighted> {
    entries: LruCache<String, V>,
    max_bytes: usize,
    used_bytes: usize,
    on_evicted: Option<EvictionHook<V>>,
}

impl<V: Weighted> Cache<V> {
    /// Creates a cache with the given byte budget and optional eviction hook.
    pub fn new(max_bytes: usize, on_evicted: Option<EvictionHook<V>>) -> Self {
        Self {
            entries: LruCache::unbounded(),
            max_bytes,
            used_bytes: 0,
            on_evicted,
        }
    }

    /// Looks up a key, promoting the entry to most-recently-used on a hit.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    /// Inserts or updates an entry, then evicts from the LRU end until the
    /// budget holds again.
    ///
    /// An update keeps the key's stored bytes accounted once and adjusts by
    /// the value-size delta. The freshly written entry is itself eligible
    /// for eviction when it alone exceeds the budget.
    pub fn add(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        let key_len = key.len();
        let weight = value.weight();
        match self.entries.put(key, value) {
            Some(old) => {
                self.used_bytes = self.used_bytes - old.weight() + weight;
            }
            None => {
                self.used_bytes += key_len + weight;
            }
        }

        while self.max_bytes != 0 && self.used_bytes > self.max_bytes {
            self.remove_oldest();
        }
    }

    /// Evicts the least-recently-used entry, if any, firing the hook.
    pub fn remove_oldest(&mut self) {
        if let Some((key, value)) = self.entries.pop_lru() {
            self.used_bytes -= key.len() + value.weight();
            if let Some(hook) = self.on_evicted.as_mut() {
                hook(&key, &value);
            }
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently accounted against the budget.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Configured byte ceiling (zero means unbounded).
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

}

impl<V: Weighted> std::fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("len", &self.entries.len())
            .field("used_bytes", &self.used_bytes)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    impl Weighted for String {
        fn weight(&self) -> usize {
            self.len()
        }
    }

    #[test]
    fn get_hits_and_misses() {
        let mut cache: Cache<String> = Cache::new(10, None);
        cache.add("test", "value".to_string());
        assert_eq!(cache.get("test").map(String::as_str), Some("value"));
        assert!(cache.get("123").is_none());
    }

    #[test]
    fn evicts_oldest_when_over_budget() {
        let cap = "k1k2v1v2".len();
        let mut cache: Cache<String> = Cache::new(cap, None);
        cache.add("k1", "v1".to_string());
        cache.add("k2", "v2".to_string());
        cache.add("k3", "v3".to_string());

        assert_eq!(cache.len(), 2);
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_some());
        assert!(cache.get("k3").is_some());
    }

    #[test]
    fn get_promotes_entry_out_of_eviction_order() {
        let cap = 2 * ("k1".len() + "v1".len());
        let mut cache: Cache<String> = Cache::new(cap, None);
        cache.add("k1", "v1".to_string());
        cache.add("k2", "v2".to_string());
        cache.get("k1");
        cache.add("k3", "v3".to_string());

        assert!(cache.get("k2").is_none());
        assert!(cache.get("k1").is_some());
    }

    #[test]
    fn eviction_hook_sees_each_victim_once() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let hook: EvictionHook<String> =
            Box::new(move |key, _value| sink.lock().push(key.to_string()));

        let cap = "k1k2v1v2".len();
        let mut cache: Cache<String> = Cache::new(cap, Some(hook));
        cache.add("k1", "v1".to_string());
        cache.add("k2", "v2".to_string());
        cache.add("k3", "v3".to_string());

        assert_eq!(evicted.lock().as_slice(), ["k1".to_string()]);
    }

    #[test]
    fn update_replaces_value_and_adjusts_accounting() {
        let mut cache: Cache<String> = Cache::new(0, None);
        cache.add("test", "value".to_string());
        cache.add("test", "longer-value".to_string());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_bytes(), "test".len() + "longer-value".len());
        assert_eq!(cache.get("test").map(String::as_str), Some("longer-value"));
    }

    #[test]
    fn accounting_tracks_entry_sum() {
        let mut cache: Cache<String> = Cache::new(0, None);
        cache.add("a", "x".to_string());
        cache.add("bb", "yy".to_string());
        assert_eq!(cache.used_bytes(), 1 + 1 + 2 + 2);

        cache.remove_oldest();
        assert_eq!(cache.used_bytes(), 2 + 2);

        cache.remove_oldest();
        assert_eq!(cache.used_bytes(), 0);
        assert!(cache.is_empty());
    }
}
