//! Fixed-capacity idempotency cache: `key -> result` with least-recent
//! eviction and O(1) lookup, per the design note on replacing an
//! ad-hoc idempotency map with a bounded LRU (default capacity 10,000).
//! Used wherever a component needs "replay with the same key is a
//! no-op returning the cached result" without growing unboundedly.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;

pub struct IdempotencyCache<V: Clone> {
    inner: Mutex<LruCache<String, V>>,
}

impl<V: Clone> IdempotencyCache<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(10_000).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn put(&self, key: &str, value: V) {
        self.inner.lock().await.put(key.to_string(), value);
    }

    /// Removes and returns the cached value for `key`, if present.
    pub async fn remove(&self, key: &str) -> Option<V> {
        self.inner.lock().await.pop(key)
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evicts_least_recently_used_entry() {
        let cache: IdempotencyCache<u64> = IdempotencyCache::new(2);
        cache.put("a", 1).await;
        cache.put("b", 2).await;
        // Touch "a" so "b" becomes the least-recently-used entry.
        assert_eq!(cache.get("a").await, Some(1));
        cache.put("c", 3).await;
        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("c").await, Some(3));
    }

    #[tokio::test]
    async fn repeated_put_on_same_key_is_a_cache_hit() {
        let cache: IdempotencyCache<&'static str> = IdempotencyCache::new(10);
        cache.put("k", "first").await;
        assert_eq!(cache.get("k").await, Some("first"));
    }
}
