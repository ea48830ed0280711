//! A small bounded LRU cache with TTL, used for the speed-layer's memory
//! tier (SPEC_FULL.md §4.4 tier 1). Hand-rolled for the same reason as
//! `bloom`: no crate in the dependency corpus provides one, and small data
//! structures like this are cheap enough to write directly rather than
//! pulling in a dependency for them.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Bounded-capacity, TTL-aware LRU cache. Not thread-safe on its own —
/// callers lock-stripe it externally (SPEC_FULL.md §5 "speed-layer memory
/// cache is lock-striped").
pub struct LruCache<V> {
    capacity: usize,
    default_ttl: Duration,
    map: HashMap<String, Entry<V>>,
    order: VecDeque<String>,
}

impl<V: Clone> LruCache<V> {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            default_ttl,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns the cached value if present and not expired, bumping it to
    /// most-recently-used. Expired entries are lazily evicted on access.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let expired = match self.map.get(key) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            self.remove(key);
            return None;
        }

        self.touch(key);
        self.map.get(key).map(|e| e.value.clone())
    }

    pub fn put(&mut self, key: String, value: V) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    pub fn put_with_ttl(&mut self, key: String, value: V, ttl: Duration) {
        if self.map.contains_key(&key) {
            self.order.retain(|k| k != &key);
        } else if self.map.len() >= self.capacity {
            self.evict_oldest();
        }

        self.map.insert(
            key.clone(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        self.order.push_back(key);
    }

    pub fn remove(&mut self, key: &str) {
        self.map.remove(key);
        self.order.retain(|k| k != key);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.order.pop_front() {
            self.map.remove(&oldest);
        }
    }
}
