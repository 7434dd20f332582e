//! Bounded memo tables used by the protocol parsers.
//!
//! Repeated small messages (health checks, keep-alive pings, identical
//! control frames) are common on long-lived servers. Each protocol instance
//! keeps a handful of these caches keyed by the raw bytes it parsed, so a
//! second identical message skips the parser entirely.
//!
//! Eviction is strictly first-in first-out: once the table grows past its
//! capacity the oldest inserted key is dropped, regardless of how often it was
//! hit. Updating an existing key keeps its original position.
//!
//! ```text
//!  insert(k4) with capacity 3
//!
//!   order: [k1, k2, k3]  ──▶  [k1, k2, k3, k4]  ──▶  [k2, k3, k4]
//!                                                   (k1 evicted)
//! ```

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct BoundedCache<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V> BoundedCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(1024) + 1),
            order: VecDeque::with_capacity(capacity.min(1024) + 1),
            capacity,
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Inserts `value`, returning the evicted entry if the capacity was
    /// exceeded.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.capacity == 0 {
            return None;
        }
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value;
            return None;
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);

        if self.entries.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                return self.entries.remove(&oldest).map(|v| (oldest, v));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_in_insertion_order() {
        let mut cache = BoundedCache::new(3);
        for i in 0..3 {
            assert!(cache.insert(i, i * 10).is_none());
        }
        // hits do not refresh position
        assert_eq!(cache.get(&0), Some(&0));

        let evicted = cache.insert(3, 30);
        assert_eq!(evicted, Some((0, 0)));
        assert!(!cache.contains(&0));
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.insert(4, 40), Some((1, 10)));
    }

    #[test]
    fn test_update_keeps_position() {
        let mut cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 3);
        assert_eq!(cache.get("a"), Some(&3));

        let evicted = cache.insert("c", 4);
        assert_eq!(evicted, Some(("a", 3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_never_stores() {
        let mut cache = BoundedCache::new(0);
        cache.insert(1u8, 1u8);
        assert!(cache.is_empty());
    }
}
