//! Bounded LRU caches.
//!
//! Every cache in the crate (page buffers, MFT entries, entry summaries,
//! path components) is a separate `Lru` instance specialized to its value
//! type. Eviction hands the displaced value back to the caller so the page
//! cache can recycle buffers through its free list.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// A fixed-capacity least-recently-used cache.
///
/// Recency is tracked with a monotonically increasing stamp; the oldest
/// stamp is evicted when the cache is full. Lookups refresh the stamp.
pub struct Lru<K, V> {
    capacity: usize,
    tick: u64,
    map: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
}

struct Slot<V> {
    value: V,
    stamp: u64,
}

impl<K: Eq + Hash + Clone, V> Lru<K, V> {
    pub fn with_capacity(capacity: usize) -> Self {
        Lru {
            capacity: capacity.max(1),
            tick: 0,
            map: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a key, refreshing its recency.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let stamp = self.next_tick();
        let slot = self.map.get_mut(key)?;
        self.order.remove(&slot.stamp);
        slot.stamp = stamp;
        self.order.insert(stamp, key.clone());
        Some(&slot.value)
    }

    /// Insert a value, returning the evicted entry if the cache was full.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let stamp = self.next_tick();

        if let Some(old) = self.map.get(&key) {
            self.order.remove(&old.stamp);
        }
        self.map.insert(key.clone(), Slot { value, stamp });
        self.order.insert(stamp, key);

        if self.map.len() > self.capacity {
            if let Some((&oldest, _)) = self.order.iter().next() {
                let victim_key = self.order.remove(&oldest)?;
                let victim = self.map.remove(&victim_key)?;
                return Some((victim_key, victim.value));
            }
        }
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.map.remove(key)?;
        self.order.remove(&slot.stamp);
        Some(slot.value)
    }

    /// Drop every entry, returning the values so buffers can be recycled.
    pub fn purge(&mut self) -> Vec<V> {
        self.order.clear();
        self.map.drain().map(|(_, slot)| slot.value).collect()
    }
}
