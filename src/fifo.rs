//! Insertion-ordered bounded map shared by the tile and image caches.
//!
//! Eviction is first-in-first-out: reads never change an entry's position.
//! The bound is enforced lazily, on insert, and only once the map has grown
//! `slack` entries past its capacity, so eviction happens in batches instead
//! of on every insert.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Bounded map with FIFO eviction.
#[derive(Debug)]
pub struct FifoCache<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
    slack: usize,
}

impl<K, V> FifoCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding `capacity` entries, allowed to overshoot by
    /// `slack` entries before a batch eviction runs.
    pub fn new(capacity: usize, slack: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity + slack + 1),
            order: VecDeque::with_capacity(capacity + slack + 1),
            capacity,
            slack,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert without evicting. An existing key keeps its queue position and
    /// the previous value is returned.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.entries.insert(key.clone(), value);
        if previous.is_none() {
            self.order.push_back(key);
        }
        previous
    }

    /// Whether the cache has grown past `capacity + slack`.
    pub fn needs_eviction(&self) -> bool {
        self.entries.len() > self.capacity + self.slack
    }

    /// Remove oldest entries until the cache is back at `capacity`.
    ///
    /// Entries for which `can_evict` returns `false` are skipped and keep
    /// their position. Returns the evicted entries, oldest first.
    pub fn evict_oldest<F>(&mut self, mut can_evict: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut evicted = Vec::new();
        let mut index = 0;

        while self.entries.len() > self.capacity && index < self.order.len() {
            let key = &self.order[index];
            let evictable = self
                .entries
                .get(key)
                .is_some_and(|value| can_evict(key, value));

            if !evictable {
                index += 1;
                continue;
            }

            if let Some(key) = self.order.remove(index) {
                if let Some(value) = self.entries.remove(&key) {
                    evicted.push((key, value));
                }
            }
        }

        evicted
    }

    /// Insert and, when the bound is exceeded, evict the oldest entries.
    pub fn insert_and_evict(&mut self, key: K, value: V) -> Vec<(K, V)> {
        self.insert(key, value);
        if self.needs_eviction() {
            self.evict_oldest(|_, _| true)
        } else {
            Vec::new()
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
        }
        Some(value)
    }

    /// Remove every entry matching `predicate`.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let keys: Vec<K> = self
            .order
            .iter()
            .filter(|key| {
                self.entries
                    .get(*key)
                    .is_some_and(|value| predicate(key, value))
            })
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|key| self.remove(&key).map(|value| (key, value)))
            .collect()
    }

    /// Remove all entries, returning them oldest first.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let order = std::mem::take(&mut self.order);
        let mut entries = std::mem::take(&mut self.entries);
        order
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|value| (key, value)))
            .collect()
    }

    /// Iterate values oldest first.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.order.iter().filter_map(|key| self.entries.get(key))
    }
}
