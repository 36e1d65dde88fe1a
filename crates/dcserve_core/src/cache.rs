//! Bounded in-process caches.
//!
//! # Responsibility
//! - `LruCache`: capacity-bounded map with least-recently-used eviction.
//! - `MemoCache`: thread-safe memo that builds each cold key exactly once,
//!   even when several callers ask for it at the same time.
//!
//! # Invariants
//! - A cache never holds more than `capacity` entries.
//! - A failed build leaves the key cold; the next caller retries.
//! - Entries expire only through eviction or `clear`, never by time.

use once_cell::sync::OnceCell;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

/// Capacity-bounded map evicting the least recently used key.
#[derive(Debug, Clone)]
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.map.contains_key(key) {
            self.touch(key);
            return self.map.get(key);
        }
        None
    }

    /// Inserts `value`, returning how many entries were evicted.
    pub fn insert(&mut self, key: K, value: V) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        if self.map.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return 0;
        }
        self.order.push_back(key);

        let mut evicted = 0;
        while self.map.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    fn touch(&mut self, key: &K) {
        if let Some(position) = self.order.iter().position(|candidate| candidate == key) {
            if let Some(found) = self.order.remove(position) {
                self.order.push_back(found);
            }
        }
    }
}

/// Populate-once-per-key memo over an `LruCache`.
#[derive(Debug)]
pub struct MemoCache<K, V> {
    entries: Mutex<LruCache<K, Arc<OnceCell<V>>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> MemoCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached value for `key`, running `build` on a cold key.
    ///
    /// Concurrent callers of the same cold key block on one build; the
    /// cache lock itself is not held while building.
    pub fn get_or_try_init<E>(
        &self,
        key: K,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            match entries.get(&key) {
                Some(cell) => Arc::clone(cell),
                None => {
                    let cell = Arc::new(OnceCell::new());
                    entries.insert(key, Arc::clone(&cell));
                    cell
                }
            }
        };
        cell.get_or_try_init(build).cloned()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .capacity()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
