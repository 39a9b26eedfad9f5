use std::fmt;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::decode::Payload;

use super::CacheKey;

/// How hard the process is asked to give memory back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Give back some memory: the store is trimmed to half its usage.
    Moderate,
    /// Give back everything: the store is emptied.
    Severe,
}

impl MemoryPressure {
    /// Trim level at or above which the memory store is emptied.
    const SEVERE_TRIM_LEVEL: u32 = 60;
    /// Trim level at or above which the memory store is halved.
    const MODERATE_TRIM_LEVEL: u32 = 40;

    /// Maps a numeric platform trim level to a pressure, if it calls for any action.
    pub fn from_trim_level(level: u32) -> Option<Self> {
        if level >= Self::SEVERE_TRIM_LEVEL {
            Some(Self::Severe)
        } else if level >= Self::MODERATE_TRIM_LEVEL {
            Some(Self::Moderate)
        } else {
            None
        }
    }
}

struct Entry<T> {
    payload: Arc<T>,
    weight: u64,
}

struct Inner<T> {
    entries: LruCache<CacheKey, Entry<T>>,
    size: u64,
}

impl<T> Inner<T> {
    /// Drops least recently used entries until at most `target` bytes are in use.
    fn shrink_to(&mut self, target: u64) -> usize {
        let mut evicted = 0;
        while self.size > target {
            let Some((_, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.size -= entry.weight;
            evicted += 1;
        }
        evicted
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Arc<T>> {
        let entry = self.entries.pop(key)?;
        self.size -= entry.weight;
        Some(entry.payload)
    }
}

/// In-process cache of decoded payloads.
///
/// The store is bounded by the summed [`Payload::weight`] of its entries rather than by their
/// count. Both [`get`](Self::get) and [`put`](Self::put) count as an access, and entries are
/// evicted strictly in least-recently-used order. All operations take a single lock and are
/// thus linearized.
pub struct MemoryStore<T> {
    capacity: u64,
    inner: Mutex<Inner<T>>,
}

impl<T> fmt::Debug for MemoryStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MemoryStore")
            .field("capacity", &self.capacity)
            .field("size", &inner.size)
            .field("len", &inner.entries.len())
            .finish()
    }
}

impl<T: Payload> MemoryStore<T> {
    /// Creates an empty store holding at most `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                size: 0,
            }),
        }
    }

    /// Returns the payload stored under `key`, marking it as most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<T>> {
        let mut inner = self.inner.lock().unwrap();
        let payload = inner.entries.get(key).map(|entry| entry.payload.clone());

        match payload {
            Some(_) => metric!(counter("caches.memory.hit") += 1),
            None => metric!(counter("caches.memory.miss") += 1),
        }
        payload
    }

    /// Whether an entry exists for `key`, without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().unwrap().entries.contains(key)
    }

    /// Stores `payload` under `key`, evicting older entries as needed.
    ///
    /// Returns the payload previously stored under `key`. A payload that is larger than the whole
    /// budget is not stored, but still replaces any previous entry.
    pub fn put(&self, key: CacheKey, payload: Arc<T>) -> Option<Arc<T>> {
        let weight = payload.weight();
        let mut inner = self.inner.lock().unwrap();

        if weight > self.capacity {
            tracing::debug!(%key, weight, capacity = self.capacity, "Payload exceeds memory budget");
            return inner.remove(&key);
        }

        let previous = inner.entries.put(key, Entry { payload, weight });
        inner.size += weight;
        if let Some(previous) = &previous {
            inner.size -= previous.weight;
        }

        let evicted = inner.shrink_to(self.capacity);
        if evicted > 0 {
            metric!(counter("caches.memory.evicted") += evicted as i64);
        }
        metric!(gauge("caches.memory.size") = inner.size);

        previous.map(|entry| entry.payload)
    }

    /// Removes the entry stored under `key`.
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.inner.lock().unwrap().remove(key)
    }

    /// Removes every entry whose key starts with `prefix`.
    ///
    /// This scans the whole store and returns the removed payloads.
    pub fn remove_by_prefix(&self, prefix: &str) -> Vec<Arc<T>> {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<_> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.as_str().starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();

        keys.iter().filter_map(|key| inner.remove(key)).collect()
    }

    /// Reduces the store to half of its current usage.
    pub fn trim(&self) {
        let mut inner = self.inner.lock().unwrap();
        let target = inner.size / 2;
        let evicted = inner.shrink_to(target);
        tracing::debug!(evicted, size = inner.size, "Trimmed memory cache");
    }

    /// Reduces the store to at most `target` bytes.
    pub fn trim_to(&self, target: u64) {
        self.inner.lock().unwrap().shrink_to(target);
    }

    /// Drops every entry.
    pub fn evict_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.size = 0;
        tracing::debug!("Evicted all memory cache entries");
    }

    /// Reacts to a memory-pressure signal.
    pub fn on_pressure(&self, pressure: MemoryPressure) {
        match pressure {
            MemoryPressure::Moderate => self.trim(),
            MemoryPressure::Severe => self.evict_all(),
        }
    }

    /// Total weight of all entries, in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
