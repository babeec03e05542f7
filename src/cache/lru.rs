//! Size-budgeted LRU tracker.
//!
//! Ordered key → (value, bytes) map with byte-size accounting. Reads promote
//! to most-recently-used; inserts evict from the LRU end until the total
//! fits the budget. An entry larger than the whole budget is rejected.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

struct Entry<V> {
    value: V,
    size_bytes: usize,
}

struct Inner<V> {
    map: HashMap<String, Entry<V>>,
    /// Most-recently-used at the front.
    order: VecDeque<String>,
    total_bytes: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LruStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejected_oversize: u64,
    pub entries: usize,
    pub total_bytes: usize,
}

/// Thread-safe LRU with a byte budget.
pub struct LruTracker<V> {
    inner: Mutex<Inner<V>>,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    rejected_oversize: AtomicU64,
}

impl<V: Clone> LruTracker<V> {
    pub fn new(max_size_mb: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
                total_bytes: 0,
            }),
            max_bytes: max_size_mb * 1024 * 1024,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            rejected_oversize: AtomicU64::new(0),
        }
    }

    /// Look up and promote to most-recently-used.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.map.get(key) {
            let value = entry.value.clone();
            inner.order.retain(|k| k != key);
            inner.order.push_front(key.to_string());
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(value)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Peek without promoting or counting.
    pub fn peek(&self, key: &str) -> Option<V> {
        let inner = self.inner.lock().unwrap();
        inner.map.get(key).map(|e| e.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().unwrap().map.contains_key(key)
    }

    /// Insert or replace, evicting from the LRU end until the total fits.
    /// Returns false for an entry whose own size exceeds the whole budget.
    pub fn insert(&self, key: &str, value: V, size_bytes: usize) -> bool {
        if size_bytes > self.max_bytes {
            self.rejected_oversize.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(key, size_bytes, budget = self.max_bytes, "entry exceeds cache budget, rejected");
            return false;
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.map.remove(key) {
            inner.total_bytes -= old.size_bytes;
            inner.order.retain(|k| k != key);
        }
        while inner.total_bytes + size_bytes > self.max_bytes {
            let Some(victim) = inner.order.pop_back() else {
                break;
            };
            if let Some(entry) = inner.map.remove(&victim) {
                inner.total_bytes -= entry.size_bytes;
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.map.insert(key.to_string(), Entry { value, size_bytes });
        inner.order.push_front(key.to_string());
        inner.total_bytes += size_bytes;
        true
    }

    /// Replace the value under `key` only if it is still present. Used by
    /// background rebuilds so an evicted entry is not resurrected.
    pub fn replace_if_present(&self, key: &str, value: V, size_bytes: usize) -> bool {
        if !self.contains(key) {
            return false;
        }
        self.insert(key, value, size_bytes)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.map.remove(key)?;
        inner.total_bytes -= entry.size_bytes;
        inner.order.retain(|k| k != key);
        Some(entry.value)
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.map.len();
        inner.map.clear();
        inner.order.clear();
        inner.total_bytes = 0;
        n
    }

    /// Visit every resident value (no promotion).
    pub fn for_each_value<F: FnMut(&V)>(&self, mut f: F) {
        let inner = self.inner.lock().unwrap();
        for entry in inner.map.values() {
            f(&entry.value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }

    pub fn stats(&self) -> LruStats {
        let inner = self.inner.lock().unwrap();
        LruStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            rejected_oversize: self.rejected_oversize.load(Ordering::Relaxed),
            entries: inner.map.len(),
            total_bytes: inner.total_bytes,
        }
    }
}
