//! Fingerprint-keyed response cache.
//!
//! Caches fully serialized responses under a hash of the raw request
//! bytes. A hit short-circuits the whole pipeline and replays the stored
//! bytes. Capacity is bounded; eviction is least-recently-used, and the
//! check-size → evict → insert sequence runs under one lock so at most one
//! build per fingerprint lands.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bytes: Vec<u8>,
    pub status: u16,
    pub inserted_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<u64, CacheEntry>,
    // Recency order, least recent at the front.
    order: VecDeque<u64>,
}

impl CacheInner {
    fn touch(&mut self, fingerprint: u64) {
        if let Some(position) = self.order.iter().position(|key| *key == fingerprint) {
            self.order.remove(position);
        }
        self.order.push_back(fingerprint);
    }
}

pub struct ResponseCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        ResponseCache {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Look up a serialized response, refreshing its recency on hit.
    pub async fn get(&self, fingerprint: u64) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.get(&fingerprint).cloned()?;
        inner.touch(fingerprint);
        Some(entry)
    }

    /// Insert a serialized response, evicting the least recently used entry
    /// when the cache is full.
    pub async fn insert(&self, fingerprint: u64, bytes: Vec<u8>, status: u16) {
        let mut inner = self.inner.lock().await;

        if !inner.entries.contains_key(&fingerprint) && inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }

        inner.entries.insert(
            fingerprint,
            CacheEntry {
                bytes,
                status,
                inserted_at: Instant::now(),
            },
        );
        inner.touch(fingerprint);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }
}
