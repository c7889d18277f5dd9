use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use enrich_common::types::ProviderResult;

/// Deterministic cache key: same provider, subject and threshold always
/// resolve to the same entry.
pub fn cache_key(provider: &str, subject_key: &str, min_confidence: f64) -> String {
    format!("{provider}:{min_confidence:.4}:{subject_key}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct Entry {
    value: ProviderResult,
    expires_at: Instant,
    last_used: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    /// Monotonic access counter driving LRU ordering.
    tick: u64,
}

/// TTL + LRU memo of successful provider responses. Consulted before the
/// rate limiter and circuit breaker: a hit consumes no token and probes no
/// breaker.
pub struct ResponseCache {
    inner: Mutex<Inner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<ProviderResult> {
        let mut inner = self.inner.lock().expect("poisoned cache lock");
        inner.tick += 1;
        let tick = inner.tick;

        match inner.entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.last_used = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                inner.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: &str, value: ProviderResult, ttl: Duration) {
        let mut inner = self.inner.lock().expect("poisoned cache lock");
        inner.tick += 1;
        let tick = inner.tick;

        inner.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
                last_used: tick,
            },
        );

        while inner.entries.len() > self.capacity {
            let lru_key = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match lru_key {
                Some(lru_key) => {
                    inner.entries.remove(&lru_key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("poisoned cache lock");
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: inner.entries.len(),
        }
    }
}
