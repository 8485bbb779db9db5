//! Backend reply cache (spec §4.7).
//!
//! Grounded on `original_source/src/common/cache.hh` (`BasicCache`/
//! `LruCache`): keyed by filename, LRU eviction, hit/miss counters, and an
//! optional full disablement where `get` always misses and `put` is a
//! no-op. The hand-rolled intrusive list + map from the original is
//! replaced with the `lru` crate, which the wider example pack reaches for
//! this same job.

use bytes::Bytes;
use lru::LruCache as RawLru;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

struct Counters {
    hit: u64,
    miss: u64,
}

/// LRU cache from filename to last reply payload, serialized by a single
/// mutex (spec §4.7: "All operations are serialized by a single mutex").
pub struct ReplyCache {
    enabled: bool,
    store: Mutex<Option<RawLru<String, Bytes>>>,
    counters: Mutex<Counters>,
}

impl ReplyCache {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        let store = if enabled {
            // capacity validated to be > 0 by `CacheConfig::validate`.
            Some(RawLru::new(
                NonZeroUsize::new(capacity).expect("capacity must be nonzero when enabled"),
            ))
        } else {
            None
        };

        ReplyCache {
            enabled,
            store: Mutex::new(store),
            counters: Mutex::new(Counters { hit: 0, miss: 0 }),
        }
    }

    pub fn get(&self, filename: &str) -> Option<Bytes> {
        if !self.enabled {
            return None;
        }

        let mut store = self.store.lock();
        let found = store.as_mut().and_then(|c| c.get(filename)).cloned();
        let mut counters = self.counters.lock();
        match &found {
            Some(_) => counters.hit += 1,
            None => counters.miss += 1,
        }
        found
    }

    pub fn put(&self, filename: String, value: Bytes) {
        if !self.enabled {
            return;
        }

        let mut store = self.store.lock();
        if let Some(c) = store.as_mut() {
            c.put(filename, value);
        }
    }

    /// `(hit_rate, miss_rate)`, both zero if nothing has been looked up
    /// yet.
    pub fn hit_miss_rates(&self) -> (f64, f64) {
        let counters = self.counters.lock();
        let total = counters.hit + counters.miss;
        if total == 0 {
            return (0.0, 0.0);
        }
        (
            counters.hit as f64 / total as f64,
            counters.miss as f64 / total as f64,
        )
    }
}
