//! # Lookup Cache
//!
//! Bounded, TTL-based memoization of downstream read queries, keyed by
//! `(type, key)`. Shields the fiscal service from redundant lookups. Expired
//! entries read as misses and are removed on access; exceeding the capacity
//! bound evicts the entry with the oldest last-access timestamp (approximate
//! LRU).
//!
//! `get_or_fetch` is deliberately not a single-flight primitive: concurrent
//! misses for the same key may each invoke the fetch function. Errors from
//! the fetch are never cached.

use crate::config::CacheConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    last_access: Instant,
    hit_count: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

struct CacheState<V> {
    entries: HashMap<(String, String), CacheEntry<V>>,
    counters: CacheCounters,
}

/// Point-in-time cache statistics for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

pub struct LookupCache<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> LookupCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                counters: CacheCounters::default(),
            }),
        }
    }

    /// Get a live entry; an expired entry counts as a miss and is removed.
    pub fn get(&self, entry_type: &str, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let CacheState { entries, counters } = &mut *guard;
        let map_key = (entry_type.to_string(), key.to_string());

        match entries.get_mut(&map_key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = now;
                entry.hit_count += 1;
                counters.hits += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(&map_key);
                counters.expirations += 1;
                counters.misses += 1;
                trace!(entry_type, key, "Cache entry expired on read");
                None
            }
            None => {
                counters.misses += 1;
                None
            }
        }
    }

    /// Insert a value, optionally overriding the configured TTL. Evicts the
    /// least recently accessed entry when the capacity bound is exceeded.
    pub fn set(&self, entry_type: &str, key: &str, value: V, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.unwrap_or_else(|| self.config.ttl());
        let mut state = self.state.lock();
        let map_key = (entry_type.to_string(), key.to_string());

        if !state.entries.contains_key(&map_key)
            && state.entries.len() >= self.config.max_entries
        {
            if let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(k, _)| k.clone())
            {
                state.entries.remove(&oldest);
                state.counters.evictions += 1;
                debug!(
                    entry_type = %oldest.0,
                    key = %oldest.1,
                    "Cache eviction (least recently accessed)"
                );
            }
        }

        state.entries.insert(
            map_key,
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + ttl,
                last_access: now,
                hit_count: 0,
            },
        );
    }

    /// Remove one entry.
    pub fn invalidate(&self, entry_type: &str, key: &str) {
        let mut state = self.state.lock();
        state
            .entries
            .remove(&(entry_type.to_string(), key.to_string()));
    }

    /// Remove every entry of a type.
    pub fn invalidate_type(&self, entry_type: &str) {
        let mut state = self.state.lock();
        state.entries.retain(|(t, _), _| t != entry_type);
    }

    /// Cached read-through. On a miss, runs `fetch` and caches a successful
    /// result. Not single-flight: concurrent misses may each fetch.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        entry_type: &str,
        key: &str,
        fetch: F,
        ttl: Option<Duration>,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(entry_type, key) {
            return Ok(value);
        }
        let value = fetch().await?;
        self.set(entry_type, key, value.clone(), ttl);
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.counters.hits + state.counters.misses;
        CacheStats {
            entries: state.entries.len(),
            hits: state.counters.hits,
            misses: state.counters.misses,
            evictions: state.counters.evictions,
            expirations: state.counters.expirations,
            hit_rate: if lookups > 0 {
                state.counters.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    /// Age of an entry since creation, if present. Exposed for diagnostics.
    pub fn entry_age(&self, entry_type: &str, key: &str) -> Option<Duration> {
        let state = self.state.lock();
        state
            .entries
            .get(&(entry_type.to_string(), key.to_string()))
            .map(|entry| entry.created_at.elapsed())
    }
}
