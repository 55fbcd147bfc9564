//! Per-dependency circuit breaker registry.
//!
//! Hands out one shared breaker per dependency name, created on first use
//! with the process-wide configuration, and owns the periodic sweep that
//! prunes expired metrics samples from every breaker.

use crate::config::CircuitBreakerConfig;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::metrics::MetricsSnapshot;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            breakers: DashMap::new(),
            sweep_handle: Mutex::new(None),
        })
    }

    /// Get the shared breaker for a dependency name, creating it on first
    /// use. Every call site for a given name must go through this method so
    /// state stays process-wide.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name.to_string(), self.config.clone()))
            })
            .clone()
    }

    /// Snapshot every registered breaker for the observability surface.
    pub async fn snapshots(&self) -> Vec<MetricsSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|entry| entry.value().clone()).collect();
        let mut snapshots = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            snapshots.push(breaker.snapshot().await);
        }
        snapshots
    }

    /// Start the periodic sweep pruning expired metrics samples. Idempotent;
    /// a second call replaces nothing.
    pub fn start_sweep(self: &Arc<Self>) {
        let mut handle = self.sweep_handle.lock();
        if handle.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        let interval = self.config.sweep_interval();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let breakers: Vec<Arc<CircuitBreaker>> = manager
                    .breakers
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                for breaker in breakers {
                    breaker.prune_metrics().await;
                }
                debug!("Circuit breaker metrics sweep completed");
            }
        }));
    }

    /// Stop the sweep task. Called on pipeline shutdown.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for CircuitBreakerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_name_returns_shared_instance() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default());
        let first = manager.breaker("fiscal_service");
        let second = manager.breaker("fiscal_service");
        assert!(Arc::ptr_eq(&first, &second));

        let other = manager.breaker("other_service");
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn snapshots_cover_all_breakers() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default());
        manager.breaker("a");
        manager.breaker("b");

        let snapshots = manager.snapshots().await;
        let mut names: Vec<String> = snapshots.into_iter().map(|s| s.name).collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
