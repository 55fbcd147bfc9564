//! # Dedup Gate
//!
//! Idempotency guard in front of the task queue. Tracks event keys that are
//! currently in flight and keys completed within the dedup window; a key is
//! admitted only when it is in neither set. The in-flight set doubles as a
//! mutual-exclusion lock keyed by event identity: the second concurrent
//! admission for a key is rejected, not queued.
//!
//! All operations are O(1) average and non-blocking. A background sweep,
//! owned and cancellable by this component, drops completed entries older
//! than the window.

use crate::config::DedupConfig;
use crate::types::EventKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct DedupState {
    in_flight: HashSet<EventKey>,
    recently_completed: HashMap<EventKey, Instant>,
}

pub struct DedupGate {
    config: DedupConfig,
    state: Arc<Mutex<DedupState>>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DedupGate {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(DedupState::default())),
            sweep_handle: Mutex::new(None),
        }
    }

    /// Try to admit a key. Returns `false` if the key is in flight or was
    /// completed within the dedup window; otherwise marks it in flight.
    pub fn try_acquire(&self, key: &EventKey) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.in_flight.contains(key) {
            trace!(key = %key, "Dedup rejection: already in flight");
            return false;
        }

        if let Some(completed_at) = state.recently_completed.get(key) {
            if now.duration_since(*completed_at) < self.config.window() {
                trace!(key = %key, "Dedup rejection: completed within window");
                return false;
            }
            state.recently_completed.remove(key);
        }

        state.in_flight.insert(key.clone());
        true
    }

    /// Move a key from in flight to recently completed, stamped now. Blocks
    /// re-admission for the rest of the dedup window.
    pub fn complete(&self, key: &EventKey) {
        let mut state = self.state.lock();
        if state.in_flight.remove(key) {
            state.recently_completed.insert(key.clone(), Instant::now());
        }
    }

    /// Drop a key from in flight without marking it completed, so a future
    /// delivery of the same event can be retried.
    pub fn release(&self, key: &EventKey) {
        let mut state = self.state.lock();
        state.in_flight.remove(key);
    }

    /// Remove completed entries older than the window. Invoked by the sweep
    /// task; public for deterministic tests.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window();
        let mut state = self.state.lock();
        let before = state.recently_completed.len();
        state
            .recently_completed
            .retain(|_, completed_at| now.duration_since(*completed_at) < window);
        let removed = before - state.recently_completed.len();
        if removed > 0 {
            debug!(removed, "Dedup sweep removed expired completions");
        }
        removed
    }

    /// (in-flight, recently-completed) sizes for observability.
    pub fn sizes(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.in_flight.len(), state.recently_completed.len())
    }

    /// Start the background sweep. Idempotent.
    pub fn start_sweep(self: &Arc<Self>) {
        let mut handle = self.sweep_handle.lock();
        if handle.is_some() {
            return;
        }
        let gate = Arc::clone(self);
        let interval = self.config.sweep_interval();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gate.sweep_expired();
            }
        }));
    }

    /// Stop the background sweep. Called on shutdown.
    pub fn stop(&self) {
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for DedupGate {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gate(window_ms: u64) -> DedupGate {
        DedupGate::new(DedupConfig {
            window_ms,
            sweep_interval_ms: 10,
        })
    }

    #[test]
    fn second_acquire_before_completion_is_rejected() {
        let gate = gate(300_000);
        let key = EventKey::new("orders/paid", "42");

        assert!(gate.try_acquire(&key));
        assert!(!gate.try_acquire(&key));
    }

    #[test]
    fn completed_key_blocks_readmission_within_window() {
        let gate = gate(300_000);
        let key = EventKey::new("orders/paid", "42");

        assert!(gate.try_acquire(&key));
        gate.complete(&key);
        assert!(!gate.try_acquire(&key));
    }

    #[tokio::test]
    async fn window_expiry_allows_readmission() {
        let gate = gate(50);
        let key = EventKey::new("orders/paid", "42");

        assert!(gate.try_acquire(&key));
        gate.complete(&key);
        assert!(!gate.try_acquire(&key));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(gate.try_acquire(&key));
    }

    #[test]
    fn release_allows_immediate_retry() {
        let gate = gate(300_000);
        let key = EventKey::new("orders/paid", "42");

        assert!(gate.try_acquire(&key));
        gate.release(&key);
        assert!(gate.try_acquire(&key));
    }

    #[test]
    fn key_is_never_both_in_flight_and_completed() {
        let gate = gate(300_000);
        let key = EventKey::new("orders/paid", "42");

        gate.try_acquire(&key);
        gate.complete(&key);
        let (in_flight, completed) = gate.sizes();
        assert_eq!(in_flight, 0);
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn sweep_drops_expired_completions() {
        let gate = gate(20);
        let key = EventKey::new("orders/paid", "42");
        gate.try_acquire(&key);
        gate.complete(&key);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(gate.sweep_expired(), 1);
        let (_, completed) = gate.sizes();
        assert_eq!(completed, 0);
    }

    #[test]
    fn distinct_resources_do_not_interfere() {
        let gate = gate(300_000);
        assert!(gate.try_acquire(&EventKey::new("orders/paid", "1")));
        assert!(gate.try_acquire(&EventKey::new("orders/paid", "2")));
        assert!(gate.try_acquire(&EventKey::new("refunds/created", "1")));
    }
}
