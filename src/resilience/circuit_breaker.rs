//! # Circuit Breaker Implementation
//!
//! Fault isolation for the downstream fiscal service. Classic three-state
//! pattern: Closed (normal operation), Open (failing fast), and Half-Open
//! (testing recovery). The closed→open transition is additionally gated by a
//! minimum call volume over the trailing metrics window so a tiny sample
//! cannot trip the breaker.

use crate::config::CircuitBreakerConfig;
use crate::resilience::metrics::{CircuitBreakerMetrics, MetricsSnapshot};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through.
    Closed = 0,
    /// Failure mode - all calls fail fast without executing.
    Open = 1,
    /// Testing recovery - limited probe calls allowed through.
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            // Default to the safest state
            _ => CircuitState::Open,
        }
    }
}

/// Errors that can occur during circuit breaker operation.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls.
    #[error("Circuit breaker is open for {dependency}")]
    CircuitOpen { dependency: String },

    /// Operation executed and failed; the failure was recorded.
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Core circuit breaker with atomic state management.
///
/// One instance guards one named dependency and is shared by every call site
/// through the [`super::CircuitBreakerManager`].
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Dependency name for logging and metrics.
    name: String,

    /// Current circuit state (atomic for cheap reads).
    state: AtomicU8,

    config: CircuitBreakerConfig,

    /// Metrics tracking protected by mutex; all success/failure recording is
    /// serialized through it.
    metrics: Arc<Mutex<CircuitBreakerMetrics>>,

    /// Time when the circuit was opened, for timeout calculations.
    opened_at: Arc<Mutex<Option<Instant>>>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        info!(
            dependency = %name,
            failure_threshold = config.failure_threshold,
            volume_threshold = config.volume_threshold,
            timeout_ms = config.timeout_ms,
            success_threshold = config.success_threshold,
            "🛡️ Circuit breaker initialized"
        );

        let window = config.metrics_window();
        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            metrics: Arc::new(Mutex::new(CircuitBreakerMetrics::new(window))),
            opened_at: Arc::new(Mutex::new(None)),
        }
    }

    /// Get current circuit state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Get dependency name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call would currently be allowed through.
    ///
    /// While open, an elapsed timeout moves the circuit to half-open and the
    /// call is allowed as a probe. A rejection increments the rejection
    /// counter without touching failure/success counts.
    pub async fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = self.opened_at.lock().await;
                match *opened_at {
                    Some(opened_time) if opened_time.elapsed() >= self.config.timeout() => {
                        drop(opened_at);
                        self.transition_to_half_open().await;
                        true
                    }
                    Some(_) => {
                        drop(opened_at);
                        self.metrics.lock().await.record_rejection();
                        false
                    }
                    None => {
                        // Open without a timestamp should not happen; allow
                        // the call rather than wedge the dependency shut.
                        warn!(dependency = %self.name, "Circuit open but no timestamp recorded");
                        true
                    }
                }
            }
            CircuitState::HalfOpen => {
                let mut metrics = self.metrics.lock().await;
                if metrics.half_open_successes < u64::from(self.config.success_threshold) {
                    true
                } else {
                    metrics.record_rejection();
                    false
                }
            }
        }
    }

    /// Execute an operation with circuit breaker protection.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_execute().await {
            return Err(CircuitBreakerError::CircuitOpen {
                dependency: self.name.clone(),
            });
        }

        let start_time = Instant::now();
        let result = operation().await;
        let duration = start_time.elapsed();

        match &result {
            Ok(_) => self.record_success(duration).await,
            Err(_) => self.record_failure(duration).await,
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Record a successful operation.
    async fn record_success(&self, duration: std::time::Duration) {
        let mut metrics = self.metrics.lock().await;
        metrics.record(true, duration, Instant::now());

        debug!(
            dependency = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🟢 Operation succeeded"
        );

        match self.state() {
            CircuitState::HalfOpen => {
                metrics.half_open_successes += 1;
                if metrics.half_open_successes >= u64::from(self.config.success_threshold) {
                    drop(metrics);
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Closed => {
                // A success while closed resets the failure streak.
                metrics.consecutive_failures = 0;
            }
            CircuitState::Open => {
                warn!(dependency = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    /// Record a failed operation.
    async fn record_failure(&self, duration: std::time::Duration) {
        let now = Instant::now();
        let mut metrics = self.metrics.lock().await;
        metrics.record(false, duration, now);

        error!(
            dependency = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🔴 Operation failed"
        );

        match self.state() {
            CircuitState::Closed => {
                metrics.consecutive_failures += 1;
                let over_failure_threshold =
                    metrics.consecutive_failures >= u64::from(self.config.failure_threshold);
                let over_volume_threshold =
                    metrics.window_volume(now) >= u64::from(self.config.volume_threshold);
                if over_failure_threshold && over_volume_threshold {
                    drop(metrics);
                    self.transition_to_open().await;
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state immediately reopens the
                // circuit and restarts the timeout.
                drop(metrics);
                self.transition_to_open().await;
            }
            CircuitState::Open => {}
        }
    }

    async fn transition_to_closed(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);

        // Lock order: opened_at before metrics, matching transition_to_open.
        let mut opened_at = self.opened_at.lock().await;
        *opened_at = None;
        drop(opened_at);

        let mut metrics = self.metrics.lock().await;
        metrics.consecutive_failures = 0;
        metrics.half_open_successes = 0;

        info!(
            dependency = %self.name,
            total_calls = metrics.total_calls,
            "🟢 Circuit breaker closed (recovered)"
        );
    }

    async fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);

        let mut opened_at = self.opened_at.lock().await;
        *opened_at = Some(Instant::now());

        let mut metrics = self.metrics.lock().await;
        metrics.half_open_successes = 0;

        error!(
            dependency = %self.name,
            consecutive_failures = metrics.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            timeout_ms = self.config.timeout_ms,
            "🔴 Circuit breaker opened (failing fast)"
        );
    }

    async fn transition_to_half_open(&self) {
        self.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);

        let mut metrics = self.metrics.lock().await;
        metrics.half_open_successes = 0;

        info!(
            dependency = %self.name,
            success_threshold = self.config.success_threshold,
            "🟡 Circuit breaker half-open (testing recovery)"
        );
    }

    /// Administrative override: force a specific state.
    ///
    /// The caller is responsible for audit-logging the override.
    pub async fn force_state(&self, state: CircuitState) {
        warn!(dependency = %self.name, forced_state = ?state, "🚨 Circuit breaker state forced");
        match state {
            CircuitState::Closed => self.transition_to_closed().await,
            CircuitState::Open => self.transition_to_open().await,
            CircuitState::HalfOpen => self.transition_to_half_open().await,
        }
    }

    /// Administrative reset: return to closed and clear all counters.
    pub async fn reset(&self) {
        warn!(dependency = %self.name, "🚨 Circuit breaker reset");
        {
            let mut metrics = self.metrics.lock().await;
            metrics.reset();
        }
        self.transition_to_closed().await;
    }

    /// Prune expired window samples. Called by the manager's periodic sweep;
    /// reads prune lazily as well.
    pub async fn prune_metrics(&self) {
        self.metrics.lock().await.prune(Instant::now());
    }

    /// Point-in-time metrics snapshot for observability.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let mut metrics = self.metrics.lock().await;
        let (p50, p95, p99) = metrics.latency_percentiles(now);
        let average_duration_ms = if metrics.success_count + metrics.failure_count > 0 {
            (metrics.total_duration / (metrics.success_count + metrics.failure_count) as u32)
                .as_millis() as u64
        } else {
            0
        };

        MetricsSnapshot {
            name: self.name.clone(),
            state: self.state(),
            total_calls: metrics.total_calls,
            success_count: metrics.success_count,
            failure_count: metrics.failure_count,
            rejected_calls: metrics.rejected_calls,
            consecutive_failures: metrics.consecutive_failures,
            window_volume: metrics.window_volume(now),
            window_failure_rate: metrics.window_failure_rate(now),
            latency_p50_ms: p50.as_millis() as u64,
            latency_p95_ms: p95.as_millis() as u64,
            latency_p99_ms: p99.as_millis() as u64,
            average_duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn test_config(failure_threshold: u32, timeout_ms: u64, success_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            timeout_ms,
            volume_threshold: 1,
            metrics_window_ms: 60_000,
            sweep_interval_ms: 10_000,
        }
    }

    #[tokio::test]
    async fn normal_operation_stays_closed() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config(3, 100, 2));

        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());

        let snapshot = circuit.snapshot().await;
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.success_count, 1);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config(3, 100, 2));

        for _ in 0..2 {
            let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
            assert_eq!(circuit.state(), CircuitState::Closed);
        }

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.can_execute().await);

        // Fast-fail without reaching the dependency.
        let result = circuit
            .call(|| async { Ok::<_, String>("should not execute") })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));

        let snapshot = circuit.snapshot().await;
        assert_eq!(snapshot.failure_count, 3);
        // can_execute + the rejected call each count one rejection.
        assert_eq!(snapshot.rejected_calls, 2);
    }

    #[tokio::test]
    async fn volume_threshold_prevents_opening_on_small_sample() {
        let mut config = test_config(2, 100, 1);
        config.volume_threshold = 5;
        let circuit = CircuitBreaker::new("test".to_string(), config);

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;

        // Failure threshold reached but window volume (2) is below 5.
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config(1, 50, 2));

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;

        // First probe allowed, its failure reopens the circuit.
        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.can_execute().await);
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config(1, 50, 1));

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn closed_success_resets_failure_streak() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config(3, 100, 1));

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        let _ = circuit.call(|| async { Ok::<_, String>("ok") }).await;
        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;

        // Streak was broken by the success; still closed.
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn force_and_reset_operations() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config(1, 1_000, 1));

        circuit.force_state(CircuitState::Open).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        circuit.force_state(CircuitState::HalfOpen).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        circuit.reset().await;
        assert_eq!(circuit.state(), CircuitState::Closed);
        let snapshot = circuit.snapshot().await;
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.rejected_calls, 0);
    }
}
