//! Sliding-window call metrics backing circuit breaker decisions.
//!
//! Samples are timestamped (outcome, latency) pairs retained for a bounded
//! trailing window. They gate the closed→open transition (volume threshold)
//! and feed the observability snapshot (call volume, failure rate, latency
//! percentiles). Samples are pruned lazily on read and periodically by the
//! manager's background sweep; they are never persisted.

use crate::resilience::circuit_breaker::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One observed call through the breaker.
#[derive(Debug, Clone, Copy)]
pub struct CallSample {
    pub at: Instant,
    pub success: bool,
    pub latency: Duration,
}

/// Mutable metrics accumulator owned by one circuit breaker.
#[derive(Debug)]
pub struct CircuitBreakerMetrics {
    window: Duration,
    samples: VecDeque<CallSample>,
    pub consecutive_failures: u64,
    pub half_open_successes: u64,
    pub rejected_calls: u64,
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            consecutive_failures: 0,
            half_open_successes: 0,
            rejected_calls: 0,
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            total_duration: Duration::ZERO,
        }
    }

    /// Record a completed call outcome.
    pub fn record(&mut self, success: bool, latency: Duration, now: Instant) {
        self.total_calls += 1;
        self.total_duration += latency;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.samples.push_back(CallSample {
            at: now,
            success,
            latency,
        });
        self.prune(now);
    }

    /// Record a rejection while the circuit is open. Rejections never count
    /// as failures or successes.
    pub fn record_rejection(&mut self) {
        self.rejected_calls += 1;
    }

    /// Drop samples older than the trailing window.
    pub fn prune(&mut self, now: Instant) {
        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Call volume observed within the trailing window.
    pub fn window_volume(&mut self, now: Instant) -> u64 {
        self.prune(now);
        self.samples.len() as u64
    }

    /// Failure rate over the trailing window, 0.0 when no samples exist.
    pub fn window_failure_rate(&mut self, now: Instant) -> f64 {
        self.prune(now);
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|s| !s.success).count();
        failures as f64 / self.samples.len() as f64
    }

    /// Latency percentiles (p50, p95, p99) over the trailing window.
    pub fn latency_percentiles(&mut self, now: Instant) -> (Duration, Duration, Duration) {
        self.prune(now);
        if self.samples.is_empty() {
            return (Duration::ZERO, Duration::ZERO, Duration::ZERO);
        }
        let mut latencies: Vec<Duration> = self.samples.iter().map(|s| s.latency).collect();
        latencies.sort_unstable();
        let pick = |quantile: f64| -> Duration {
            let index = ((latencies.len() as f64 - 1.0) * quantile).round() as usize;
            latencies[index.min(latencies.len() - 1)]
        };
        (pick(0.50), pick(0.95), pick(0.99))
    }

    /// Clear all counters and samples (administrative reset).
    pub fn reset(&mut self) {
        self.samples.clear();
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.rejected_calls = 0;
        self.total_calls = 0;
        self.success_count = 0;
        self.failure_count = 0;
        self.total_duration = Duration::ZERO;
    }
}

/// Point-in-time, serializable view of one breaker for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rejected_calls: u64,
    pub consecutive_failures: u64,
    pub window_volume: u64,
    pub window_failure_rate: f64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub average_duration_ms: u64,
}
