//! # Resilience Module
//!
//! Fault tolerance for calls into the downstream fiscal service: circuit
//! breakers isolate a failing dependency, the backoff policy spaces retry
//! attempts, and sliding-window metrics expose failure rates and latency
//! percentiles for observability.
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: per-dependency three-state guards with a volume
//!   gate on the open transition
//! - **Backoff Policy**: pure exponential delay computation with an optional
//!   retryability predicate
//! - **Metrics Collection**: trailing-window call records, pruned lazily and
//!   by the manager's periodic sweep
//! - **Manager**: one shared breaker per dependency name, created on first
//!   use
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fiscal_core::config::CircuitBreakerConfig;
//! use fiscal_core::resilience::CircuitBreaker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let circuit = CircuitBreaker::new("fiscal_service".to_string(), CircuitBreakerConfig::default());
//!
//! let result = circuit
//!     .call(|| async {
//!         // Downstream call here
//!         Ok::<&str, Box<dyn std::error::Error>>("success")
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod manager;
pub mod metrics;

pub use backoff::{RetryError, RetryPolicy};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use manager::CircuitBreakerManager;
pub use metrics::{CircuitBreakerMetrics, MetricsSnapshot};
