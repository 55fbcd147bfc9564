//! # Structured Error Handling
//!
//! Crate-wide error taxonomy for the emission pipeline. Variants map onto the
//! failure classes the resilience layer distinguishes: transport problems,
//! downstream service verdicts (with HTTP-like status semantics), validation
//! failures that must never be retried, internal processing faults, timeouts,
//! and circuit-open rejections that never reached the dependency at all.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FiscalError {
    /// Transport-level failure reaching the downstream service.
    #[error("Network error: {message}")]
    Network { message: String },

    /// The downstream service answered with an error. `status` carries the
    /// HTTP-like status code when one is available.
    #[error("Downstream service error ({status:?}): {message}")]
    Downstream { status: Option<u16>, message: String },

    /// Malformed or semantically invalid input. Never retried.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Internal logic failure inside the pipeline.
    #[error("Processing error: {message}")]
    Processing { message: String },

    /// Failure in upstream webhook handling reported into the core.
    #[error("Webhook error: {message}")]
    Webhook { message: String },

    /// An operation exceeded its allotted wall-clock time.
    #[error("Operation '{operation}' timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    /// Rejected before any attempt because the circuit for the named
    /// dependency is open.
    #[error("Circuit breaker is open for {dependency}")]
    CircuitOpen { dependency: String },

    /// The task queue refused admission (backpressure).
    #[error("Task queue is full ({depth} pending)")]
    QueueFull { depth: usize },

    /// Durable storage (error store, audit log, reports) failed.
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl FiscalError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn downstream(status: impl Into<Option<u16>>, message: impl Into<String>) -> Self {
        Self::Downstream {
            status: status.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for FiscalError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for FiscalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage {
            message: format!("serialization failed: {err}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, FiscalError>;
