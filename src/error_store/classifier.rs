//! # Error Classification
//!
//! Closed, exhaustive mapping from [`FiscalError`] variants to the error
//! taxonomy the store aggregates by, plus the retryability rule the retry
//! policy consults. Classification is a total function: every variant maps to
//! exactly one kind, with `Unknown` reserved for errors that arrive from
//! outside the taxonomy (e.g. deserialized legacy records).

use crate::error::FiscalError;
use serde::{Deserialize, Serialize};

/// Fixed error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level failure (connection refused, DNS, TLS).
    Network,
    /// The downstream fiscal service answered with an error.
    DownstreamService,
    /// Malformed or semantically invalid input.
    Validation,
    /// Internal pipeline logic failure.
    Processing,
    /// Upstream webhook handling failure.
    Webhook,
    /// Wall-clock timeout.
    Timeout,
    /// Rejected by an open circuit before any attempt.
    CircuitOpen,
    /// Anything outside the closed taxonomy.
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::DownstreamService => "downstream_service",
            ErrorKind::Validation => "validation",
            ErrorKind::Processing => "processing",
            ErrorKind::Webhook => "webhook",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Result of classifying one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
}

/// Classify an error into the fixed taxonomy with its retryability verdict.
///
/// Retryability rule: network failures, timeouts, and downstream 5xx/429
/// responses are retryable; validation errors, other 4xx responses, and
/// circuit-open rejections are not. A downstream error without a status code
/// carries no verdict and is treated as non-retryable.
pub fn classify(error: &FiscalError) -> Classification {
    match error {
        FiscalError::Network { .. } => Classification {
            kind: ErrorKind::Network,
            retryable: true,
        },
        FiscalError::Timeout { .. } => Classification {
            kind: ErrorKind::Timeout,
            retryable: true,
        },
        FiscalError::Downstream { status, .. } => Classification {
            kind: ErrorKind::DownstreamService,
            retryable: matches!(status, Some(code) if *code == 429 || *code >= 500),
        },
        FiscalError::Validation { .. } => Classification {
            kind: ErrorKind::Validation,
            retryable: false,
        },
        FiscalError::Webhook { .. } => Classification {
            kind: ErrorKind::Webhook,
            retryable: false,
        },
        FiscalError::CircuitOpen { .. } => Classification {
            kind: ErrorKind::CircuitOpen,
            retryable: false,
        },
        FiscalError::QueueFull { .. } => Classification {
            kind: ErrorKind::Processing,
            retryable: true,
        },
        FiscalError::Processing { .. }
        | FiscalError::Storage { .. }
        | FiscalError::Configuration(_) => Classification {
            kind: ErrorKind::Processing,
            retryable: false,
        },
    }
}

/// Retryability shorthand for the backoff predicate.
pub fn is_retryable(error: &FiscalError) -> bool {
    classify(error).retryable
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn network_and_timeout_are_retryable() {
        assert!(is_retryable(&FiscalError::network("connection reset")));
        assert!(is_retryable(&FiscalError::Timeout {
            operation: "emit".into(),
            elapsed: Duration::from_secs(30),
        }));
    }

    #[test]
    fn downstream_status_semantics() {
        assert!(is_retryable(&FiscalError::downstream(500, "internal")));
        assert!(is_retryable(&FiscalError::downstream(503, "unavailable")));
        assert!(is_retryable(&FiscalError::downstream(429, "rate limited")));
        assert!(!is_retryable(&FiscalError::downstream(400, "bad request")));
        assert!(!is_retryable(&FiscalError::downstream(401, "unauthorized")));
        assert!(!is_retryable(&FiscalError::downstream(409, "duplicate")));
        assert!(!is_retryable(&FiscalError::downstream(None, "no status")));
    }

    #[test]
    fn validation_and_circuit_open_never_retry() {
        assert!(!is_retryable(&FiscalError::validation("missing field")));
        assert!(!is_retryable(&FiscalError::CircuitOpen {
            dependency: "fiscal_service".into(),
        }));
    }

    #[test]
    fn kinds_cover_the_taxonomy() {
        assert_eq!(
            classify(&FiscalError::network("x")).kind,
            ErrorKind::Network
        );
        assert_eq!(
            classify(&FiscalError::downstream(500, "x")).kind,
            ErrorKind::DownstreamService
        );
        assert_eq!(
            classify(&FiscalError::validation("x")).kind,
            ErrorKind::Validation
        );
        assert_eq!(
            classify(&FiscalError::Webhook { message: "x".into() }).kind,
            ErrorKind::Webhook
        );
        assert_eq!(
            classify(&FiscalError::processing("x")).kind,
            ErrorKind::Processing
        );
        assert_eq!(
            classify(&FiscalError::CircuitOpen {
                dependency: "d".into()
            })
            .kind,
            ErrorKind::CircuitOpen
        );
    }
}
