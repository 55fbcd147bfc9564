//! # Configuration System
//!
//! Explicit, validated configuration for every tunable the resilience core
//! exposes: concurrency and queue bounds, dedup window, circuit breaker
//! thresholds, retry delays, cache TTL and size, retention periods, and
//! buffer flush intervals. All values are static for the process lifetime and
//! injected into the components at construction time.
//!
//! Configuration is loaded from YAML files with an environment overlay (see
//! [`loader::ConfigManager`]); `Default` provides production-suitable values
//! and `for_test()` provides tightened values for fast test feedback.

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration for the emission pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FiscalConfig {
    /// Task queue execution settings.
    pub execution: ExecutionConfig,

    /// Dedup gate settings.
    pub dedup: DedupConfig,

    /// Circuit breaker thresholds shared by all dependency breakers.
    pub circuit_breakers: CircuitBreakerConfig,

    /// Retry and backoff settings.
    pub backoff: BackoffConfig,

    /// Lookup cache settings.
    pub cache: CacheConfig,

    /// Error store settings.
    pub error_store: ErrorStoreConfig,

    /// Audit log settings.
    pub audit: AuditConfig,

    /// Reconciliation engine settings.
    pub reconciliation: ReconciliationConfig,
}

impl Default for FiscalConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            dedup: DedupConfig::default(),
            circuit_breakers: CircuitBreakerConfig::default(),
            backoff: BackoffConfig::default(),
            cache: CacheConfig::default(),
            error_store: ErrorStoreConfig::default(),
            audit: AuditConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

impl FiscalConfig {
    /// Test-optimized configuration: tiny windows and delays so suites get
    /// rapid feedback, storage rooted under a caller-provided directory.
    pub fn for_test(data_dir: &std::path::Path) -> Self {
        Self {
            execution: ExecutionConfig {
                max_concurrent_emissions: 2,
                max_queue_size: 8,
                task_timeout_ms: 2_000,
            },
            dedup: DedupConfig {
                window_ms: 300,
                sweep_interval_ms: 50,
            },
            circuit_breakers: CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 1,
                timeout_ms: 100,
                volume_threshold: 1,
                metrics_window_ms: 5_000,
                sweep_interval_ms: 500,
            },
            backoff: BackoffConfig {
                max_attempts: 2,
                initial_delay_ms: 10,
                max_delay_ms: 50,
                backoff_factor: 2.0,
            },
            cache: CacheConfig {
                ttl_ms: 5_000,
                max_entries: 16,
            },
            error_store: ErrorStoreConfig {
                path: data_dir.join("errors.json"),
                max_entries: 16,
            },
            audit: AuditConfig {
                dir: data_dir.join("audit"),
                buffer_size: 4,
                flush_interval_ms: 50,
                max_entries_per_file: 32,
                retention_days: 1,
            },
            reconciliation: ReconciliationConfig {
                lookup_delay_ms: 1,
                history_size: 4,
                reports_dir: data_dir.join("reports"),
            },
        }
    }

    /// Validate cross-field consistency. Rejects configurations that would
    /// silently disable a safety mechanism.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.execution.max_concurrent_emissions == 0 {
            return Err(ConfigurationError::Invalid(
                "execution.max_concurrent_emissions must be at least 1".into(),
            ));
        }
        if self.execution.max_queue_size == 0 {
            return Err(ConfigurationError::Invalid(
                "execution.max_queue_size must be at least 1".into(),
            ));
        }
        if self.backoff.max_attempts == 0 {
            return Err(ConfigurationError::Invalid(
                "backoff.max_attempts must be at least 1".into(),
            ));
        }
        if self.backoff.backoff_factor < 1.0 {
            return Err(ConfigurationError::Invalid(
                "backoff.backoff_factor must be >= 1.0".into(),
            ));
        }
        if self.circuit_breakers.failure_threshold == 0 {
            return Err(ConfigurationError::Invalid(
                "circuit_breakers.failure_threshold must be at least 1".into(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigurationError::Invalid(
                "cache.max_entries must be at least 1".into(),
            ));
        }
        if self.audit.max_entries_per_file == 0 {
            return Err(ConfigurationError::Invalid(
                "audit.max_entries_per_file must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Task queue execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Bounded concurrency: at most this many emission tasks run at once.
    pub max_concurrent_emissions: usize,
    /// Bounded capacity of the pending list; admissions beyond it fail fast.
    pub max_queue_size: usize,
    /// Per-task wall-clock timeout.
    pub task_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_emissions: 4,
            max_queue_size: 256,
            task_timeout_ms: 60_000,
        }
    }
}

impl ExecutionConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

/// Dedup gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Time span during which a completed event key blocks re-admission.
    pub window_ms: u64,
    /// Interval of the background sweep that drops expired completions.
    pub sweep_interval_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: 300_000,
            sweep_interval_ms: 30_000,
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Circuit breaker thresholds, shared by every dependency breaker the
/// manager creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close it again.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub timeout_ms: u64,
    /// Minimum call volume within the metrics window before the failure
    /// threshold may open the circuit.
    pub volume_threshold: u32,
    /// Trailing window over which call samples are retained.
    pub metrics_window_ms: u64,
    /// Interval of the background sweep pruning expired samples.
    pub sweep_interval_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            volume_threshold: 10,
            metrics_window_ms: 60_000,
            sweep_interval_ms: 10_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_millis(self.metrics_window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Retry and backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Multiplier applied per additional attempt.
    pub backoff_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Lookup cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default entry TTL; individual `set` calls may override it.
    pub ttl_ms: u64,
    /// Capacity bound; exceeding it evicts the least recently accessed entry.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            max_entries: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Error store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorStoreConfig {
    /// Snapshot file location.
    pub path: PathBuf,
    /// Retention bound. Past it, resolved entries are evicted oldest-first;
    /// unresolved entries always survive.
    pub max_entries: usize,
}

impl Default for ErrorStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/errors.json"),
            max_entries: 10_000,
        }
    }
}

/// Audit log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory holding the rotated JSONL files.
    pub dir: PathBuf,
    /// Buffered entries that force an immediate flush.
    pub buffer_size: usize,
    /// Timer-driven flush interval.
    pub flush_interval_ms: u64,
    /// Entries per file before rotation starts a new one.
    pub max_entries_per_file: usize,
    /// Files older than this are deleted on startup and periodically.
    pub retention_days: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/audit"),
            buffer_size: 100,
            flush_interval_ms: 5_000,
            max_entries_per_file: 10_000,
            retention_days: 90,
        }
    }
}

impl AuditConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Reconciliation engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Fixed delay between per-record remote lookups (rate-limit respect).
    pub lookup_delay_ms: u64,
    /// Rolling in-memory history of recent reports.
    pub history_size: usize,
    /// Directory where reports are persisted by id.
    pub reports_dir: PathBuf,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            lookup_delay_ms: 200,
            history_size: 20,
            reports_dir: PathBuf::from("data/reconciliation"),
        }
    }
}

impl ReconciliationConfig {
    pub fn lookup_delay(&self) -> Duration {
        Duration::from_millis(self.lookup_delay_ms)
    }
}
