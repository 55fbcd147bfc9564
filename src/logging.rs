//! # Structured Logging Module
//!
//! Environment-aware structured logging that outputs to both console and a
//! JSON file, for debugging the async emission pipeline and its background
//! sweeps.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call has any effect, and an
/// already-installed global subscriber (e.g. from a test harness) is left in
/// place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let log_dir = PathBuf::from("log");
        if !log_dir.exists() {
            if let Err(err) = fs::create_dir_all(&log_dir) {
                eprintln!("fiscal-core: failed to create log directory: {err}");
                return;
            }
        }

        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("{environment}.{pid}.{timestamp}.log");

        let file_appender = tracing_appender::rolling::never(&log_dir, &log_filename);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(EnvFilter::new(log_level.clone())),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(log_level)),
            );

        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing one"
            );
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = %log_dir.join(&log_filename).display(),
            "🔧 STRUCTURED LOGGING: Initialized with file output"
        );

        // Keep the non-blocking writer alive for the process lifetime.
        std::mem::forget(guard);
    });
}

/// Get current environment from environment variables.
fn get_environment() -> String {
    resolve_environment(
        std::env::var("FISCAL_ENV").ok(),
        std::env::var("APP_ENV").ok(),
    )
}

/// Resolution order: `FISCAL_ENV`, then `APP_ENV`, then `development`.
/// Separated from the env-var reads so it is testable without mutating
/// process-global state.
fn resolve_environment(fiscal_env: Option<String>, app_env: Option<String>) -> String {
    fiscal_env
        .or(app_env)
        .unwrap_or_else(|| "development".to_string())
}

/// Get log level based on environment.
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for emission operations.
pub fn log_emission_operation(
    operation: &str,
    order_ref: Option<&str>,
    topic: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        order_ref = order_ref,
        topic = topic,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🧾 EMISSION_OPERATION"
    );
}

/// Log structured data for reconciliation operations.
pub fn log_reconciliation_operation(
    operation: &str,
    report_id: Option<&str>,
    total: Option<usize>,
    discrepancies: Option<usize>,
    status: &str,
) {
    tracing::info!(
        operation = %operation,
        report_id = report_id,
        total = total,
        discrepancies = discrepancies,
        status = %status,
        timestamp = %Utc::now().to_rfc3339(),
        "🔍 RECONCILIATION_OPERATION"
    );
}

/// Log error with full context.
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
