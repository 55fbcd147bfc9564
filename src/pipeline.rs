//! # Emission Pipeline
//!
//! Composition root wiring the resilience layer together: an incoming event
//! passes the dedup gate, becomes a task on the bounded queue, and executes
//! the downstream emission through the circuit breaker and retry policy. On
//! terminal success the outcome lands in the injected result store and the
//! audit log; on terminal failure it lands in the error store and audit log
//! and the dedup key is released so a later duplicate delivery can retry.
//!
//! Every component is explicitly constructed and owned here - there are no
//! global singletons. Background sweeps (dedup window, breaker metrics,
//! audit flush) are started on construction and stopped by [`EmissionPipeline::shutdown`].

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditResult, AuditStats};
use crate::cache::{CacheStats, LookupCache};
use crate::config::FiscalConfig;
use crate::dedup::DedupGate;
use crate::error::{FiscalError, Result};
use crate::error_store::{classifier, ErrorContext, ErrorKind, ErrorStore, ErrorStoreStats};
use crate::queue::{QueueError, TaskOptions, TaskQueue};
use crate::reconciliation::{
    ReconciliationEngine, ReconciliationReport, ReportSummary, Selection,
};
use crate::resilience::{
    CircuitBreakerError, CircuitBreakerManager, CircuitState, MetricsSnapshot, RetryPolicy,
};
use crate::types::{
    DocumentEmitter, EmissionRecord, EmissionRequest, EventKey, FiscalDocument, IncomingEvent,
    LookupKey, ResultStore,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Dependency name the emission breaker is registered under.
pub const FISCAL_DEPENDENCY: &str = "fiscal_service";

const DEFAULT_PRIORITY: u8 = 5;
const STATS_WINDOW_DAYS: i64 = 7;

/// Terminal outcome of one admitted emission.
#[derive(Debug, Clone)]
pub enum EmissionOutcome {
    Emitted(FiscalDocument),
    Failed {
        kind: ErrorKind,
        message: String,
        attempts: u32,
    },
    /// The task exceeded its wall-clock budget. The local record stays
    /// pending; reconciliation detects a late remote success.
    TimedOut,
    /// The queue dropped the task before completion (shutdown).
    Dropped,
}

/// Completion ticket for an admitted event. Dropping it does not affect the
/// emission; all bookkeeping happens inside the pipeline.
pub struct EmissionTicket {
    order_ref: String,
    rx: oneshot::Receiver<EmissionOutcome>,
}

impl EmissionTicket {
    pub fn order_ref(&self) -> &str {
        &self.order_ref
    }

    pub async fn outcome(self) -> EmissionOutcome {
        self.rx.await.unwrap_or(EmissionOutcome::Dropped)
    }
}

/// Admission verdict for one delivered event.
pub enum Admission {
    Accepted(EmissionTicket),
    /// Rejected by the dedup gate: in flight or completed within the window.
    Duplicate,
}

/// Aggregated observability surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub circuits: Vec<MetricsSnapshot>,
    pub queue_depth: usize,
    pub queue_in_use: usize,
    pub dedup_in_flight: usize,
    pub dedup_recently_completed: usize,
    pub cache: CacheStats,
    pub errors: ErrorStoreStats,
    pub audit: AuditStats,
    pub latest_reconciliation: Option<ReportSummary>,
}

pub struct EmissionPipeline {
    config: FiscalConfig,
    dedup: Arc<DedupGate>,
    queue: TaskQueue,
    breakers: Arc<CircuitBreakerManager>,
    retry: RetryPolicy,
    cache: Arc<LookupCache<FiscalDocument>>,
    errors: Arc<ErrorStore>,
    audit: Arc<AuditLog>,
    emitter: Arc<dyn DocumentEmitter>,
    results: Arc<dyn ResultStore>,
    reconciler: ReconciliationEngine,
}

impl EmissionPipeline {
    /// Build the pipeline and start its background sweeps. Must be called
    /// from within a tokio runtime.
    pub fn new(
        config: FiscalConfig,
        emitter: Arc<dyn DocumentEmitter>,
        results: Arc<dyn ResultStore>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|err| FiscalError::Configuration(err.to_string()))?;

        let dedup = Arc::new(DedupGate::new(config.dedup.clone()));
        let breakers = CircuitBreakerManager::new(config.circuit_breakers.clone());
        let audit = Arc::new(AuditLog::new(config.audit.clone())?);
        let errors = Arc::new(ErrorStore::new(config.error_store.clone())?);
        let reconciler = ReconciliationEngine::new(
            config.reconciliation.clone(),
            Arc::clone(&emitter),
            Arc::clone(&results),
            Arc::clone(&audit),
        )?;

        dedup.start_sweep();
        breakers.start_sweep();
        audit.start_flush_task();

        info!(
            max_concurrent = config.execution.max_concurrent_emissions,
            max_queue_size = config.execution.max_queue_size,
            dedup_window_ms = config.dedup.window_ms,
            "🚀 Emission pipeline initialized"
        );

        Ok(Self {
            dedup,
            queue: TaskQueue::new(config.execution.clone()),
            breakers,
            retry: RetryPolicy::new(config.backoff.clone()),
            cache: Arc::new(LookupCache::new(config.cache.clone())),
            errors,
            audit,
            emitter,
            results,
            reconciler,
            config,
        })
    }

    /// Handle one delivered event with the default priority.
    pub async fn handle_event(&self, event: IncomingEvent) -> Result<Admission> {
        self.handle_event_with_priority(event, DEFAULT_PRIORITY).await
    }

    /// Handle one delivered event. Duplicates are skipped and audit-logged;
    /// admitted events become emission tasks on the bounded queue.
    pub async fn handle_event_with_priority(
        &self,
        event: IncomingEvent,
        priority: u8,
    ) -> Result<Admission> {
        let key = event.key.clone();
        if !self.dedup.try_acquire(&key) {
            self.audit.log(
                AuditEvent::new(AuditAction::EmissionSkipped, AuditResult::Skipped)
                    .order_ref(&key.resource_id)
                    .details(serde_json::json!({
                        "topic": key.topic,
                        "reason": "duplicate_delivery",
                    })),
            )?;
            return Ok(Admission::Duplicate);
        }

        let order_ref = key.resource_id.clone();
        if let Err(err) = self.results.set(EmissionRecord::pending(&order_ref)).await {
            self.dedup.release(&key);
            return Err(err);
        }

        let request = EmissionRequest {
            order_ref: order_ref.clone(),
            payload: event.payload,
        };
        let task = self.emission_task(key.clone(), request);

        let handle = match self
            .queue
            .enqueue(TaskOptions::new(key.to_string(), priority), task)
        {
            Ok(handle) => handle,
            Err(QueueError::CapacityExceeded { pending }) => {
                self.dedup.release(&key);
                return Err(FiscalError::QueueFull { depth: pending });
            }
            Err(err) => {
                self.dedup.release(&key);
                return Err(FiscalError::processing(err.to_string()));
            }
        };

        Ok(Admission::Accepted(self.watch(key, order_ref, handle)))
    }

    /// The emission task body: breaker-wrapped, backoff-retried downstream
    /// call plus all terminal bookkeeping.
    fn emission_task(
        &self,
        key: EventKey,
        request: EmissionRequest,
    ) -> impl std::future::Future<Output = EmissionOutcome> + Send + 'static {
        let breaker = self.breakers.breaker(FISCAL_DEPENDENCY);
        let retry = self.retry.clone();
        let emitter = Arc::clone(&self.emitter);
        let results = Arc::clone(&self.results);
        let errors = Arc::clone(&self.errors);
        let audit = Arc::clone(&self.audit);
        let cache = Arc::clone(&self.cache);
        let dedup = Arc::clone(&self.dedup);

        async move {
            let order_ref = request.order_ref.clone();
            let started = Instant::now();
            let attempt_counter = Arc::new(AtomicU32::new(0));

            let result = retry
                .execute_if(
                    || {
                        let breaker = Arc::clone(&breaker);
                        let emitter = Arc::clone(&emitter);
                        let request = request.clone();
                        let counter = Arc::clone(&attempt_counter);
                        async move {
                            counter.fetch_add(1, Ordering::Relaxed);
                            breaker
                                .call(|| emitter.emit(&request))
                                .await
                                .map_err(|err| match err {
                                    CircuitBreakerError::CircuitOpen { dependency } => {
                                        FiscalError::CircuitOpen { dependency }
                                    }
                                    CircuitBreakerError::OperationFailed(source) => source,
                                })
                        }
                    },
                    classifier::is_retryable,
                )
                .await;

            let duration_ms = started.elapsed().as_millis() as u64;
            let attempts = attempt_counter.load(Ordering::Relaxed);

            match result {
                Ok(document) => {
                    let record =
                        EmissionRecord::emitted(&order_ref, document.clone(), attempts);
                    if let Err(err) = results.set(record).await {
                        // Emitted downstream but not recorded locally;
                        // reconciliation picks this up as missing-locally.
                        error!(
                            order_ref = %order_ref,
                            error = %err,
                            "Failed to persist emitted record"
                        );
                    }
                    // Same key scheme as lookup_document, so a lookup right
                    // after emission is served from cache.
                    let cache_key =
                        LookupKey::AccessKey(document.access_key.clone()).to_string();
                    cache.set("document", &cache_key, document.clone(), None);
                    if let Err(err) = audit.log(
                        AuditEvent::new(AuditAction::EmissionSucceeded, AuditResult::Success)
                            .order_ref(&order_ref)
                            .document_key(&document.access_key)
                            .duration_ms(duration_ms)
                            .details(serde_json::json!({ "attempts": attempts })),
                    ) {
                        warn!(error = %err, "Audit write failed for emission success");
                    }
                    dedup.complete(&key);
                    crate::logging::log_emission_operation(
                        "emit_document",
                        Some(&order_ref),
                        Some(&key.topic),
                        "emitted",
                        None,
                    );
                    EmissionOutcome::Emitted(document)
                }
                Err(retry_err) => {
                    let source = retry_err.into_source();
                    let classification = classifier::classify(&source);
                    if let Err(err) = errors.record_error(
                        &source,
                        ErrorContext::for_order(&order_ref, attempts, "emission_task"),
                    ) {
                        error!(error = %err, "Error store write failed");
                    }
                    if let Err(err) = results
                        .set(EmissionRecord::failed(&order_ref, source.to_string(), attempts))
                        .await
                    {
                        error!(
                            order_ref = %order_ref,
                            error = %err,
                            "Failed to persist failed record"
                        );
                    }
                    if let Err(err) = audit.log(
                        AuditEvent::new(AuditAction::EmissionFailed, AuditResult::Failure)
                            .order_ref(&order_ref)
                            .duration_ms(duration_ms)
                            .details(serde_json::json!({
                                "attempts": attempts,
                                "kind": classification.kind.to_string(),
                                "error": source.to_string(),
                            })),
                    ) {
                        warn!(error = %err, "Audit write failed for emission failure");
                    }
                    dedup.release(&key);
                    crate::logging::log_emission_operation(
                        "emit_document",
                        Some(&order_ref),
                        Some(&key.topic),
                        "failed",
                        Some(&source.to_string()),
                    );
                    EmissionOutcome::Failed {
                        kind: classification.kind,
                        message: source.to_string(),
                        attempts,
                    }
                }
            }
        }
    }

    /// Watch a queued task and translate queue-level failures (timeout,
    /// drop) into terminal bookkeeping; the task body handles its own.
    fn watch(
        &self,
        key: EventKey,
        order_ref: String,
        handle: crate::queue::TaskHandle<EmissionOutcome>,
    ) -> EmissionTicket {
        let (tx, rx) = oneshot::channel();
        let dedup = Arc::clone(&self.dedup);
        let errors = Arc::clone(&self.errors);
        let audit = Arc::clone(&self.audit);
        let task_timeout = self.config.execution.task_timeout();
        let ticket_order_ref = order_ref.clone();

        tokio::spawn(async move {
            let outcome = match handle.join().await {
                Ok(outcome) => outcome,
                Err(QueueError::TimedOut { .. }) => {
                    let err = FiscalError::Timeout {
                        operation: "emit_document".to_string(),
                        elapsed: task_timeout,
                    };
                    if let Err(store_err) = errors.record_error(
                        &err,
                        ErrorContext::for_order(&order_ref, 0, "task_queue"),
                    ) {
                        error!(error = %store_err, "Error store write failed for timeout");
                    }
                    crate::logging::log_error(
                        "task_queue",
                        "emit_document",
                        &err.to_string(),
                        Some(&order_ref),
                    );
                    if let Err(audit_err) = audit.log(
                        AuditEvent::new(AuditAction::EmissionFailed, AuditResult::Failure)
                            .order_ref(&order_ref)
                            .details(serde_json::json!({
                                "kind": "timeout",
                                "timeout_ms": task_timeout.as_millis() as u64,
                            })),
                    ) {
                        warn!(error = %audit_err, "Audit write failed for timeout");
                    }
                    // Local record stays pending; a late downstream success
                    // is caught by reconciliation.
                    dedup.release(&key);
                    EmissionOutcome::TimedOut
                }
                Err(_) => {
                    dedup.release(&key);
                    EmissionOutcome::Dropped
                }
            };
            let _ = tx.send(outcome);
        });

        EmissionTicket {
            order_ref: ticket_order_ref,
            rx,
        }
    }

    /// Cached downstream lookup. Shields the fiscal service from redundant
    /// queries; not-found results are never cached.
    pub async fn lookup_document(&self, key: &LookupKey) -> Result<Option<FiscalDocument>> {
        let cache_key = key.to_string();
        if let Some(document) = self.cache.get("document", &cache_key) {
            return Ok(Some(document));
        }

        let breaker = self.breakers.breaker(FISCAL_DEPENDENCY);
        let found = breaker
            .call(|| self.emitter.lookup(key))
            .await
            .map_err(|err| match err {
                CircuitBreakerError::CircuitOpen { dependency } => {
                    FiscalError::CircuitOpen { dependency }
                }
                CircuitBreakerError::OperationFailed(source) => source,
            })?;

        if let Some(document) = &found {
            self.cache.set("document", &cache_key, document.clone(), None);
        }
        Ok(found)
    }

    /// Administrative override: force a breaker state. Audit-logged.
    pub async fn force_circuit(
        &self,
        dependency: &str,
        state: CircuitState,
        actor: &str,
    ) -> Result<()> {
        self.breakers.breaker(dependency).force_state(state).await;
        self.audit.log(
            AuditEvent::new(AuditAction::CircuitForced, AuditResult::Success)
                .actor(actor)
                .details(serde_json::json!({
                    "dependency": dependency,
                    "state": state,
                })),
        )?;
        Ok(())
    }

    /// Administrative reset: return a breaker to closed with cleared
    /// counters. Audit-logged.
    pub async fn reset_circuit(&self, dependency: &str, actor: &str) -> Result<()> {
        self.breakers.breaker(dependency).reset().await;
        self.audit.log(
            AuditEvent::new(AuditAction::CircuitReset, AuditResult::Success)
                .actor(actor)
                .details(serde_json::json!({ "dependency": dependency })),
        )?;
        Ok(())
    }

    /// Resolve a recorded error. Audit-logged when the resolution applied.
    pub fn resolve_error(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: &str,
    ) -> Result<bool> {
        let applied = self.errors.resolve(id, resolved_by, notes)?;
        if applied {
            self.audit.log(
                AuditEvent::new(AuditAction::ErrorResolved, AuditResult::Success)
                    .actor(resolved_by)
                    .details(serde_json::json!({ "error_id": id, "notes": notes })),
            )?;
        }
        Ok(applied)
    }

    /// Run reconciliation over the selected local records.
    pub async fn reconcile(&self, selection: Selection) -> Result<ReconciliationReport> {
        let report = self.reconciler.reconcile(selection).await?;
        crate::logging::log_reconciliation_operation(
            "reconcile",
            Some(&report.id.to_string()),
            Some(report.total),
            Some(report.discrepancies.len()),
            "completed",
        );
        Ok(report)
    }

    pub fn get_reconciliation_report(&self, id: Uuid) -> Result<Option<ReconciliationReport>> {
        self.reconciler.get_report(id)
    }

    /// Point-in-time observability snapshot across all components.
    pub async fn status(&self) -> Result<PipelineStatus> {
        let (dedup_in_flight, dedup_recently_completed) = self.dedup.sizes();
        Ok(PipelineStatus {
            circuits: self.breakers.snapshots().await,
            queue_depth: self.queue.depth(),
            queue_in_use: self.queue.in_use(),
            dedup_in_flight,
            dedup_recently_completed,
            cache: self.cache.stats(),
            errors: self.errors.stats(),
            audit: self.audit.stats(STATS_WINDOW_DAYS)?,
            latest_reconciliation: self.reconciler.latest_summary(),
        })
    }

    /// Direct access to the error store for query endpoints.
    pub fn error_store(&self) -> &ErrorStore {
        &self.errors
    }

    /// Direct access to the audit log for query endpoints.
    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Stop background sweeps and flush the audit buffer.
    pub fn shutdown(&self) -> Result<()> {
        self.dedup.stop();
        self.breakers.shutdown();
        self.audit.shutdown()?;
        info!("🛑 Emission pipeline shut down");
        Ok(())
    }
}
