//! # Reconciliation Engine
//!
//! Periodic (or on-demand) comparison of the local emission records against
//! the downstream system of record, catching drift the synchronous path
//! cannot see: a local failure whose document was actually issued, an
//! emitted record the downstream no longer knows, or diverging document
//! fields. Lookups go through the injected accessor, primary key first with a
//! secondary order-reference fallback, with a fixed delay between records to
//! respect downstream rate limits.

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditResult};
use crate::config::ReconciliationConfig;
use crate::error::Result;
use crate::types::{DocumentEmitter, EmissionRecord, EmissionStatus, FiscalDocument, LookupKey, ResultStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Which local records a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// The N most recently updated records.
    Recent(usize),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Kind of detected inconsistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Locally emitted, no remote record found.
    MissingRemotely,
    /// Locally failed or absent, but the downstream issued a document.
    MissingLocally,
    /// Both sides exist but document fields differ.
    DataMismatch,
    /// The remote lookup itself failed (not a not-found).
    ProcessingError,
    /// Local record still pending with no terminal outcome.
    PendingEmission,
}

/// One detected inconsistency between local and remote state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub kind: DiscrepancyKind,
    pub local: EmissionRecord,
    pub remote: Option<FiscalDocument>,
    pub severity: Severity,
    pub recommended_action: String,
}

/// A remote lookup failure, surfaced separately from discrepancies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupFailure {
    pub order_ref: String,
    pub message: String,
}

/// Immutable result of one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub verified: usize,
    pub discrepant: usize,
    pub errored: usize,
    pub success_rate: f64,
    pub severity_breakdown: HashMap<Severity, usize>,
    pub discrepancies: Vec<Discrepancy>,
    pub lookup_failures: Vec<LookupFailure>,
}

/// Compact view for the observability snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub verified: usize,
    pub discrepant: usize,
    pub errored: usize,
    pub success_rate: f64,
}

impl ReconciliationReport {
    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            id: self.id,
            timestamp: self.timestamp,
            total: self.total,
            verified: self.verified,
            discrepant: self.discrepant,
            errored: self.errored,
            success_rate: self.success_rate,
        }
    }
}

pub struct ReconciliationEngine {
    config: ReconciliationConfig,
    emitter: Arc<dyn DocumentEmitter>,
    store: Arc<dyn ResultStore>,
    audit: Arc<AuditLog>,
    history: Mutex<VecDeque<ReconciliationReport>>,
}

impl ReconciliationEngine {
    pub fn new(
        config: ReconciliationConfig,
        emitter: Arc<dyn DocumentEmitter>,
        store: Arc<dyn ResultStore>,
        audit: Arc<AuditLog>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.reports_dir)?;
        Ok(Self {
            config,
            emitter,
            store,
            audit,
            history: Mutex::new(VecDeque::new()),
        })
    }

    /// Run reconciliation over the selected local records.
    pub async fn reconcile(&self, selection: Selection) -> Result<ReconciliationReport> {
        let mut records = self.store.all().await?;
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Selection::Recent(limit) = selection {
            records.truncate(limit);
        }

        info!(total = records.len(), "Reconciliation run started");

        let mut verified = 0usize;
        let mut discrepancies = Vec::new();
        let mut lookup_failures = Vec::new();

        for (index, record) in records.iter().enumerate() {
            if index > 0 {
                // Rate-limit respect between remote lookups.
                tokio::time::sleep(self.config.lookup_delay()).await;
            }
            match self.check_record(record).await {
                Ok(Some(discrepancy)) => discrepancies.push(discrepancy),
                Ok(None) => verified += 1,
                Err(err) => {
                    warn!(order_ref = %record.order_ref, error = %err, "Remote lookup failed");
                    lookup_failures.push(LookupFailure {
                        order_ref: record.order_ref.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        let report = self.build_report(records.len(), verified, discrepancies, lookup_failures);
        self.persist(&report)?;
        self.remember(report.clone());

        self.audit.log(
            AuditEvent::new(AuditAction::ReconciliationCompleted, AuditResult::Success)
                .details(serde_json::json!({
                    "report_id": report.id,
                    "total": report.total,
                    "verified": report.verified,
                    "discrepant": report.discrepant,
                    "errored": report.errored,
                })),
        )?;

        info!(
            report_id = %report.id,
            total = report.total,
            verified = report.verified,
            discrepant = report.discrepant,
            errored = report.errored,
            "Reconciliation run completed"
        );
        Ok(report)
    }

    /// Check one local record against the downstream. `Ok(None)` means
    /// verified; `Ok(Some(_))` is a discrepancy; `Err` is a lookup failure.
    async fn check_record(&self, record: &EmissionRecord) -> Result<Option<Discrepancy>> {
        match record.status {
            EmissionStatus::Pending => Ok(Some(Discrepancy {
                kind: DiscrepancyKind::PendingEmission,
                local: record.clone(),
                remote: None,
                severity: Severity::Low,
                recommended_action: "await emission or re-enqueue the event".to_string(),
            })),
            EmissionStatus::Emitted => {
                let remote = self.lookup_with_fallback(record).await?;
                match remote {
                    None => Ok(Some(Discrepancy {
                        kind: DiscrepancyKind::MissingRemotely,
                        local: record.clone(),
                        remote: None,
                        severity: Severity::Critical,
                        recommended_action: "verify and reissue the document".to_string(),
                    })),
                    Some(remote_doc) => {
                        if Self::documents_match(record.document.as_ref(), &remote_doc) {
                            Ok(None)
                        } else {
                            Ok(Some(Discrepancy {
                                kind: DiscrepancyKind::DataMismatch,
                                local: record.clone(),
                                remote: Some(remote_doc),
                                severity: Severity::Medium,
                                recommended_action: "sync local record from remote".to_string(),
                            }))
                        }
                    }
                }
            }
            EmissionStatus::Failed => {
                let remote = self
                    .emitter
                    .lookup(&LookupKey::OrderRef(record.order_ref.clone()))
                    .await?;
                match remote {
                    // Local failure but remote success: the silent-drift case.
                    Some(remote_doc) => Ok(Some(Discrepancy {
                        kind: DiscrepancyKind::MissingLocally,
                        local: record.clone(),
                        remote: Some(remote_doc),
                        severity: Severity::High,
                        recommended_action: "import remote document and mark emitted".to_string(),
                    })),
                    None => Ok(None),
                }
            }
        }
    }

    /// Primary access-key lookup, falling back to the order reference when
    /// the local record never captured an access key or the primary lookup
    /// found nothing.
    async fn lookup_with_fallback(&self, record: &EmissionRecord) -> Result<Option<FiscalDocument>> {
        if let Some(document) = &record.document {
            if let Some(found) = self
                .emitter
                .lookup(&LookupKey::AccessKey(document.access_key.clone()))
                .await?
            {
                return Ok(Some(found));
            }
        }
        self.emitter
            .lookup(&LookupKey::OrderRef(record.order_ref.clone()))
            .await
    }

    /// Field-level comparison on {type, series, number, authorization code}.
    fn documents_match(local: Option<&FiscalDocument>, remote: &FiscalDocument) -> bool {
        match local {
            None => false,
            Some(local) => {
                local.doc_type == remote.doc_type
                    && local.series == remote.series
                    && local.number == remote.number
                    && local.authorization_code == remote.authorization_code
            }
        }
    }

    fn build_report(
        &self,
        total: usize,
        verified: usize,
        discrepancies: Vec<Discrepancy>,
        lookup_failures: Vec<LookupFailure>,
    ) -> ReconciliationReport {
        let mut severity_breakdown: HashMap<Severity, usize> = HashMap::new();
        for discrepancy in &discrepancies {
            *severity_breakdown.entry(discrepancy.severity).or_default() += 1;
        }
        let errored = lookup_failures.len();
        ReconciliationReport {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            total,
            verified,
            discrepant: discrepancies.len(),
            errored,
            success_rate: if total > 0 {
                verified as f64 / total as f64
            } else {
                1.0
            },
            severity_breakdown,
            discrepancies,
            lookup_failures,
        }
    }

    fn persist(&self, report: &ReconciliationReport) -> Result<()> {
        let path = self.config.reports_dir.join(format!("report-{}.json", report.id));
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(report)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn remember(&self, report: ReconciliationReport) {
        let mut history = self.history.lock();
        history.push_front(report);
        history.truncate(self.config.history_size);
    }

    /// Load a persisted report by id.
    pub fn get_report(&self, id: Uuid) -> Result<Option<ReconciliationReport>> {
        let path = self.config.reports_dir.join(format!("report-{id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Summaries of the rolling in-memory history, newest first.
    pub fn recent_summaries(&self) -> Vec<ReportSummary> {
        self.history.lock().iter().map(|r| r.summary()).collect()
    }

    /// Summary of the most recent run, if any.
    pub fn latest_summary(&self) -> Option<ReportSummary> {
        self.history.lock().front().map(|r| r.summary())
    }
}
