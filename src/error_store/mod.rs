//! # Error Store
//!
//! Durable record of terminal emission failures with a resolution workflow.
//! Every recorded error is classified into the fixed taxonomy and stamped
//! with a retryable flag and full business context (order/refund/webhook id,
//! attempt number). Records are immutable once created except for the
//! resolution sub-record, mutated only by an explicit resolve operation.
//!
//! Persistence is crash-tolerant: the JSON snapshot is written to a temp file
//! and renamed into place, so a crash mid-write never corrupts the store.
//! Retention evicts resolved entries oldest-first past the size bound and
//! always preserves unresolved entries regardless of age.

pub mod classifier;

use crate::config::ErrorStoreConfig;
use crate::error::{FiscalError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use classifier::{classify, is_retryable, Classification, ErrorKind};

/// Business context captured with every recorded error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    pub order_ref: Option<String>,
    pub refund_ref: Option<String>,
    pub webhook_id: Option<String>,
    /// Attempt number at which the failure became terminal.
    pub attempt: u32,
    /// Component that reported the failure.
    pub source: String,
}

impl ErrorContext {
    pub fn for_order(order_ref: impl Into<String>, attempt: u32, source: impl Into<String>) -> Self {
        Self {
            order_ref: Some(order_ref.into()),
            refund_ref: None,
            webhook_id: None,
            attempt,
            source: source.into(),
        }
    }
}

/// Resolution sub-record attached by the resolve operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_by: String,
    pub notes: String,
    pub resolved_at: DateTime<Utc>,
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub context: ErrorContext,
    pub resolution: Option<Resolution>,
}

impl ErrorRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Filter for unresolved-error queries.
#[derive(Debug, Clone, Default)]
pub struct ErrorFilter {
    pub kind: Option<ErrorKind>,
    pub order_ref: Option<String>,
    pub retryable_only: bool,
}

/// Aggregate counts for the observability surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorStoreStats {
    pub total: usize,
    pub unresolved: usize,
    pub resolved: usize,
    pub unresolved_by_kind: HashMap<ErrorKind, usize>,
}

pub struct ErrorStore {
    config: ErrorStoreConfig,
    records: Mutex<Vec<ErrorRecord>>,
    /// Serializes snapshot writes. Taken while still holding `records` so
    /// snapshots reach disk in mutation order, then `records` is released
    /// and queries proceed while the file write is in flight.
    disk: Mutex<()>,
}

impl ErrorStore {
    /// Open the store, loading any existing snapshot. An unreadable snapshot
    /// is set aside (renamed `.corrupt`) rather than silently dropped.
    pub fn new(config: ErrorStoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let records = match Self::load(&config.path) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    path = %config.path.display(),
                    error = %err,
                    "Error store snapshot unreadable, starting empty"
                );
                let corrupt = config.path.with_extension("json.corrupt");
                let _ = fs::rename(&config.path, &corrupt);
                Vec::new()
            }
        };

        if !records.is_empty() {
            info!(
                count = records.len(),
                path = %config.path.display(),
                "Error store loaded"
            );
        }

        Ok(Self {
            config,
            records: Mutex::new(records),
            disk: Mutex::new(()),
        })
    }

    fn load(path: &Path) -> Result<Vec<ErrorRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Atomic snapshot write: temp file then rename.
    fn persist(&self, records: &[ErrorRecord]) -> Result<()> {
        let tmp_path = self.config.path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(records)?;
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &self.config.path)?;
        Ok(())
    }

    /// Record a terminal failure. Returns the new record's id.
    pub fn record_error(&self, error: &FiscalError, context: ErrorContext) -> Result<Uuid> {
        let classification = classify(error);
        let record = ErrorRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: classification.kind,
            message: error.to_string(),
            retryable: classification.retryable,
            context,
            resolution: None,
        };
        let id = record.id;

        debug!(
            error_id = %id,
            kind = %record.kind,
            retryable = record.retryable,
            "Error recorded"
        );
        let disk;
        let snapshot = {
            let mut records = self.records.lock();
            records.push(record);
            Self::enforce_retention(&mut records, self.config.max_entries);
            disk = self.disk.lock();
            records.clone()
        };
        self.persist(&snapshot)?;
        drop(disk);
        Ok(id)
    }

    /// Evict resolved entries oldest-first past the bound; unresolved entries
    /// always survive.
    fn enforce_retention(records: &mut Vec<ErrorRecord>, max_entries: usize) {
        while records.len() > max_entries {
            match records.iter().position(ErrorRecord::is_resolved) {
                Some(index) => {
                    let evicted = records.remove(index);
                    debug!(error_id = %evicted.id, "Retention evicted resolved error");
                }
                None => break,
            }
        }
    }

    /// Unresolved records matching the filter, newest first.
    pub fn unresolved(&self, filter: &ErrorFilter) -> Vec<ErrorRecord> {
        let records = self.records.lock();
        let mut matched: Vec<ErrorRecord> = records
            .iter()
            .filter(|record| !record.is_resolved())
            .filter(|record| filter.kind.map_or(true, |kind| record.kind == kind))
            .filter(|record| {
                filter
                    .order_ref
                    .as_ref()
                    .map_or(true, |order| record.context.order_ref.as_ref() == Some(order))
            })
            .filter(|record| !filter.retryable_only || record.retryable)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched
    }

    /// All records of one kind, resolved or not.
    pub fn by_kind(&self, kind: ErrorKind) -> Vec<ErrorRecord> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect()
    }

    /// All records for one order reference.
    pub fn by_order(&self, order_ref: &str) -> Vec<ErrorRecord> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.context.order_ref.as_deref() == Some(order_ref))
            .cloned()
            .collect()
    }

    /// Attach a resolution to an unresolved record. Returns `false` when the
    /// id is unknown or the record is already resolved.
    pub fn resolve(
        &self,
        id: Uuid,
        resolved_by: impl Into<String>,
        notes: impl Into<String>,
    ) -> Result<bool> {
        let disk;
        let snapshot = {
            let mut records = self.records.lock();
            let Some(record) = records
                .iter_mut()
                .find(|record| record.id == id && !record.is_resolved())
            else {
                return Ok(false);
            };

            record.resolution = Some(Resolution {
                resolved_by: resolved_by.into(),
                notes: notes.into(),
                resolved_at: Utc::now(),
            });
            disk = self.disk.lock();
            records.clone()
        };
        info!(error_id = %id, "Error resolved");
        self.persist(&snapshot)?;
        drop(disk);
        Ok(true)
    }

    pub fn stats(&self) -> ErrorStoreStats {
        let records = self.records.lock();
        let mut unresolved_by_kind: HashMap<ErrorKind, usize> = HashMap::new();
        let mut unresolved = 0usize;
        for record in records.iter() {
            if !record.is_resolved() {
                unresolved += 1;
                *unresolved_by_kind.entry(record.kind).or_default() += 1;
            }
        }
        ErrorStoreStats {
            total: records.len(),
            unresolved,
            resolved: records.len() - unresolved,
            unresolved_by_kind,
        }
    }
}
