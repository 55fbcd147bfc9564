//! # Audit Log
//!
//! Durable append-only record of auditable outcomes: emissions (success,
//! failure, skip), administrative circuit overrides, error resolutions, and
//! reconciliation runs. Entries are buffered in memory and flushed to disk on
//! a timer or when the buffer reaches a size threshold - a bounded window of
//! at-risk entries is traded for write efficiency.
//!
//! Storage is date-partitioned JSONL, rotated once the active file reaches a
//! maximum entry count. Files older than the retention period are deleted on
//! startup and by the periodic flush task. Queries scan only files whose
//! filename date falls within the requested range, then filter in memory; no
//! index structure is needed at the expected volume.

use crate::config::AuditConfig;
use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Kinds of auditable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    EmissionSucceeded,
    EmissionFailed,
    EmissionSkipped,
    CircuitForced,
    CircuitReset,
    ErrorResolved,
    ReconciliationCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
    Skipped,
}

/// Input for one audit entry; ids and timestamps are stamped by the log.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub result: AuditResult,
    pub actor: String,
    pub order_ref: Option<String>,
    pub document_key: Option<String>,
    pub details: serde_json::Value,
    pub duration_ms: Option<u64>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, result: AuditResult) -> Self {
        Self {
            action,
            result,
            actor: "system".to_string(),
            order_ref: None,
            document_key: None,
            details: serde_json::Value::Null,
            duration_ms: None,
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn order_ref(mut self, order_ref: impl Into<String>) -> Self {
        self.order_ref = Some(order_ref.into());
        self
    }

    pub fn document_key(mut self, key: impl Into<String>) -> Self {
        self.document_key = Some(key.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Immutable persisted audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub result: AuditResult,
    pub actor: String,
    pub order_ref: Option<String>,
    pub document_key: Option<String>,
    pub details: serde_json::Value,
    pub duration_ms: Option<u64>,
}

/// Aggregate statistics over a trailing window of days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditStats {
    pub window_days: i64,
    pub total: usize,
    pub by_action: HashMap<AuditAction, usize>,
    pub by_result: HashMap<AuditResult, usize>,
}

struct AuditState {
    buffer: Vec<AuditEntry>,
    active_date: NaiveDate,
    active_seq: u32,
    active_count: usize,
}

pub struct AuditLog {
    config: AuditConfig,
    state: Mutex<AuditState>,
    /// Serializes file appends. Taken while still holding `state` so batches
    /// reach disk in buffer order, then `state` is released and concurrent
    /// recorders can keep buffering while the write is in flight.
    disk: Mutex<()>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let today = Utc::now().date_naive();
        let mut active_seq = 1u32;
        let mut active_count = 0usize;
        for (date, seq, path) in Self::list_files(&config.dir)? {
            if date == today && seq >= active_seq {
                active_seq = seq;
                active_count = fs::read_to_string(&path)
                    .map(|contents| contents.lines().count())
                    .unwrap_or(0);
            }
        }

        let log = Self {
            config,
            state: Mutex::new(AuditState {
                buffer: Vec::new(),
                active_date: today,
                active_seq,
                active_count,
            }),
            disk: Mutex::new(()),
            flush_handle: Mutex::new(None),
        };
        log.apply_retention()?;
        Ok(log)
    }

    /// Record an auditable outcome. Returns the stamped entry.
    pub fn log(&self, event: AuditEvent) -> Result<AuditEntry> {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: event.action,
            result: event.result,
            actor: event.actor,
            order_ref: event.order_ref,
            document_key: event.document_key,
            details: event.details,
            duration_ms: event.duration_ms,
        };

        let mut state = self.state.lock();
        state.buffer.push(entry.clone());
        if state.buffer.len() >= self.config.buffer_size {
            self.flush_with(state)?;
        }
        Ok(entry)
    }

    /// Flush all buffered entries to disk.
    pub fn flush(&self) -> Result<()> {
        self.flush_with(self.state.lock())
    }

    fn flush_with(&self, mut state: parking_lot::MutexGuard<'_, AuditState>) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }

        // Assign each entry to its target file under the state lock (this
        // is where rotation decisions live), then do the writes with only
        // the disk lock held.
        let entries = std::mem::take(&mut state.buffer);
        let mut batches: Vec<(PathBuf, Vec<AuditEntry>)> = Vec::new();
        for entry in entries {
            let entry_date = entry.timestamp.date_naive();
            let needs_rotation = entry_date != state.active_date
                || state.active_count >= self.config.max_entries_per_file;
            if needs_rotation {
                if entry_date != state.active_date {
                    state.active_date = entry_date;
                    state.active_seq = 1;
                } else {
                    state.active_seq += 1;
                }
                state.active_count = 0;
                debug!(
                    date = %state.active_date,
                    seq = state.active_seq,
                    "Audit log rotated"
                );
            }

            let path = self.file_path(state.active_date, state.active_seq);
            match batches.last_mut() {
                Some((last_path, batch)) if *last_path == path => batch.push(entry),
                _ => batches.push((path, vec![entry])),
            }
            state.active_count += 1;
        }

        let disk = self.disk.lock();
        drop(state);

        let mut flushed = 0usize;
        for (path, batch) in &batches {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let mut writer = BufWriter::new(file);
            for entry in batch {
                serde_json::to_writer(&mut writer, entry)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            flushed += batch.len();
        }
        drop(disk);

        debug!(flushed, "Audit buffer flushed");
        Ok(())
    }

    fn file_path(&self, date: NaiveDate, seq: u32) -> PathBuf {
        self.config
            .dir
            .join(format!("audit-{}.{seq:04}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Enumerate (date, seq, path) for every audit file in the directory.
    fn list_files(dir: &std::path::Path) -> Result<Vec<(NaiveDate, u32, PathBuf)>> {
        let mut files = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name
                .strip_prefix("audit-")
                .and_then(|rest| rest.strip_suffix(".jsonl"))
            else {
                continue;
            };
            // stem is "<date>.<seq>"
            let Some((date_part, seq_part)) = stem.split_once('.') else {
                continue;
            };
            let (Ok(date), Ok(seq)) = (
                NaiveDate::parse_from_str(date_part, "%Y-%m-%d"),
                seq_part.parse::<u32>(),
            ) else {
                continue;
            };
            files.push((date, seq, path));
        }
        files.sort();
        Ok(files)
    }

    /// Delete files older than the retention period.
    pub fn apply_retention(&self) -> Result<()> {
        let cutoff = Utc::now().date_naive() - ChronoDuration::days(self.config.retention_days);
        for (date, _, path) in Self::list_files(&self.config.dir)? {
            if date < cutoff {
                if let Err(err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "Failed to delete expired audit file");
                } else {
                    info!(path = %path.display(), "Expired audit file deleted");
                }
            }
        }
        Ok(())
    }

    fn scan(&self, from_date: NaiveDate) -> Result<Vec<AuditEntry>> {
        let mut entries = Vec::new();
        for (date, _, path) in Self::list_files(&self.config.dir)? {
            if date < from_date {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            for line in contents.lines() {
                match serde_json::from_str::<AuditEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "Skipping unreadable audit line");
                    }
                }
            }
        }
        entries.sort_by_key(|entry| entry.timestamp);
        Ok(entries)
    }

    /// Entries from the trailing `hours`, oldest first.
    pub fn recent(&self, hours: i64) -> Result<Vec<AuditEntry>> {
        self.flush()?;
        let cutoff = Utc::now() - ChronoDuration::hours(hours);
        let entries = self
            .scan(cutoff.date_naive())?
            .into_iter()
            .filter(|entry| entry.timestamp >= cutoff)
            .collect();
        Ok(entries)
    }

    /// Every entry referencing one order, oldest first.
    pub fn by_order(&self, order_ref: &str) -> Result<Vec<AuditEntry>> {
        self.flush()?;
        let entries = self
            .scan(NaiveDate::MIN)?
            .into_iter()
            .filter(|entry| entry.order_ref.as_deref() == Some(order_ref))
            .collect();
        Ok(entries)
    }

    /// Aggregate statistics over the trailing `days`.
    pub fn stats(&self, days: i64) -> Result<AuditStats> {
        self.flush()?;
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let mut by_action: HashMap<AuditAction, usize> = HashMap::new();
        let mut by_result: HashMap<AuditResult, usize> = HashMap::new();
        let mut total = 0usize;
        for entry in self.scan(cutoff.date_naive())? {
            if entry.timestamp < cutoff {
                continue;
            }
            total += 1;
            *by_action.entry(entry.action).or_default() += 1;
            *by_result.entry(entry.result).or_default() += 1;
        }
        Ok(AuditStats {
            window_days: days,
            total,
            by_action,
            by_result,
        })
    }

    /// Start the periodic flush/retention task. Idempotent.
    pub fn start_flush_task(self: &Arc<Self>) {
        let mut handle = self.flush_handle.lock();
        if handle.is_some() {
            return;
        }
        let log = Arc::clone(self);
        let interval = self.config.flush_interval();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = log.flush() {
                    warn!(error = %err, "Periodic audit flush failed");
                }
                if let Err(err) = log.apply_retention() {
                    warn!(error = %err, "Audit retention sweep failed");
                }
            }
        }));
    }

    /// Flush outstanding entries and stop the background task.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.flush_handle.lock().take() {
            handle.abort();
        }
        self.flush()
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        if let Some(handle) = self.flush_handle.lock().take() {
            handle.abort();
        }
    }
}
