//! Shared test doubles for the integration suite: a scripted downstream
//! emitter and an in-memory result store.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use fiscal_core::error::{FiscalError, Result};
use fiscal_core::types::{
    DocumentEmitter, EmissionRecord, EmissionRequest, FiscalDocument, LookupKey, ResultStore,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Downstream double with per-order scripted behavior: the first
/// `default_failures` emit calls for each order fail with the configured
/// error, later calls succeed and remember the issued document so lookups
/// can find it.
pub struct ScriptedEmitter {
    default_failures: Mutex<u32>,
    failure: Mutex<FiscalError>,
    emit_delay: Mutex<Duration>,
    calls: Mutex<HashMap<String, u32>>,
    issued: Mutex<Vec<FiscalDocument>>,
    lookup_calls: Mutex<u32>,
    lookup_failures: Mutex<u32>,
}

impl ScriptedEmitter {
    pub fn new(default_failures: u32, failure: FiscalError) -> Self {
        Self {
            default_failures: Mutex::new(default_failures),
            failure: Mutex::new(failure),
            emit_delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(HashMap::new()),
            issued: Mutex::new(Vec::new()),
            lookup_calls: Mutex::new(0),
            lookup_failures: Mutex::new(0),
        }
    }

    pub fn always_succeeding() -> Self {
        Self::new(0, FiscalError::network("unused"))
    }

    pub fn set_default_failures(&self, failures: u32) {
        *self.default_failures.lock() = failures;
    }

    pub fn set_emit_delay(&self, delay: Duration) {
        *self.emit_delay.lock() = delay;
    }

    pub fn fail_next_lookups(&self, count: u32) {
        *self.lookup_failures.lock() = count;
    }

    /// Pretend the downstream already issued this document.
    pub fn preload(&self, document: FiscalDocument) {
        self.issued.lock().push(document);
    }

    pub fn call_count(&self, order_ref: &str) -> u32 {
        self.calls.lock().get(order_ref).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }

    /// Number of lookup requests that reached this double.
    pub fn lookup_count(&self) -> u32 {
        *self.lookup_calls.lock()
    }
}

#[async_trait]
impl DocumentEmitter for ScriptedEmitter {
    async fn emit(&self, request: &EmissionRequest) -> Result<FiscalDocument> {
        let delay = *self.emit_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let count = {
            let mut calls = self.calls.lock();
            let count = calls.entry(request.order_ref.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if count <= *self.default_failures.lock() {
            return Err(self.failure.lock().clone());
        }

        let document = document_for(&request.order_ref);
        self.issued.lock().push(document.clone());
        Ok(document)
    }

    async fn lookup(&self, key: &LookupKey) -> Result<Option<FiscalDocument>> {
        *self.lookup_calls.lock() += 1;
        {
            let mut remaining = self.lookup_failures.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FiscalError::network("lookup transport failure"));
            }
        }

        let issued = self.issued.lock();
        Ok(match key {
            LookupKey::AccessKey(access_key) => issued
                .iter()
                .find(|document| &document.access_key == access_key)
                .cloned(),
            LookupKey::OrderRef(order_ref) => issued
                .iter()
                .find(|document| document.access_key == format!("key-{order_ref}"))
                .cloned(),
        })
    }
}

/// In-memory stand-in for the application's durable result store.
#[derive(Default)]
pub struct MemoryResultStore {
    records: Mutex<HashMap<String, EmissionRecord>>,
}

impl MemoryResultStore {
    /// Pre-populate a record without going through the async trait.
    pub fn seed(&self, record: EmissionRecord) {
        self.records.lock().insert(record.order_ref.clone(), record);
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn get(&self, order_ref: &str) -> Result<Option<EmissionRecord>> {
        Ok(self.records.lock().get(order_ref).cloned())
    }

    async fn set(&self, record: EmissionRecord) -> Result<()> {
        self.records.lock().insert(record.order_ref.clone(), record);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<EmissionRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

/// Deterministic document for an order reference, matching what
/// [`ScriptedEmitter`] issues.
pub fn document_for(order_ref: &str) -> FiscalDocument {
    FiscalDocument {
        access_key: format!("key-{order_ref}"),
        doc_type: "nfe".to_string(),
        series: "1".to_string(),
        number: format!("n-{order_ref}"),
        authorization_code: Some("auth".to_string()),
        issued_at: Utc::now(),
    }
}
