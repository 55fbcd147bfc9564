//! # Core Domain Types
//!
//! Shared data model for the emission pipeline plus the collaborator traits
//! the surrounding application injects: the downstream document accessor and
//! the durable local result store. The pipeline only ever talks to the
//! outside world through these seams, which keeps the resilience layer fully
//! testable with in-memory fakes.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a business event for deduplication purposes.
///
/// Composed of the upstream topic (e.g. `orders/paid`) and the resource id the
/// notification refers to. Unique within the dedup window, not globally
/// unique over time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub topic: String,
    pub resource_id: String,
}

impl EventKey {
    pub fn new(topic: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.resource_id)
    }
}

/// An opaque event notification delivered by the upstream platform.
///
/// Delivery is at-least-once; duplicates are expected and filtered by the
/// dedup gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingEvent {
    pub key: EventKey,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl IncomingEvent {
    pub fn new(key: EventKey, payload: serde_json::Value) -> Self {
        Self {
            key,
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Request handed to the downstream emitter for one business event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmissionRequest {
    /// Order (or refund) reference on the e-commerce side.
    pub order_ref: String,
    /// Opaque payload the surrounding application mapped from the event.
    pub payload: serde_json::Value,
}

/// A fiscal document as known by the downstream system of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalDocument {
    /// Primary lookup key in the downstream system.
    pub access_key: String,
    pub doc_type: String,
    pub series: String,
    pub number: String,
    pub authorization_code: Option<String>,
    pub issued_at: DateTime<Utc>,
}

/// Lifecycle of a local emission record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmissionStatus {
    /// Admitted and enqueued, no terminal outcome yet.
    Pending,
    /// Document durably issued downstream.
    Emitted,
    /// Terminal failure recorded; a later duplicate delivery may retry.
    Failed,
}

/// Local durable record of what happened to one business event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmissionRecord {
    pub order_ref: String,
    pub status: EmissionStatus,
    pub document: Option<FiscalDocument>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl EmissionRecord {
    pub fn pending(order_ref: impl Into<String>) -> Self {
        Self {
            order_ref: order_ref.into(),
            status: EmissionStatus::Pending,
            document: None,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn emitted(order_ref: impl Into<String>, document: FiscalDocument, attempts: u32) -> Self {
        Self {
            order_ref: order_ref.into(),
            status: EmissionStatus::Emitted,
            document: Some(document),
            attempts,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn failed(order_ref: impl Into<String>, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            order_ref: order_ref.into(),
            status: EmissionStatus::Failed,
            document: None,
            attempts,
            last_error: Some(error.into()),
            updated_at: Utc::now(),
        }
    }
}

/// Key used to query the downstream system of record.
///
/// The access key is the primary key; the order reference is the secondary
/// fallback used when the local record never captured an access key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKey {
    AccessKey(String),
    OrderRef(String),
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupKey::AccessKey(key) => write!(f, "access_key:{key}"),
            LookupKey::OrderRef(order) => write!(f, "order_ref:{order}"),
        }
    }
}

/// Downstream fiscal-document service accessor, injected by the application.
///
/// Every call made through the pipeline passes the circuit breaker and the
/// retry policy; implementations should be plain transport clients with no
/// retry logic of their own.
#[async_trait]
pub trait DocumentEmitter: Send + Sync {
    /// Issue a fiscal document for the request. Must be idempotent on the
    /// downstream side only to the extent the service supports it; the
    /// pipeline's dedup gate is the primary at-most-once guard.
    async fn emit(&self, request: &EmissionRequest) -> Result<FiscalDocument>;

    /// Look up an existing document. `Ok(None)` means a definitive not-found;
    /// transport or service failures surface as errors.
    async fn lookup(&self, key: &LookupKey) -> Result<Option<FiscalDocument>>;
}

/// Durable local store of emission outcomes, injected by the application.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get(&self, order_ref: &str) -> Result<Option<EmissionRecord>>;
    async fn set(&self, record: EmissionRecord) -> Result<()>;
    async fn all(&self) -> Result<Vec<EmissionRecord>>;
}
