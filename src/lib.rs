#![allow(clippy::doc_markdown)] // Allow technical terms like JSONL, TTL in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Fiscal Core
//!
//! Resilience and consistency layer between e-commerce event notifications
//! and a fiscal-document issuance service.
//!
//! ## Overview
//!
//! The upstream platform delivers order and refund events at least once, in
//! any order, in bursts. The downstream fiscal service is rate limited,
//! occasionally slow, and occasionally down. This crate sits between the two
//! and guarantees that each business event results in exactly one issued
//! document (or one well-classified, durable failure), without overwhelming
//! the downstream service.
//!
//! ## Architecture
//!
//! An [`pipeline::EmissionPipeline`] composes the building blocks:
//!
//! - [`dedup`] - in-flight and recently-completed duplicate suppression
//! - [`queue`] - bounded, prioritized task queue with a concurrency cap
//! - [`resilience`] - circuit breaker, sliding-window metrics, exponential backoff
//! - [`cache`] - TTL/LRU cache shielding the downstream lookup endpoint
//! - [`error_store`] - durable, classified failure records with resolution workflow
//! - [`audit`] - buffered, rotated JSONL audit trail
//! - [`reconciliation`] - periodic local-vs-remote consistency sweeps
//!
//! The application injects the two seams the pipeline talks to the world
//! through: a [`types::DocumentEmitter`] (downstream transport client) and a
//! [`types::ResultStore`] (durable local outcome store).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fiscal_core::config::FiscalConfig;
//! use fiscal_core::pipeline::{Admission, EmissionPipeline};
//! use fiscal_core::types::{EventKey, IncomingEvent};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     emitter: Arc<dyn fiscal_core::types::DocumentEmitter>,
//! #     results: Arc<dyn fiscal_core::types::ResultStore>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = FiscalConfig::default();
//! let pipeline = EmissionPipeline::new(config, emitter, results)?;
//!
//! let event = IncomingEvent::new(
//!     EventKey::new("orders/paid", "42"),
//!     serde_json::json!({ "total": "199.90" }),
//! );
//! match pipeline.handle_event(event).await? {
//!     Admission::Accepted(ticket) => {
//!         let outcome = ticket.outcome().await;
//!         println!("emission finished: {outcome:?}");
//!     }
//!     Admission::Duplicate => println!("duplicate delivery, skipped"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod error_store;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod reconciliation;
pub mod resilience;
pub mod types;

pub use config::FiscalConfig;
pub use error::{FiscalError, Result};
pub use error_store::{classify, is_retryable, Classification, ErrorKind};
pub use pipeline::{Admission, EmissionOutcome, EmissionPipeline, EmissionTicket, PipelineStatus};
pub use resilience::{CircuitBreaker, CircuitBreakerManager, CircuitState, RetryPolicy};
pub use types::{
    DocumentEmitter, EmissionRecord, EmissionRequest, EmissionStatus, EventKey, FiscalDocument,
    IncomingEvent, LookupKey, ResultStore,
};
