//! Circuit breaker and timeout behavior exercised through the full
//! pipeline rather than against the breaker in isolation.

mod common;

use common::{MemoryResultStore, ScriptedEmitter};
use fiscal_core::config::FiscalConfig;
use fiscal_core::error::FiscalError;
use fiscal_core::pipeline::{Admission, EmissionOutcome, EmissionPipeline, FISCAL_DEPENDENCY};
use fiscal_core::types::{EmissionStatus, EventKey, IncomingEvent};
use fiscal_core::{CircuitState, ErrorKind, ResultStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn event(order_ref: &str) -> IncomingEvent {
    IncomingEvent::new(
        EventKey::new("orders/paid", order_ref),
        serde_json::json!({ "order": order_ref }),
    )
}

async fn accept(pipeline: &EmissionPipeline, order_ref: &str) -> EmissionOutcome {
    match pipeline.handle_event(event(order_ref)).await.expect("admitted") {
        Admission::Accepted(ticket) => ticket.outcome().await,
        Admission::Duplicate => panic!("unexpected duplicate for {order_ref}"),
    }
}

#[tokio::test]
async fn breaker_opens_on_sustained_failures_and_recovers() {
    let dir = tempdir().expect("tempdir");
    let emitter = Arc::new(ScriptedEmitter::new(
        u32::MAX,
        FiscalError::network("connection refused"),
    ));
    let store = Arc::new(MemoryResultStore::default());
    let pipeline =
        EmissionPipeline::new(FiscalConfig::for_test(dir.path()), emitter.clone(), store)
            .expect("pipeline builds");

    // Test config: failure threshold 3, 2 attempts per emission. The first
    // emission contributes two consecutive failures.
    let first = accept(&pipeline, "9001").await;
    assert!(matches!(
        first,
        EmissionOutcome::Failed {
            kind: ErrorKind::Network,
            attempts: 2,
            ..
        }
    ));

    // Third consecutive failure opens the circuit mid-emission; the retry
    // is rejected without reaching the downstream.
    let second = accept(&pipeline, "9002").await;
    assert!(matches!(
        second,
        EmissionOutcome::Failed {
            kind: ErrorKind::CircuitOpen,
            ..
        }
    ));
    assert_eq!(emitter.call_count("9002"), 1);

    let status = pipeline.status().await.expect("status");
    assert_eq!(status.circuits.len(), 1);
    assert_eq!(status.circuits[0].state, CircuitState::Open);
    assert!(status.circuits[0].rejected_calls >= 1);

    // After the open timeout (100ms in test config) one probe is allowed;
    // a healthy downstream closes the circuit again.
    tokio::time::sleep(Duration::from_millis(150)).await;
    emitter.set_default_failures(0);

    let recovered = accept(&pipeline, "9003").await;
    assert!(matches!(recovered, EmissionOutcome::Emitted(_)));

    let status = pipeline.status().await.expect("status");
    assert_eq!(status.circuits[0].state, CircuitState::Closed);

    pipeline.shutdown().expect("shutdown");
}

#[tokio::test]
async fn forced_open_circuit_fails_fast_without_downstream_calls() {
    let dir = tempdir().expect("tempdir");
    let emitter = Arc::new(ScriptedEmitter::always_succeeding());
    let store = Arc::new(MemoryResultStore::default());
    let pipeline =
        EmissionPipeline::new(FiscalConfig::for_test(dir.path()), emitter.clone(), store)
            .expect("pipeline builds");

    pipeline
        .force_circuit(FISCAL_DEPENDENCY, CircuitState::Open, "operator")
        .await
        .expect("force open");

    let outcome = accept(&pipeline, "9101").await;
    assert!(matches!(
        outcome,
        EmissionOutcome::Failed {
            kind: ErrorKind::CircuitOpen,
            attempts: 1,
            ..
        }
    ));
    assert_eq!(emitter.total_calls(), 0);

    pipeline
        .reset_circuit(FISCAL_DEPENDENCY, "operator")
        .await
        .expect("reset");
    assert!(matches!(
        accept(&pipeline, "9102").await,
        EmissionOutcome::Emitted(_)
    ));

    pipeline.shutdown().expect("shutdown");
}

#[tokio::test]
async fn task_timeout_leaves_record_pending_and_releases_key() {
    let dir = tempdir().expect("tempdir");
    let emitter = Arc::new(ScriptedEmitter::always_succeeding());
    // Test config allows 2s per task.
    emitter.set_emit_delay(Duration::from_millis(2_500));
    let store = Arc::new(MemoryResultStore::default());
    let pipeline = EmissionPipeline::new(
        FiscalConfig::for_test(dir.path()),
        emitter.clone(),
        store.clone(),
    )
    .expect("pipeline builds");

    let outcome = accept(&pipeline, "9201").await;
    assert!(matches!(outcome, EmissionOutcome::TimedOut));

    // Timeouts are not terminal: the record stays pending for
    // reconciliation and the dedup key is released for redelivery.
    let record = store.get("9201").await.expect("get").expect("record present");
    assert_eq!(record.status, EmissionStatus::Pending);

    let errors = pipeline.error_store().by_order("9201");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::Timeout);

    emitter.set_emit_delay(Duration::ZERO);
    assert!(matches!(
        pipeline.handle_event(event("9201")).await.expect("readmitted"),
        Admission::Accepted(_)
    ));

    pipeline.shutdown().expect("shutdown");
}

#[tokio::test]
async fn cached_lookup_shields_the_downstream() {
    let dir = tempdir().expect("tempdir");
    let emitter = Arc::new(ScriptedEmitter::always_succeeding());
    let store = Arc::new(MemoryResultStore::default());
    let pipeline =
        EmissionPipeline::new(FiscalConfig::for_test(dir.path()), emitter.clone(), store)
            .expect("pipeline builds");

    assert!(matches!(
        accept(&pipeline, "9301").await,
        EmissionOutcome::Emitted(_)
    ));

    // The emission already populated the cache under the access key, so
    // lookups are served locally without touching the downstream.
    let key = fiscal_core::types::LookupKey::AccessKey("key-9301".to_string());
    assert!(pipeline.lookup_document(&key).await.expect("lookup").is_some());
    assert_eq!(emitter.lookup_count(), 0);
    assert!(pipeline.lookup_document(&key).await.expect("lookup").is_some());
    assert_eq!(emitter.lookup_count(), 0);

    let status = pipeline.status().await.expect("status");
    assert!(status.cache.hits >= 2);

    // A key the emission never produced still goes downstream once.
    let other = fiscal_core::types::LookupKey::OrderRef("9301".to_string());
    assert!(pipeline.lookup_document(&other).await.expect("lookup").is_some());
    assert_eq!(emitter.lookup_count(), 1);

    pipeline.shutdown().expect("shutdown");
}
