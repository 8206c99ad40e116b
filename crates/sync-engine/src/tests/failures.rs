//! Transport failures, backoff and permanent errors.

use super::harness::{assert_resolved, settle, TestHarness};
use crate::OperationOutcome;
use serde_json::json;
use sync_core::{HttpMethod, OperationDescriptor, OperationKind};

fn post(endpoint: &str) -> OperationDescriptor {
    OperationDescriptor::request(OperationKind::Create, HttpMethod::Post, endpoint)
        .with_payload(json!({"text": "hi"}))
}

fn failed_with(outcome: &OperationOutcome, needle: &str) -> bool {
    match outcome {
        OperationOutcome::Failed { error, permanent } => *permanent && error.contains(needle),
        _ => false,
    }
}

#[tokio::test]
async fn exhausted_gateway_retries_back_off_then_succeed() {
    let harness = TestHarness::new();
    // One full round of gateway attempts, then success on the backoff retry.
    harness.http.script("/api/messages", &[503, 502, 504, 200]);
    let engine = harness.start_ready("tab-1").await;

    let handle = engine.submit(post("/messages")).await.unwrap();
    assert_resolved(&settle(handle).await);
    assert_eq!(harness.http.count("/api/messages"), 4);
    engine.shutdown().await;
}

#[tokio::test]
async fn unreachable_service_is_retried() {
    let harness = TestHarness::new();
    harness.http.script("/api/messages", &[0, 0, 200]);
    let engine = harness.start_ready("tab-1").await;

    let handle = engine.submit(post("/messages")).await.unwrap();
    assert_resolved(&settle(handle).await);
    assert_eq!(harness.http.count("/api/messages"), 3);
    engine.shutdown().await;
}

#[tokio::test]
async fn retry_bound_fails_operation_and_dependents() {
    let harness = TestHarness::new();
    harness.http.fail_always("/api/conversations", 503);
    let engine = harness.start_ready("tab-1").await;

    let conversation = engine.submit(post("/conversations")).await.unwrap();
    let conversation_id = conversation.id().clone();
    let message = engine
        .submit(post("/messages").depends_on(conversation_id.clone()))
        .await
        .unwrap();

    let outcome = settle(conversation).await;
    assert!(
        failed_with(&outcome, "retry bound exceeded after 4 attempts"),
        "got {outcome:?}"
    );
    let outcome = settle(message).await;
    assert!(
        failed_with(&outcome, &format!("dependency failed: {conversation_id}")),
        "got {outcome:?}"
    );

    // Initial dispatch plus three retries, each with three gateway attempts.
    assert_eq!(harness.http.count("/api/conversations"), 12);
    assert_eq!(harness.http.count("/api/messages"), 0);
    assert_eq!(engine.status().queue.total, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn not_found_aborts_without_retry_and_purges_dependents() {
    let harness = TestHarness::new();
    harness.http.script("/api/conversations/c9", &[404]);
    let engine = harness.start_ready("tab-1").await;

    let rename = engine
        .submit(
            OperationDescriptor::request(
                OperationKind::Update,
                HttpMethod::Patch,
                "/conversations/c9",
            )
            .with_payload(json!({"title": "renamed"})),
        )
        .await
        .unwrap();
    let message = engine
        .submit(post("/messages").depends_on(rename.id().clone()))
        .await
        .unwrap();
    let unrelated = engine.submit(post("/contacts")).await.unwrap();

    let outcome = settle(rename).await;
    assert!(failed_with(&outcome, "not found (404)"), "got {outcome:?}");
    let outcome = settle(message).await;
    assert!(failed_with(&outcome, "dependency failed"), "got {outcome:?}");
    assert_resolved(&settle(unrelated).await);

    assert_eq!(harness.http.count("/api/conversations/c9"), 1);
    assert_eq!(harness.http.count("/api/messages"), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn server_error_is_permanent() {
    let harness = TestHarness::new();
    harness.http.script("/api/messages", &[500]);
    let engine = harness.start_ready("tab-1").await;

    let outcome = settle(engine.submit(post("/messages")).await.unwrap()).await;
    assert!(failed_with(&outcome, "server error (500)"), "got {outcome:?}");
    assert_eq!(harness.http.count("/api/messages"), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn validation_error_is_permanent() {
    let harness = TestHarness::new();
    harness.http.script("/api/messages", &[422]);
    let engine = harness.start_ready("tab-1").await;

    let outcome = settle(engine.submit(post("/messages")).await.unwrap()).await;
    assert!(failed_with(&outcome, "validation failed (422)"), "got {outcome:?}");
    engine.shutdown().await;
}
