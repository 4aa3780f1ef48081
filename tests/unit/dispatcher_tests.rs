//! Unit tests for inbound message routing.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use acp_adapter::acp::dispatcher::{DispatchOutcome, Dispatcher};
use acp_adapter::acp::registry::{RequestRegistry, SharedRegistry};
use acp_adapter::{AdapterEvent, AppError};

fn dispatcher() -> (Dispatcher, SharedRegistry, mpsc::UnboundedReceiver<AdapterEvent>) {
    let registry = RequestRegistry::shared();
    let (tx, rx) = mpsc::unbounded_channel();
    (Dispatcher::new(Arc::clone(&registry), tx), registry, rx)
}

#[tokio::test]
async fn response_resolves_matching_request() {
    let (dispatcher, registry, _events) = dispatcher();
    let handle = registry
        .lock()
        .await
        .register::<Value>(1, "ping")
        .expect("register");

    let outcome = dispatcher
        .dispatch_frame(br#"{"jsonrpc":"2.0","id":1,"result":{"pong":true}}"#)
        .await;

    assert_eq!(outcome, DispatchOutcome::Completed(1));
    assert_eq!(handle.await.expect("resolved"), json!({ "pong": true }));
}

#[tokio::test]
async fn string_id_matches_numeric_request() {
    let (dispatcher, registry, _events) = dispatcher();
    let handle = registry
        .lock()
        .await
        .register::<Value>(12, "ping")
        .expect("register");

    let outcome = dispatcher.dispatch_frame(br#"{"id":"12","result":{}}"#).await;

    assert_eq!(outcome, DispatchOutcome::Completed(12));
    assert_eq!(handle.await.expect("resolved"), json!({}));
}

/// An error response rejects only its own request; a concurrent request is
/// still resolved by its own response.
#[tokio::test]
async fn error_response_rejects_only_its_request() {
    let (dispatcher, registry, _events) = dispatcher();
    let (failing, healthy) = {
        let mut guard = registry.lock().await;
        (
            guard.register::<Value>(7, "explode").expect("register 7"),
            guard.register::<Value>(8, "ping").expect("register 8"),
        )
    };

    let rejected = dispatcher
        .dispatch_frame(br#"{"id":7,"error":{"code":-32000,"message":"boom"}}"#)
        .await;
    let resolved = dispatcher.dispatch_frame(br#"{"id":8,"result":{"ok":1}}"#).await;

    assert_eq!(rejected, DispatchOutcome::Rejected(7));
    assert_eq!(resolved, DispatchOutcome::Completed(8));

    let err = failing.await.expect_err("rejected");
    assert_eq!(
        err,
        AppError::Protocol {
            code: Some(-32000),
            message: "boom".into(),
        }
    );
    assert!(err.to_string().contains("boom"));
    assert_eq!(healthy.await.expect("resolved"), json!({ "ok": 1 }));
}

#[tokio::test]
async fn response_for_unknown_id_is_ignored() {
    let (dispatcher, registry, _events) = dispatcher();
    let handle = registry
        .lock()
        .await
        .register::<Value>(1, "ping")
        .expect("register");

    let outcome = dispatcher.dispatch_frame(br#"{"id":99,"result":{}}"#).await;

    assert_eq!(outcome, DispatchOutcome::UnknownId);
    assert!(registry.lock().await.contains(1), "other requests untouched");
    drop(handle);
}

#[tokio::test]
async fn duplicate_response_is_ignored() {
    let (dispatcher, registry, _events) = dispatcher();
    let handle = registry
        .lock()
        .await
        .register::<Value>(3, "once")
        .expect("register");

    let first = dispatcher.dispatch_frame(br#"{"id":3,"result":{"n":1}}"#).await;
    let second = dispatcher.dispatch_frame(br#"{"id":3,"result":{"n":2}}"#).await;

    assert_eq!(first, DispatchOutcome::Completed(3));
    assert_eq!(second, DispatchOutcome::UnknownId);
    assert_eq!(handle.await.expect("resolved"), json!({ "n": 1 }));
}

#[tokio::test]
async fn notification_is_forwarded_as_event() {
    let (dispatcher, _registry, mut events) = dispatcher();

    let outcome = dispatcher
        .dispatch_frame(br#"{"jsonrpc":"2.0","method":"status","params":{"state":"busy"}}"#)
        .await;

    assert_eq!(outcome, DispatchOutcome::Notified);
    assert_eq!(
        events.try_recv().expect("event emitted"),
        AdapterEvent::Notification {
            method: "status".into(),
            params: Some(json!({ "state": "busy" })),
        }
    );
}

#[tokio::test]
async fn malformed_and_unhandled_frames_are_dropped() {
    let (dispatcher, registry, mut events) = dispatcher();

    assert_eq!(
        dispatcher.dispatch_frame(b"not json").await,
        DispatchOutcome::Malformed
    );
    assert_eq!(
        dispatcher.dispatch_frame(br#"{"jsonrpc":"2.0"}"#).await,
        DispatchOutcome::Unhandled
    );
    assert_eq!(
        dispatcher.dispatch_frame(b"[1,2,3]").await,
        DispatchOutcome::Unhandled
    );

    assert!(events.try_recv().is_err(), "no events for dropped frames");
    assert!(registry.lock().await.is_empty());
}

#[tokio::test]
async fn messages_after_close_are_discarded() {
    let (dispatcher, registry, mut events) = dispatcher();
    let handle = registry
        .lock()
        .await
        .register::<Value>(1, "ping")
        .expect("register");
    registry.lock().await.close("ACP process closed");

    let response = dispatcher.dispatch_frame(br#"{"id":1,"result":{}}"#).await;
    let notification = dispatcher.dispatch_frame(br#"{"method":"late"}"#).await;

    assert_eq!(response, DispatchOutcome::Discarded);
    assert_eq!(notification, DispatchOutcome::Discarded);
    assert!(events.try_recv().is_err());
    assert_eq!(
        handle.await.expect_err("closed"),
        AppError::ProcessClosed("ACP process closed".into())
    );
}

#[tokio::test]
async fn dropped_event_receiver_does_not_fail_dispatch() {
    let (dispatcher, _registry, events) = dispatcher();
    drop(events);

    let outcome = dispatcher.dispatch_frame(br#"{"method":"status"}"#).await;
    assert_eq!(outcome, DispatchOutcome::Notified);
}
