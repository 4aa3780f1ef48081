//! Unit tests for the reader and writer tasks over in-memory pipes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use acp_adapter::acp::codec::encode_frame;
use acp_adapter::acp::dispatcher::Dispatcher;
use acp_adapter::acp::reader::{run_reader, ReaderExit};
use acp_adapter::acp::registry::RequestRegistry;
use acp_adapter::acp::writer::{run_writer, OutboundFrame};
use acp_adapter::{AdapterEvent, AppError};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Writer whose every write fails, standing in for a closed stdin pipe.
struct BrokenPipe;

impl AsyncWrite for BrokenPipe {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reader_resolves_framed_response() {
    let registry = RequestRegistry::shared();
    let (events, _events_rx) = mpsc::unbounded_channel();
    let (mut agent, adapter_side) = duplex(1024);
    let handle = registry
        .lock()
        .await
        .register::<Value>(1, "ping")
        .expect("register");

    let task = tokio::spawn(run_reader(
        adapter_side,
        Dispatcher::new(registry.clone(), events),
        CancellationToken::new(),
    ));

    agent
        .write_all(b"Content-Length: 31\r\n\r\n{\"id\":1,\"result\":{\"pong\":true}}")
        .await
        .expect("write frame");

    let result = tokio::time::timeout(TIMEOUT, handle)
        .await
        .expect("response in time")
        .expect("resolved");
    assert_eq!(result, json!({ "pong": true }));

    drop(agent);
    let exit = tokio::time::timeout(TIMEOUT, task)
        .await
        .expect("reader ends")
        .expect("no panic")
        .expect("reader never fails");
    assert_eq!(exit, ReaderExit::Eof);
}

#[tokio::test]
async fn reader_forwards_ndjson_notification() {
    let (events, mut events_rx) = mpsc::unbounded_channel();
    let (mut agent, adapter_side) = duplex(1024);

    tokio::spawn(run_reader(
        adapter_side,
        Dispatcher::new(RequestRegistry::shared(), events),
        CancellationToken::new(),
    ));

    agent
        .write_all(b"{\"method\":\"status\",\"params\":{\"state\":\"busy\"}}\n")
        .await
        .expect("write line");

    let event = tokio::time::timeout(TIMEOUT, events_rx.recv())
        .await
        .expect("event in time")
        .expect("channel open");
    assert_eq!(
        event,
        AdapterEvent::Notification {
            method: "status".into(),
            params: Some(json!({ "state": "busy" })),
        }
    );
}

#[tokio::test]
async fn reader_resolves_response_behind_unread_notifications() {
    let registry = RequestRegistry::shared();
    let (events, _unread) = mpsc::unbounded_channel();
    let (mut agent, adapter_side) = duplex(64 * 1024);
    let handle = registry
        .lock()
        .await
        .register::<Value>(1, "session/prompt")
        .expect("register");

    tokio::spawn(run_reader(
        adapter_side,
        Dispatcher::new(registry.clone(), events),
        CancellationToken::new(),
    ));

    tokio::spawn(async move {
        for _ in 0..1000 {
            agent
                .write_all(b"{\"method\":\"session/update\",\"params\":{}}\n")
                .await
                .expect("write notification");
        }
        agent
            .write_all(b"{\"id\":1,\"result\":{\"done\":true}}\n")
            .await
            .expect("write response");
        agent
    });

    let result = tokio::time::timeout(TIMEOUT, handle)
        .await
        .expect("response in time")
        .expect("resolved");
    assert_eq!(result, json!({ "done": true }));
}

#[tokio::test]
async fn reader_survives_garbage_between_frames() {
    let registry = RequestRegistry::shared();
    let (events, _events_rx) = mpsc::unbounded_channel();
    let (mut agent, adapter_side) = duplex(4096);
    let handle = registry
        .lock()
        .await
        .register::<Value>(2, "ping")
        .expect("register");

    tokio::spawn(run_reader(
        adapter_side,
        Dispatcher::new(registry.clone(), events),
        CancellationToken::new(),
    ));

    agent.write_all(b"agent booting\n").await.expect("write");
    agent.write_all(b"{broken json}\n").await.expect("write");
    agent
        .write_all(b"Content-Length: nope\r\n\r\n")
        .await
        .expect("write");
    agent
        .write_all(&encode_frame(br#"{"id":2,"result":{"alive":true}}"#))
        .await
        .expect("write");

    let result = tokio::time::timeout(TIMEOUT, handle)
        .await
        .expect("response in time")
        .expect("resolved");
    assert_eq!(result, json!({ "alive": true }));
}

#[tokio::test]
async fn reader_stops_on_cancel() {
    let (events, _events_rx) = mpsc::unbounded_channel();
    let (_agent, adapter_side) = duplex(64);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run_reader(
        adapter_side,
        Dispatcher::new(RequestRegistry::shared(), events),
        cancel.clone(),
    ));
    cancel.cancel();

    let exit = tokio::time::timeout(TIMEOUT, task)
        .await
        .expect("reader ends")
        .expect("no panic")
        .expect("reader never fails");
    assert_eq!(exit, ReaderExit::Cancelled);
}

// ── Writer ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn writer_frames_queued_payloads_in_order() {
    let (frames_tx, frames_rx) = mpsc::channel(8);
    let (adapter_side, mut agent) = duplex(1024);
    let cancel = CancellationToken::new();

    // Queue before the writer runs: nothing may be lost.
    let (first, first_ack) = OutboundFrame::new(Bytes::from_static(b"{\"id\":1}"));
    let (second, second_ack) = OutboundFrame::new(Bytes::from_static(b"{\"id\":2}"));
    frames_tx.send(first).await.expect("queue first");
    frames_tx.send(second).await.expect("queue second");

    let task = tokio::spawn(run_writer(adapter_side, frames_rx, cancel.clone()));

    first_ack.await.expect("ack").expect("first written");
    second_ack.await.expect("ack").expect("second written");

    drop(frames_tx);
    task.await.expect("no panic").expect("writer never fails");

    let mut wire = Vec::new();
    agent.read_to_end(&mut wire).await.expect("read wire");
    assert_eq!(
        wire,
        b"Content-Length: 8\r\n\r\n{\"id\":1}Content-Length: 8\r\n\r\n{\"id\":2}".to_vec()
    );
}

#[tokio::test]
async fn writer_reports_write_failure_per_frame() {
    let (frames_tx, frames_rx) = mpsc::channel(8);
    tokio::spawn(run_writer(BrokenPipe, frames_rx, CancellationToken::new()));

    let (frame, ack) = OutboundFrame::new(Bytes::from_static(b"{}"));
    frames_tx.send(frame).await.expect("queue");

    let err = tokio::time::timeout(TIMEOUT, ack)
        .await
        .expect("ack in time")
        .expect("ack delivered")
        .expect_err("write must fail");
    let AppError::Io(message) = err else {
        panic!("expected AppError::Io, got {err:?}");
    };
    assert!(message.starts_with("write failed"), "got: {message}");

    // The writer keeps serving; the next caller gets its own error.
    let (frame, ack) = OutboundFrame::new(Bytes::from_static(b"{}"));
    frames_tx.send(frame).await.expect("queue");
    assert!(matches!(ack.await.expect("ack"), Err(AppError::Io(_))));
}

#[tokio::test]
async fn writer_stops_on_cancel() {
    let (_frames_tx, frames_rx) = mpsc::channel::<OutboundFrame>(8);
    let (adapter_side, _agent) = duplex(64);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run_writer(adapter_side, frames_rx, cancel.clone()));
    cancel.cancel();

    tokio::time::timeout(TIMEOUT, task)
        .await
        .expect("writer ends")
        .expect("no panic")
        .expect("writer never fails");
}
