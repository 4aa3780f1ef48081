//! Lifecycle and notification events surfaced by the adapter.

use serde_json::Value;

/// Events emitted by an [`AcpProcessAdapter`](crate::acp::adapter::AcpProcessAdapter)
/// on its event channel.
///
/// Process-fatal conditions ([`Error`](Self::Error), [`Closed`](Self::Closed))
/// are always delivered here, whether or not a tracing subscriber is installed.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// The agent process was spawned.
    Spawned {
        /// OS process id, when the platform reports one.
        pid: Option<u32>,
    },
    /// The agent sent a notification.
    Notification {
        /// Method name, uninterpreted.
        method: String,
        /// Parameters, if any were sent.
        params: Option<Value>,
    },
    /// The process or its stdio failed. Every request pending at that moment
    /// has been rejected.
    Error {
        /// Human-readable failure description.
        message: String,
    },
    /// The agent process exited or was stopped. Every request pending at that
    /// moment has been rejected.
    Closed {
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Terminating signal name (e.g. `SIGTERM`), if killed by a signal.
        signal: Option<String>,
    },
}
