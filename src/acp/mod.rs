//! Agent Client Protocol (ACP) stdio transport.
//!
//! This module manages a headless agent process and the JSON-RPC stream on
//! its stdin/stdout:
//!
//! - `codec`: `Content-Length` framing with an NDJSON fallback, built on
//!   [`tokio_util::codec`].
//! - `message`: outbound envelopes and classification of inbound payloads.
//! - `registry`: in-flight requests keyed by id, with typed result validation.
//! - `dispatcher`: routes inbound messages to the registry or the event channel.
//! - `reader` / `writer`: async tasks driving the agent's stdout and stdin.
//! - `spawner`: process spawning, stderr logging, and termination.
//! - `adapter`: the [`AcpProcessAdapter`](adapter::AcpProcessAdapter) supervisor
//!   tying it all together.
//! - `event`: lifecycle and notification events surfaced to the caller.

pub mod adapter;
pub mod codec;
pub mod dispatcher;
pub mod event;
pub mod message;
pub mod reader;
pub mod registry;
pub mod spawner;
pub mod writer;

pub use adapter::{AcpProcessAdapter, ProcessState};
pub use event::AdapterEvent;
pub use registry::ResponseHandle;
