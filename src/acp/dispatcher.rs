//! Routing of decoded inbound messages.
//!
//! The [`Dispatcher`] takes each frame body produced by the codec, parses and
//! classifies it, and routes it:
//!
//! | Message                     | Route                                           |
//! |-----------------------------|-------------------------------------------------|
//! | response, known id, `error` | pending request rejected ([`AppError::Protocol`]) |
//! | response, known id          | pending request resolved (after validation)     |
//! | response, unknown id        | logged at `WARN`, ignored                       |
//! | notification                | [`AdapterEvent::Notification`] on the channel   |
//! | unhandled shape             | logged at `WARN`, ignored                       |
//! | malformed JSON              | logged at `WARN`, frame dropped                 |
//!
//! Once the registry of the current process generation has been closed,
//! nothing more is dispatched.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::acp::event::AdapterEvent;
use crate::acp::message::{request_id, InboundMessage};
use crate::acp::registry::SharedRegistry;
use crate::AppError;

/// What happened to one dispatched frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A pending request was completed (resolved, or rejected by validation).
    Completed(u64),
    /// A pending request was rejected by an error response.
    Rejected(u64),
    /// A response whose id matched no pending request.
    UnknownId,
    /// A notification was forwarded to the event channel.
    Notified,
    /// Valid JSON of an unrecognised shape.
    Unhandled,
    /// The frame body was not valid JSON.
    Malformed,
    /// The process generation is closed; the message was discarded.
    Discarded,
}

/// Routes classified messages to the request registry or the event channel.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: SharedRegistry,
    events: mpsc::UnboundedSender<AdapterEvent>,
}

impl Dispatcher {
    /// Create a dispatcher over one generation's registry.
    #[must_use]
    pub fn new(registry: SharedRegistry, events: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        Self { registry, events }
    }

    /// Registry this dispatcher completes requests in.
    #[must_use]
    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Event channel notifications are forwarded to. Sends never wait, so a
    /// caller that is slow to drain events cannot stall response routing.
    #[must_use]
    pub fn events(&self) -> &mpsc::UnboundedSender<AdapterEvent> {
        &self.events
    }

    /// Parse, classify, and route one frame body.
    pub async fn dispatch_frame(&self, payload: &[u8]) -> DispatchOutcome {
        match InboundMessage::parse(payload) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "failed to parse ACP message, dropping frame"
                );
                DispatchOutcome::Malformed
            }
        }
    }

    /// Route one classified message.
    pub async fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        match message {
            InboundMessage::Response { id, outcome } => {
                let mut registry = self.registry.lock().await;
                if registry.is_closed() {
                    debug!(%id, "acp dispatcher: response after close, discarding");
                    return DispatchOutcome::Discarded;
                }

                let Some(key) = request_id(&id).filter(|key| registry.contains(*key)) else {
                    warn!(%id, "received response for unknown request");
                    return DispatchOutcome::UnknownId;
                };

                match outcome {
                    Ok(result) => {
                        debug!(id = key, "acp dispatcher: resolving request");
                        registry.resolve(key, result);
                        DispatchOutcome::Completed(key)
                    }
                    Err(rpc_error) => {
                        warn!(
                            id = key,
                            code = ?rpc_error.code,
                            error = rpc_error.message.as_str(),
                            "ACP request error"
                        );
                        registry.reject(key, AppError::from(rpc_error));
                        DispatchOutcome::Rejected(key)
                    }
                }
            }

            InboundMessage::Notification { method, params } => {
                if self.registry.lock().await.is_closed() {
                    debug!(method = method.as_str(), "acp dispatcher: notification after close, discarding");
                    return DispatchOutcome::Discarded;
                }

                debug!(method = method.as_str(), "received ACP notification");
                let event = AdapterEvent::Notification { method, params };
                if self.events.send(event).is_err() {
                    debug!("acp dispatcher: event receiver dropped, notification discarded");
                }
                DispatchOutcome::Notified
            }

            InboundMessage::Unhandled(value) => {
                warn!(message = %truncate_for_log(&value), "received unhandled ACP message");
                DispatchOutcome::Unhandled
            }
        }
    }
}

/// Render `value` for a log line, capped so a huge payload cannot flood the log.
fn truncate_for_log(value: &Value) -> String {
    const MAX_LOG_CHARS: usize = 512;
    let rendered = value.to_string();
    match rendered.char_indices().nth(MAX_LOG_CHARS) {
        Some((cut, _)) => format!("{}…", &rendered[..cut]),
        None => rendered,
    }
}
