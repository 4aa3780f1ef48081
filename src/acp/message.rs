//! ACP wire messages.
//!
//! Outbound envelopes are plain `serde` structs. Inbound payloads are parsed
//! into a [`serde_json::Value`] and classified exactly once, immediately after
//! parsing, into an [`InboundMessage`]; everything downstream matches on that
//! enum instead of probing optional fields.
//!
//! | Shape                                   | Classified as                    |
//! |-----------------------------------------|----------------------------------|
//! | object with an `id` member (any value)  | [`InboundMessage::Response`]     |
//! | object with a string `method`, no `id`  | [`InboundMessage::Notification`] |
//! | anything else                           | [`InboundMessage::Unhandled`]    |

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Protocol version stamped on every outbound envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error text used when an error response carries no `message`.
const UNKNOWN_ERROR_MESSAGE: &str = "unknown ACP error";

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Outbound request envelope (adapter → agent).
#[derive(Debug, Serialize)]
pub struct RequestEnvelope<'a> {
    /// Always [`JSONRPC_VERSION`].
    pub jsonrpc: &'static str,
    /// Correlation id allocated by the adapter.
    pub id: u64,
    /// Method name; opaque to the adapter.
    pub method: &'a str,
    /// Method parameters; `{}` when the caller supplied none.
    pub params: Value,
}

impl<'a> RequestEnvelope<'a> {
    /// Build a request envelope, defaulting absent params to `{}`.
    #[must_use]
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params: params.unwrap_or_else(empty_object),
        }
    }
}

/// Outbound notification envelope (adapter → agent). No id, no reply.
#[derive(Debug, Serialize)]
pub struct NotificationEnvelope<'a> {
    /// Always [`JSONRPC_VERSION`].
    pub jsonrpc: &'static str,
    /// Method name; opaque to the adapter.
    pub method: &'a str,
    /// Method parameters; `{}` when the caller supplied none.
    pub params: Value,
}

impl<'a> NotificationEnvelope<'a> {
    /// Build a notification envelope, defaulting absent params to `{}`.
    #[must_use]
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params: params.unwrap_or_else(empty_object),
        }
    }
}

/// Serialise an outbound envelope to a compact JSON body.
///
/// # Errors
///
/// Returns [`AppError::Acp`] if serialisation fails.
pub fn to_payload<T: Serialize>(envelope: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope)
        .map_err(|e| AppError::Acp(format!("failed to serialise outbound message: {e}")))
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Error member of an inbound error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    /// Numeric error code, when the agent supplied one.
    pub code: Option<i64>,
    /// Human-readable error text.
    pub message: String,
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Protocol {
            code: err.code,
            message: err.message,
        }
    }
}

/// A decoded, classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Reply to a request issued by the adapter.
    Response {
        /// Raw `id` member as sent by the agent.
        id: Value,
        /// `Ok(result)` for success responses, `Err` for error responses.
        /// A missing or `null` result is normalised to `{}`.
        outcome: std::result::Result<Value, RpcError>,
    },
    /// Agent-initiated message that expects no reply.
    Notification {
        /// Method name.
        method: String,
        /// Parameters, if any were sent.
        params: Option<Value>,
    },
    /// Valid JSON that is neither a response nor a notification.
    Unhandled(Value),
}

impl InboundMessage {
    /// Classify a parsed JSON payload.
    #[must_use]
    pub fn classify(value: Value) -> Self {
        let Value::Object(mut obj) = value else {
            return Self::Unhandled(value);
        };

        if let Some(id) = obj.remove("id") {
            let outcome = match obj.remove("error") {
                Some(error) if !error.is_null() => Err(parse_rpc_error(&error)),
                _ => Ok(match obj.remove("result") {
                    None | Some(Value::Null) => empty_object(),
                    Some(result) => result,
                }),
            };
            return Self::Response { id, outcome };
        }

        match obj.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => Self::Notification {
                method,
                params: obj.remove("params"),
            },
            Some(method) => {
                obj.insert("method".to_owned(), method);
                Self::Unhandled(Value::Object(obj))
            }
            None => Self::Unhandled(Value::Object(obj)),
        }
    }

    /// Parse and classify a raw frame body.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Acp`]`("malformed json: …")` when `payload` is not
    /// valid JSON.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| AppError::Acp(format!("malformed json: {e}")))?;
        Ok(Self::classify(value))
    }
}

/// Interpret a response `id` as a request id.
///
/// Accepts non-negative integers and strings of decimal digits; any other
/// value cannot correspond to a request issued by the adapter.
#[must_use]
pub fn request_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn parse_rpc_error(error: &Value) -> RpcError {
    let message = match error {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_ERROR_MESSAGE)
            .to_owned(),
    };
    RpcError {
        code: error.get("code").and_then(Value::as_i64),
        message,
    }
}
