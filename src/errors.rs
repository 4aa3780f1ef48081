//! Error types shared across the adapter.

use std::fmt::{Display, Formatter};

/// Shared adapter result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Adapter error enumeration covering every failure mode of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The agent process could not be spawned.
    Spawn(String),
    /// Reading from or writing to the agent's stdio failed.
    Io(String),
    /// Framing or serialisation failure on the ACP stream.
    Acp(String),
    /// The agent answered a request with an `error` member.
    Protocol {
        /// Error code reported by the agent, when present.
        code: Option<i64>,
        /// Error message reported by the agent.
        message: String,
    },
    /// The `result` of a response did not match the expected shape.
    Validation(String),
    /// The agent process exited, was stopped, or crashed while the request
    /// was in flight.
    ProcessClosed(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::Protocol {
                code: Some(code),
                message,
            } => write!(f, "protocol error {code}: {message}"),
            Self::Protocol {
                code: None,
                message,
            } => write!(f, "protocol error: {message}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::ProcessClosed(msg) => write!(f, "process closed: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
