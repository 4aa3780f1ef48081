#![forbid(unsafe_code)]

//! Stdio transport adapter for JSON-RPC agent processes.
//!
//! Spawns an agent, frames requests onto its stdin, decodes its stdout
//! (`Content-Length` frames or newline-delimited JSON), correlates responses
//! with requests by id, and forwards agent notifications.

pub mod acp;
pub mod config;
pub mod errors;

pub use acp::{AcpProcessAdapter, AdapterEvent, ProcessState, ResponseHandle};
pub use config::AdapterConfig;
pub use errors::{AppError, Result};
