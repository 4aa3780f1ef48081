//! In-flight request bookkeeping.
//!
//! The [`RequestRegistry`] maps request ids to the completion side of a
//! [`oneshot`] channel. Each entry is removed exactly once: by a matching
//! response, by an explicit rejection (write failure, protocol error), or en
//! masse when the process generation it belongs to stops or crashes.
//!
//! Result validation is typed: the caller picks the result type `T` when the
//! request is registered, and the registry deserialises the `result` member
//! into `T` before completing the caller's [`ResponseHandle`]. A shape
//! mismatch rejects only that request with [`AppError::Validation`].
//!
//! Responses may arrive in any order; lookups go through a `HashMap`, not a
//! queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error};

use crate::{AppError, Result};

/// Registry shared between request callers and the reader task of one process
/// generation.
pub type SharedRegistry = Arc<Mutex<RequestRegistry>>;

/// Type-erased completion: validates the outcome into the caller's result
/// type and delivers it.
type Completion = Box<dyn FnOnce(Result<Value>) + Send>;

/// A request awaiting its response.
struct PendingRequest {
    method: String,
    complete: Completion,
}

/// Table of in-flight requests keyed by numeric id.
#[derive(Default)]
pub struct RequestRegistry {
    pending: HashMap<u64, PendingRequest>,
    /// Set once the owning process generation is gone; new registrations are
    /// refused with this reason.
    closed: Option<String>,
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.pending.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("RequestRegistry")
            .field("pending", &ids)
            .field("closed", &self.closed)
            .finish()
    }
}

impl RequestRegistry {
    /// Create an empty, open registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry wrapped for sharing with a reader task.
    #[must_use]
    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Register a pending request and return the handle its caller awaits.
    ///
    /// The response's `result` will be deserialised into `T`.
    ///
    /// # Errors
    ///
    /// - [`AppError::ProcessClosed`] if the registry has been closed.
    /// - [`AppError::Acp`] if `id` is already pending.
    pub fn register<T>(&mut self, id: u64, method: &str) -> Result<ResponseHandle<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if let Some(reason) = &self.closed {
            return Err(AppError::ProcessClosed(reason.clone()));
        }
        if self.pending.contains_key(&id) {
            return Err(AppError::Acp(format!("request id {id} is already pending")));
        }

        let (tx, rx) = oneshot::channel();
        let owned_method = method.to_owned();
        let complete: Completion = Box::new(move |outcome: Result<Value>| {
            let typed = outcome.and_then(|value| {
                serde_json::from_value::<T>(value).map_err(|e| {
                    error!(id, method = owned_method.as_str(), error = %e, "failed to validate ACP response");
                    AppError::Validation(format!("response to {owned_method} (id {id}): {e}"))
                })
            });
            if tx.send(typed).is_err() {
                debug!(id, "acp registry: caller dropped response handle before completion");
            }
        });

        self.pending.insert(
            id,
            PendingRequest {
                method: method.to_owned(),
                complete,
            },
        );

        Ok(ResponseHandle { id, rx })
    }

    /// Complete request `id` with a successful `result`.
    ///
    /// Returns `false` when no such request is pending.
    pub fn resolve(&mut self, id: u64, result: Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Complete request `id` with `err`.
    ///
    /// Returns `false` when no such request is pending.
    pub fn reject(&mut self, id: u64, err: AppError) -> bool {
        self.complete(id, Err(err))
    }

    /// Reject every pending request with a clone of `err`.
    ///
    /// Returns the number of requests rejected.
    pub fn reject_all(&mut self, err: &AppError) -> usize {
        let drained: Vec<_> = self.pending.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            debug!(id, method = entry.method.as_str(), error = %err, "acp registry: rejecting pending request");
            (entry.complete)(Err(err.clone()));
        }
        count
    }

    /// Reject everything pending with [`AppError::ProcessClosed`] and refuse
    /// further registrations.
    ///
    /// Returns the number of requests rejected.
    pub fn close(&mut self, reason: &str) -> usize {
        self.closed = Some(reason.to_owned());
        self.reject_all(&AppError::ProcessClosed(reason.to_owned()))
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Whether request `id` is still pending.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no requests are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn complete(&mut self, id: u64, outcome: Result<Value>) -> bool {
        match self.pending.remove(&id) {
            Some(entry) => {
                (entry.complete)(outcome);
                true
            }
            None => false,
        }
    }
}

/// Future resolving to the validated result of one request.
///
/// Dropping the handle abandons the result; the registry entry is still
/// cleared when the response (or the process close) arrives.
#[derive(Debug)]
#[must_use = "a response handle does nothing unless awaited"]
pub struct ResponseHandle<T> {
    id: u64,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> ResponseHandle<T> {
    /// Id of the request this handle belongs to.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Future for ResponseHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(AppError::ProcessClosed(
                    "request abandoned before completion".into(),
                ))
            })
        })
    }
}
