//! ACP reader task.
//!
//! Reads frames from an agent's stdout with [`FramedRead`] over [`AcpCodec`]
//! and hands each frame body to the [`Dispatcher`]. This task is the only
//! path through which responses reach the request registry, so decode,
//! dispatch, and resolution happen in arrival order.
//!
//! Malformed frames are logged and skipped; they never end the task.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::AcpCodec;
use crate::acp::dispatcher::Dispatcher;
use crate::acp::event::AdapterEvent;
use crate::{AppError, Result};

/// Why the reader loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The agent closed its stdout.
    Eof,
    /// The cancellation token fired.
    Cancelled,
    /// Reading from stdout failed; pending requests were rejected.
    Failed(String),
}

/// ACP reader task: decodes frames from `stdout` and dispatches them.
///
/// # Cancellation
///
/// Checked before every frame: once `cancel` fires no further frame is
/// dispatched, even if bytes are already buffered.
///
/// # Errors
///
/// Never fails. An unrecoverable I/O error on `stdout` emits
/// [`AdapterEvent::Error`], rejects every pending request with
/// [`AppError::Io`], and returns [`ReaderExit::Failed`].
pub async fn run_reader<R>(
    stdout: R,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
) -> Result<ReaderExit>
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, AcpCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("acp reader: cancellation received, stopping");
                return Ok(ReaderExit::Cancelled);
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("acp reader: EOF detected");
                        return Ok(ReaderExit::Eof);
                    }

                    Some(Err(e)) => {
                        warn!(error = %e, "acp reader: IO error, stopping");
                        let message = format!("stdout read failed: {e}");
                        fail_pending(&dispatcher, &message).await;
                        return Ok(ReaderExit::Failed(message));
                    }

                    Some(Ok(frame)) => {
                        if cancel.is_cancelled() {
                            debug!("acp reader: frame arrived after cancellation, discarding");
                            return Ok(ReaderExit::Cancelled);
                        }
                        let outcome = dispatcher.dispatch_frame(&frame).await;
                        debug!(?outcome, bytes = frame.len(), "acp reader: frame dispatched");
                    }
                }
            }
        }
    }
}

/// Reject everything pending with an I/O error and surface it as an event.
async fn fail_pending(dispatcher: &Dispatcher, message: &str) {
    let rejected = dispatcher
        .registry()
        .lock()
        .await
        .reject_all(&AppError::Io(message.to_owned()));
    debug!(rejected, "acp reader: pending requests rejected after read failure");

    let event = AdapterEvent::Error {
        message: message.to_owned(),
    };
    if dispatcher.events().send(event).is_err() {
        debug!("acp reader: event receiver dropped before error could be delivered");
    }
}
