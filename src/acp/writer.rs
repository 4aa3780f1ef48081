//! ACP writer task.
//!
//! Owns the agent's stdin. Callers never write directly: they enqueue an
//! [`OutboundFrame`] on the writer channel and await its acknowledgement.
//! Frames queued before the process is ready are held in the channel and
//! flushed in order once the task runs, so no post-spawn delay is needed.

use bytes::Bytes;
use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::AcpCodec;
use crate::{AppError, Result};

/// One outbound message body plus the channel its write result is reported on.
#[derive(Debug)]
pub struct OutboundFrame {
    /// JSON body; framed by the codec on write.
    pub payload: Bytes,
    /// Receives `Ok(())` once the frame is flushed, or the write error.
    pub ack: oneshot::Sender<Result<()>>,
}

impl OutboundFrame {
    /// Pair `payload` with a fresh acknowledgement channel.
    #[must_use]
    pub fn new(payload: Bytes) -> (Self, oneshot::Receiver<Result<()>>) {
        let (ack, rx) = oneshot::channel();
        (Self { payload, ack }, rx)
    }
}

/// ACP writer task: frames queued payloads and writes them to `stdin`.
///
/// Each frame is written and flushed before its acknowledgement is sent. A
/// failed write is reported to that frame's sender only; the task keeps
/// serving the queue so later callers receive their own errors.
///
/// The task exits cleanly when `cancel` fires or every sender is dropped.
///
/// # Errors
///
/// Never fails; write errors are delivered per frame.
pub async fn run_writer<W>(
    stdin: W,
    mut frame_rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = FramedWrite::new(stdin, AcpCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("acp writer: cancellation received, stopping");
                break;
            }

            frame = frame_rx.recv() => {
                let Some(OutboundFrame { payload, ack }) = frame else {
                    debug!("acp writer: frame channel closed, stopping");
                    break;
                };

                let bytes = payload.len();
                let result = framed.send(payload).await.map_err(|e| {
                    warn!(error = %e, "failed to write ACP frame to stdin");
                    AppError::Io(format!("write failed: {e}"))
                });
                if result.is_ok() {
                    debug!(bytes, "acp writer: frame flushed");
                }
                if ack.send(result).is_err() {
                    debug!("acp writer: caller dropped before write acknowledgement");
                }
            }
        }
    }

    // Fail whatever is still queued so no caller waits on a dead writer.
    frame_rx.close();
    while let Ok(OutboundFrame { ack, .. }) = frame_rx.try_recv() {
        ack.send(Err(AppError::ProcessClosed("writer stopped".into())))
            .ok();
    }

    Ok(())
}
