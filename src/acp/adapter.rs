//! Process supervisor for one ACP agent.
//!
//! [`AcpProcessAdapter`] owns the agent process and everything wired to it:
//!
//! ```text
//!  request()/notify() ──► writer queue ──► run_writer ──► child stdin
//!         │
//!         └─► RequestRegistry ◄── Dispatcher ◄── run_reader ◄── child stdout
//!                                     │
//!                                     └──► AdapterEvent channel
//! ```
//!
//! Each spawn starts a new *generation* with its own registry, reader, writer,
//! stderr logger, and exit monitor. Request ids come from one counter owned by
//! the adapter, so they keep increasing across restarts and a late response
//! from an old generation can never complete a new request.
//!
//! # Lifecycle
//!
//! `Unstarted → Running → { Stopped | Crashed }`. The process is started
//! explicitly with [`start`](AcpProcessAdapter::start) or lazily by the first
//! request. When it exits, every pending request is rejected with
//! [`AppError::ProcessClosed`] and [`AdapterEvent::Closed`] is emitted; the
//! next request spawns a fresh process. Restart policy is up to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acp::dispatcher::Dispatcher;
use crate::acp::event::AdapterEvent;
use crate::acp::message::{to_payload, NotificationEnvelope, RequestEnvelope};
use crate::acp::reader::{run_reader, ReaderExit};
use crate::acp::registry::{RequestRegistry, ResponseHandle, SharedRegistry};
use crate::acp::spawner::{self, ExitReport};
use crate::acp::writer::{run_writer, OutboundFrame};
use crate::config::AdapterConfig;
use crate::{AppError, Result};

/// Capacity of the outbound frame queue in front of the writer task.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Rejection reason for requests pending when the process exits on its own.
const CLOSED_REASON: &str = "ACP process closed";

/// Rejection reason for requests pending when [`AcpProcessAdapter::stop`] runs.
const STOPPED_REASON: &str = "ACP process stopped";

/// Lifecycle state of the supervised process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProcessState {
    /// No process has been spawned yet.
    #[default]
    Unstarted,
    /// A process is running.
    Running {
        /// OS process id, if reported.
        pid: Option<u32>,
    },
    /// The process was stopped on request or exited with code 0.
    Stopped {
        /// Exit code, if any.
        exit_code: Option<i32>,
        /// Terminating signal, if any.
        signal: Option<String>,
    },
    /// The process failed to spawn, failed, or exited abnormally.
    Crashed {
        /// Exit code, if any.
        exit_code: Option<i32>,
        /// Terminating signal, if any.
        signal: Option<String>,
    },
}

/// Supervisor and JSON-RPC client for one agent process.
///
/// Cheap to clone; clones share the same process. Dropping the last clone
/// cancels the background tasks and kills the process.
#[derive(Debug, Clone)]
pub struct AcpProcessAdapter {
    inner: Arc<AdapterInner>,
}

#[derive(Debug)]
struct AdapterInner {
    config: AdapterConfig,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<AdapterEvent>,
    slot: Mutex<Slot>,
    shutdown: CancellationToken,
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: ProcessState,
    /// Number of the most recently spawned generation.
    generation: u64,
    running: Option<Generation>,
}

/// Handles to one running process generation.
#[derive(Debug)]
struct Generation {
    id: u64,
    pid: Option<u32>,
    registry: SharedRegistry,
    outbound: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

/// Everything the exit monitor of one generation owns.
struct MonitorTask {
    inner: Weak<AdapterInner>,
    generation: u64,
    child: Child,
    registry: SharedRegistry,
    events: mpsc::UnboundedSender<AdapterEvent>,
    cancel: CancellationToken,
    ready: oneshot::Receiver<()>,
    reader: JoinHandle<Result<ReaderExit>>,
    writer: JoinHandle<Result<()>>,
    stderr: JoinHandle<()>,
    drain: Duration,
    grace: Duration,
}

impl AcpProcessAdapter {
    /// Create an adapter for `config` and the receiver of its events.
    ///
    /// No process is spawned until [`start`](Self::start) or the first
    /// request. The event channel is unbounded: the reader never waits on
    /// the caller, so responses keep resolving and [`stop`](Self::stop)
    /// completes even while no one is draining events.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `config` fails validation.
    pub fn new(config: AdapterConfig) -> Result<(Self, mpsc::UnboundedReceiver<AdapterEvent>)> {
        config.validate()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = AdapterInner {
            config,
            next_id: AtomicU64::new(1),
            events,
            slot: Mutex::new(Slot::default()),
            shutdown: CancellationToken::new(),
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        ))
    }

    /// Configuration this adapter spawns processes with.
    #[must_use]
    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    /// Spawn the agent process. A no-op while a process is running.
    ///
    /// Outgoing frames are queued until the writer task owns the child's
    /// stdin, so requests may be issued as soon as this returns.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the process cannot be spawned; an
    /// [`AdapterEvent::Error`] is emitted as well.
    pub async fn start(&self) -> Result<()> {
        let launched = {
            let mut slot = self.inner.slot.lock().await;
            if let Some(running) = &slot.running {
                debug!(pid = ?running.pid, "ACP process already started");
                return Ok(());
            }
            match self.launch(&mut slot) {
                Ok(launched) => Ok(launched),
                Err(err) => {
                    slot.state = ProcessState::Crashed {
                        exit_code: None,
                        signal: None,
                    };
                    Err(err)
                }
            }
        };

        match launched {
            Ok((pid, ready)) => {
                info!(?pid, "ACP process running");
                emit(&self.inner.events, AdapterEvent::Spawned { pid });
                ready.send(()).ok();
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "ACP process error");
                emit(
                    &self.inner.events,
                    AdapterEvent::Error {
                        message: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }

    /// Stop the running process. A no-op when nothing is running.
    ///
    /// Every pending request is rejected with [`AppError::ProcessClosed`]
    /// before the process is terminated. Returns once the process has been
    /// reaped and [`AdapterEvent::Closed`] has been emitted.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the exit monitor task panicked.
    pub async fn stop(&self) -> Result<()> {
        let Some(generation) = self.inner.slot.lock().await.running.take() else {
            return Ok(());
        };

        info!(pid = ?generation.pid, "stopping ACP process");
        let rejected = generation.registry.lock().await.close(STOPPED_REASON);
        if rejected > 0 {
            debug!(rejected, "pending ACP requests rejected on stop");
        }
        generation.cancel.cancel();

        generation
            .monitor
            .await
            .map_err(|err| AppError::Io(format!("exit monitor failed: {err}")))
    }

    /// Send a request whose result must be a JSON object.
    ///
    /// # Errors
    ///
    /// See [`request_typed`](Self::request_typed).
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Map<String, Value>> {
        self.request_typed(method, params).await
    }

    /// Send a request and wait for its result, deserialised into `T`.
    ///
    /// Starts the process if needed. There is no timeout; wrap the call in
    /// [`tokio::time::timeout`] when a deadline is needed.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`]: the process could not be started.
    /// - [`AppError::Io`]: the request could not be written.
    /// - [`AppError::Protocol`]: the agent answered with an error.
    /// - [`AppError::Validation`]: the result does not deserialise into `T`.
    /// - [`AppError::ProcessClosed`]: the process went away first.
    pub async fn request_typed<T>(&self, method: &str, params: Option<Value>) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.send_request::<T>(method, params).await?.await
    }

    /// Write a request and return the handle its response resolves.
    ///
    /// Returns once the frame has been flushed to the agent's stdin, so
    /// several requests can be in flight at the same time.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`]: the process could not be started.
    /// - [`AppError::Io`]: the request could not be written; the pending
    ///   entry is removed.
    /// - [`AppError::ProcessClosed`]: the process exited before the write.
    pub async fn send_request<T>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<ResponseHandle<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (registry, outbound) = self.current_generation().await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = to_payload(&RequestEnvelope::new(id, method, params))?;
        let handle = registry.lock().await.register::<T>(id, method)?;

        debug!(id, method, "sending ACP request");
        if let Err(err) = write_frame(&outbound, payload).await {
            error!(id, method, error = %err, "failed to write ACP request");
            registry.lock().await.reject(id, err.clone());
            return Err(err);
        }

        Ok(handle)
    }

    /// Send a notification; no id, no reply.
    ///
    /// Starts the process if needed and resolves once the frame is written.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`]: the process could not be started.
    /// - [`AppError::Io`]: the notification could not be written.
    /// - [`AppError::ProcessClosed`]: the process exited before the write.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let (_, outbound) = self.current_generation().await?;
        let payload = to_payload(&NotificationEnvelope::new(method, params))?;

        debug!(method, "sending ACP notification");
        write_frame(&outbound, payload).await.inspect_err(|err| {
            error!(method, error = %err, "failed to write ACP notification");
        })
    }

    /// OS process id of the running process.
    pub async fn pid(&self) -> Option<u32> {
        self.inner
            .slot
            .lock()
            .await
            .running
            .as_ref()
            .and_then(|g| g.pid)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ProcessState {
        self.inner.slot.lock().await.state.clone()
    }

    /// Whether a process is running.
    pub async fn is_running(&self) -> bool {
        self.inner.slot.lock().await.running.is_some()
    }

    /// Number of requests awaiting a response from the running process.
    pub async fn pending_count(&self) -> usize {
        let registry = self
            .inner
            .slot
            .lock()
            .await
            .running
            .as_ref()
            .map(|g| Arc::clone(&g.registry));
        match registry {
            Some(registry) => registry.lock().await.len(),
            None => 0,
        }
    }

    // ── Private helpers ───────────────────────────────────────────────────────

    /// Registry and writer queue of the running generation, starting one if
    /// necessary.
    async fn current_generation(&self) -> Result<(SharedRegistry, mpsc::Sender<OutboundFrame>)> {
        if let Some(handles) = self.running_handles().await {
            return Ok(handles);
        }
        self.start().await?;
        self.running_handles()
            .await
            .ok_or_else(|| AppError::ProcessClosed("ACP process exited during startup".into()))
    }

    async fn running_handles(&self) -> Option<(SharedRegistry, mpsc::Sender<OutboundFrame>)> {
        self.inner
            .slot
            .lock()
            .await
            .running
            .as_ref()
            .map(|g| (Arc::clone(&g.registry), g.outbound.clone()))
    }

    /// Spawn a process and its tasks into `slot`.
    ///
    /// Returns the pid and the sender that releases the exit monitor once the
    /// `Spawned` event has been emitted, so `Closed` can never precede it.
    fn launch(&self, slot: &mut Slot) -> Result<(Option<u32>, oneshot::Sender<()>)> {
        let config = &self.inner.config;
        let conn = spawner::spawn_agent(config)?;

        slot.generation += 1;
        let generation = slot.generation;
        let pid = conn.pid;

        let cancel = self.inner.shutdown.child_token();
        let registry = RequestRegistry::shared();
        let (outbound, frame_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let dispatcher = Dispatcher::new(Arc::clone(&registry), self.inner.events.clone());
        let reader = tokio::spawn(run_reader(conn.stdout, dispatcher, cancel.clone()));
        let writer = tokio::spawn(run_writer(conn.stdin, frame_rx, cancel.clone()));
        let stderr = spawner::spawn_stderr_logger(conn.stderr, pid, cancel.clone());

        let monitor = tokio::spawn(
            MonitorTask {
                inner: Arc::downgrade(&self.inner),
                generation,
                child: conn.child,
                registry: Arc::clone(&registry),
                events: self.inner.events.clone(),
                cancel: cancel.clone(),
                ready: ready_rx,
                reader,
                writer,
                stderr,
                drain: config.stdout_drain(),
                grace: config.stop_grace(),
            }
            .run(),
        );

        slot.running = Some(Generation {
            id: generation,
            pid,
            registry,
            outbound,
            cancel,
            monitor,
        });
        slot.state = ProcessState::Running { pid };

        Ok((pid, ready_tx))
    }
}

impl MonitorTask {
    /// Wait for the process to exit (or be stopped), then tear the generation
    /// down: drain stdout, stop the tasks, reject what is still pending,
    /// record the final state, and emit the close event.
    async fn run(self) {
        let Self {
            inner,
            generation,
            mut child,
            registry,
            events,
            cancel,
            ready,
            reader,
            writer,
            stderr,
            drain,
            grace,
        } = self;

        ready.await.ok();

        let (exit, requested) = tokio::select! {
            status = child.wait() => (status.map(ExitReport::from_status).map_err(AppError::from), false),
            () = cancel.cancelled() => (spawner::terminate(&mut child, grace).await, true),
        };

        let mut reader = Some(reader);
        if !requested {
            // Let the reader consume what the process wrote before exiting.
            if let Some(handle) = reader.as_mut() {
                if let Ok(joined) = tokio::time::timeout(drain, handle).await {
                    log_reader_exit(generation, joined);
                    reader = None;
                } else {
                    debug!(generation, "stdout still open after exit, abandoning it");
                }
            }
        }

        cancel.cancel();
        if let Some(handle) = reader {
            log_reader_exit(generation, handle.await);
        }
        if let Err(err) = writer.await {
            warn!(generation, error = %err, "acp writer task panicked");
        }
        if let Err(err) = stderr.await {
            warn!(generation, error = %err, "acp stderr task panicked");
        }

        let reason = if requested { STOPPED_REASON } else { CLOSED_REASON };
        let (state, event, rejected) = match exit {
            Ok(report) => {
                warn!(
                    generation,
                    code = ?report.exit_code,
                    signal = ?report.signal,
                    "ACP process closed"
                );
                let rejected = registry.lock().await.close(reason);
                let state = if requested || report.is_success() {
                    ProcessState::Stopped {
                        exit_code: report.exit_code,
                        signal: report.signal.clone(),
                    }
                } else {
                    ProcessState::Crashed {
                        exit_code: report.exit_code,
                        signal: report.signal.clone(),
                    }
                };
                let event = AdapterEvent::Closed {
                    exit_code: report.exit_code,
                    signal: report.signal,
                };
                (state, event, rejected)
            }
            Err(err) => {
                error!(generation, error = %err, "ACP process error");
                let mut guard = registry.lock().await;
                let rejected = guard.reject_all(&err);
                guard.close(reason);
                let state = ProcessState::Crashed {
                    exit_code: None,
                    signal: None,
                };
                let event = AdapterEvent::Error {
                    message: err.to_string(),
                };
                (state, event, rejected)
            }
        };
        if rejected > 0 {
            debug!(generation, rejected, "pending ACP requests rejected on close");
        }

        if let Some(inner) = inner.upgrade() {
            let mut slot = inner.slot.lock().await;
            if slot.running.as_ref().is_some_and(|g| g.id == generation) {
                slot.running = None;
                slot.state = state;
            } else if slot.running.is_none() && slot.generation == generation {
                slot.state = state;
            }
        }

        emit(&events, event);
    }
}

fn log_reader_exit(
    generation: u64,
    joined: std::result::Result<Result<ReaderExit>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(exit)) => debug!(generation, ?exit, "acp reader finished"),
        Ok(Err(err)) => warn!(generation, error = %err, "acp reader failed"),
        Err(err) => warn!(generation, error = %err, "acp reader task panicked"),
    }
}

/// Queue `payload` for the writer and wait until it has been flushed.
async fn write_frame(outbound: &mpsc::Sender<OutboundFrame>, payload: Vec<u8>) -> Result<()> {
    let (frame, ack) = OutboundFrame::new(Bytes::from(payload));
    outbound
        .send(frame)
        .await
        .map_err(|_| AppError::ProcessClosed("ACP process stdin is not available".into()))?;
    ack.await
        .map_err(|_| AppError::ProcessClosed("ACP process stdin is not available".into()))?
}

/// Deliver `event`, tolerating a dropped receiver.
fn emit(events: &mpsc::UnboundedSender<AdapterEvent>, event: AdapterEvent) {
    if events.send(event).is_err() {
        debug!("acp adapter: event receiver dropped, event discarded");
    }
}
