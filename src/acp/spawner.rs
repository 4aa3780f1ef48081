//! ACP agent process spawner.
//!
//! Spawns the configured agent command with:
//! - the caller's arguments and working directory;
//! - the inherited environment with the configured variables overlaid on top
//!   (additive, nothing is removed);
//! - piped stdin/stdout/stderr;
//! - `kill_on_drop(true)` so an abandoned child does not outlive its adapter.
//!
//! Also hosts the helpers the supervisor uses around a running child:
//! draining stderr into the log, terminating the process, and describing how
//! it exited.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AdapterConfig;
use crate::{AppError, Result};

/// Active stdio connection to a freshly spawned agent process.
#[derive(Debug)]
pub struct AcpConnection {
    /// Child process handle; kept alive so `kill_on_drop` works.
    pub child: Child,
    /// OS process id, if the platform reports one.
    pub pid: Option<u32>,
    /// Agent's stdin, where framed requests are written.
    pub stdin: ChildStdin,
    /// Agent's stdout, carrying protocol frames.
    pub stdout: ChildStdout,
    /// Agent's stderr; logged only, never parsed.
    pub stderr: ChildStderr,
}

/// How an agent process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal name, if the process was killed by a signal.
    pub signal: Option<String>,
}

impl ExitReport {
    /// Describe an [`ExitStatus`].
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            exit_code: status.code(),
            signal: signal_name(status),
        }
    }

    /// Whether the process exited with code 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Build the command for `config` without spawning it.
#[must_use]
pub fn build_command(config: &AdapterConfig) -> Command {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    // Overlay only; the inherited environment stays intact.
    cmd.envs(&config.env);

    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Spawn the agent process described by `config`.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// - [`AppError::Spawn`]`("failed to spawn …")`: OS spawn failure (missing
///   binary, bad working directory, permissions).
/// - [`AppError::Spawn`]`("failed to capture …")`: a stdio pipe is missing.
pub fn spawn_agent(config: &AdapterConfig) -> Result<AcpConnection> {
    info!(
        command = config.command.as_str(),
        args = ?config.args,
        cwd = ?config.cwd,
        "starting ACP process"
    );

    let mut child = build_command(config).spawn().map_err(|err| {
        AppError::Spawn(format!("failed to spawn {}: {err}", config.command))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;

    let pid = child.id();
    debug!(?pid, "ACP process spawned");

    Ok(AcpConnection {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

/// Spawn a task that logs every stderr line of the agent at `WARN`.
///
/// Ends at EOF, on a read error, or when `cancel` fires.
#[must_use]
pub fn spawn_stderr_logger(
    stderr: ChildStderr,
    pid: Option<u32>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => warn!(?pid, chunk = line.as_str(), "ACP process stderr output"),
                    Ok(None) => break,
                    Err(err) => {
                        debug!(?pid, %err, "acp stderr: read failed, stopping");
                        break;
                    }
                },
            }
        }
    })
}

/// Terminate `child` and reap it.
///
/// On Unix the process first receives `SIGTERM` and gets `grace` to exit
/// before it is killed outright. Elsewhere it is killed immediately.
///
/// # Errors
///
/// Returns [`AppError::Io`] if the process cannot be killed or reaped.
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<ExitReport> {
    if let Some(status) = child.try_wait()? {
        return Ok(ExitReport::from_status(status));
    }

    if let Some(report) = graceful_stop(child, grace).await? {
        return Ok(report);
    }

    child.kill().await?;
    let status = child.wait().await?;
    Ok(ExitReport::from_status(status))
}

// ── Private helpers ───────────────────────────────────────────────────────────

#[cfg(unix)]
async fn graceful_stop(child: &mut Child, grace: Duration) -> Result<Option<ExitReport>> {
    if !send_sigterm(child) {
        return Ok(None);
    }
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return Ok(Some(ExitReport::from_status(status?)));
    }
    warn!(pid = ?child.id(), ?grace, "ACP process ignored SIGTERM, killing");
    Ok(None)
}

#[cfg(not(unix))]
#[allow(clippy::unused_async)]
async fn graceful_stop(_child: &mut Child, _grace: Duration) -> Result<Option<ExitReport>> {
    Ok(None)
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            debug!(pid, %err, "failed to deliver SIGTERM");
            false
        }
    }
}

#[cfg(unix)]
fn signal_name(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let signo = status.signal()?;
    Some(
        nix::sys::signal::Signal::try_from(signo)
            .map_or_else(|_| format!("signal {signo}"), |sig| sig.as_str().to_owned()),
    )
}

#[cfg(not(unix))]
fn signal_name(_status: ExitStatus) -> Option<String> {
    None
}
