//! Process supervisor
//!
//! Launches the tunnel binary and owns the OS child process for its lifetime.
//!
//! ## Architecture
//!
//! ```text
//!              ┌────────────────────┐
//!  stdout ───▶ │ line reader task   │──┐
//!              └────────────────────┘  │   mpsc    ┌──────────────┐
//!              ┌────────────────────┐  ├─────────▶ │  LineStream  │
//!  stderr ───▶ │ line reader task   │──┘           └──────────────┘
//!              └────────────────────┘
//!              ┌────────────────────┐   watch     ┌──────────────┐
//!  child  ───▶ │ exit watcher task  │───────────▶ │ exit_watch() │
//!              └────────────────────┘             └──────────────┘
//!                        ▲ oneshot (stop request)
//!                        └──── terminate() / drop
//! ```
//!
//! Reader tasks keep draining the pipes after the line stream is dropped so the
//! child never blocks on a full pipe once startup detection is finished.

mod command;

pub use command::{LaunchCommand, NamedTunnel, TunnelMode, resolve_executable, resolve_program};

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, trace, warn};

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::traits::{LineStream, ProcessExit, ProcessLauncher, TunnelProcess};

/// Buffered lines between the pipe readers and the consumer
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Extra time `terminate()` waits beyond the grace period for the forced kill to land
const TERMINATE_MARGIN: Duration = Duration::from_secs(2);

/// Launches the tunnel binary as a real child process
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    grace_period: Duration,
}

impl CommandLauncher {
    /// Create a launcher with the given stop grace period
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Create a launcher from supervisor configuration
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.grace_period())
    }
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn start(&self, command: &LaunchCommand) -> Result<Box<dyn TunnelProcess>> {
        let program = resolve_program(&command.program)?;
        info!(
            program = %program.display(),
            args = ?command.args,
            "Starting tunnel process"
        );

        let mut child = Command::new(&program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::spawn(format!(
                    "Failed to start {}: {}",
                    program.display(),
                    e
                ))
            })?;

        let pid = child.id();
        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone(), "stderr"));
        }
        drop(line_tx);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(watch_exit(child, pid, stop_rx, exit_tx, self.grace_period));

        debug!(?pid, "Tunnel process spawned");

        Ok(Box::new(ChildProcess {
            pid,
            output: Mutex::new(Some(Box::pin(ReceiverStream::new(line_rx)))),
            exit_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            grace_period: self.grace_period,
        }))
    }
}

/// Handle to a child process started by [`CommandLauncher`]
///
/// Dropping the handle stops the process the same way `terminate()` does.
pub struct ChildProcess {
    pid: Option<u32>,
    output: Mutex<Option<LineStream>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    grace_period: Duration,
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid)
            .field("exit", &*self.exit_rx.borrow())
            .finish()
    }
}

#[async_trait]
impl TunnelProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn take_output(&mut self) -> Option<LineStream> {
        self.output
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    async fn terminate(&self) -> Result<Option<ProcessExit>> {
        if let Some(exit) = *self.exit_rx.borrow() {
            debug!(pid = ?self.pid, "Tunnel process already exited");
            return Ok(Some(exit));
        }

        let stop = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = stop {
            info!(pid = ?self.pid, "Stopping tunnel process");
            let _ = stop.send(());
        }

        let mut exit_rx = self.exit_rx.clone();
        match tokio::time::timeout(
            self.grace_period + TERMINATE_MARGIN,
            exit_rx.wait_for(Option::is_some),
        )
        .await
        {
            Ok(Ok(exit)) => Ok(*exit),
            Ok(Err(_)) => Ok(None),
            Err(_) => Err(Error::Other(format!(
                "Tunnel process {:?} did not exit after stop request",
                self.pid
            ))),
        }
    }
}

/// Read lines from one pipe and forward them to the merged stream
async fn forward_lines<R>(pipe: R, tx: mpsc::Sender<String>, source: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(pipe).lines();
    let mut forwarding = true;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                trace!(source, line = %line, "tunnel output");
                if forwarding && tx.send(line).await.is_err() {
                    // Consumer is gone; keep draining so the child never blocks.
                    forwarding = false;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(source, error = %e, "Failed to read tunnel output");
                break;
            }
        }
    }
}

/// Own the child until it exits or a stop is requested, then publish the exit
async fn watch_exit(
    mut child: Child,
    pid: Option<u32>,
    stop_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    grace_period: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on an explicit stop and when the handle is dropped.
        _ = stop_rx => stop_child(&mut child, pid, grace_period).await,
    };

    let exit = match status {
        Ok(status) => exit_from_status(status),
        Err(e) => {
            warn!(?pid, error = %e, "Failed to wait for tunnel process");
            ProcessExit {
                code: None,
                signal: None,
            }
        }
    };

    info!(?pid, code = ?exit.code, signal = ?exit.signal, "Tunnel process exited");
    let _ = exit_tx.send(Some(exit));
}

/// Graceful stop, escalating to a forced kill after the grace period
async fn stop_child(
    child: &mut Child,
    pid: Option<u32>,
    grace_period: Duration,
) -> std::io::Result<ExitStatus> {
    request_graceful_stop(child, pid);

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(?pid, ?grace_period, "Tunnel process ignored stop request, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_graceful_stop(child: &mut Child, pid: Option<u32>) {
    let Some(pid) = pid else {
        let _ = child.start_kill();
        return;
    };
    // SAFETY: `pid` belongs to a child we still own and have not reaped.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, "SIGTERM failed, falling back to kill");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_graceful_stop(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

fn exit_from_status(status: ExitStatus) -> ProcessExit {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ProcessExit {
        code: status.code(),
        signal,
    }
}
