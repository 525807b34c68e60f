// # Tunnel Process Traits
//
// Defines the seam between the startup state machine and the OS process that
// runs the tunnel binary.
//
// ## Implementations
//
// - [`CommandLauncher`](crate::supervisor::CommandLauncher): real child processes
// - Test doubles that replay a scripted log
//
// ## Contract
//
// - Output is one merged stream of stdout and stderr lines. It can be taken
//   once and ends when both pipes close.
// - Exit is published once on a `watch` channel; late subscribers still see it.
// - `terminate()` is idempotent: stopping an exited process is a no-op.

use async_trait::async_trait;
use std::pin::Pin;
use tokio::sync::watch;
use tokio_stream::Stream;

use crate::supervisor::LaunchCommand;

/// Merged, line-buffered output of a tunnel process
pub type LineStream = Pin<Box<dyn Stream<Item = String> + Send + 'static>>;

/// How a tunnel process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally (advisory only)
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Exit with a code
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Exit by signal
    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }
}

/// A running (or finished) tunnel process
#[async_trait]
pub trait TunnelProcess: Send + Sync {
    /// OS process ID, if known
    fn pid(&self) -> Option<u32>;

    /// Take the merged output stream; returns `None` once taken
    fn take_output(&mut self) -> Option<LineStream>;

    /// Subscribe to the exit notification
    fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>>;

    /// Stop the process: graceful request, then forced kill after the grace period
    ///
    /// Returns the exit, or `None` if it could not be observed.
    async fn terminate(&self) -> Result<Option<ProcessExit>, crate::Error>;
}

/// Starts tunnel processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Launch the command; fails with `Error::Spawn` if it cannot be started
    async fn start(&self, command: &LaunchCommand) -> Result<Box<dyn TunnelProcess>, crate::Error>;
}
