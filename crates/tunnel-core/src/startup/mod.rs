//! Startup detection
//!
//! Drives a [`TunnelAttempt`] from the output and exit of a [`TunnelProcess`]
//! until it resolves. Four sources race inside one `select!` loop:
//!
//! - caller cancellation
//! - output lines, classified by the [`SignalDetector`]
//! - process exit
//! - the attempt deadline
//!
//! Whichever resolves the attempt first wins; everything after is ignored by
//! the machine. When the outcome is not `Ready` the process is terminated
//! exactly once before the outcome is returned.

mod machine;
mod quorum;

pub use machine::{FailureReason, Phase, ReadyTunnel, StartupOutcome, TunnelAttempt};
pub use quorum::ConnectionQuorum;
pub use tokio_util::sync::CancellationToken;

use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::detector::SignalDetector;
use crate::traits::{LineStream, TunnelProcess};

/// How long buffered output is still read after the process exits
///
/// A fatal line written just before exit is a better diagnosis than the exit.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Run startup detection for a spawned process
///
/// Returns the outcome together with the unread remainder of the output
/// stream (present only when the attempt became ready with output still open).
pub async fn run_startup(
    process: &mut dyn TunnelProcess,
    mut attempt: TunnelAttempt,
    detector: &SignalDetector,
    cancel: Option<CancellationToken>,
) -> (StartupOutcome, Option<LineStream>) {
    attempt.spawned();

    let mut lines = process.take_output();
    let mut exit_rx = process.exit_watch();
    let cancel = cancel.unwrap_or_default();
    let mut exit_pending = *exit_rx.borrow_and_update();

    let deadline = tokio::time::sleep(attempt.deadline());
    tokio::pin!(deadline);

    let outcome = loop {
        if let Some(exit) = exit_pending.take() {
            if let Some(outcome) = drain_after_exit(&mut attempt, &mut lines, detector).await {
                break outcome;
            }
            if let Some(outcome) = attempt.on_exit(exit.code) {
                break outcome;
            }
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if let Some(outcome) = attempt.cancel() {
                    break outcome;
                }
            }

            line = next_line(&mut lines), if lines.is_some() => match line {
                Some(line) => {
                    if let Some(outcome) = attempt.on_line(&line, detector, Instant::now()) {
                        break outcome;
                    }
                }
                None => {
                    debug!(port = attempt.port(), "Tunnel output closed");
                    lines = None;
                }
            },

            exit = exit_rx.wait_for(Option::is_some) => {
                let exit = match exit {
                    Ok(exit) => *exit,
                    Err(_) => None,
                };
                // A dropped exit channel means the process is gone without a status.
                exit_pending = Some(exit.unwrap_or(crate::traits::ProcessExit {
                    code: None,
                    signal: None,
                }));
            }

            _ = &mut deadline => {
                if let Some(outcome) = attempt.on_deadline() {
                    break outcome;
                }
            }
        }
    };

    if outcome.is_ready() {
        return (outcome, lines);
    }

    drop(lines);
    match process.terminate().await {
        Ok(exit) => debug!(port = attempt.port(), ?exit, "Terminated tunnel process after failed startup"),
        Err(e) => warn!(port = attempt.port(), error = %e, "Failed to terminate tunnel process"),
    }
    (outcome, None)
}

async fn next_line(lines: &mut Option<LineStream>) -> Option<String> {
    match lines.as_mut() {
        Some(stream) => stream.next().await,
        None => None,
    }
}

async fn drain_after_exit(
    attempt: &mut TunnelAttempt,
    lines: &mut Option<LineStream>,
    detector: &SignalDetector,
) -> Option<StartupOutcome> {
    let stream = lines.as_mut()?;
    let drain = async {
        while let Some(line) = stream.next().await {
            if let Some(outcome) = attempt.on_line(&line, detector, Instant::now()) {
                return Some(outcome);
            }
        }
        None
    };
    let outcome = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, drain)
        .await
        .ok()
        .flatten();
    *lines = None;
    outcome
}
