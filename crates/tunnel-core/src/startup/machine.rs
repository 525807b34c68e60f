//! Startup state machine
//!
//! ```text
//!  Init ──spawn──▶ Starting ──ConnectionRegistered──▶ AwaitingQuorum ──quorum (+url)──▶ Ready
//!    │                │                                    │
//!    └────────────────┴──── FatalError / exit / cancel ────┴──▶ Failed
//!    └────────────────┴──────────── deadline ──────────────┴──▶ TimedOut
//! ```
//!
//! The machine is synchronous and clock-injected; the async driver in the
//! parent module feeds it lines, exit events and the deadline. Resolution is
//! exactly-once: after a terminal phase every further input is ignored.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::quorum::ConnectionQuorum;
use crate::config::StartupConfig;
use crate::detector::{LogSignal, SignalDetector};
use crate::error::{Error, FailureContext};
use crate::supervisor::TunnelMode;

/// Lifecycle phase of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Starting,
    AwaitingQuorum,
    Ready,
    Failed,
    TimedOut,
}

impl Phase {
    /// Whether the phase is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Ready | Phase::Failed | Phase::TimedOut)
    }
}

/// Why an attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The process exited before readiness
    ProcessExited { code: Option<i32> },
    /// A fatal log line was seen
    FatalLog { message: String },
    /// The caller cancelled the attempt
    Cancelled,
}

/// A tunnel that reached readiness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyTunnel {
    /// Local port being exposed
    pub port: u16,
    /// Public URL (quick tunnels)
    pub url: Option<String>,
    /// Tunnel identifier (named tunnels)
    pub tunnel_id: Option<String>,
    /// Distinct connections registered when readiness was declared
    pub connections: usize,
    /// Edge locations seen
    pub locations: Vec<String>,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// Time from spawn to readiness
    pub elapsed: Duration,
}

/// Terminal result of a startup attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    Ready(ReadyTunnel),
    Failed {
        reason: FailureReason,
        context: FailureContext,
    },
    TimedOut {
        after: Duration,
        context: FailureContext,
    },
}

impl StartupOutcome {
    /// Whether the attempt succeeded
    pub fn is_ready(&self) -> bool {
        matches!(self, StartupOutcome::Ready(_))
    }

    /// Convert into the engine's error taxonomy
    pub fn into_result(self) -> Result<ReadyTunnel, Error> {
        match self {
            StartupOutcome::Ready(ready) => Ok(ready),
            StartupOutcome::Failed { reason, context } => Err(match reason {
                FailureReason::ProcessExited { code } => Error::ProcessExited { code, context },
                FailureReason::FatalLog { message } => Error::FatalLogSignal { message, context },
                FailureReason::Cancelled => Error::Cancelled { context },
            }),
            StartupOutcome::TimedOut { after, context } => {
                Err(Error::DetectionTimeout { after, context })
            }
        }
    }
}

/// One supervised run of the tunnel binary
#[derive(Debug)]
pub struct TunnelAttempt {
    port: u16,
    mode: TunnelMode,
    started_at: DateTime<Utc>,
    started: Instant,
    deadline: Duration,
    min_connections: usize,
    phase: Phase,
    url: Option<String>,
    quorum: ConnectionQuorum,
    tail: VecDeque<String>,
    tail_limit: usize,
    exit_code: Option<i32>,
}

impl TunnelAttempt {
    /// Create an attempt in the `Init` phase
    pub fn new(port: u16, mode: TunnelMode, config: &StartupConfig) -> Self {
        Self {
            port,
            mode,
            started_at: Utc::now(),
            started: Instant::now(),
            deadline: config.deadline(),
            min_connections: config.min_connections.max(1),
            phase: Phase::Init,
            url: None,
            quorum: ConnectionQuorum::new(config.dedup_window()),
            tail: VecDeque::new(),
            tail_limit: config.log_tail_lines.max(1),
            exit_code: None,
        }
    }

    /// Override the deadline for this attempt
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mode(&self) -> &TunnelMode {
        &self.mode
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn connections(&self) -> usize {
        self.quorum.size()
    }

    /// `Init → Starting`, on successful spawn
    pub fn spawned(&mut self) {
        if self.phase == Phase::Init {
            self.started = Instant::now();
            self.phase = Phase::Starting;
            debug!(port = self.port, mode = self.mode.label(), "Tunnel attempt starting");
        }
    }

    /// Feed one output line
    pub fn on_line(
        &mut self,
        line: &str,
        detector: &SignalDetector,
        now: Instant,
    ) -> Option<StartupOutcome> {
        if self.phase.is_terminal() {
            return None;
        }

        if self.tail.len() == self.tail_limit {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());

        let signal = detector.classify(line)?;
        self.on_signal(signal, now)
    }

    /// Feed one classified signal
    pub fn on_signal(&mut self, signal: LogSignal, now: Instant) -> Option<StartupOutcome> {
        if self.phase.is_terminal() {
            debug!(port = self.port, ?signal, "Ignoring signal after resolution");
            return None;
        }

        match signal {
            LogSignal::UrlDiscovered { url } => {
                if self.url.is_none() {
                    info!(port = self.port, url = %url, "Tunnel URL discovered");
                    self.url = Some(url);
                }
                self.check_ready(now)
            }
            LogSignal::ConnectionRegistered { index, location } => {
                let counted = self.quorum.record(index, location.as_deref(), now);
                self.phase = Phase::AwaitingQuorum;
                if counted {
                    info!(
                        port = self.port,
                        ?index,
                        ?location,
                        connections = self.quorum.size(),
                        required = self.min_connections,
                        "Tunnel connection registered"
                    );
                }
                self.check_ready(now)
            }
            LogSignal::FatalError { message } => {
                self.fail(FailureReason::FatalLog { message })
            }
            LogSignal::ProcessExited { code } => {
                self.exit_code = code;
                self.fail(FailureReason::ProcessExited { code })
            }
        }
    }

    /// The process exited
    pub fn on_exit(&mut self, code: Option<i32>) -> Option<StartupOutcome> {
        self.on_signal(LogSignal::ProcessExited { code }, Instant::now())
    }

    /// The deadline elapsed
    pub fn on_deadline(&mut self) -> Option<StartupOutcome> {
        if self.phase.is_terminal() {
            return None;
        }
        self.phase = Phase::TimedOut;
        warn!(
            port = self.port,
            deadline = ?self.deadline,
            connections = self.quorum.size(),
            url_found = self.url.is_some(),
            "Tunnel did not become ready before the deadline"
        );
        Some(StartupOutcome::TimedOut {
            after: self.deadline,
            context: self.context(),
        })
    }

    /// The caller cancelled the attempt
    pub fn cancel(&mut self) -> Option<StartupOutcome> {
        if self.phase.is_terminal() {
            return None;
        }
        self.fail(FailureReason::Cancelled)
    }

    fn check_ready(&mut self, now: Instant) -> Option<StartupOutcome> {
        if self.quorum.size() < self.min_connections {
            return None;
        }
        if self.mode.is_quick() && self.url.is_none() {
            debug!(port = self.port, "Quorum reached, waiting for tunnel URL");
            return None;
        }

        self.phase = Phase::Ready;
        let ready = ReadyTunnel {
            port: self.port,
            url: self.url.clone(),
            tunnel_id: self.mode.tunnel_id().map(str::to_string),
            connections: self.quorum.size(),
            locations: self.quorum.locations().to_vec(),
            started_at: self.started_at,
            elapsed: now.saturating_duration_since(self.started),
        };
        info!(
            port = self.port,
            url = ?ready.url,
            tunnel_id = ?ready.tunnel_id,
            connections = ready.connections,
            elapsed = ?ready.elapsed,
            "Tunnel ready"
        );
        Some(StartupOutcome::Ready(ready))
    }

    fn fail(&mut self, reason: FailureReason) -> Option<StartupOutcome> {
        self.phase = Phase::Failed;
        warn!(port = self.port, ?reason, "Tunnel attempt failed");
        Some(StartupOutcome::Failed {
            reason,
            context: self.context(),
        })
    }

    fn context(&self) -> FailureContext {
        FailureContext {
            last_lines: self.tail.iter().cloned().collect(),
            exit_code: self.exit_code,
        }
    }
}
