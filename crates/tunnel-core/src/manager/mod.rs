//! Caller-facing tunnel lifecycle
//!
//! [`TunnelManager::establish_tunnel`] ties the pieces together:
//!
//! ```text
//! claim port ─▶ spawn ─▶ startup detection ─▶ (named + hostname) reconcile CNAME ─▶ TunnelHandle
//!                 │              │                          │
//!                 └──────────────┴──── failure / cancel ────┴──▶ terminate + DNS rollback + release port
//! ```
//!
//! Only one attempt may own a local port at a time. The port stays claimed
//! until the returned [`TunnelHandle`] is torn down or dropped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, trace, warn};

use crate::config::TunnelConfig;
use crate::detector::SignalDetector;
use crate::error::{Error, ErrorKind, FailureContext, Result};
use crate::reconcile::{ReconcileOptions, ReconciliationOutcome, Reconciler};
use crate::startup::{CancellationToken, ReadyTunnel, TunnelAttempt, run_startup};
use crate::supervisor::{LaunchCommand, TunnelMode};
use crate::traits::{LineStream, ProcessExit, ProcessLauncher, RecordType, TunnelProcess};

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle events emitted by the [`TunnelManager`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A tunnel process is being started
    Starting { port: u16, mode: &'static str },

    /// Startup detection declared the tunnel ready
    Ready {
        port: u16,
        url: Option<String>,
        tunnel_id: Option<String>,
        connections: usize,
    },

    /// The hostname was reconciled
    DnsReconciled {
        port: u16,
        hostname: String,
        decision: &'static str,
    },

    /// The attempt failed; the process was stopped and DNS rolled back
    Failed {
        port: u16,
        kind: ErrorKind,
        reason: String,
    },

    /// A ready tunnel's process exited on its own
    Exited { port: u16, code: Option<i32> },

    /// The tunnel was torn down by the caller
    TornDown { port: u16 },
}

/// Per-attempt options for [`TunnelManager::establish_tunnel`]
#[derive(Debug, Clone, Default)]
pub struct EstablishOptions {
    /// Cancels the attempt while it is in flight
    pub cancel: Option<CancellationToken>,
    /// Override of the configured startup deadline
    pub deadline: Option<Duration>,
    /// Undo this attempt's DNS changes on teardown
    pub remove_dns_on_teardown: bool,
    /// Overrides for the hostname reconciliation
    pub reconcile: ReconcileOptions,
}

impl EstablishOptions {
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn remove_dns_on_teardown(mut self, remove: bool) -> Self {
        self.remove_dns_on_teardown = remove;
        self
    }
}

/// Claim on a local port; released on drop
#[derive(Debug)]
struct PortLease {
    port: u16,
    active: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    fn claim(active: &Arc<Mutex<HashSet<u16>>>, port: u16) -> Result<Self> {
        let mut ports = active.lock().unwrap_or_else(PoisonError::into_inner);
        if !ports.insert(port) {
            return Err(Error::PortBusy(port));
        }
        Ok(Self {
            port,
            active: Arc::clone(active),
        })
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
        debug!(port = self.port, "Released tunnel port");
    }
}

/// A running tunnel
pub struct TunnelHandle {
    ready: ReadyTunnel,
    mode: TunnelMode,
    dns: Option<ReconciliationOutcome>,
    remove_dns_on_teardown: bool,
    process: Box<dyn TunnelProcess>,
    monitor: Option<JoinHandle<()>>,
    _lease: PortLease,
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("ready", &self.ready)
            .field("mode", &self.mode)
            .field("dns", &self.dns)
            .field("pid", &self.process.pid())
            .finish()
    }
}

impl TunnelHandle {
    pub fn port(&self) -> u16 {
        self.ready.port
    }

    /// Public URL (quick tunnels)
    pub fn url(&self) -> Option<&str> {
        self.ready.url.as_deref()
    }

    pub fn mode(&self) -> &TunnelMode {
        &self.mode
    }

    /// Readiness details
    pub fn ready(&self) -> &ReadyTunnel {
        &self.ready
    }

    /// The hostname reconciliation, for named tunnels with a hostname
    pub fn dns(&self) -> Option<&ReconciliationOutcome> {
        self.dns.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Whether the tunnel process has exited
    pub fn has_exited(&self) -> bool {
        self.process.exit_watch().borrow().is_some()
    }
}

/// Establishes and tears down tunnels
pub struct TunnelManager {
    launcher: Arc<dyn ProcessLauncher>,
    reconciler: Option<Arc<Reconciler>>,
    config: TunnelConfig,
    detector: SignalDetector,
    active: Arc<Mutex<HashSet<u16>>>,
    event_tx: mpsc::Sender<TunnelEvent>,
}

impl TunnelManager {
    /// Create a manager
    ///
    /// `reconciler` is required only for named tunnels that carry a hostname.
    /// Returns the manager and the receiver of its lifecycle events.
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        reconciler: Option<Reconciler>,
        config: TunnelConfig,
    ) -> Result<(Self, mpsc::Receiver<TunnelEvent>)> {
        config.validate()?;
        let detector = SignalDetector::from_config(&config.startup)?;
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let manager = Self {
            launcher,
            reconciler: reconciler.map(Arc::new),
            config,
            detector,
            active: Arc::new(Mutex::new(HashSet::new())),
            event_tx,
        };

        Ok((manager, event_rx))
    }

    /// Replace the signal detector (to add log rules)
    pub fn with_detector(mut self, detector: SignalDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Ports with an in-flight or established tunnel
    pub fn active_ports(&self) -> Vec<u16> {
        let ports = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ports: Vec<u16> = ports.iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Start a tunnel for `port` and wait until it is ready
    ///
    /// On any failure the child process is terminated, DNS changes made by
    /// this attempt are rolled back and the port is released before the error
    /// is returned.
    pub async fn establish_tunnel(
        &self,
        port: u16,
        mode: TunnelMode,
        options: EstablishOptions,
    ) -> Result<TunnelHandle> {
        if port == 0 {
            return Err(Error::config("Local port must be > 0"));
        }
        let hostname = match mode {
            TunnelMode::Named(ref named) => named.hostname.clone(),
            TunnelMode::Quick => None,
        };
        if hostname.is_some() && self.reconciler.is_none() {
            return Err(Error::config(
                "A DNS provider is required to route a hostname to a named tunnel",
            ));
        }

        let lease = PortLease::claim(&self.active, port)?;
        let result = self.run_attempt(lease, mode, hostname, options).await;
        if let Err(ref e) = result {
            error!(port, kind = %e.kind(), error = %e, "Tunnel attempt failed");
            if let Some(context) = e.context()
                && !context.last_lines.is_empty()
            {
                debug!(port, tail = %context.tail(), "Last tunnel output");
            }
            self.emit_event(TunnelEvent::Failed {
                port,
                kind: e.kind(),
                reason: e.to_string(),
            });
        }
        result
    }

    /// Stop a tunnel and release its port
    ///
    /// DNS changes are undone only when the tunnel was established with
    /// `remove_dns_on_teardown`.
    pub async fn teardown_tunnel(&self, mut handle: TunnelHandle) -> Result<()> {
        let port = handle.port();
        info!(port, pid = ?handle.pid(), "Tearing down tunnel");

        if let Some(monitor) = handle.monitor.take() {
            monitor.abort();
        }

        let mut first_error = handle.process.terminate().await.err();

        if handle.remove_dns_on_teardown
            && let (Some(reconciler), Some(outcome)) = (self.reconciler.as_ref(), handle.dns.as_ref())
            && let Err(e) = reconciler.rollback(outcome).await
        {
            first_error.get_or_insert(e);
        }

        self.emit_event(TunnelEvent::TornDown { port });
        drop(handle);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_attempt(
        &self,
        lease: PortLease,
        mode: TunnelMode,
        hostname: Option<String>,
        options: EstablishOptions,
    ) -> Result<TunnelHandle> {
        let port = lease.port;
        let program = self
            .config
            .binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.config.binary_name.trim()));
        let command = LaunchCommand::for_mode(program, port, &mode, &self.config.supervisor);

        self.emit_event(TunnelEvent::Starting {
            port,
            mode: mode.label(),
        });

        if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled {
                context: FailureContext::default(),
            });
        }

        let mut process = self.launcher.start(&command).await?;

        let mut attempt = TunnelAttempt::new(port, mode.clone(), &self.config.startup);
        if let Some(deadline) = options.deadline {
            attempt = attempt.with_deadline(deadline);
        }
        let (outcome, output) =
            run_startup(process.as_mut(), attempt, &self.detector, options.cancel.clone()).await;
        let ready = outcome.into_result()?;

        self.emit_event(TunnelEvent::Ready {
            port,
            url: ready.url.clone(),
            tunnel_id: ready.tunnel_id.clone(),
            connections: ready.connections,
        });

        // Output keeps draining while DNS is routed
        let monitor = tokio::spawn(monitor_tunnel(
            port,
            output,
            process.exit_watch(),
            self.event_tx.clone(),
        ));

        let dns = match (hostname, mode.tunnel_id(), self.reconciler.as_ref()) {
            (Some(hostname), Some(tunnel_id), Some(reconciler)) => {
                match self
                    .route_hostname(reconciler, &hostname, tunnel_id, &options, process.as_ref())
                    .await
                {
                    Ok(outcome) => {
                        self.emit_event(TunnelEvent::DnsReconciled {
                            port,
                            hostname,
                            decision: outcome.decision.label(),
                        });
                        Some(outcome)
                    }
                    Err(e) => {
                        monitor.abort();
                        if let Err(stop_err) = process.terminate().await {
                            warn!(port, error = %stop_err, "Failed to stop tunnel after DNS failure");
                        }
                        return Err(e);
                    }
                }
            }
            _ => None,
        };

        info!(port, url = ?ready.url, tunnel_id = ?ready.tunnel_id, "Tunnel established");

        Ok(TunnelHandle {
            ready,
            mode,
            dns,
            remove_dns_on_teardown: options.remove_dns_on_teardown,
            process,
            monitor: Some(monitor),
            _lease: lease,
        })
    }

    /// Point `hostname` at the tunnel, undoing the change if the attempt
    /// was cancelled or the process died meanwhile
    async fn route_hostname(
        &self,
        reconciler: &Reconciler,
        hostname: &str,
        tunnel_id: &str,
        options: &EstablishOptions,
        process: &dyn TunnelProcess,
    ) -> Result<ReconciliationOutcome> {
        let target = reconciler.tunnel_target(tunnel_id);
        let mut reconcile_options = options.reconcile.clone();
        if reconcile_options.cancel.is_none() {
            reconcile_options.cancel = options.cancel.clone();
        }

        let outcome = reconciler
            .reconcile(hostname, RecordType::Cname, &target, &reconcile_options)
            .await?;
        if !outcome.is_converged()
            && outcome.changed()
            && let Err(e) = reconciler.rollback(&outcome).await
        {
            error!(hostname, error = %e, pending = ?outcome.undo, "DNS changes could not be undone");
        }
        let outcome = outcome.ensure_converged()?;

        let cancelled = options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled);
        let exit: Option<ProcessExit> = *process.exit_watch().borrow();
        if !cancelled && exit.is_none() {
            return Ok(outcome);
        }

        if let Err(e) = reconciler.rollback(&outcome).await {
            warn!(hostname, error = %e, "Failed to roll back DNS for abandoned tunnel");
        }
        match exit {
            Some(exit) if !cancelled => Err(Error::ProcessExited {
                code: exit.code,
                context: FailureContext {
                    last_lines: Vec::new(),
                    exit_code: exit.code,
                },
            }),
            _ => Err(Error::Cancelled {
                context: FailureContext::default(),
            }),
        }
    }

    fn emit_event(&self, event: TunnelEvent) {
        if self.event_tx.try_send(event).is_err() {
            trace!("Tunnel event channel full or closed, dropping event");
        }
    }
}

/// Drain output of a ready tunnel and report an unexpected exit
async fn monitor_tunnel(
    port: u16,
    mut lines: Option<LineStream>,
    mut exit_rx: tokio::sync::watch::Receiver<Option<ProcessExit>>,
    event_tx: mpsc::Sender<TunnelEvent>,
) {
    loop {
        tokio::select! {
            line = next_line(&mut lines), if lines.is_some() => match line {
                Some(line) => trace!(port, line = %line, "tunnel output"),
                None => lines = None,
            },
            exit = exit_rx.wait_for(Option::is_some) => {
                let code = match exit {
                    Ok(exit) => (*exit).and_then(|e| e.code),
                    Err(_) => None,
                };
                warn!(port, ?code, "Tunnel process exited");
                let _ = event_tx.try_send(TunnelEvent::Exited { port, code });
                break;
            }
        }
    }
}

async fn next_line(lines: &mut Option<LineStream>) -> Option<String> {
    match lines.as_mut() {
        Some(stream) => stream.next().await,
        None => None,
    }
}
