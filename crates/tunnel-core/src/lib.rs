// # tunnel-core
//
// Core library for supervising an outbound tunnel binary and pointing DNS at it.
//
// ## Architecture Overview
//
// - **Supervisor**: launches the tunnel binary, merges its output into lines,
//   publishes its exit, and stops it gracefully
// - **SignalDetector**: classifies one output line into at most one `LogSignal`
// - **Startup**: a state machine that turns signals, exit and a deadline into
//   exactly one `Ready` / `Failed` / `TimedOut` outcome
// - **Reconciler**: converges the records at a hostname toward one desired
//   record, with a rollback log for every mutation
// - **DnsProvider**: trait for the zone/record API the reconciler drives
// - **TunnelManager**: `establish_tunnel` / `teardown_tunnel` for callers
// - **ProviderRegistry**: plugin-based registry of DNS provider factories
//
// ## Design Principles
//
// 1. **Library-First**: the daemon is a thin shell over this crate
// 2. **Plugin-Based**: providers register factories; no vendor if-else in the core
// 3. **Line-Local Detection**: log format drift is absorbed by detector rules,
//    never by the state machine
// 4. **No Half-Applied State**: a failed attempt always terminates its process
//    and undoes its DNS changes

pub mod budget;
pub mod config;
pub mod detector;
pub mod error;
pub mod manager;
pub mod reconcile;
pub mod registry;
pub mod startup;
pub mod supervisor;
pub mod traits;

// Re-export core types for convenience
pub use budget::ApiBudget;
pub use config::{DnsConfig, ProviderConfig, StartupConfig, SupervisorConfig, TunnelConfig};
pub use detector::{LogSignal, SignalDetector};
pub use error::{Error, ErrorKind, FailureContext, Result};
pub use manager::{EstablishOptions, TunnelEvent, TunnelHandle, TunnelManager};
pub use reconcile::{
    ReconcileOptions, ReconciliationDecision, ReconciliationOutcome, Reconciler,
    UnresolvableReason, UndoStep,
};
pub use registry::ProviderRegistry;
pub use startup::{CancellationToken, Phase, ReadyTunnel, StartupOutcome, TunnelAttempt};
pub use supervisor::{CommandLauncher, LaunchCommand, NamedTunnel, TunnelMode};
pub use traits::{
    DnsProvider, DnsProviderFactory, DnsRecord, LineStream, ProcessExit, ProcessLauncher,
    RecordSpec, RecordType, TunnelProcess,
};
