//! Core traits for the tunnel engine
//!
//! This module defines the abstract interfaces at the engine's two external seams.
//!
//! - [`DnsProvider`]: zone lookup and record CRUD against a DNS provider API
//! - [`ProcessLauncher`] / [`TunnelProcess`]: the supervised tunnel binary

pub mod dns_provider;
pub mod process;

pub use dns_provider::{DnsProvider, DnsProviderFactory, DnsRecord, RecordSpec, RecordType};
pub use process::{LineStream, ProcessExit, ProcessLauncher, TunnelProcess};
