//! Launch command construction and executable lookup

use std::path::{Path, PathBuf};

use crate::config::{SupervisorConfig, TunnelConfig};
use crate::error::{Error, Result};

/// Which kind of tunnel to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMode {
    /// Anonymous tunnel; the public URL is assigned by the provider and read from the log
    Quick,
    /// Pre-registered tunnel bound to a caller-chosen hostname
    Named(NamedTunnel),
}

impl TunnelMode {
    /// Tunnel identifier, present only for named tunnels
    pub fn tunnel_id(&self) -> Option<&str> {
        match self {
            TunnelMode::Quick => None,
            TunnelMode::Named(named) => Some(&named.tunnel_id),
        }
    }

    /// Whether this is a quick tunnel
    pub fn is_quick(&self) -> bool {
        matches!(self, TunnelMode::Quick)
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            TunnelMode::Quick => "quick",
            TunnelMode::Named(_) => "named",
        }
    }
}

/// Settings of a named tunnel
///
/// The credentials JSON and routing YAML are read by the tunnel binary; the
/// engine only passes their paths along.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedTunnel {
    /// Tunnel identifier (UUID)
    pub tunnel_id: String,
    /// Path to the per-tunnel credentials file
    pub credentials_file: PathBuf,
    /// Path to the routing config; without one the local port is routed directly
    pub config_file: Option<PathBuf>,
    /// Public hostname to point at the tunnel
    pub hostname: Option<String>,
}

impl NamedTunnel {
    /// Create named tunnel settings
    pub fn new(tunnel_id: impl Into<String>, credentials_file: impl Into<PathBuf>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            credentials_file: credentials_file.into(),
            config_file: None,
            hostname: None,
        }
    }

    /// Set the routing config path
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Set the public hostname
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

/// A fully resolved command line for the tunnel binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    /// Build the command line for `mode` exposing the local `port`
    pub fn for_mode(
        program: impl Into<PathBuf>,
        port: u16,
        mode: &TunnelMode,
        supervisor: &SupervisorConfig,
    ) -> Self {
        let mut args = vec!["tunnel".to_string()];
        if supervisor.no_autoupdate {
            args.push("--no-autoupdate".to_string());
        }

        match mode {
            TunnelMode::Quick => {
                args.push("--url".to_string());
                args.push(local_endpoint(port));
            }
            TunnelMode::Named(named) => {
                if let Some(ref config_file) = named.config_file {
                    args.push("--config".to_string());
                    args.push(config_file.display().to_string());
                }
                args.push("--credentials-file".to_string());
                args.push(named.credentials_file.display().to_string());
                if named.config_file.is_none() {
                    args.push("--url".to_string());
                    args.push(local_endpoint(port));
                }
                args.push("run".to_string());
                args.push(named.tunnel_id.clone());
            }
        }

        Self {
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

fn local_endpoint(port: u16) -> String {
    format!("http://localhost:{}", port)
}

/// Locate the tunnel binary
///
/// An explicit `binary` wins over `binary_name`; see [`resolve_program`].
pub fn resolve_executable(config: &TunnelConfig) -> Result<PathBuf> {
    match config.binary {
        Some(ref path) => resolve_program(path),
        None => resolve_program(Path::new(config.binary_name.trim())),
    }
}

/// Resolve a program to an executable file
///
/// A path with a directory part must point at an executable file. A bare name
/// is searched on `PATH`.
pub fn resolve_program(program: &Path) -> Result<PathBuf> {
    if program.as_os_str().is_empty() {
        return Err(Error::spawn("Tunnel binary name is empty"));
    }

    let explicit = program.components().count() > 1 || program.is_absolute();
    which::which(program).map_err(|e| {
        if explicit {
            Error::spawn(format!(
                "Tunnel binary not found or not executable: {} ({})",
                program.display(),
                e
            ))
        } else {
            Error::spawn(format!(
                "Tunnel binary '{}' was not found on PATH ({})",
                program.display(),
                e
            ))
        }
    })
}
