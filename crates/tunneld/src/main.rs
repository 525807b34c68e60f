// # tunneld - Tunnel Daemon
//
// Thin integration layer over `tunnel-core`. It contains no tunnel or DNS
// logic of its own.
//
// The tunneld daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Registering DNS providers
// 4. Establishing one tunnel and keeping it until shutdown
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Tunnel
// - `TUNNEL_PORT`: Local port to expose (required)
// - `TUNNEL_MODE`: `quick` (default) or `named`
// - `TUNNEL_ID`: Tunnel identifier (named mode)
// - `TUNNEL_CREDENTIALS_FILE`: Credentials JSON path (named mode)
// - `TUNNEL_CONFIG_FILE`: Routing config path (named mode, optional)
// - `TUNNEL_HOSTNAME`: Public hostname to route to the tunnel (named mode, optional)
// - `TUNNEL_BIN`: Explicit path to the tunnel binary (default: `cloudflared` on PATH)
// - `TUNNEL_DEADLINE_SECS`: Startup deadline in seconds
// - `TUNNEL_MIN_CONNECTIONS`: Edge connections required for readiness
//
// ### DNS Provider
// - `TUNNEL_PROVIDER_API_TOKEN`: API token (required with `TUNNEL_HOSTNAME`)
// - `TUNNEL_PROVIDER_ZONE_ID`: Zone ID (optional)
// - `TUNNEL_PROVIDER_ACCOUNT_ID`: Account ID (optional)
// - `TUNNEL_DNS_MODE`: `dry-run` to log DNS writes instead of sending them
//
// ### Logging
// - `TUNNEL_LOG_LEVEL`: trace, debug, info (default), warn, error
//
// ## Example
//
// ```bash
// export TUNNEL_PORT=8080
// export TUNNEL_MODE=named
// export TUNNEL_ID=6ff42ae2-765d-4adf-8112-31c55c1551ef
// export TUNNEL_CREDENTIALS_FILE=/etc/tunnel/6ff42ae2.json
// export TUNNEL_HOSTNAME=app.example.com
// export TUNNEL_PROVIDER_API_TOKEN=your_token
//
// tunneld
// ```

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tunnel_core::{
    ApiBudget, CommandLauncher, EstablishOptions, NamedTunnel, ProviderConfig, ProviderRegistry,
    Reconciler, TunnelConfig, TunnelEvent, TunnelManager, TunnelMode,
};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (tunnel failed to establish or died)
#[derive(Debug, Clone, Copy)]
enum TunnelExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error
    RuntimeError = 2,
}

impl From<TunnelExitCode> for ExitCode {
    fn from(code: TunnelExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
struct Config {
    port: u16,
    mode: String,
    tunnel_id: Option<String>,
    credentials_file: Option<PathBuf>,
    config_file: Option<PathBuf>,
    hostname: Option<String>,
    binary: Option<PathBuf>,
    deadline_secs: Option<u64>,
    min_connections: Option<usize>,
    provider_api_token: Option<String>,
    provider_zone_id: Option<String>,
    provider_account_id: Option<String>,
    log_level: String,
}

/// Read a variable, treating empty values as unset
fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read and parse a numeric variable
fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|v| v.parse::<T>().with_context(|| format!("{} is not a valid number: '{}'", name, v)))
        .transpose()
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let port = parse_var::<u16>("TUNNEL_PORT")?.context(
            "TUNNEL_PORT is required. Set it via: export TUNNEL_PORT=8080",
        )?;

        Ok(Self {
            port,
            mode: var("TUNNEL_MODE").unwrap_or_else(|| "quick".to_string()),
            tunnel_id: var("TUNNEL_ID"),
            credentials_file: var("TUNNEL_CREDENTIALS_FILE").map(PathBuf::from),
            config_file: var("TUNNEL_CONFIG_FILE").map(PathBuf::from),
            hostname: var("TUNNEL_HOSTNAME"),
            binary: var("TUNNEL_BIN").map(PathBuf::from),
            deadline_secs: parse_var("TUNNEL_DEADLINE_SECS")?,
            min_connections: parse_var("TUNNEL_MIN_CONNECTIONS")?,
            provider_api_token: var("TUNNEL_PROVIDER_API_TOKEN"),
            provider_zone_id: var("TUNNEL_PROVIDER_ZONE_ID"),
            provider_account_id: var("TUNNEL_PROVIDER_ACCOUNT_ID"),
            log_level: var("TUNNEL_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("TUNNEL_PORT must be between 1 and 65535");
        }

        match self.mode.as_str() {
            "quick" => {
                if self.hostname.is_some() {
                    anyhow::bail!(
                        "TUNNEL_HOSTNAME requires TUNNEL_MODE=named. \
                        Quick tunnels get their hostname from the provider."
                    );
                }
            }
            "named" => {
                if self.tunnel_id.is_none() {
                    anyhow::bail!("TUNNEL_ID is required when TUNNEL_MODE=named");
                }
                match self.credentials_file {
                    None => anyhow::bail!(
                        "TUNNEL_CREDENTIALS_FILE is required when TUNNEL_MODE=named"
                    ),
                    Some(ref path) if !path.exists() => anyhow::bail!(
                        "TUNNEL_CREDENTIALS_FILE does not exist: {}",
                        path.display()
                    ),
                    Some(_) => {}
                }
                if let Some(ref path) = self.config_file
                    && !path.exists()
                {
                    anyhow::bail!("TUNNEL_CONFIG_FILE does not exist: {}", path.display());
                }
            }
            other => anyhow::bail!(
                "TUNNEL_MODE '{}' is not supported. Supported modes: quick, named",
                other
            ),
        }

        if let Some(ref hostname) = self.hostname {
            validate_domain_name(hostname)?;
            if self.provider_api_token.is_none() {
                anyhow::bail!(
                    "TUNNEL_PROVIDER_API_TOKEN is required when TUNNEL_HOSTNAME is set. \
                    Set it via: export TUNNEL_PROVIDER_API_TOKEN=your_token"
                );
            }
        }

        if let Some(ref token) = self.provider_api_token {
            let token_lower = token.to_lowercase();
            if token_lower.contains("your_token") || token_lower.contains("replace_me") {
                anyhow::bail!(
                    "TUNNEL_PROVIDER_API_TOKEN appears to be a placeholder. \
                    Use an actual API token from your DNS provider."
                );
            }
        }

        if let Some(deadline) = self.deadline_secs
            && !(1..=3600).contains(&deadline)
        {
            anyhow::bail!(
                "TUNNEL_DEADLINE_SECS must be between 1 and 3600 seconds. Got: {}",
                deadline
            );
        }

        if let Some(min_connections) = self.min_connections
            && !(1..=16).contains(&min_connections)
        {
            anyhow::bail!(
                "TUNNEL_MIN_CONNECTIONS must be between 1 and 16. Got: {}",
                min_connections
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "TUNNEL_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    /// Engine configuration derived from the environment
    fn tunnel_config(&self) -> TunnelConfig {
        let mut config = TunnelConfig::new();
        config.binary = self.binary.clone();
        if let Some(deadline) = self.deadline_secs {
            config.startup.deadline_secs = deadline;
        }
        if let Some(min_connections) = self.min_connections {
            config.startup.min_connections = min_connections;
        }
        config.provider = self
            .provider_api_token
            .as_ref()
            .map(|token| ProviderConfig::Cloudflare {
                api_token: token.clone(),
                zone_id: self.provider_zone_id.clone(),
                account_id: self.provider_account_id.clone(),
            });
        config
    }

    /// Tunnel mode derived from the environment
    fn tunnel_mode(&self) -> Result<TunnelMode> {
        if self.mode != "named" {
            return Ok(TunnelMode::Quick);
        }
        let tunnel_id = self.tunnel_id.clone().context("TUNNEL_ID is required")?;
        let credentials = self
            .credentials_file
            .clone()
            .context("TUNNEL_CREDENTIALS_FILE is required")?;

        let mut named = NamedTunnel::new(tunnel_id, credentials);
        if let Some(ref path) = self.config_file {
            named = named.with_config_file(path);
        }
        if let Some(ref hostname) = self.hostname {
            named = named.with_hostname(hostname);
        }
        Ok(TunnelMode::Named(named))
    }
}

/// Validate that a string is a valid domain name (RFC 1035 basics)
fn validate_domain_name(domain: &str) -> Result<()> {
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() {
        anyhow::bail!("Domain name cannot be empty");
    }
    if domain.len() > 253 {
        anyhow::bail!(
            "Domain name too long: {} chars (max 253). Got: {}",
            domain.len(),
            domain
        );
    }
    if !domain.contains('.') {
        anyhow::bail!("Domain name must have at least two labels. Got: '{}'", domain);
    }

    for label in domain.split('.') {
        if label.is_empty() {
            anyhow::bail!("Domain name has empty label: '{}'", domain);
        }
        if label.len() > 63 {
            anyhow::bail!(
                "Domain label too long: {} chars (max 63). Label: '{}'",
                label.len(),
                label
            );
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            anyhow::bail!(
                "Domain label contains invalid characters. Label: '{}'. \
                Valid: alphanumeric and hyphen only.",
                label
            );
        }
        if label.starts_with('-') || label.ends_with('-') {
            anyhow::bail!(
                "Domain label cannot start or end with hyphen. Label: '{}'",
                label
            );
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return TunnelExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return TunnelExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return TunnelExitCode::ConfigError.into();
    }

    info!(port = config.port, mode = %config.mode, "Starting tunneld daemon");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return TunnelExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        match run_daemon(config).await {
            Ok(()) => TunnelExitCode::CleanShutdown,
            Err(DaemonError::Config(e)) => {
                error!("Configuration error: {:#}", e);
                TunnelExitCode::ConfigError
            }
            Err(DaemonError::Runtime(e)) => {
                error!("Daemon error: {:#}", e);
                TunnelExitCode::RuntimeError
            }
        }
    });

    result.into()
}

/// Failure of the daemon, split by exit code
enum DaemonError {
    Config(anyhow::Error),
    Runtime(anyhow::Error),
}

/// Why the daemon stopped waiting
enum Shutdown {
    Signal(&'static str),
    TunnelExited(Option<i32>),
}

/// Run the daemon
async fn run_daemon(config: Config) -> std::result::Result<(), DaemonError> {
    let tunnel_config = config.tunnel_config();
    let mode = config.tunnel_mode().map_err(DaemonError::Config)?;

    let binary = tunnel_core::supervisor::resolve_executable(&tunnel_config)
        .map_err(|e| DaemonError::Config(e.into()))?;
    info!(binary = %binary.display(), "Using tunnel binary");

    let registry = ProviderRegistry::new();

    #[cfg(feature = "cloudflare")]
    {
        info!("Registering Cloudflare provider");
        tunnel_provider_cloudflare::register(&registry);
    }

    let reconciler = match (config.hostname.as_ref(), tunnel_config.provider.as_ref()) {
        (Some(_), Some(provider_config)) => {
            let budget = Arc::new(ApiBudget::from_config(&tunnel_config.dns));
            let provider = registry
                .create_provider(provider_config, budget)
                .map_err(|e| DaemonError::Config(e.into()))?;
            info!(provider = provider.provider_name(), "DNS provider ready");
            Some(Reconciler::new(provider, tunnel_config.dns.clone()))
        }
        _ => None,
    };

    let launcher = Arc::new(CommandLauncher::from_config(&tunnel_config.supervisor));
    let (manager, mut events) = TunnelManager::new(launcher, reconciler, tunnel_config)
        .map_err(|e| DaemonError::Config(e.into()))?;

    let handle = manager
        .establish_tunnel(config.port, mode, EstablishOptions::default())
        .await
        .map_err(|e| DaemonError::Runtime(e.into()))?;

    match handle.url() {
        Some(url) => info!(port = handle.port(), url, "Tunnel is up"),
        None => info!(port = handle.port(), "Tunnel is up"),
    }
    if let Some(outcome) = handle.dns() {
        info!(
            hostname = %outcome.hostname,
            decision = outcome.decision.label(),
            "Hostname routed to tunnel"
        );
    }

    let shutdown = tokio::select! {
        signal = wait_for_shutdown() => signal.map(Shutdown::Signal),
        code = wait_for_exit(&mut events) => Ok(Shutdown::TunnelExited(code)),
    };

    let teardown = manager.teardown_tunnel(handle).await;

    match shutdown.map_err(DaemonError::Runtime)? {
        Shutdown::Signal(signal) => {
            info!("Received shutdown signal: {}", signal);
            if let Err(e) = teardown {
                warn!(error = %e, "Teardown finished with errors");
            }
            info!("Shutting down daemon");
            Ok(())
        }
        Shutdown::TunnelExited(code) => Err(DaemonError::Runtime(anyhow::anyhow!(
            "Tunnel process exited unexpectedly (code {:?})",
            code
        ))),
    }
}

/// Wait until the manager reports that the tunnel process exited on its own
async fn wait_for_exit(events: &mut tokio::sync::mpsc::Receiver<TunnelEvent>) -> Option<i32> {
    while let Some(event) = events.recv().await {
        if let TunnelEvent::Exited { code, .. } = event {
            return code;
        }
    }
    // Channel closed without an exit event; keep waiting for a signal.
    std::future::pending().await
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let signal = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(signal)
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
