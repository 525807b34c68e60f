//! Configuration types for the tunnel engine
//!
//! Every section carries serde defaults so a partial document (or none at all)
//! yields a working configuration. Call [`TunnelConfig::validate`] before use.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Explicit path to the tunnel binary (skips `PATH` lookup)
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Executable name searched on `PATH` when `binary` is unset
    #[serde(default = "default_binary_name")]
    pub binary_name: String,

    /// Startup detection settings
    #[serde(default)]
    pub startup: StartupConfig,

    /// Child process settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// DNS reconciliation settings
    #[serde(default)]
    pub dns: DnsConfig,

    /// DNS provider configuration (required for named tunnels with a hostname)
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
}

impl TunnelConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            binary: None,
            binary_name: default_binary_name(),
            startup: StartupConfig::default(),
            supervisor: SupervisorConfig::default(),
            dns: DnsConfig::default(),
            provider: None,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.binary.is_none() && self.binary_name.trim().is_empty() {
            return Err(crate::Error::config(
                "Either a binary path or a binary name is required",
            ));
        }

        self.startup.validate()?;
        self.supervisor.validate()?;
        self.dns.validate()?;

        if let Some(ref provider) = self.provider {
            provider.validate()?;
        }

        Ok(())
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Startup state machine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Seconds to wait for readiness before the attempt times out
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Distinct edge connections required to declare readiness
    ///
    /// One registered connection is already serviceable, so the default
    /// resolves early rather than waiting for the full set.
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Window in which index-less registration lines count only once
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,

    /// Output lines kept for failure diagnostics
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Host suffix of provider-assigned quick tunnel URLs
    #[serde(default = "default_quick_url_suffix")]
    pub quick_url_suffix: String,
}

impl StartupConfig {
    /// Deadline as a [`Duration`]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Deduplication window as a [`Duration`]
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    /// Validate the startup configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.deadline_secs == 0 {
            return Err(crate::Error::config("Startup deadline must be > 0"));
        }
        if self.min_connections == 0 {
            return Err(crate::Error::config("Minimum connection quorum must be >= 1"));
        }
        if self.log_tail_lines == 0 {
            return Err(crate::Error::config("Log tail must keep at least one line"));
        }
        if self.quick_url_suffix.trim().is_empty() {
            return Err(crate::Error::config("Quick tunnel URL suffix cannot be empty"));
        }
        Ok(())
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            min_connections: default_min_connections(),
            dedup_window_ms: default_dedup_window_ms(),
            log_tail_lines: default_log_tail_lines(),
            quick_url_suffix: default_quick_url_suffix(),
        }
    }
}

/// Child process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds between the graceful stop request and a forced kill
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Pass `--no-autoupdate` to the tunnel binary
    #[serde(default = "default_true")]
    pub no_autoupdate: bool,
}

impl SupervisorConfig {
    /// Grace period as a [`Duration`]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Validate the supervisor configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.grace_period_secs > 300 {
            return Err(crate::Error::config(format!(
                "Grace period must be at most 300 seconds. Got: {}",
                self.grace_period_secs
            )));
        }
        Ok(())
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            no_autoupdate: true,
        }
    }
}

/// DNS reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Host suffix that named tunnel CNAME targets live under
    #[serde(default = "default_tunnel_target_suffix")]
    pub tunnel_target_suffix: String,

    /// TTL for created records (1 = provider "automatic")
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Whether created records are proxied through the provider edge
    #[serde(default = "default_true")]
    pub proxied: bool,

    /// Bounded retries for rate-limited or transient provider calls
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: usize,

    /// Base delay of the exponential retry backoff
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Requests allowed per budget window, shared by every reconciliation
    #[serde(default = "default_api_budget_per_window")]
    pub api_budget_per_window: u32,

    /// Length of the budget window
    #[serde(default = "default_api_budget_window_secs")]
    pub api_budget_window_secs: u64,
}

impl DnsConfig {
    /// Base retry delay as a [`Duration`]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Validate the DNS configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.tunnel_target_suffix.trim().is_empty() {
            return Err(crate::Error::config("Tunnel target suffix cannot be empty"));
        }
        if self.max_rate_limit_retries > 10 {
            return Err(crate::Error::config(format!(
                "Rate limit retries must be between 0 and 10. Got: {}",
                self.max_rate_limit_retries
            )));
        }
        if self.api_budget_per_window == 0 || self.api_budget_window_secs == 0 {
            return Err(crate::Error::config("API budget and its window must be > 0"));
        }
        Ok(())
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            tunnel_target_suffix: default_tunnel_target_suffix(),
            ttl: default_ttl(),
            proxied: true,
            max_rate_limit_retries: default_max_rate_limit_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            api_budget_per_window: default_api_budget_per_window(),
            api_budget_window_secs: default_api_budget_window_secs(),
        }
    }
}

/// DNS provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Cloudflare provider
    Cloudflare {
        /// Cloudflare API token
        api_token: String,
        /// Zone ID (optional, can be auto-detected)
        zone_id: Option<String>,
        /// Account ID (optional)
        account_id: Option<String>,
    },

    /// Custom provider
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl ProviderConfig {
    /// Validate the provider configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            ProviderConfig::Cloudflare { api_token, .. } => {
                if api_token.is_empty() {
                    return Err(crate::Error::config("Cloudflare API token cannot be empty"));
                }
                Ok(())
            }
            ProviderConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom provider factory cannot be empty",
                    ));
                }
                if config.is_null() {
                    return Err(crate::Error::config(
                        "Custom provider config cannot be null",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Get the provider type name
    pub fn type_name(&self) -> &str {
        match self {
            ProviderConfig::Cloudflare { .. } => "cloudflare",
            ProviderConfig::Custom { factory, .. } => factory,
        }
    }
}

fn default_binary_name() -> String {
    "cloudflared".to_string()
}

fn default_deadline_secs() -> u64 {
    60
}

fn default_min_connections() -> usize {
    1
}

fn default_dedup_window_ms() -> u64 {
    500
}

fn default_log_tail_lines() -> usize {
    50
}

fn default_quick_url_suffix() -> String {
    "trycloudflare.com".to_string()
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_tunnel_target_suffix() -> String {
    "cfargotunnel.com".to_string()
}

fn default_ttl() -> u32 {
    1
}

fn default_max_rate_limit_retries() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_api_budget_per_window() -> u32 {
    1200
}

fn default_api_budget_window_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}
