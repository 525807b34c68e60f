//! Error types for the tunnel engine
//!
//! Every failure the engine can surface is a variant of [`Error`]. Each variant
//! maps onto a stable taxonomy tag ([`ErrorKind`]) so callers can log and branch
//! on the precise reason without matching on message text.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for tunnel engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Diagnostics captured when a startup attempt does not reach `Ready`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureContext {
    /// The most recent output lines of the tunnel process, oldest first
    pub last_lines: Vec<String>,
    /// Exit code of the process, if it exited on its own
    pub exit_code: Option<i32>,
}

impl FailureContext {
    /// Render the captured tail as a single block for logging
    pub fn tail(&self) -> String {
        self.last_lines.join("\n")
    }
}

/// Core error type for the tunnel engine
#[derive(Error, Debug)]
pub enum Error {
    /// The tunnel binary is missing or could not be launched
    #[error("Failed to launch tunnel binary: {0}")]
    Spawn(String),

    /// The startup deadline elapsed before the tunnel became ready
    #[error("Tunnel did not become ready within {after:?}")]
    DetectionTimeout {
        after: Duration,
        context: FailureContext,
    },

    /// The tunnel binary logged an unrecoverable condition
    #[error("Tunnel reported a fatal error: {message}")]
    FatalLogSignal {
        message: String,
        context: FailureContext,
    },

    /// The tunnel process exited before becoming ready
    #[error("Tunnel process exited before becoming ready (exit code: {code:?})")]
    ProcessExited {
        code: Option<i32>,
        context: FailureContext,
    },

    /// The caller cancelled the attempt
    #[error("Tunnel attempt cancelled")]
    Cancelled { context: FailureContext },

    /// Another attempt already owns the local port
    #[error("Port {0} already has an active tunnel attempt")]
    PortBusy(u16),

    /// The hostname's domain is not managed by the configured account
    #[error("Zone not found: {0}")]
    ZoneNotFound(String),

    /// Credentials were rejected or lack a required permission
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// The DNS provider asked us to slow down
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// More than one record (or an unrecognized record) occupies the hostname
    #[error("Ambiguous DNS state: {0}")]
    AmbiguousDnsState(String),

    /// The desired target belongs to a tunnel registered under another account
    #[error("Cross-account conflict: {0}")]
    CrossAccountConflict(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP errors from provider APIs
    #[error("HTTP error: {message}")]
    Http {
        message: String,
        status: Option<u16>,
    },

    /// Local I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Structured taxonomy tag for [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Spawn,
    DetectionTimeout,
    FatalLogSignal,
    ProcessExited,
    Cancelled,
    PortBusy,
    ZoneNotFound,
    Authorization,
    RateLimited,
    AmbiguousDnsState,
    CrossAccountConflict,
    NotFound,
    Config,
    Http,
    Io,
    Json,
    Other,
}

impl ErrorKind {
    /// Stable tag string used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Spawn => "SpawnError",
            ErrorKind::DetectionTimeout => "DetectionTimeout",
            ErrorKind::FatalLogSignal => "FatalLogSignal",
            ErrorKind::ProcessExited => "ProcessExited",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::PortBusy => "PortBusy",
            ErrorKind::ZoneNotFound => "ZoneNotFound",
            ErrorKind::Authorization => "AuthorizationError",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::AmbiguousDnsState => "AmbiguousDnsState",
            ErrorKind::CrossAccountConflict => "CrossAccountConflict",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Http => "HttpError",
            ErrorKind::Io => "IoError",
            ErrorKind::Json => "JsonError",
            ErrorKind::Other => "Other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an authorization error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limited(msg: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: msg.into(),
            retry_after,
        }
    }

    /// Create a "zone not found" error
    pub fn zone_not_found(msg: impl Into<String>) -> Self {
        Self::ZoneNotFound(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an ambiguous DNS state error
    pub fn ambiguous(msg: impl Into<String>) -> Self {
        Self::AmbiguousDnsState(msg.into())
    }

    /// Create a cross-account conflict error
    pub fn cross_account(msg: impl Into<String>) -> Self {
        Self::CrossAccountConflict(msg.into())
    }

    /// Create an HTTP error, optionally carrying the response status
    pub fn http(msg: impl Into<String>, status: Option<u16>) -> Self {
        Self::Http {
            message: msg.into(),
            status,
        }
    }

    /// The taxonomy tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Spawn(_) => ErrorKind::Spawn,
            Error::DetectionTimeout { .. } => ErrorKind::DetectionTimeout,
            Error::FatalLogSignal { .. } => ErrorKind::FatalLogSignal,
            Error::ProcessExited { .. } => ErrorKind::ProcessExited,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::PortBusy(_) => ErrorKind::PortBusy,
            Error::ZoneNotFound(_) => ErrorKind::ZoneNotFound,
            Error::Authorization(_) => ErrorKind::Authorization,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::AmbiguousDnsState(_) => ErrorKind::AmbiguousDnsState,
            Error::CrossAccountConflict(_) => ErrorKind::CrossAccountConflict,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Config(_) => ErrorKind::Config,
            Error::Http { .. } => ErrorKind::Http,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) => ErrorKind::Json,
            Error::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether repeating the same call later may succeed
    ///
    /// Only provider throttling and provider-side 5xx responses qualify.
    /// Detection failures are never resumed; a caller retries with a fresh attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::RateLimited { .. } => true,
            Error::Http {
                status: Some(status),
                ..
            } => (500..=599).contains(status),
            _ => false,
        }
    }

    /// Delay the provider asked for, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Startup diagnostics, for errors produced by a failed attempt
    pub fn context(&self) -> Option<&FailureContext> {
        match self {
            Error::DetectionTimeout { context, .. }
            | Error::FatalLogSignal { context, .. }
            | Error::ProcessExited { context, .. }
            | Error::Cancelled { context } => Some(context),
            _ => None,
        }
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
