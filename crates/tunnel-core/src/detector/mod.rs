//! Signal detector
//!
//! Maps one line of tunnel output to at most one [`LogSignal`]. The tunnel
//! binary's log format is not a contract we control, so matching is done on
//! stable substrings and small extraction patterns rather than structured
//! parsing. New formats are handled by adding rules to the tables below (or at
//! runtime through [`SignalDetector::with_fatal_marker`] and
//! [`SignalDetector::with_connection_phrase`]); the state machine never changes.
//!
//! Precedence within one line: fatal error, then connection, then URL.
//! Fatal markers only apply to `ERR`/`FTL` lines and to lines without a level.

use regex::Regex;
use std::sync::OnceLock;

use crate::config::StartupConfig;
use crate::error::{Error, Result};

/// A classified event derived from tunnel output or process state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSignal {
    /// A public tunnel URL appeared in the output
    UrlDiscovered { url: String },
    /// An edge connection was registered; fields are best-effort
    ConnectionRegistered {
        index: Option<u32>,
        location: Option<String>,
    },
    /// The binary reported an unrecoverable condition
    FatalError { message: String },
    /// The process exited
    ProcessExited { code: Option<i32> },
}

/// Phrases announcing a registered edge connection (case-insensitive)
const CONNECTION_PHRASES: &[&str] = &["registered tunnel connection", "connection established"];

/// Lines mentioning connections that must never count as registrations
const CONNECTION_EXCLUSIONS: &[&str] = &[
    "unregistered",
    "unregister",
    "disconnect",
    "retrying",
    "failed",
    "error",
];

/// Info-level marker token
const INFO_MARKER: &str = "INF";

/// Level tokens of advisory lines; fatal markers never match these
const ADVISORY_LEVELS: &[&str] = &["DBG", "INF", "WRN"];

/// Level tokens the binary writes (`zerolog` console format)
const LEVEL_TOKENS: &[&str] = &["DBG", "INF", "WRN", "ERR", "FTL"];

/// Connection identifier token
const CONNECTION_ID_TOKEN: &str = "connindex=";

/// Fatal markers; every fragment of an entry must appear (case-insensitive)
const FATAL_MARKERS: &[&[&str]] = &[
    &["unauthorized"],
    &["authentication failed"],
    &["permission denied"],
    &["tunnel not found"],
    &["error parsing tunnel id"],
    &["failed to", "credentials"],
    &["failed to", "certificate"],
    &["failed to", "invalid tunnel secret"],
    &["failed to", "unmarshal"],
    &["failed to request quick tunnel"],
];

/// Subdomains under the quick-tunnel suffix that are API endpoints, not tunnels
const RESERVED_SUBDOMAINS: &[&str] = &["api", "www"];

fn conn_index_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Static pattern, verified by tests
        Regex::new(r"(?i)connIndex=(\d+)").unwrap()
    })
}

fn location_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Static pattern, verified by tests
        Regex::new(r"(?i)location=([a-z0-9_-]+)").unwrap()
    })
}

/// Stateless line classifier
#[derive(Debug, Clone)]
pub struct SignalDetector {
    url_pattern: Regex,
    fatal_markers: Vec<Vec<String>>,
    connection_phrases: Vec<String>,
}

impl SignalDetector {
    /// Create a detector for quick tunnel URLs under `url_suffix`
    pub fn new(url_suffix: &str) -> Result<Self> {
        let suffix = url_suffix.trim().trim_start_matches('.');
        if suffix.is_empty() {
            return Err(Error::config("Quick tunnel URL suffix cannot be empty"));
        }
        let url_pattern = Regex::new(&format!(
            r#"(?i)(?P<url>https://(?P<sub>(?:[a-z0-9-]+\.)*[a-z0-9-]+)\.{})(?P<path>/\S*)?(?:[\s|:"',]|$)"#,
            regex::escape(suffix)
        ))
        .map_err(|e| Error::config(format!("Invalid quick tunnel URL suffix: {}", e)))?;

        Ok(Self {
            url_pattern,
            fatal_markers: FATAL_MARKERS
                .iter()
                .map(|parts| parts.iter().map(|p| p.to_string()).collect())
                .collect(),
            connection_phrases: CONNECTION_PHRASES.iter().map(|p| p.to_string()).collect(),
        })
    }

    /// Create a detector from startup configuration
    pub fn from_config(config: &StartupConfig) -> Result<Self> {
        Self::new(&config.quick_url_suffix)
    }

    /// Add a fatal marker; every fragment must appear in the line
    pub fn with_fatal_marker<I, S>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let marker: Vec<String> = fragments
            .into_iter()
            .map(|f| f.into().to_lowercase())
            .collect();
        if !marker.is_empty() {
            self.fatal_markers.push(marker);
        }
        self
    }

    /// Add a phrase that announces a registered connection
    pub fn with_connection_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.connection_phrases.push(phrase.into().to_lowercase());
        self
    }

    /// Classify one line of output
    pub fn classify(&self, line: &str) -> Option<LogSignal> {
        let lower = line.to_lowercase();

        if self.is_fatal(line, &lower) {
            return Some(LogSignal::FatalError {
                message: line.trim().to_string(),
            });
        }

        if self.is_connection(line, &lower) {
            return Some(LogSignal::ConnectionRegistered {
                index: conn_index_pattern()
                    .captures(line)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse().ok()),
                location: location_pattern()
                    .captures(line)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string()),
            });
        }

        self.find_url(line)
            .map(|url| LogSignal::UrlDiscovered { url })
    }

    fn is_fatal(&self, line: &str, lower: &str) -> bool {
        if level(line).is_some_and(|lvl| ADVISORY_LEVELS.contains(&lvl)) {
            return false;
        }
        self.fatal_markers
            .iter()
            .any(|parts| parts.iter().all(|p| lower.contains(p.as_str())))
    }

    fn is_connection(&self, line: &str, lower: &str) -> bool {
        if CONNECTION_EXCLUSIONS.iter().any(|x| lower.contains(x)) {
            return false;
        }

        if self
            .connection_phrases
            .iter()
            .any(|p| lower.contains(p.as_str()))
        {
            return true;
        }

        let info_level = line.split_whitespace().any(|token| token == INFO_MARKER);
        info_level && lower.contains(CONNECTION_ID_TOKEN)
    }

    fn find_url(&self, line: &str) -> Option<String> {
        for caps in self.url_pattern.captures_iter(line) {
            let subdomain = caps.name("sub").map(|m| m.as_str()).unwrap_or_default();
            let has_path = caps.name("path").is_some_and(|m| m.as_str().len() > 1);
            if has_path || RESERVED_SUBDOMAINS.contains(&subdomain.to_lowercase().as_str()) {
                continue;
            }
            return caps.name("url").map(|m| m.as_str().to_lowercase());
        }
        None
    }
}

/// Level token of a line, looked up among its leading tokens
fn level(line: &str) -> Option<&str> {
    line.split_whitespace()
        .take(3)
        .find(|token| LEVEL_TOKENS.contains(token))
}
