// # DNS Provider Trait
//
// Defines the Zone/Record Client interface consumed by the reconciliation engine.
//
// ## Implementations
//
// - Cloudflare: `tunnel-provider-cloudflare` crate
//
// ## Usage
//
// ```rust,ignore
// use tunnel_core::DnsProvider;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let provider = /* DnsProvider implementation */;
//
//     let zone_id = provider.zone_id("app.example.com").await?;
//     let records = provider.list_records(&zone_id, "app.example.com").await?;
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::budget::ApiBudget;

/// DNS record type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// A record (IPv4)
    A,
    /// AAAA record (IPv6)
    Aaaa,
    /// CNAME record
    Cname,
    /// Any other type (TXT, MX, ...), carried through untouched
    Other(String),
}

impl RecordType {
    /// Parse the provider's type string; unknown types map to `Other`
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "A" => RecordType::A,
            "AAAA" => RecordType::Aaaa,
            "CNAME" => RecordType::Cname,
            other => RecordType::Other(other.to_string()),
        }
    }

    /// Wire name of the type
    pub fn as_str(&self) -> &str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Other(name) => name,
        }
    }

    /// A, AAAA and CNAME records compete for the same hostname
    pub fn is_address(&self) -> bool {
        matches!(self, RecordType::A | RecordType::Aaaa | RecordType::Cname)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as it exists at the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    /// Provider-assigned record ID
    pub id: String,
    /// Record type
    pub record_type: RecordType,
    /// Fully qualified record name
    pub name: String,
    /// Record target (IP address or hostname)
    pub content: String,
    /// Time-to-live (1 = automatic)
    pub ttl: u32,
    /// Whether traffic is proxied through the provider edge
    pub proxied: bool,
}

impl DnsRecord {
    /// The writable part of this record, used to restore it
    pub fn spec(&self) -> RecordSpec {
        RecordSpec {
            record_type: self.record_type.clone(),
            name: self.name.clone(),
            content: self.content.clone(),
            ttl: self.ttl,
            proxied: self.proxied,
        }
    }
}

/// The writable fields of a record (create/update payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSpec {
    pub record_type: RecordType,
    pub name: String,
    pub content: String,
    pub ttl: u32,
    pub proxied: bool,
}

impl RecordSpec {
    /// Create a record spec
    pub fn new(
        record_type: RecordType,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            record_type,
            name: name.into(),
            content: content.into(),
            ttl: 1,
            proxied: true,
        }
    }

    /// Set the TTL
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the proxied flag
    pub fn with_proxied(mut self, proxied: bool) -> Self {
        self.proxied = proxied;
        self
    }
}

/// Trait for DNS provider implementations
///
/// Each method performs one logical API operation and reports failures with
/// the engine's error taxonomy:
///
/// - `Error::ZoneNotFound`: the domain is not managed by this account
/// - `Error::Authorization`: token rejected or missing permission (never retried)
/// - `Error::RateLimited`: throttled, optionally with the provider's `Retry-After`
/// - `Error::NotFound`: the record ID no longer exists
/// - `Error::CrossAccountConflict`: the target is owned by another account
///
/// Providers do not retry and do not cache records. Retry policy and
/// conflict handling belong to the [`Reconciler`](crate::reconcile::Reconciler).
/// Providers do account every request against the shared
/// [`ApiBudget`] they were constructed with.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Resolve the ID of the zone that owns `hostname`
    async fn zone_id(&self, hostname: &str) -> Result<String, crate::Error>;

    /// List records in the zone whose name equals `name`
    async fn list_records(
        &self,
        zone_id: &str,
        name: &str,
    ) -> Result<Vec<DnsRecord>, crate::Error>;

    /// Create a record
    async fn create_record(
        &self,
        zone_id: &str,
        record: &RecordSpec,
    ) -> Result<DnsRecord, crate::Error>;

    /// Replace a record's writable fields, keeping its ID
    async fn update_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record: &RecordSpec,
    ) -> Result<DnsRecord, crate::Error>;

    /// Delete a record by ID
    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), crate::Error>;

    /// Get the provider name (for logging/debugging)
    fn provider_name(&self) -> &'static str;
}

/// Helper trait for constructing DNS providers from configuration
pub trait DnsProviderFactory: Send + Sync {
    /// Create a DnsProvider instance from configuration
    ///
    /// The budget is shared by every provider created for the same process,
    /// so concurrent attempts draw from one coordinated allowance.
    fn create(
        &self,
        config: &crate::config::ProviderConfig,
        budget: Arc<ApiBudget>,
    ) -> Result<Box<dyn DnsProvider>, crate::Error>;
}
