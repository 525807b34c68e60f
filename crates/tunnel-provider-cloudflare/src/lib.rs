// # Cloudflare DNS Provider
//
// Cloudflare API v4 implementation of the `DnsProvider` trait used by the
// tunnel reconciliation engine.
//
// ## Behavior
//
// - One HTTP request per trait call (zone lookup may probe several names)
// - Every request first draws a slot from the shared `ApiBudget`
// - HTTP 429 records a cooldown in the budget and surfaces `RateLimited`
//   with the `Retry-After` delay
// - No retries and no record caching; both belong to the reconciler
// - Dry-run mode performs reads and logs writes without sending them
//
// ## Error Mapping
//
// | Response                               | Error                  |
// |----------------------------------------|------------------------|
// | 401, 403                               | `Authorization`        |
// | 404                                    | `NotFound`             |
// | 429                                    | `RateLimited`          |
// | error code 1014 / "Cross-User Banned"  | `CrossAccountConflict` |
// | 5xx                                    | `Http` (retriable)     |
// | anything else                          | `Http`                 |
//
// ## Security
//
// - API token NEVER appears in logs or `Debug` output
//
// ## API Reference
//
// - List Zones: GET `/zones?name=...`
// - List DNS Records: GET `/zones/:zone_id/dns_records?name=...`
// - Create DNS Record: POST `/zones/:zone_id/dns_records`
// - Update DNS Record: PUT `/zones/:zone_id/dns_records/:record_id`
// - Delete DNS Record: DELETE `/zones/:zone_id/dns_records/:record_id`

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tunnel_core::config::ProviderConfig;
use tunnel_core::traits::{DnsProvider, DnsProviderFactory, DnsRecord, RecordSpec, RecordType};
use tunnel_core::{ApiBudget, Error, Result};

/// Cloudflare API base URL
const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size for record listings
const RECORDS_PER_PAGE: u32 = 100;

/// Error code Cloudflare returns when a hostname is banned for this account
/// because it is bound to another account's tunnel
const CROSS_USER_BANNED_CODE: i64 = 1014;

/// Record-already-exists style error codes
const RECORD_CONFLICT_CODES: &[i64] = &[81053, 81057, 81058];

/// Environment variable that switches the provider to dry-run mode
pub const DNS_MODE_ENV: &str = "TUNNEL_DNS_MODE";

/// A record as returned by the API
#[derive(Debug, Deserialize)]
struct CfRecord {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: String,
    #[serde(default = "default_ttl")]
    ttl: u32,
    #[serde(default)]
    proxied: bool,
}

fn default_ttl() -> u32 {
    1
}

impl From<CfRecord> for DnsRecord {
    fn from(record: CfRecord) -> Self {
        DnsRecord {
            id: record.id,
            record_type: RecordType::parse(&record.record_type),
            name: record.name,
            content: record.content,
            ttl: record.ttl,
            proxied: record.proxied,
        }
    }
}

/// Cloudflare DNS provider
///
/// # Dry-Run Mode
///
/// When `dry_run` is true, the provider will:
/// - Perform all GET requests (zone lookup, record listing)
/// - Log the intended POST/PUT/DELETE payloads
/// - **NOT** modify DNS records; writes return synthesized records
///
/// # Security
///
/// The Debug implementation does NOT expose the API token.
pub struct CloudflareProvider {
    /// Cloudflare API token
    /// ⚠️ NEVER log this value
    api_token: String,

    /// Zone ID (optional, auto-detected from the hostname otherwise)
    zone_id: Option<String>,

    /// Account ID (optional, narrows zone lookup)
    account_id: Option<String>,

    client: reqwest::Client,

    base_url: String,

    dry_run: bool,

    /// Request budget shared with every other provider in the process
    budget: Arc<ApiBudget>,

    /// Counter for synthesized dry-run record IDs
    dry_run_ids: AtomicU64,
}

// Custom Debug implementation that hides the API token
impl std::fmt::Debug for CloudflareProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareProvider")
            .field("api_token", &"<REDACTED>")
            .field("zone_id", &self.zone_id)
            .field("account_id", &self.account_id)
            .field("base_url", &self.base_url)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl CloudflareProvider {
    /// Create a new Cloudflare provider
    ///
    /// # Parameters
    ///
    /// - `api_token`: Cloudflare API token with Zone:DNS:Edit permissions
    /// - `zone_id`: Optional zone ID (auto-detected when absent)
    /// - `account_id`: Optional account ID
    /// - `dry_run`: If true, perform reads but skip writes
    /// - `budget`: Request budget shared across the process
    pub fn new(
        api_token: impl Into<String>,
        zone_id: Option<String>,
        account_id: Option<String>,
        dry_run: bool,
        budget: Arc<ApiBudget>,
    ) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.trim().is_empty() {
            return Err(Error::config("Cloudflare API token cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("Failed to build HTTP client: {}", e), None))?;

        Ok(Self {
            api_token,
            zone_id: zone_id.filter(|z| !z.trim().is_empty()),
            account_id: account_id.filter(|a| !a.trim().is_empty()),
            client,
            base_url: CLOUDFLARE_API_BASE.to_string(),
            dry_run,
            budget,
            dry_run_ids: AtomicU64::new(0),
        })
    }

    /// Point the provider at another API endpoint (tests, API proxies)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Whether writes are only logged
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send one request and return the decoded envelope
    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        if let Err(wait) = self.budget.try_acquire() {
            tracing::debug!(operation = what, ?wait, "API budget exhausted");
            return Err(Error::rate_limited(
                format!("{}: local API budget exhausted", what),
                Some(wait),
            ));
        }

        let response = request
            .bearer_auth(&self.api_token)
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| Error::http(format!("{}: HTTP request failed: {}", what, e), None))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response".to_string());
        let json: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()))
        };

        let api_success = json.get("success").and_then(Value::as_bool).unwrap_or(true);
        if status.is_success() && api_success {
            return Ok(json);
        }

        Err(self.map_error(status.as_u16(), &json, retry_after, what))
    }

    /// Map a failed response onto the engine's error taxonomy
    fn map_error(
        &self,
        status: u16,
        body: &Value,
        retry_after: Option<Duration>,
        what: &str,
    ) -> Error {
        let errors: Vec<(i64, String)> = body["errors"]
            .as_array()
            .map(|errors| {
                errors
                    .iter()
                    .map(|e| {
                        (
                            e["code"].as_i64().unwrap_or_default(),
                            e["message"].as_str().unwrap_or_default().to_string(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let detail = if errors.is_empty() {
            match body {
                Value::String(text) => text.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            }
        } else {
            errors
                .iter()
                .map(|(code, message)| format!("{}: {}", code, message))
                .collect::<Vec<_>>()
                .join("; ")
        };
        let message = format!("{} failed (status {}): {}", what, status, detail);

        let cross_account = errors.iter().any(|(code, message)| {
            *code == CROSS_USER_BANNED_CODE || message.to_lowercase().contains("cross-user banned")
        });
        if cross_account {
            return Error::cross_account(message);
        }

        if errors.iter().any(|(code, _)| RECORD_CONFLICT_CODES.contains(code)) {
            return Error::http(message, Some(409));
        }

        match status {
            401 | 403 => Error::auth(message),
            404 => Error::not_found(message),
            429 => {
                self.budget.record_throttle(retry_after);
                Error::rate_limited(message, retry_after)
            }
            _ => Error::http(message, Some(status)),
        }
    }

    fn parse_record(json: &Value) -> Result<DnsRecord> {
        let record: CfRecord = serde_json::from_value(json.clone())?;
        Ok(record.into())
    }

    fn record_payload(record: &RecordSpec) -> Value {
        let mut payload = serde_json::json!({
            "type": record.record_type.as_str(),
            "name": record.name,
            "content": record.content,
            "ttl": record.ttl,
        });
        if record.record_type.is_address() {
            payload["proxied"] = Value::Bool(record.proxied);
        }
        payload
    }

    fn synthesized(&self, id: Option<&str>, record: &RecordSpec) -> DnsRecord {
        let id = match id {
            Some(id) => id.to_string(),
            None => format!(
                "dry-run-{}",
                self.dry_run_ids.fetch_add(1, Ordering::Relaxed) + 1
            ),
        };
        DnsRecord {
            id,
            record_type: record.record_type.clone(),
            name: record.name.clone(),
            content: record.content.clone(),
            ttl: record.ttl,
            proxied: record.proxied,
        }
    }
}

/// Candidate zone names for a hostname, most specific first, down to two labels
fn zone_candidates(hostname: &str) -> Vec<String> {
    let hostname = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = hostname.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return Vec::new();
    }
    (0..=labels.len() - 2)
        .map(|start| labels[start..].join("."))
        .collect()
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    async fn zone_id(&self, hostname: &str) -> Result<String> {
        if let Some(ref zone_id) = self.zone_id {
            tracing::debug!("Using pre-configured zone ID");
            return Ok(zone_id.clone());
        }

        let candidates = zone_candidates(hostname);
        if candidates.is_empty() {
            return Err(Error::zone_not_found(format!(
                "'{}' is not a valid hostname",
                hostname
            )));
        }

        for candidate in &candidates {
            let mut query = vec![("name", candidate.as_str())];
            if let Some(ref account_id) = self.account_id {
                query.push(("account.id", account_id.as_str()));
            }
            let request = self.client.get(self.url("/zones")).query(&query);
            let json = self.send(request, "Zone lookup").await?;

            if let Some(id) = json["result"]
                .as_array()
                .and_then(|zones| zones.first())
                .and_then(|zone| zone["id"].as_str())
            {
                tracing::debug!(hostname, zone = %candidate, zone_id = id, "Found zone");
                return Ok(id.to_string());
            }
        }

        Err(Error::zone_not_found(format!(
            "No zone managed by this account contains '{}'",
            hostname
        )))
    }

    async fn list_records(&self, zone_id: &str, name: &str) -> Result<Vec<DnsRecord>> {
        let path = format!("/zones/{}/dns_records", zone_id);
        let per_page = RECORDS_PER_PAGE.to_string();
        let mut records = Vec::new();
        let mut page: u32 = 1;

        loop {
            let page_param = page.to_string();
            let request = self.client.get(self.url(&path)).query(&[
                ("name", name),
                ("per_page", per_page.as_str()),
                ("page", page_param.as_str()),
            ]);
            let json = self.send(request, "Record listing").await?;

            let result = json["result"].as_array().ok_or_else(|| {
                Error::http("Invalid response format: result is not an array", None)
            })?;
            for item in result {
                records.push(Self::parse_record(item)?);
            }

            let total_pages = json["result_info"]["total_pages"].as_u64().unwrap_or(1);
            if u64::from(page) >= total_pages || result.is_empty() {
                break;
            }
            page += 1;
        }

        tracing::debug!(name, count = records.len(), "Listed DNS records");
        Ok(records)
    }

    async fn create_record(&self, zone_id: &str, record: &RecordSpec) -> Result<DnsRecord> {
        let payload = Self::record_payload(record);

        if self.dry_run {
            tracing::info!(zone_id, %payload, "[DRY-RUN] Would create DNS record");
            return Ok(self.synthesized(None, record));
        }

        let path = format!("/zones/{}/dns_records", zone_id);
        let request = self.client.post(self.url(&path)).json(&payload);
        let json = self.send(request, "Record creation").await?;
        Self::parse_record(&json["result"])
    }

    async fn update_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record: &RecordSpec,
    ) -> Result<DnsRecord> {
        let payload = Self::record_payload(record);

        if self.dry_run {
            tracing::info!(zone_id, record_id, %payload, "[DRY-RUN] Would update DNS record");
            return Ok(self.synthesized(Some(record_id), record));
        }

        let path = format!("/zones/{}/dns_records/{}", zone_id, record_id);
        let request = self.client.put(self.url(&path)).json(&payload);
        let json = self.send(request, "Record update").await?;
        Self::parse_record(&json["result"])
    }

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!(zone_id, record_id, "[DRY-RUN] Would delete DNS record");
            return Ok(());
        }

        let path = format!("/zones/{}/dns_records/{}", zone_id, record_id);
        let request = self.client.delete(self.url(&path));
        self.send(request, "Record deletion").await?;
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "cloudflare"
    }
}

/// Factory for creating Cloudflare providers
pub struct CloudflareFactory;

impl DnsProviderFactory for CloudflareFactory {
    fn create(&self, config: &ProviderConfig, budget: Arc<ApiBudget>) -> Result<Box<dyn DnsProvider>> {
        match config {
            ProviderConfig::Cloudflare {
                api_token,
                zone_id,
                account_id,
            } => {
                let dry_run = std::env::var(DNS_MODE_ENV)
                    .unwrap_or_default()
                    .eq_ignore_ascii_case("dry-run");

                if dry_run {
                    tracing::warn!("Cloudflare provider running in DRY-RUN mode - no changes will be made");
                }

                Ok(Box::new(CloudflareProvider::new(
                    api_token.clone(),
                    zone_id.clone(),
                    account_id.clone(),
                    dry_run,
                    budget,
                )?))
            }
            _ => Err(Error::config("Invalid config for Cloudflare provider")),
        }
    }
}

/// Register the Cloudflare provider with a registry
///
/// # Example
///
/// ```rust
/// use tunnel_core::ProviderRegistry;
///
/// let registry = ProviderRegistry::new();
/// tunnel_provider_cloudflare::register(&registry);
/// assert!(registry.has_provider("cloudflare"));
/// ```
pub fn register(registry: &tunnel_core::ProviderRegistry) {
    registry.register_provider("cloudflare", Box::new(CloudflareFactory));
}
