//! Hostname resolution over DNS-over-HTTPS with a TTL cache.
//!
//! # Resolution Flow
//!
//! ```text
//! host
//!   |
//!   +-- IP literal? ------------------> [ip]            (no cache, no network)
//!   |
//!   +-- fresh cache entry? -----------> cached addresses
//!   |
//!   +-- resolution disabled? ---------> []              (caller passes the name through)
//!   |
//!   +-- A lookup  ----+  (concurrent, each bounded by lookup_timeout,
//!   +-- AAAA lookup --+   failures degrade to [])
//!                     |
//!                     v
//!               A ++ AAAA --> cache if non-empty --> addresses
//! ```
//!
//! The cache is keyed by lowercased hostname. Entries are replaced on refresh,
//! expire lazily on lookup, and empty results are never stored.

use crate::{ProxyError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default public DoH endpoint speaking the JSON API.
pub const DEFAULT_DOH_URL: &str = "https://cloudflare-dns.com/dns-query";

/// DNS record family requested from the resolution service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        }
    }

    pub fn accepts(self, addr: &IpAddr) -> bool {
        match self {
            RecordType::A => addr.is_ipv4(),
            RecordType::Aaaa => addr.is_ipv6(),
        }
    }
}

/// Failure of a single lookup against the resolution service.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("DoH request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DoH response status {0}")]
    Status(u32),

    #[error("lookup timed out after {0:?}")]
    TimedOut(Duration),
}

pub type LookupFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<Vec<IpAddr>, LookupError>> + Send + 'a>>;

/// External name-resolution service.
pub trait DnsLookup: Send + Sync {
    /// Resolve `name` to addresses of the given record family.
    fn lookup<'a>(&'a self, name: &'a str, record: RecordType) -> LookupFuture<'a>;
}

/// Time-bounded store of resolution results.
///
/// The in-process [`MemoryResolutionStore`] is the default; a shared store
/// can be substituted without touching the pipeline.
pub trait ResolutionStore: Send + Sync {
    /// Unexpired, non-empty addresses for `host`, if any.
    fn get(&self, host: &str) -> Option<Vec<IpAddr>>;

    /// Replace the entry for `host`, expiring after `ttl`.
    fn set(&self, host: &str, addresses: Vec<IpAddr>, ttl: Duration);
}

#[derive(Debug, Clone)]
struct CacheEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
}

/// Process-local [`ResolutionStore`].
#[derive(Debug, Default)]
pub struct MemoryResolutionStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryResolutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including ones that expired but were not
    /// looked up since.
    pub fn len(&self) -> usize {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResolutionStore for MemoryResolutionStore {
    fn get(&self, host: &str) -> Option<Vec<IpAddr>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(host) {
            Some(entry) if entry.expires_at > Instant::now() && !entry.addresses.is_empty() => {
                Some(entry.addresses.clone())
            }
            Some(_) => {
                entries.remove(host);
                None
            }
            None => None,
        }
    }

    fn set(&self, host: &str, addresses: Vec<IpAddr>, ttl: Duration) {
        if addresses.is_empty() {
            return;
        }
        let entry = CacheEntry {
            addresses,
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host.to_string(), entry);
    }
}

/// JSON body returned by DoH endpoints (`application/dns-json`).
#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,

    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    data: String,
}

/// Keep the answers that are syntactically valid addresses of the requested family.
fn addresses_from_response(
    response: DohResponse,
    record: RecordType,
) -> std::result::Result<Vec<IpAddr>, LookupError> {
    if response.status != 0 {
        return Err(LookupError::Status(response.status));
    }
    Ok(response
        .answer
        .into_iter()
        .filter_map(|answer| answer.data.trim().parse::<IpAddr>().ok())
        .filter(|addr| record.accepts(addr))
        .collect())
}

/// DNS-over-HTTPS client using the JSON query API.
#[derive(Debug, Clone)]
pub struct DohClient {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl DohClient {
    /// Create a client for the given endpoint URL.
    ///
    /// # Errors
    /// * `ProxyError::InvalidDohUrl` - `endpoint` is not an absolute http(s) URL
    /// * `ProxyError::HttpClient` - the HTTP client could not be built
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = reqwest::Url::parse(endpoint).map_err(|e| ProxyError::InvalidDohUrl {
            url: endpoint.to_string(),
            message: e.to_string(),
        })?;
        if !matches!(endpoint.scheme(), "https" | "http") {
            return Err(ProxyError::InvalidDohUrl {
                url: endpoint.to_string(),
                message: "scheme must be http or https".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("connectgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ProxyError::HttpClient)?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }
}

impl DnsLookup for DohClient {
    fn lookup<'a>(&'a self, name: &'a str, record: RecordType) -> LookupFuture<'a> {
        Box::pin(async move {
            let mut url = self.endpoint.clone();
            url.query_pairs_mut()
                .append_pair("name", name)
                .append_pair("type", record.as_str());

            let response: DohResponse = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/dns-json")
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            addresses_from_response(response, record)
        })
    }
}

/// Resolution policy.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// When `false`, uncached hostnames resolve to an empty list.
    /// Default: `true`
    pub enabled: bool,

    /// DoH endpoint.
    /// Default: [`DEFAULT_DOH_URL`]
    pub doh_url: String,

    /// Bound on each individual A / AAAA lookup.
    /// Default: 3 seconds
    pub lookup_timeout: Duration,

    /// Lifetime of a cache entry.
    /// Default: 60 seconds
    pub cache_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            doh_url: DEFAULT_DOH_URL.to_string(),
            lookup_timeout: Duration::from_secs(3),
            cache_ttl: Duration::from_secs(60),
        }
    }
}

/// Resolves CONNECT hosts to candidate addresses.
#[derive(Clone)]
pub struct Resolver {
    config: ResolverConfig,
    lookup: Arc<dyn DnsLookup>,
    store: Arc<dyn ResolutionStore>,
}

impl Resolver {
    pub fn new(
        config: ResolverConfig,
        lookup: Arc<dyn DnsLookup>,
        store: Arc<dyn ResolutionStore>,
    ) -> Self {
        Self {
            config,
            lookup,
            store,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Whether uncached names are looked up at all.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Cached addresses for `host`, without triggering a lookup.
    pub fn cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.store.get(&normalize_host(host))
    }

    /// Resolve `host` to candidate addresses, IPv4 before IPv6.
    ///
    /// Never fails: lookup errors and timeouts yield an empty partial result.
    /// An empty return means "no candidates"; when resolution is disabled the
    /// caller is expected to pass the hostname through.
    pub async fn resolve(&self, host: &str) -> Vec<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }

        let name = normalize_host(host);
        if let Some(addresses) = self.store.get(&name) {
            debug!(host = %name, count = addresses.len(), "resolution cache hit");
            return addresses;
        }

        if !self.config.enabled {
            return Vec::new();
        }

        let (v4, v6) = tokio::join!(
            self.lookup_bounded(&name, RecordType::A),
            self.lookup_bounded(&name, RecordType::Aaaa),
        );
        let mut addresses = v4;
        addresses.extend(v6);

        if addresses.is_empty() {
            debug!(host = %name, "resolution returned no addresses");
        } else {
            self.store.set(&name, addresses.clone(), self.config.cache_ttl);
        }
        addresses
    }

    async fn lookup_bounded(&self, name: &str, record: RecordType) -> Vec<IpAddr> {
        let timeout = self.config.lookup_timeout;
        let outcome = match tokio::time::timeout(timeout, self.lookup.lookup(name, record)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(LookupError::TimedOut(timeout)),
        };
        outcome.unwrap_or_else(|e| {
            debug!(host = %name, record = record.as_str(), error = %e, "lookup failed");
            Vec::new()
        })
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Choose the address to dial: the first IPv4 candidate, else the first overall.
pub fn select_address(candidates: &[IpAddr]) -> Option<IpAddr> {
    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}
