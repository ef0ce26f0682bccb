//! DNS-over-HTTPS resolution (RFC 8484 wire format).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::RwLock;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::resolver::{DnsResolver, answer_strings, build_query};
use crate::cache::{DnsCache, MokaCache};
use crate::config::DnsSettings;
use crate::error::Error;

const DNS_MESSAGE: &str = "application/dns-message";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const NEXTDNS_BASE: &str = "https://dns.nextdns.io";

/// Known DNS-over-HTTPS providers.
///
/// Unknown names read from settings fall back to Cloudflare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum DohProvider {
    #[default]
    Cloudflare,
    CloudflareSecurity,
    Quad9,
    Quad9Ecs,
    Google,
    Adguard,
    AdguardFamily,
    NextDns,
    Custom,
}

impl DohProvider {
    /// Providers with a fixed public endpoint.
    pub const PUBLIC: [Self; 7] = [
        Self::Cloudflare,
        Self::CloudflareSecurity,
        Self::Quad9,
        Self::Quad9Ecs,
        Self::Google,
        Self::Adguard,
        Self::AdguardFamily,
    ];

    pub const fn id(self) -> &'static str {
        match self {
            Self::Cloudflare => "cloudflare",
            Self::CloudflareSecurity => "cloudflare_security",
            Self::Quad9 => "quad9",
            Self::Quad9Ecs => "quad9_ecs",
            Self::Google => "google",
            Self::Adguard => "adguard",
            Self::AdguardFamily => "adguard_family",
            Self::NextDns => "nextdns",
            Self::Custom => "custom",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Cloudflare => "Cloudflare (1.1.1.1)",
            Self::CloudflareSecurity => "Cloudflare Security",
            Self::Quad9 => "Quad9 (9.9.9.9)",
            Self::Quad9Ecs => "Quad9 with ECS",
            Self::Google => "Google DNS (8.8.8.8)",
            Self::Adguard => "AdGuard DNS",
            Self::AdguardFamily => "AdGuard Family",
            Self::NextDns => "NextDNS (Personal)",
            Self::Custom => "Custom server",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Cloudflare => "Fast and privacy-focused",
            Self::CloudflareSecurity => "Blocks malware and phishing",
            Self::Quad9 => "Security and privacy focused",
            Self::Quad9Ecs => "With EDNS Client Subnet",
            Self::Google => "Fast and reliable",
            Self::Adguard => "Blocks ads and trackers",
            Self::AdguardFamily => "Blocks ads, trackers, and adult content",
            Self::NextDns => "Your NextDNS profile",
            Self::Custom => "User-provided endpoint",
        }
    }

    /// Fixed endpoint, `None` for NextDNS and custom servers.
    pub const fn endpoint(self) -> Option<&'static str> {
        match self {
            Self::Cloudflare => Some("https://cloudflare-dns.com/dns-query"),
            Self::CloudflareSecurity => Some("https://security.cloudflare-dns.com/dns-query"),
            Self::Quad9 => Some("https://dns.quad9.net/dns-query"),
            Self::Quad9Ecs => Some("https://dns11.quad9.net/dns-query"),
            Self::Google => Some("https://dns.google/dns-query"),
            Self::Adguard => Some("https://dns.adguard.com/dns-query"),
            Self::AdguardFamily => Some("https://dns-family.adguard.com/dns-query"),
            Self::NextDns | Self::Custom => None,
        }
    }
}

impl From<&str> for DohProvider {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "cloudflare_security" => Self::CloudflareSecurity,
            "quad9" => Self::Quad9,
            "quad9_ecs" => Self::Quad9Ecs,
            "google" => Self::Google,
            "adguard" => Self::Adguard,
            "adguard_family" => Self::AdguardFamily,
            "nextdns" => Self::NextDns,
            "custom" => Self::Custom,
            _ => Self::Cloudflare,
        }
    }
}

impl From<String> for DohProvider {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<DohProvider> for &'static str {
    fn from(value: DohProvider) -> Self {
        value.id()
    }
}

impl fmt::Display for DohProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// A row of the provider picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub url: String,
}

/// Outcome of a provider connectivity test.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTest {
    pub success: bool,
    pub latency_ms: f64,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DohError {
    #[error("DNS-over-HTTPS is disabled")]
    Disabled,

    #[error("no endpoint configured for provider {0}")]
    NoEndpoint(DohProvider),

    #[error("invalid DNS message: {0}")]
    Protocol(#[from] hickory_proto::ProtoError),

    #[error("DoH server {url} answered HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("timeout querying {url}")]
    Timeout { url: String },

    #[error("network error querying {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to create HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

#[derive(Debug, Clone)]
struct DohState {
    enabled: bool,
    provider: DohProvider,
    custom_server: String,
    nextdns_profile: String,
}

impl DohState {
    fn url_for(&self, provider: DohProvider) -> Option<String> {
        match provider {
            DohProvider::Custom => {
                Some(self.custom_server.clone()).filter(|url| !url.is_empty())
            }
            DohProvider::NextDns if !self.nextdns_profile.is_empty() => {
                Some(format!("{NEXTDNS_BASE}/{}", self.nextdns_profile))
            }
            DohProvider::NextDns => DohProvider::Cloudflare.endpoint().map(str::to_string),
            fixed => fixed.endpoint().map(str::to_string),
        }
    }
}

/// DNS-over-HTTPS resolver.
///
/// Clones share the HTTP client, settings and cache.
#[derive(Clone)]
pub struct DohResolver<C: DnsCache = MokaCache> {
    client: Client,
    state: Arc<RwLock<DohState>>,
    cache: C,
}

impl DohResolver<MokaCache> {
    /// Create a resolver with a Moka cache expiring after
    /// `dns.cache_ttl_seconds`.
    pub fn new(settings: &DnsSettings, nextdns_profile: &str) -> Result<Self, DohError> {
        let cache = MokaCache::with_capacity(
            Duration::from_secs(settings.cache_ttl_seconds),
            10_000,
        );
        Self::with_cache(settings, nextdns_profile, cache)
    }
}

impl<C: DnsCache> DohResolver<C> {
    pub fn with_cache(
        settings: &DnsSettings,
        nextdns_profile: &str,
        cache: C,
    ) -> Result<Self, DohError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(crate::blocklist::remote::USER_AGENT)
            .build()
            .map_err(DohError::ClientBuild)?;

        Ok(Self {
            client,
            state: Arc::new(RwLock::new(DohState {
                enabled: settings.enabled,
                provider: settings.provider,
                custom_server: settings.custom_server.clone(),
                nextdns_profile: nextdns_profile.to_string(),
            })),
            cache,
        })
    }

    /// Apply new settings. Changing the provider drops cached answers.
    pub fn apply_settings(&self, settings: &DnsSettings, nextdns_profile: &str) {
        let mut state = self.state.write();
        let provider_changed = state.provider != settings.provider
            || state.custom_server != settings.custom_server
            || state.nextdns_profile != nextdns_profile;

        state.enabled = settings.enabled;
        state.provider = settings.provider;
        state.custom_server.clone_from(&settings.custom_server);
        state.nextdns_profile = nextdns_profile.to_string();
        drop(state);

        if provider_changed {
            self.cache.clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn provider(&self) -> DohProvider {
        self.state.read().provider
    }

    /// Endpoint of the configured provider.
    ///
    /// NextDNS without a profile uses Cloudflare. A custom provider with an
    /// empty server has no endpoint.
    pub fn provider_url(&self) -> Option<String> {
        let state = self.state.read();
        state.url_for(state.provider)
    }

    /// Resolve `domain` and return the answers of `record_type`.
    ///
    /// Answers are cached per name and type.
    ///
    /// # Errors
    ///
    /// Returns [`DohError::Disabled`] when `dns.enabled` is off, or the
    /// transport error when the provider cannot be reached.
    pub async fn lookup(
        &self,
        domain: &str,
        record_type: RecordType,
    ) -> Result<Vec<String>, DohError> {
        if !self.is_enabled() {
            return Err(DohError::Disabled);
        }

        let key = (Name::from_str(domain)?, record_type);
        if let Some(cached) = self.cache.get(&key).await {
            tracing::trace!(domain, ?record_type, "DoH cache hit");
            return Ok(answer_strings(&cached, record_type));
        }

        let url = self
            .provider_url()
            .ok_or_else(|| DohError::NoEndpoint(self.provider()))?;
        let query = build_query(domain, record_type).map_err(protocol_error)?;
        let response = self.exchange(&url, &query).await?;

        let answers = answer_strings(&response, record_type);
        tracing::debug!(domain, ?record_type, ?answers, "DoH resolved");
        self.cache.insert(key, response).await;
        Ok(answers)
    }

    /// Resolve `google.com` through `provider`, bypassing the cache.
    ///
    /// Works whether or not DNS-over-HTTPS is enabled, so a provider can be
    /// tried before switching to it.
    pub async fn test_provider(&self, provider: DohProvider) -> ProviderTest {
        let Some(url) = self.state.read().url_for(provider) else {
            return ProviderTest {
                success: false,
                latency_ms: 0.0,
                message: "No endpoint configured".to_string(),
            };
        };

        let started = Instant::now();
        let outcome = match build_query("google.com", RecordType::A) {
            Ok(query) => self.exchange(&url, &query).await,
            Err(err) => Err(protocol_error(err)),
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(response) if !answer_strings(&response, RecordType::A).is_empty() => ProviderTest {
                success: true,
                latency_ms,
                message: format!("Success ({latency_ms:.0}ms)"),
            },
            Ok(_) => ProviderTest {
                success: false,
                latency_ms: 0.0,
                message: "No response".to_string(),
            },
            Err(err) => ProviderTest {
                success: false,
                latency_ms: 0.0,
                message: format!("Error: {err}"),
            },
        }
    }

    /// The public providers, plus NextDNS when a profile is configured.
    pub fn available_providers(&self) -> Vec<ProviderInfo> {
        let state = self.state.read();
        let mut providers: Vec<ProviderInfo> = DohProvider::PUBLIC
            .iter()
            .map(|provider| ProviderInfo {
                id: provider.id(),
                name: provider.display_name(),
                description: provider.description(),
                url: provider.endpoint().unwrap_or_default().to_string(),
            })
            .collect();

        if !state.nextdns_profile.is_empty() {
            providers.push(ProviderInfo {
                id: DohProvider::NextDns.id(),
                name: DohProvider::NextDns.display_name(),
                description: DohProvider::NextDns.description(),
                url: format!("{NEXTDNS_BASE}/{}", state.nextdns_profile),
            });
        }

        providers
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        tracing::info!("DoH cache cleared");
    }

    pub fn cached_entries(&self) -> u64 {
        self.cache.entry_count()
    }

    async fn exchange(&self, url: &str, query: &Message) -> Result<Message, DohError> {
        let body = query.to_bytes()?;

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(body)
            .send()
            .await
            .map_err(|err| transport_error(url, err))?;

        if !response.status().is_success() {
            metrics::counter!("defensiq_doh_queries_total", "outcome" => "http_error").increment(1);
            return Err(DohError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| transport_error(url, err))?;
        let message = Message::from_bytes(&bytes)?;

        metrics::counter!("defensiq_doh_queries_total", "outcome" => "ok").increment(1);
        Ok(message)
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> DohError {
    metrics::counter!("defensiq_doh_queries_total", "outcome" => "network_error").increment(1);
    if err.is_timeout() {
        DohError::Timeout {
            url: url.to_string(),
        }
    } else {
        DohError::Network {
            url: url.to_string(),
            source: err,
        }
    }
}

fn protocol_error(err: Error) -> DohError {
    match err {
        Error::Protocol(proto) => DohError::Protocol(proto),
        other => DohError::Protocol(hickory_proto::ProtoError::from(other.to_string())),
    }
}

impl<C: DnsCache> DnsResolver for DohResolver<C> {
    async fn resolve(&self, query: &Message) -> crate::error::Result<Message> {
        let url = self
            .provider_url()
            .ok_or_else(|| Error::Resolver(DohError::NoEndpoint(self.provider()).to_string()))?;
        self.exchange(&url, query)
            .await
            .map_err(|err| Error::Resolver(err.to_string()))
    }
}
