//! NextDNS cloud denylist client.
//!
//! The denylist of the configured profile can be pulled into the local
//! blocklist under the `nextdns` category, and domains can be pushed to it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::blocklist::{Category, Entry};
use crate::config::ConfigStore;
use crate::events::{EventLog, EventType};

pub const API_BASE: &str = "https://api.nextdns.io";
pub const SOURCE: &str = "nextdns";

const PROFILE_ID_LEN: usize = 6;
const CACHE_MAX_AGE: Duration = Duration::from_secs(60 * 60);
const SHORT_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NextDnsError {
    #[error("Profile ID not configured")]
    NotConfigured,

    #[error("Invalid Profile ID")]
    InvalidProfile,

    #[error("HTTP {0}")]
    HttpStatus(u16),

    #[error("Connection timeout")]
    Timeout,

    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("failed to create HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl From<reqwest::Error> for NextDnsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err)
        }
    }
}

/// A denylisted domain of the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DenylistEntry {
    pub domain: String,
    pub category: Category,
    pub source: &'static str,
    pub active: bool,
}

#[derive(Debug, Deserialize)]
struct DenylistResponse {
    #[serde(default)]
    data: Vec<DenylistItem>,
}

#[derive(Debug, Deserialize)]
struct DenylistItem {
    #[serde(default)]
    id: String,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

/// Active entries as blocklist entries.
pub fn blocklist_entries(list: &[DenylistEntry]) -> Vec<Entry> {
    list.iter()
        .filter(|entry| entry.active && !entry.domain.is_empty())
        .map(|entry| Entry::domain(entry.domain.clone()))
        .collect()
}

struct CachedDenylist {
    profile_id: String,
    fetched_at: Instant,
    entries: Vec<DenylistEntry>,
}

pub struct NextDnsClient {
    client: Client,
    base_url: String,
    config: Arc<ConfigStore>,
    events: Arc<EventLog>,
    cache: Mutex<Option<CachedDenylist>>,
}

impl NextDnsClient {
    pub fn new(config: Arc<ConfigStore>, events: Arc<EventLog>) -> Result<Self, NextDnsError> {
        Self::with_base_url(API_BASE, config, events)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        config: Arc<ConfigStore>,
        events: Arc<EventLog>,
    ) -> Result<Self, NextDnsError> {
        let client = Client::builder()
            .user_agent(crate::blocklist::remote::USER_AGENT)
            .build()
            .map_err(NextDnsError::ClientBuild)?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            config,
            events,
            cache: Mutex::new(None),
        })
    }

    fn profile_id(&self) -> String {
        self.config.read(|s| s.nextdns.profile_id.clone())
    }

    pub fn is_configured(&self) -> bool {
        self.profile_id().len() == PROFILE_ID_LEN
    }

    fn configured_profile(&self) -> Result<String, NextDnsError> {
        let profile = self.profile_id();
        if profile.len() == PROFILE_ID_LEN {
            Ok(profile)
        } else {
            Err(NextDnsError::NotConfigured)
        }
    }

    fn request(&self, method: reqwest::Method, path: &str, timeout: Duration) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let api_key = self.config.read(|s| s.nextdns.api_key.clone());
        let builder = self.client.request(method, url).timeout(timeout);
        if api_key.is_empty() {
            builder
        } else {
            builder.header("X-Api-Key", api_key)
        }
    }

    /// Check that the profile exists.
    pub async fn test_connection(&self) -> Result<(), NextDnsError> {
        let profile = self.configured_profile()?;
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/profiles/{profile}/status"),
                SHORT_TIMEOUT,
            )
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(NextDnsError::InvalidProfile),
            status => Err(NextDnsError::HttpStatus(status.as_u16())),
        }
    }

    /// The profile denylist, served from a one hour cache unless `force`.
    pub async fn fetch_denylist(&self, force: bool) -> Result<Vec<DenylistEntry>, NextDnsError> {
        let profile = match self.configured_profile() {
            Ok(profile) => profile,
            Err(err) => {
                self.events.log(
                    EventType::ErrorOccurred,
                    "Cannot fetch NextDNS blocklists: Profile not configured",
                );
                return Err(err);
            }
        };

        if !force
            && let Some(cached) = self.cache.lock().as_ref()
            && cached.profile_id == profile
            && cached.fetched_at.elapsed() < CACHE_MAX_AGE
        {
            return Ok(cached.entries.clone());
        }

        match self.download_denylist(&profile).await {
            Ok(entries) => {
                self.events.log_with(
                    EventType::ConfigChanged,
                    format!("Fetched {} entries from NextDNS", entries.len()),
                    json!({ "count": entries.len() }),
                );
                *self.cache.lock() = Some(CachedDenylist {
                    profile_id: profile,
                    fetched_at: Instant::now(),
                    entries: entries.clone(),
                });
                Ok(entries)
            }
            Err(err) => {
                self.events.log(
                    EventType::ErrorOccurred,
                    format!("Failed to fetch NextDNS blocklists: {err}"),
                );
                Err(err)
            }
        }
    }

    async fn download_denylist(&self, profile: &str) -> Result<Vec<DenylistEntry>, NextDnsError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/profiles/{profile}/denylist"),
                FETCH_TIMEOUT,
            )
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(NextDnsError::HttpStatus(response.status().as_u16()));
        }

        let body: DenylistResponse = response.json().await?;
        Ok(body
            .data
            .into_iter()
            .map(|item| DenylistEntry {
                domain: item.id,
                category: Category::Custom,
                source: SOURCE,
                active: item.active,
            })
            .collect())
    }

    pub async fn add_to_denylist(&self, domain: &str) -> Result<(), NextDnsError> {
        let profile = self.configured_profile()?;
        let outcome = self
            .request(
                reqwest::Method::POST,
                &format!("/profiles/{profile}/denylist"),
                SHORT_TIMEOUT,
            )
            .json(&json!({ "id": domain, "active": true }))
            .send()
            .await
            .map_err(NextDnsError::from)
            .and_then(|response| match response.status() {
                StatusCode::OK | StatusCode::CREATED => Ok(()),
                status => Err(NextDnsError::HttpStatus(status.as_u16())),
            });

        self.record_change(
            outcome,
            EventType::RuleAdded,
            format!("Added {domain} to NextDNS denylist"),
            domain,
            "Failed to add domain to NextDNS",
        )
    }

    pub async fn remove_from_denylist(&self, domain: &str) -> Result<(), NextDnsError> {
        let profile = self.configured_profile()?;
        let outcome = self
            .request(
                reqwest::Method::DELETE,
                &format!("/profiles/{profile}/denylist/{domain}"),
                SHORT_TIMEOUT,
            )
            .send()
            .await
            .map_err(NextDnsError::from)
            .and_then(|response| match response.status() {
                StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
                status => Err(NextDnsError::HttpStatus(status.as_u16())),
            });

        self.record_change(
            outcome,
            EventType::RuleRemoved,
            format!("Removed {domain} from NextDNS denylist"),
            domain,
            "Failed to remove domain from NextDNS",
        )
    }

    fn record_change(
        &self,
        outcome: Result<(), NextDnsError>,
        kind: EventType,
        message: String,
        domain: &str,
        failure: &str,
    ) -> Result<(), NextDnsError> {
        match outcome {
            Ok(()) => {
                *self.cache.lock() = None;
                self.events.log_with(kind, message, json!({ "domain": domain }));
                Ok(())
            }
            Err(err) => {
                self.events.log_with(
                    EventType::ErrorOccurred,
                    format!("{failure}: {err}"),
                    json!({ "domain": domain }),
                );
                Err(err)
            }
        }
    }

    /// Query analytics of the profile, as returned by the API.
    pub async fn statistics(&self) -> Result<Value, NextDnsError> {
        let profile = self.configured_profile()?;
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/profiles/{profile}/analytics/status"),
                SHORT_TIMEOUT,
            )
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(NextDnsError::HttpStatus(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}
