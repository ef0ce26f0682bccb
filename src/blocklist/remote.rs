//! Remote URL blocklist loader.
//!
//! Fetches blocklist feeds over HTTP and keeps the last good copy on disk
//! for offline fallback.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use tokio::fs;

use super::loader::parse_blocking;
use super::{Entry, ParseError};
use crate::config::BlocklistFormat;

/// Default timeout for HTTP requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// User-Agent header value for HTTP requests.
pub const USER_AGENT: &str = concat!("defensiq/", env!("CARGO_PKG_VERSION"));

/// Error type for remote blocklist loading operations.
#[derive(Debug, thiserror::Error)]
pub enum RemoteLoadError {
    /// HTTP request failed with a non-success status code.
    #[error("HTTP request failed for {url}: status {status}")]
    HttpStatus {
        /// URL that was requested.
        url: String,
        /// HTTP status code returned.
        status: u16,
    },

    /// Network error during HTTP request.
    #[error("network error fetching {url}: {source}")]
    Network {
        /// URL that was requested.
        url: String,
        /// Underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Timeout fetching the remote URL.
    #[error("timeout fetching {url}")]
    Timeout {
        /// URL that timed out.
        url: String,
    },

    /// Error parsing the blocklist content.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Task join error from spawning a blocking task.
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Cache not available for fallback.
    #[error("cache not available: {0:?}")]
    CacheUnavailable(PathBuf),

    /// I/O error during cache operations.
    #[error("cache I/O error for {path:?}: {source}")]
    CacheIo {
        /// Path to the cache file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create HTTP client.
    #[error("failed to create HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

/// Loads blocklist feeds from remote URLs.
pub struct RemoteLoader {
    client: Client,
    cache_dir: PathBuf,
}

impl RemoteLoader {
    /// Create a new remote loader with the specified cache directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(cache_dir: PathBuf) -> Result<Self, RemoteLoadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .gzip(true)
            .build()
            .map_err(RemoteLoadError::ClientBuild)?;

        Ok(Self { client, cache_dir })
    }

    /// Fetch and parse a feed without touching the cache.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteLoadError`] if:
    /// - The HTTP request fails ([`RemoteLoadError::Network`])
    /// - The server returns a non-success status ([`RemoteLoadError::HttpStatus`])
    /// - The request times out ([`RemoteLoadError::Timeout`])
    /// - The content cannot be parsed ([`RemoteLoadError::Parse`])
    pub async fn load(
        &self,
        url: &str,
        format: BlocklistFormat,
    ) -> Result<Vec<Entry>, RemoteLoadError> {
        let content = self.fetch(url).await?;
        Ok(parse_blocking(content, format).await??)
    }

    /// Fetch a feed, refreshing its cache file, and fall back to the cached
    /// copy when the fetch fails.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteLoadError`] if both the remote fetch and cache
    /// fallback fail.
    pub async fn load_cached(
        &self,
        name: &str,
        url: &str,
        format: BlocklistFormat,
    ) -> Result<Vec<Entry>, RemoteLoadError> {
        let cache_path = self.cache_path(name);

        let content = match self.fetch(url).await {
            Ok(content) => {
                if let Err(err) = self.save_cache(&cache_path, &content).await {
                    tracing::warn!(
                        path = ?cache_path,
                        error = ?err,
                        "failed to save blocklist to cache"
                    );
                }
                content
            }
            Err(err) => {
                tracing::warn!(
                    url = %url,
                    error = ?err,
                    "failed to fetch remote blocklist, trying cache"
                );
                self.read_cache(&cache_path).await?
            }
        };

        Ok(parse_blocking(content, format).await??)
    }

    async fn fetch(&self, url: &str) -> Result<String, RemoteLoadError> {
        let response = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                RemoteLoadError::Timeout {
                    url: url.to_string(),
                }
            } else {
                RemoteLoadError::Network {
                    url: url.to_string(),
                    source: err,
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(RemoteLoadError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        response
            .text()
            .await
            .map_err(|err| RemoteLoadError::Network {
                url: url.to_string(),
                source: err,
            })
    }

    async fn save_cache(&self, cache_path: &Path, content: &str) -> Result<(), RemoteLoadError> {
        if let Some(parent) = cache_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| RemoteLoadError::CacheIo {
                    path: parent.to_path_buf(),
                    source: err,
                })?;
        }

        fs::write(cache_path, content)
            .await
            .map_err(|err| RemoteLoadError::CacheIo {
                path: cache_path.to_path_buf(),
                source: err,
            })?;

        tracing::debug!(path = ?cache_path, "saved blocklist to cache");
        Ok(())
    }

    async fn read_cache(&self, cache_path: &Path) -> Result<String, RemoteLoadError> {
        let content = fs::read_to_string(cache_path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                RemoteLoadError::CacheUnavailable(cache_path.to_path_buf())
            } else {
                RemoteLoadError::CacheIo {
                    path: cache_path.to_path_buf(),
                    source: err,
                }
            }
        })?;

        tracing::info!(path = ?cache_path, "loaded blocklist from cache");
        Ok(content)
    }

    fn cache_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{name}.cache"))
    }
}

/// Returns the default cache directory for blocklist feeds.
///
/// - Windows: `{FOLDERID_LocalAppData}\defensiq\blocklists\`
/// - Linux: `~/.cache/defensiq/blocklists/`
///
/// Falls back to `./cache/blocklists` if the cache directory cannot be determined.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir().map_or_else(
        || PathBuf::from("./cache/blocklists"),
        |p| p.join("defensiq").join("blocklists"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_loader() -> (RemoteLoader, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let loader = RemoteLoader::new(temp_dir.path().to_path_buf()).unwrap();
        (loader, temp_dir)
    }

    #[tokio::test]
    async fn should_load_domains_format_from_url() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/blocklist.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("# Comment\nexample.com\n*.ads.com"),
            )
            .mount(&mock_server)
            .await;

        let (loader, _temp) = create_loader();
        let url = format!("{}/blocklist.txt", mock_server.uri());

        let entries = loader.load(&url, BlocklistFormat::Domains).await.unwrap();

        assert_eq!(
            entries,
            vec![Entry::domain("example.com"), Entry::domain("ads.com")]
        );
    }

    #[tokio::test]
    async fn should_load_hosts_format_from_url() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/hosts"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "# Hosts file\n0.0.0.0 ads.example.com\n127.0.0.1 tracking.example.com",
            ))
            .mount(&mock_server)
            .await;

        let (loader, _temp) = create_loader();
        let url = format!("{}/hosts", mock_server.uri());

        let entries = loader.load(&url, BlocklistFormat::Hosts).await.unwrap();

        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn should_return_http_status_error_when_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/notfound.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let (loader, _temp) = create_loader();
        let url = format!("{}/notfound.txt", mock_server.uri());

        let result = loader.load(&url, BlocklistFormat::Domains).await;

        assert!(matches!(
            result,
            Err(RemoteLoadError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn should_return_network_error_when_connection_refused() {
        let (loader, _temp) = create_loader();
        let url = "http://127.0.0.1:1/blocklist.txt";

        let result = loader.load(url, BlocklistFormat::Domains).await;

        assert!(matches!(result, Err(RemoteLoadError::Network { .. })));
    }

    #[tokio::test]
    async fn should_cache_response_on_successful_load() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/blocklist.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("example.com"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (loader, temp_dir) = create_loader();
        let url = format!("{}/blocklist.txt", mock_server.uri());

        let entries = loader
            .load_cached("test", &url, BlocklistFormat::Domains)
            .await
            .unwrap();

        assert_eq!(entries, vec![Entry::domain("example.com")]);

        let cache_path = temp_dir.path().join("test.cache");
        let cached_content = std::fs::read_to_string(&cache_path).unwrap();
        assert_eq!(cached_content, "example.com");
    }

    #[tokio::test]
    async fn should_fallback_to_cache_when_remote_fails() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/blocklist.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("example.com"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (loader, _temp) = create_loader();
        let url = format!("{}/blocklist.txt", mock_server.uri());

        loader
            .load_cached("test", &url, BlocklistFormat::Domains)
            .await
            .unwrap();

        mock_server.reset().await;

        Mock::given(method("GET"))
            .and(path("/blocklist.txt"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let entries = loader
            .load_cached("test", &url, BlocklistFormat::Domains)
            .await
            .unwrap();
        assert_eq!(entries, vec![Entry::domain("example.com")]);
    }

    #[tokio::test]
    async fn should_return_cache_unavailable_when_no_cache_exists() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/blocklist.txt"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let (loader, _temp) = create_loader();
        let url = format!("{}/blocklist.txt", mock_server.uri());

        let result = loader
            .load_cached("nonexistent", &url, BlocklistFormat::Domains)
            .await;

        assert!(matches!(result, Err(RemoteLoadError::CacheUnavailable(_))));
    }

    #[tokio::test]
    async fn should_include_user_agent_header() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/blocklist.txt"))
            .and(header("User-Agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_string("example.com"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (loader, _temp) = create_loader();
        let url = format!("{}/blocklist.txt", mock_server.uri());

        let entries = loader.load(&url, BlocklistFormat::Domains).await.unwrap();

        assert_eq!(entries, vec![Entry::domain("example.com")]);
    }

    #[test]
    fn should_return_default_cache_dir() {
        let cache_dir = default_cache_dir();
        assert!(cache_dir.ends_with("defensiq/blocklists") || cache_dir.ends_with("blocklists"));
    }
}
