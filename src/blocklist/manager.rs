//! Blocklist manager with hot-reload support.
//!
//! The manager owns the user blocklist and the configured feeds, and keeps a
//! compiled [`Matcher`] that the filter engine reads. Every mutation rebuilds
//! the matcher and swaps it in place, so packet inspection never restarts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use super::loader::{FileLoader, LoadError};
use super::remote::{RemoteLoadError, RemoteLoader};
use super::store::{BlocklistStats, BlocklistStore, ListFormat, StoreError};
use super::{Category, Entry, Target, format_for_path};
use crate::config::{BlocklistSettings, FeedConfig, FeedSource};
use crate::dns::{Matcher, Verdict};

/// Error type for blocklist manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Feed with the given name was not found.
    #[error("unknown blocklist feed: {0:?}")]
    UnknownFeed(String),

    /// Failed to load blocklist from file.
    #[error("failed to load file blocklist")]
    FileLoad(#[from] LoadError),

    /// Failed to load blocklist from remote URL.
    #[error("failed to load remote blocklist")]
    RemoteLoad(#[from] RemoteLoadError),

    /// The persistent user blocklist rejected the change.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Statistics for a single feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedStats {
    /// Number of entries loaded from this feed.
    pub entry_count: usize,
    pub category: Category,
}

/// Manages the user blocklist and third-party feeds.
///
/// # Example
///
/// ```no_run
/// use defensiq::blocklist::{BlocklistManager, BlocklistStore};
/// use defensiq::config::BlocklistSettings;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = BlocklistStore::open("config".as_ref())?;
/// let manager = BlocklistManager::new(&BlocklistSettings::default(), store)?;
/// manager.initialize().await?;
///
/// manager.add_domain("ads.example.com", "advertising".into())?;
/// assert!(manager.check_domain("www.ads.example.com").is_some());
/// # Ok(())
/// # }
/// ```
pub struct BlocklistManager {
    /// Current compiled matcher, shared with the filter engine.
    matcher: Arc<RwLock<Matcher>>,

    /// User-managed entries, persisted to `blocklist.json`.
    store: Mutex<BlocklistStore>,

    /// Entries per feed for incremental updates.
    feed_entries: RwLock<HashMap<String, Vec<Entry>>>,

    /// When each feed was last loaded or attempted.
    last_attempt: RwLock<HashMap<String, Instant>>,

    settings: RwLock<BlocklistSettings>,

    remote_loader: RemoteLoader,
}

impl BlocklistManager {
    /// Create a manager over an opened store. The matcher starts with the
    /// store content; feeds are loaded by [`initialize`](Self::initialize).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client for remote feeds cannot be created.
    pub fn new(settings: &BlocklistSettings, store: BlocklistStore) -> Result<Self, ManagerError> {
        let remote_loader = RemoteLoader::new(settings.cache_dir())?;

        let manager = Self {
            matcher: Arc::new(RwLock::new(Matcher::default())),
            store: Mutex::new(store),
            feed_entries: RwLock::new(HashMap::new()),
            last_attempt: RwLock::new(HashMap::new()),
            settings: RwLock::new(settings.clone()),
            remote_loader,
        };
        manager.rebuild_matcher();
        Ok(manager)
    }

    /// Get a shared handle on the matcher.
    ///
    /// Handles stay valid across rebuilds: the content behind the lock is
    /// replaced, not the lock itself.
    #[must_use]
    pub fn matcher(&self) -> Arc<RwLock<Matcher>> {
        Arc::clone(&self.matcher)
    }

    /// Load every enabled feed and rebuild the matcher.
    ///
    /// Failed feeds are logged but don't fail the initialization, so
    /// filtering can start while a feed is temporarily unavailable.
    pub async fn initialize(&self) -> Result<(), ManagerError> {
        let feeds = self.settings.read().feeds.clone();

        for feed in &feeds {
            if !feed.enabled {
                tracing::debug!(name = ?feed.name, "skipping disabled blocklist feed");
                continue;
            }

            self.last_attempt.write().insert(feed.name.clone(), Instant::now());
            match self.load_feed(feed).await {
                Ok(entries) => {
                    tracing::info!(
                        name = ?feed.name,
                        count = entries.len(),
                        "loaded blocklist feed"
                    );
                    self.feed_entries.write().insert(feed.name.clone(), entries);
                }
                Err(err) => {
                    tracing::error!(
                        name = ?feed.name,
                        error = ?err,
                        "failed to load blocklist feed"
                    );
                }
            }
        }

        self.rebuild_matcher();
        Ok(())
    }

    /// Rebuild the matcher from the store and the loaded feeds.
    ///
    /// User entries are inserted first so their category wins over a feed
    /// listing the same domain. Feed entries of a switched-off category are
    /// skipped.
    fn rebuild_matcher(&self) {
        let settings = self.settings.read().clone();
        let mut matcher = Matcher::new();

        {
            let store = self.store.lock();
            for (domain, category) in store.domains() {
                matcher.insert_domain(domain, category.clone());
            }
            for (ip, category) in store.ips() {
                matcher.insert_ip(ip, category.clone());
            }
            for (pattern, category) in store.patterns() {
                matcher.insert_pattern(pattern, category.clone());
            }
        }

        let mut skipped = 0usize;
        {
            let feed_entries = self.feed_entries.read();
            for feed in settings.feeds.iter().filter(|feed| feed.enabled) {
                let Some(entries) = feed_entries.get(&feed.name) else {
                    continue;
                };
                for entry in entries {
                    let category = entry.category_or(&feed.category);
                    if !settings.category_enabled(category) {
                        skipped += 1;
                        continue;
                    }
                    match &entry.target {
                        Target::Domain(domain) => matcher.insert_domain(domain, category.clone()),
                        Target::Ip(ip) => matcher.insert_ip(*ip, category.clone()),
                        Target::Pattern(pattern) => {
                            matcher.insert_pattern(pattern, category.clone());
                        }
                    }
                }
            }
        }

        tracing::info!(entries = matcher.len(), skipped, "rebuilt blocklist matcher");

        *self.matcher.write() = matcher;
    }

    async fn load_feed(&self, feed: &FeedConfig) -> Result<Vec<Entry>, ManagerError> {
        match &feed.source {
            FeedSource::File { path } => {
                tracing::debug!(name = ?feed.name, path = ?path, "loading file blocklist");
                Ok(FileLoader::load(path, feed.format).await?)
            }
            FeedSource::Remote { url } => {
                tracing::debug!(name = ?feed.name, url = %url, "loading remote blocklist");
                Ok(self
                    .remote_loader
                    .load_cached(&feed.name, url, feed.format)
                    .await?)
            }
        }
    }

    fn feed(&self, name: &str) -> Result<FeedConfig, ManagerError> {
        self.settings
            .read()
            .feeds
            .iter()
            .find(|feed| feed.name == name)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownFeed(name.to_string()))
    }

    /// Reload a feed by name and rebuild the matcher.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::UnknownFeed`] if no feed with the given name
    /// exists, or the load error when the feed cannot be fetched.
    pub async fn refresh_feed(&self, name: &str) -> Result<usize, ManagerError> {
        let feed = self.feed(name)?;

        tracing::info!(name = ?name, "refreshing blocklist feed");

        self.last_attempt.write().insert(name.to_string(), Instant::now());
        let entries = self.load_feed(&feed).await?;
        let count = entries.len();

        self.feed_entries.write().insert(name.to_string(), entries);
        self.rebuild_matcher();

        tracing::info!(name = ?name, count, "refreshed blocklist feed");
        Ok(count)
    }

    /// Enable or disable a feed at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::UnknownFeed`] if no feed with the given name
    /// exists.
    pub async fn set_feed_enabled(&self, name: &str, enabled: bool) -> Result<(), ManagerError> {
        let mut feed = self.feed(name)?;
        feed.enabled = enabled;

        if enabled {
            tracing::info!(name = ?name, "enabling blocklist feed");
            self.last_attempt.write().insert(name.to_string(), Instant::now());
            let entries = self.load_feed(&feed).await?;
            self.feed_entries.write().insert(name.to_string(), entries);
        } else {
            tracing::info!(name = ?name, "disabling blocklist feed");
            self.feed_entries.write().remove(name);
        }

        if let Some(stored) = self
            .settings
            .write()
            .feeds
            .iter_mut()
            .find(|f| f.name == name)
        {
            stored.enabled = enabled;
        }

        self.rebuild_matcher();
        Ok(())
    }

    /// Enabled feeds whose `refresh_interval_hours` has elapsed since they
    /// were last loaded. Feeds without an interval are never due.
    #[must_use]
    pub fn feeds_due(&self) -> Vec<String> {
        let last_attempt = self.last_attempt.read();
        self.settings
            .read()
            .feeds
            .iter()
            .filter(|feed| feed.enabled)
            .filter_map(|feed| {
                let interval = Duration::from_secs(feed.refresh_interval_hours? * 3600);
                let due = last_attempt
                    .get(&feed.name)
                    .is_none_or(|at| at.elapsed() >= interval);
                due.then(|| feed.name.clone())
            })
            .collect()
    }

    /// Refresh every due feed. Returns how many were refreshed; failures are
    /// logged and retried once the interval elapses again.
    pub async fn refresh_due_feeds(&self) -> usize {
        let mut refreshed = 0;
        for name in self.feeds_due() {
            match self.refresh_feed(&name).await {
                Ok(_) => refreshed += 1,
                Err(err) => {
                    tracing::warn!(name = ?name, error = ?err, "scheduled feed refresh failed");
                }
            }
        }
        refreshed
    }

    /// Replace the blocklist settings (categories, feeds) and rebuild.
    ///
    /// Feeds that disappeared are dropped. New feeds are loaded on the next
    /// [`initialize`](Self::initialize) or [`refresh_feed`](Self::refresh_feed).
    pub fn apply_settings(&self, settings: &BlocklistSettings) {
        {
            let mut feed_entries = self.feed_entries.write();
            feed_entries.retain(|name, _| settings.feeds.iter().any(|f| &f.name == name));
        }
        *self.settings.write() = settings.clone();
        self.rebuild_matcher();
    }

    /// Get statistics for all loaded feeds.
    #[must_use]
    pub fn feed_stats(&self) -> HashMap<String, FeedStats> {
        let settings = self.settings.read();
        self.feed_entries
            .read()
            .iter()
            .map(|(name, entries)| {
                let category = settings
                    .feeds
                    .iter()
                    .find(|f| &f.name == name)
                    .map_or(Category::Custom, |f| f.category.clone());
                (
                    name.clone(),
                    FeedStats {
                        entry_count: entries.len(),
                        category,
                    },
                )
            })
            .collect()
    }

    /// Number of unique entries in the current matcher.
    #[must_use]
    pub fn total_entries(&self) -> usize {
        self.matcher.read().len()
    }

    #[must_use]
    pub fn is_feed_loaded(&self, name: &str) -> bool {
        self.feed_entries.read().contains_key(name)
    }

    /// Check a domain against the current matcher.
    pub fn check_domain(&self, domain: &str) -> Option<Verdict> {
        self.matcher.read().check_domain(domain)
    }

    pub fn check_ip(&self, ip: IpAddr) -> Option<Verdict> {
        self.matcher.read().check_ip(ip)
    }

    /// Apply a change to the store, then rebuild when something changed.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut BlocklistStore) -> Result<T, StoreError>,
        changed: impl Fn(&T) -> bool,
    ) -> Result<T, ManagerError> {
        let outcome = {
            let mut store = self.store.lock();
            f(&mut store)?
        };
        if changed(&outcome) {
            self.rebuild_matcher();
        }
        Ok(outcome)
    }

    pub fn add_domain(&self, domain: &str, category: Category) -> Result<bool, ManagerError> {
        self.mutate(|store| store.add_domain(domain, category), |c| *c)
    }

    pub fn remove_domain(&self, domain: &str) -> Result<bool, ManagerError> {
        self.mutate(|store| store.remove_domain(domain), |c| *c)
    }

    pub fn add_ip(&self, ip: &str, category: Category) -> Result<bool, ManagerError> {
        self.mutate(|store| store.add_ip(ip, category), |c| *c)
    }

    pub fn remove_ip(&self, ip: &str) -> Result<bool, ManagerError> {
        self.mutate(|store| store.remove_ip(ip), |c| *c)
    }

    pub fn add_pattern(&self, pattern: &str, category: Category) -> Result<bool, ManagerError> {
        self.mutate(|store| store.add_pattern(pattern, category), |c| *c)
    }

    pub fn remove_pattern(&self, pattern: &str) -> Result<bool, ManagerError> {
        self.mutate(|store| store.remove_pattern(pattern), |c| *c)
    }

    /// Import a local file into the user blocklist.
    ///
    /// `.json` files use the `blocklist.json` shape, anything else is read as
    /// one domain or IP per line. Returns the number of entries accepted.
    pub async fn import_file(
        &self,
        path: &Path,
        category: Category,
    ) -> Result<usize, ManagerError> {
        let entries = FileLoader::load(path, format_for_path(path)).await?;
        let accepted = self.mutate(|store| store.add_entries(entries, &category), |n| *n > 0)?;
        tracing::info!(path = ?path, accepted, "imported blocklist file");
        Ok(accepted)
    }

    /// Merge entries pulled from a cloud denylist under `category`.
    pub fn merge_cloud_entries(
        &self,
        entries: Vec<Entry>,
        category: Category,
    ) -> Result<usize, ManagerError> {
        self.mutate(|store| store.add_entries(entries, &category), |n| *n > 0)
    }

    pub fn export_file(&self, path: &Path, format: ListFormat) -> Result<(), ManagerError> {
        Ok(self.store.lock().export(path, format)?)
    }

    pub fn clear_category(&self, category: &Category) -> Result<usize, ManagerError> {
        self.mutate(|store| store.clear_category(category), |n| *n > 0)
    }

    #[must_use]
    pub fn statistics(&self) -> BlocklistStats {
        self.store.lock().statistics()
    }

    /// User-listed domains with their category, sorted.
    #[must_use]
    pub fn domain_rows(&self) -> Vec<(String, Category)> {
        self.store
            .lock()
            .domains()
            .map(|(domain, category)| (domain.to_string(), category.clone()))
            .collect()
    }

    #[must_use]
    pub fn ip_rows(&self) -> Vec<(IpAddr, Category)> {
        self.store
            .lock()
            .ips()
            .map(|(ip, category)| (ip, category.clone()))
            .collect()
    }

    #[must_use]
    pub fn pattern_rows(&self) -> Vec<(String, Category)> {
        self.store
            .lock()
            .patterns()
            .map(|(pattern, category)| (pattern.to_string(), category.clone()))
            .collect()
    }
}
