//! Settings loading, persistence and validation.
//!
//! Settings are stored as JSON in `<config_dir>/settings.json`. Every section
//! falls back to its defaults field by field, so a partial or older file is
//! merged with the current defaults on load. Each save also writes a SHA-256
//! digest of the canonical JSON to `.settings.checksum`; a mismatch on load
//! means the file was edited outside the application and is only reported.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::blocklist::Category;
use crate::dns::DohProvider;
use crate::error::{ConfigError, Result, ValidationError};
use crate::network::app_control::AppRule;

/// Settings file name inside the config directory.
pub const SETTINGS_FILE: &str = "settings.json";
/// Checksum file name inside the config directory.
pub const CHECKSUM_FILE: &str = ".settings.checksum";
/// Config directory used when none is given on the command line.
pub const DEFAULT_CONFIG_DIR: &str = "config";

/// Complete application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app: AppSettings,
    pub monitoring: MonitoringSettings,
    pub filtering: FilteringSettings,
    pub cia_triad: CiaSettings,
    pub blocklist: BlocklistSettings,
    pub windows: WindowsSettings,
    pub logging: LoggingSettings,
    pub dns: DnsSettings,
    pub nextdns: NextDnsSettings,
    pub app_control: AppControlSettings,
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub theme: Theme,
    pub auto_start: bool,
    pub minimize_to_tray: bool,
    pub show_notifications: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            theme: Theme::Light,
            auto_start: false,
            minimize_to_tray: true,
            show_notifications: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Passive,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub enabled: bool,
    pub capture_mode: CaptureMode,
    /// Dashboard refresh period in milliseconds.
    pub update_interval: u64,
    /// Record every allowed packet as a `TRAFFIC_ALLOWED` event.
    pub log_all_traffic: bool,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_mode: CaptureMode::Passive,
            update_interval: 1000,
            log_all_traffic: false,
        }
    }
}

/// What happens to a packet that matches the blocklist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockMode {
    /// Silently discard the packet.
    #[default]
    Drop,
    /// Discard the packet and answer blocked DNS queries with a sinkhole reply.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilteringSettings {
    pub enabled: bool,
    pub block_mode: BlockMode,
    pub log_blocked: bool,
}

impl Default for FilteringSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            block_mode: BlockMode::Drop,
            log_blocked: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiaSettings {
    pub confidentiality_checks: bool,
    pub integrity_checks: bool,
    pub availability_checks: bool,
    pub http_warning: bool,
    /// Packets per second above which a DoS alert is raised.
    pub dos_threshold: u64,
}

impl Default for CiaSettings {
    fn default() -> Self {
        Self {
            confidentiality_checks: true,
            integrity_checks: true,
            availability_checks: true,
            http_warning: true,
            dos_threshold: 1000,
        }
    }
}

/// Supported blocklist file formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlocklistFormat {
    /// One domain or IP per line.
    #[default]
    Domains,
    /// `/etc/hosts` style lines.
    Hosts,
    /// The `blocklist.json` document shape.
    Json,
}

/// Where a blocklist feed is loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedSource {
    File { path: PathBuf },
    Remote { url: String },
}

/// A third-party blocklist merged into the matcher on top of the user list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source: FeedSource,
    #[serde(default)]
    pub format: BlocklistFormat,
    #[serde(default = "default_feed_category")]
    pub category: Category,
    #[serde(default)]
    pub refresh_interval_hours: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocklistSettings {
    /// Turns on per-category filtering using `categories`.
    pub enabled: bool,
    pub categories: BTreeMap<String, bool>,
    pub feeds: Vec<FeedConfig>,
    pub cache_dir: Option<PathBuf>,
}

impl Default for BlocklistSettings {
    fn default() -> Self {
        let categories = [
            ("malware", true),
            ("phishing", true),
            ("advertising", false),
            ("gambling", false),
            ("adult", false),
        ]
        .into_iter()
        .map(|(name, on)| (name.to_string(), on))
        .collect();

        Self {
            enabled: false,
            categories,
            feeds: Vec::new(),
            cache_dir: None,
        }
    }
}

impl BlocklistSettings {
    /// Whether entries of `category` take part in matching.
    ///
    /// Categories only switch off when category filtering is enabled and the
    /// category is explicitly set to `false`.
    pub fn category_enabled(&self, category: &Category) -> bool {
        !self.enabled
            || self
                .categories
                .get(category.as_str())
                .copied()
                .unwrap_or(true)
    }

    /// Directory where remote feeds are cached.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(crate::blocklist::remote::default_cache_dir)
    }

    pub fn has_remote_feeds(&self) -> bool {
        self.feeds
            .iter()
            .any(|feed| matches!(feed.source, FeedSource::Remote { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowsSettings {
    /// Enforce app-control block rules with Windows Firewall program rules.
    pub firewall_integration: bool,
    pub defender_monitoring: bool,
    pub event_viewer_import: bool,
}

impl Default for WindowsSettings {
    fn default() -> Self {
        Self {
            firewall_integration: false,
            defender_monitoring: true,
            event_viewer_import: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

/// Log level saved in `<dir>/settings.json`, read before logging starts.
///
/// A missing or invalid file gives the default level.
pub fn configured_log_level(dir: &Path) -> LogLevel {
    std::fs::read_to_string(dir.join(SETTINGS_FILE))
        .ok()
        .and_then(|content| Settings::parse(&content).ok())
        .map(|settings| settings.logging.level)
        .unwrap_or_default()
}

/// Export format for security events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
    Txt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: LogLevel,
    pub max_log_size_mb: u64,
    pub retention_days: u32,
    pub export_format: ExportFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            max_log_size_mb: 100,
            retention_days: 30,
            export_format: ExportFormat::Csv,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    /// Resolve through DNS-over-HTTPS.
    pub enabled: bool,
    pub provider: DohProvider,
    /// Endpoint used when `provider` is `custom`.
    pub custom_server: String,
    pub cache_ttl_seconds: u64,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: DohProvider::Cloudflare,
            custom_server: String::new(),
            cache_ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NextDnsSettings {
    pub profile_id: String,
    /// Sent as `X-Api-Key`; the denylist endpoints reject anonymous calls.
    pub api_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppControlSettings {
    pub rules: Vec<AppRule>,
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub listen: SocketAddr,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 9090)),
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_feed_category() -> Category {
    Category::Custom
}

impl Settings {
    /// Parse settings from a JSON string and validate them.
    pub fn parse(content: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(content).map_err(ConfigError::Parse)?;
        settings.validate().map_err(ConfigError::from)?;
        Ok(settings)
    }

    /// Validate the settings.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.monitoring.update_interval == 0 {
            return Err(ValidationError::ZeroUpdateInterval);
        }

        if self.cia_triad.dos_threshold == 0 {
            return Err(ValidationError::ZeroDosThreshold);
        }

        if self.dns.cache_ttl_seconds == 0 {
            return Err(ValidationError::ZeroCacheTtl);
        }

        if self.dns.provider == DohProvider::Custom
            && !self.dns.custom_server.starts_with("https://")
        {
            return Err(ValidationError::InvalidCustomServer(
                self.dns.custom_server.clone(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for feed in &self.blocklist.feeds {
            if feed.name.trim().is_empty() {
                return Err(ValidationError::EmptyFeedName);
            }
            if !seen.insert(feed.name.as_str()) {
                return Err(ValidationError::DuplicateFeedName {
                    name: feed.name.clone(),
                });
            }
            match &feed.source {
                FeedSource::File { path } if path.as_os_str().is_empty() => {
                    return Err(ValidationError::EmptyFeedPath {
                        name: feed.name.clone(),
                    });
                }
                FeedSource::Remote { url }
                    if !(url.starts_with("http://") || url.starts_with("https://")) =>
                {
                    return Err(ValidationError::InvalidFeedUrl {
                        name: feed.name.clone(),
                        url: url.clone(),
                    });
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Persistent, shared settings.
pub struct ConfigStore {
    dir: PathBuf,
    settings: RwLock<Settings>,
    integrity_ok: AtomicBool,
}

impl ConfigStore {
    /// Open the settings in `dir`, creating the directory and a default
    /// settings file when they do not exist yet.
    ///
    /// An unreadable or invalid file is reported and replaced in memory by
    /// the defaults; the file itself is left untouched until the next save.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| ConfigError::WriteFile {
            path: dir.clone(),
            source,
        })?;

        let store = Self {
            dir,
            settings: RwLock::new(Settings::default()),
            integrity_ok: AtomicBool::new(true),
        };

        let path = store.settings_path();
        if !path.exists() {
            info!(path = ?path, "writing default settings");
            store.save()?;
            return Ok(store);
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        match Settings::parse(&content) {
            Ok(settings) => {
                store.verify_checksum(&settings);
                *store.settings.write() = settings;
                debug!(path = ?path, "loaded settings");
            }
            Err(err) => {
                warn!(path = ?path, error = %err, "invalid settings file, using defaults");
            }
        }

        Ok(store)
    }

    /// Directory holding the settings file.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }

    fn checksum_path(&self) -> PathBuf {
        self.dir.join(CHECKSUM_FILE)
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Read part of the settings without cloning everything.
    pub fn read<R>(&self, f: impl FnOnce(&Settings) -> R) -> R {
        f(&self.settings.read())
    }

    /// Whether the settings file matched its checksum when it was loaded.
    pub fn integrity_ok(&self) -> bool {
        self.integrity_ok.load(Ordering::SeqCst)
    }

    /// Apply a change, validate the result and persist it.
    pub fn update<R>(&self, f: impl FnOnce(&mut Settings) -> R) -> Result<R> {
        let mut updated = self.settings();
        let out = f(&mut updated);
        updated.validate().map_err(ConfigError::from)?;
        self.commit(updated)?;
        Ok(out)
    }

    /// Swap in validated settings and persist them. The previous settings
    /// are restored when writing fails.
    fn commit(&self, updated: Settings) -> Result<()> {
        let previous = std::mem::replace(&mut *self.settings.write(), updated);
        if let Err(err) = self.save() {
            *self.settings.write() = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Get a value by dot-separated path, e.g. `filtering.enabled`.
    pub fn get(&self, key: &str) -> Option<Value> {
        let tree = serde_json::to_value(&*self.settings.read()).ok()?;
        lookup(&tree, key).cloned()
    }

    /// Set a value by dot-separated path and persist the settings.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut tree = serde_json::to_value(&*self.settings.read())?;
        assign(&mut tree, key, value);

        let updated: Settings =
            serde_json::from_value(tree).map_err(|source| ConfigError::InvalidValue {
                key: key.to_string(),
                source,
            })?;

        // Keys unknown to the typed settings disappear in the round trip.
        let check = serde_json::to_value(&updated)?;
        if lookup(&check, key).is_none() {
            return Err(ConfigError::UnknownKey(key.to_string()).into());
        }

        updated.validate().map_err(ConfigError::from)?;
        self.commit(updated)
    }

    /// Restore the default settings and persist them.
    pub fn reset_to_defaults(&self) -> Result<()> {
        *self.settings.write() = Settings::default();
        info!("settings reset to defaults");
        self.save()
    }

    /// Write the current settings to `path`.
    pub fn export_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(&*self.settings.read())?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Replace the settings with the content of `path`, merged with defaults.
    pub fn import_from(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Settings::parse(&content)?;
        *self.settings.write() = settings;
        info!(path = ?path, "imported settings");
        self.save()
    }

    /// Persist the settings and refresh the checksum file.
    pub fn save(&self) -> Result<()> {
        let settings = self.settings.read().clone();
        let content = serde_json::to_string_pretty(&settings)?;
        let path = self.settings_path();
        std::fs::write(&path, content).map_err(|source| ConfigError::WriteFile {
            path: path.clone(),
            source,
        })?;

        let digest = checksum(&serde_json::to_value(&settings)?);
        let checksum_path = self.checksum_path();
        std::fs::write(&checksum_path, digest).map_err(|source| ConfigError::WriteFile {
            path: checksum_path,
            source,
        })?;

        self.integrity_ok.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn verify_checksum(&self, settings: &Settings) {
        let Ok(stored) = std::fs::read_to_string(self.checksum_path()) else {
            return;
        };
        let Ok(tree) = serde_json::to_value(settings) else {
            return;
        };

        if stored.trim() != checksum(&tree) {
            warn!("settings file checksum mismatch, it may have been modified externally");
            self.integrity_ok.store(false, Ordering::SeqCst);
        }
    }
}

/// SHA-256 of the canonical (sorted keys, compact) JSON encoding.
fn checksum(tree: &Value) -> String {
    let canonical = tree.to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn lookup<'a>(tree: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .try_fold(tree, |node, part| node.as_object()?.get(part))
}

fn assign(tree: &mut Value, key: &str, value: Value) {
    let mut node = tree;
    let mut parts = key.split('.').peekable();

    while let Some(part) = parts.next() {
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        node = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store() -> (ConfigStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn should_write_defaults_when_settings_file_is_missing() {
        let (store, dir) = open_store();

        assert!(dir.path().join(SETTINGS_FILE).exists());
        assert!(dir.path().join(CHECKSUM_FILE).exists());
        assert_eq!(store.settings(), Settings::default());
        assert!(store.integrity_ok());
    }

    #[test]
    fn should_expose_documented_default_keys() {
        let (store, _dir) = open_store();

        assert_eq!(store.get("app.theme"), Some(json!("light")));
        assert_eq!(store.get("filtering.enabled"), Some(json!(false)));
        assert_eq!(store.get("filtering.block_mode"), Some(json!("drop")));
        assert_eq!(store.get("monitoring.log_all_traffic"), Some(json!(false)));
        assert_eq!(store.get("dns.provider"), Some(json!("cloudflare")));
        assert_eq!(store.get("dns.enabled"), Some(json!(false)));
        assert_eq!(store.get("cia_triad.dos_threshold"), Some(json!(1000)));
        assert_eq!(
            store.get("blocklist.categories.advertising"),
            Some(json!(false))
        );
        assert_eq!(store.get("logging.level"), Some(json!("INFO")));
    }

    #[test]
    fn should_return_none_for_missing_keys() {
        let (store, _dir) = open_store();

        assert!(store.get("app.missing").is_none());
        assert!(store.get("app.theme.deeper").is_none());
    }

    #[test]
    fn should_persist_values_set_by_dot_path() {
        let (store, dir) = open_store();

        store.set("filtering.enabled", json!(true)).unwrap();
        store.set("app.theme", json!("dark")).unwrap();

        let reopened = ConfigStore::open(dir.path()).unwrap();
        assert!(reopened.settings().filtering.enabled);
        assert_eq!(reopened.settings().app.theme, Theme::Dark);
        assert!(reopened.integrity_ok());
    }

    #[test]
    fn should_reject_values_of_the_wrong_type() {
        let (store, _dir) = open_store();

        let result = store.set("filtering.enabled", json!("yes"));
        assert!(result.is_err());
        assert!(!store.settings().filtering.enabled);
    }

    #[test]
    fn should_reject_unknown_keys() {
        let (store, _dir) = open_store();

        let result = store.set("filtering.turbo", json!(true));
        assert!(matches!(
            result,
            Err(crate::Error::Config(ConfigError::UnknownKey(_)))
        ));
    }

    #[test]
    fn should_reject_zero_dos_threshold() {
        let (store, _dir) = open_store();

        let result = store.set("cia_triad.dos_threshold", json!(0));
        assert!(matches!(
            result,
            Err(crate::Error::Config(ConfigError::Validation(
                ValidationError::ZeroDosThreshold
            )))
        ));
    }

    #[test]
    fn should_merge_partial_file_with_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{"filtering": {"enabled": true}, "dns": {"provider": "quad9"}}"#,
        )
        .unwrap();

        let store = ConfigStore::open(dir.path()).unwrap();
        let settings = store.settings();

        assert!(settings.filtering.enabled);
        assert!(settings.filtering.log_blocked);
        assert_eq!(settings.dns.provider, DohProvider::Quad9);
        assert_eq!(settings.app, AppSettings::default());
    }

    #[test]
    fn should_read_log_level_before_opening_store() {
        let dir = TempDir::new().unwrap();
        assert_eq!(configured_log_level(dir.path()), LogLevel::Info);

        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{"logging": {"level": "WARNING"}}"#,
        )
        .unwrap();
        assert_eq!(configured_log_level(dir.path()), LogLevel::Warning);

        std::fs::write(dir.path().join(SETTINGS_FILE), "{ not json").unwrap();
        assert_eq!(configured_log_level(dir.path()), LogLevel::Info);
    }

    #[test]
    fn should_keep_previous_settings_when_write_fails() {
        let (store, dir) = open_store();
        std::fs::remove_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path(), "").unwrap();

        assert!(store.set("filtering.enabled", json!(true)).is_err());
        assert!(store.update(|s| s.app.theme = Theme::Dark).is_err());

        assert!(!store.settings().filtering.enabled);
        assert_eq!(store.settings().app.theme, Theme::Light);
        std::fs::remove_file(dir.path()).unwrap();
    }

    #[test]
    fn should_fall_back_to_defaults_when_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "{ not json").unwrap();

        let store = ConfigStore::open(dir.path()).unwrap();
        assert_eq!(store.settings(), Settings::default());
    }

    #[test]
    fn should_flag_checksum_mismatch_without_failing() {
        let (store, dir) = open_store();
        store.set("app.auto_start", json!(true)).unwrap();

        let path = dir.path().join(SETTINGS_FILE);
        let edited = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"auto_start\": true", "\"auto_start\": false");
        std::fs::write(&path, edited).unwrap();

        let reopened = ConfigStore::open(dir.path()).unwrap();
        assert!(!reopened.integrity_ok());
        assert!(!reopened.settings().app.auto_start);
    }

    #[test]
    fn should_reset_to_defaults() {
        let (store, _dir) = open_store();
        store.set("filtering.enabled", json!(true)).unwrap();

        store.reset_to_defaults().unwrap();

        assert_eq!(store.settings(), Settings::default());
    }

    #[test]
    fn should_export_and_import_settings() {
        let (store, dir) = open_store();
        store.set("monitoring.log_all_traffic", json!(true)).unwrap();

        let exported = dir.path().join("exported.json");
        store.export_to(&exported).unwrap();
        store.reset_to_defaults().unwrap();
        assert!(!store.settings().monitoring.log_all_traffic);

        store.import_from(&exported).unwrap();
        assert!(store.settings().monitoring.log_all_traffic);
    }

    #[test]
    fn should_update_with_closure_and_validate() {
        let (store, _dir) = open_store();

        store.update(|s| s.cia_triad.dos_threshold = 5000).unwrap();
        assert_eq!(store.settings().cia_triad.dos_threshold, 5000);

        let result = store.update(|s| s.dns.cache_ttl_seconds = 0);
        assert!(result.is_err());
        assert_eq!(store.settings().dns.cache_ttl_seconds, 300);
    }

    #[test]
    fn should_require_https_custom_doh_server() {
        let mut settings = Settings::default();
        settings.dns.provider = DohProvider::Custom;
        settings.dns.custom_server = "http://dns.example.com/dns-query".into();

        assert!(matches!(
            settings.validate(),
            Err(ValidationError::InvalidCustomServer(_))
        ));

        settings.dns.custom_server = "https://dns.example.com/dns-query".into();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn should_reject_duplicate_and_invalid_feeds() {
        let mut settings = Settings::default();
        let feed = FeedConfig {
            name: "ads".into(),
            enabled: true,
            source: FeedSource::Remote {
                url: "https://example.com/ads.txt".into(),
            },
            format: BlocklistFormat::Domains,
            category: Category::Advertising,
            refresh_interval_hours: None,
        };
        settings.blocklist.feeds = vec![feed.clone(), feed.clone()];
        assert_eq!(
            settings.validate(),
            Err(ValidationError::DuplicateFeedName { name: "ads".into() })
        );

        let mut bad_url = feed;
        bad_url.source = FeedSource::Remote {
            url: "ftp://example.com/ads.txt".into(),
        };
        settings.blocklist.feeds = vec![bad_url];
        assert!(matches!(
            settings.validate(),
            Err(ValidationError::InvalidFeedUrl { .. })
        ));
    }

    #[test]
    fn should_parse_feed_definitions() {
        let settings = Settings::parse(
            r#"{
                "blocklist": {
                    "feeds": [
                        {"name": "hosts", "source": {"type": "remote", "url": "https://example.com/hosts"}, "format": "hosts", "category": "malware"},
                        {"name": "local", "enabled": false, "source": {"type": "file", "path": "lists/local.txt"}}
                    ]
                }
            }"#,
        )
        .unwrap();

        let feeds = &settings.blocklist.feeds;
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].format, BlocklistFormat::Hosts);
        assert_eq!(feeds[0].category, Category::Malware);
        assert!(feeds[0].enabled);
        assert!(!feeds[1].enabled);
        assert_eq!(feeds[1].category, Category::Custom);
        assert!(settings.blocklist.has_remote_feeds());
    }

    #[test]
    fn should_only_filter_categories_when_enabled() {
        let mut blocklist = BlocklistSettings::default();
        assert!(blocklist.category_enabled(&Category::Advertising));

        blocklist.enabled = true;
        assert!(!blocklist.category_enabled(&Category::Advertising));
        assert!(blocklist.category_enabled(&Category::Malware));
        assert!(blocklist.category_enabled(&Category::Custom));
    }
}
