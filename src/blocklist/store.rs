//! Persistent user blocklist.
//!
//! Stored as `blocklist.json` next to the settings. Every mutation is
//! written back immediately.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use regex::RegexBuilder;
use serde::Serialize;
use tracing::{debug, info};

use super::{BlocklistDocument, Category, Entry, ListedValue, Target};

/// Error type for blocklist store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid blocklist file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid domain: {0:?}")]
    InvalidDomain(String),

    #[error("invalid IP address: {0:?}")]
    InvalidIp(String),

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Formats the user blocklist can be exported to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    Json,
    /// Plain text with `# Domains` and `# IP Addresses` sections.
    Txt,
}

/// Per-category entry counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
    pub domains: usize,
    pub ips: usize,
}

/// Summary of the user blocklist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlocklistStats {
    pub total_domains: usize,
    pub total_ips: usize,
    pub total_patterns: usize,
    pub by_category: BTreeMap<String, CategoryCount>,
}

/// Normalize a domain for storage and lookup.
///
/// Lowercases, trims whitespace and the trailing root dot, and drops a
/// leading `*.` wildcard. Empty values and values containing `/` or
/// whitespace are rejected.
pub fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_end_matches('.');
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    if domain.is_empty() || domain.contains('/') || domain.contains(char::is_whitespace) {
        return None;
    }
    Some(domain.to_lowercase())
}

/// The user's categorized domains, IPs and regex patterns.
#[derive(Debug)]
pub struct BlocklistStore {
    path: PathBuf,
    domains: BTreeMap<String, Category>,
    ips: BTreeMap<IpAddr, Category>,
    /// Searched in insertion order; the first match wins.
    patterns: Vec<(String, Category)>,
}

impl BlocklistStore {
    pub const FILE_NAME: &'static str = "blocklist.json";

    /// Open the blocklist in `dir`, creating an empty file when missing.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut store = Self {
            path: dir.join(Self::FILE_NAME),
            domains: BTreeMap::new(),
            ips: BTreeMap::new(),
            patterns: Vec::new(),
        };

        if !store.path.exists() {
            store.save()?;
            return Ok(store);
        }

        let content = std::fs::read_to_string(&store.path).map_err(|source| StoreError::Io {
            path: store.path.clone(),
            source,
        })?;
        let document: BlocklistDocument = serde_json::from_str(&content)?;
        for entry in document.into_entries() {
            store.insert(entry, &Category::Custom);
        }

        info!(
            domains = store.domains.len(),
            ips = store.ips.len(),
            patterns = store.patterns.len(),
            "loaded blocklist"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block a domain and all of its subdomains.
    ///
    /// Returns `false` when the domain was already listed with this category.
    pub fn add_domain(&mut self, domain: &str, category: Category) -> Result<bool, StoreError> {
        let domain =
            normalize_domain(domain).ok_or_else(|| StoreError::InvalidDomain(domain.to_string()))?;
        let changed = self.domains.insert(domain, category.clone()).as_ref() != Some(&category);
        self.save()?;
        Ok(changed)
    }

    pub fn remove_domain(&mut self, domain: &str) -> Result<bool, StoreError> {
        let Some(domain) = normalize_domain(domain) else {
            return Ok(false);
        };
        let removed = self.domains.remove(&domain).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn add_ip(&mut self, ip: &str, category: Category) -> Result<bool, StoreError> {
        let parsed: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| StoreError::InvalidIp(ip.to_string()))?;
        let changed = self.ips.insert(parsed, category.clone()).as_ref() != Some(&category);
        self.save()?;
        Ok(changed)
    }

    pub fn remove_ip(&mut self, ip: &str) -> Result<bool, StoreError> {
        let Ok(parsed) = ip.trim().parse::<IpAddr>() else {
            return Ok(false);
        };
        let removed = self.ips.remove(&parsed).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Add a case-insensitive regular expression searched in domain names.
    ///
    /// Returns `false` when the pattern was already listed with this category.
    pub fn add_pattern(&mut self, pattern: &str, category: Category) -> Result<bool, StoreError> {
        compile_pattern(pattern)?;
        let changed = self.upsert_pattern(pattern.to_string(), category);
        self.save()?;
        Ok(changed)
    }

    fn upsert_pattern(&mut self, pattern: String, category: Category) -> bool {
        match self.patterns.iter_mut().find(|(p, _)| *p == pattern) {
            Some((_, existing)) if *existing == category => false,
            Some((_, existing)) => {
                *existing = category;
                true
            }
            None => {
                self.patterns.push((pattern, category));
                true
            }
        }
    }

    pub fn remove_pattern(&mut self, pattern: &str) -> Result<bool, StoreError> {
        let before = self.patterns.len();
        self.patterns.retain(|(p, _)| p != pattern);
        let removed = self.patterns.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Add parsed entries, using `default_category` for entries without one.
    ///
    /// Invalid entries are skipped. Returns the number of entries accepted.
    pub fn add_entries(
        &mut self,
        entries: Vec<Entry>,
        default_category: &Category,
    ) -> Result<usize, StoreError> {
        let mut accepted = 0;
        for entry in entries {
            if self.insert(entry, default_category) {
                accepted += 1;
            }
        }
        self.save()?;
        Ok(accepted)
    }

    fn insert(&mut self, entry: Entry, default_category: &Category) -> bool {
        let category = entry.category_or(default_category).clone();
        match entry.target {
            Target::Domain(domain) => match normalize_domain(&domain) {
                Some(domain) => {
                    self.domains.insert(domain, category);
                    true
                }
                None => {
                    debug!(domain = %domain, "skipping invalid domain");
                    false
                }
            },
            Target::Ip(ip) => {
                self.ips.insert(ip, category);
                true
            }
            Target::Pattern(pattern) => {
                if compile_pattern(&pattern).is_err() {
                    debug!(pattern = %pattern, "skipping invalid pattern");
                    return false;
                }
                self.upsert_pattern(pattern, category);
                true
            }
        }
    }

    pub fn domains(&self) -> impl Iterator<Item = (&str, &Category)> {
        self.domains.iter().map(|(d, c)| (d.as_str(), c))
    }

    pub fn ips(&self) -> impl Iterator<Item = (IpAddr, &Category)> {
        self.ips.iter().map(|(ip, c)| (*ip, c))
    }

    pub fn patterns(&self) -> impl Iterator<Item = (&str, &Category)> {
        self.patterns.iter().map(|(p, c)| (p.as_str(), c))
    }

    pub fn statistics(&self) -> BlocklistStats {
        let mut by_category: BTreeMap<String, CategoryCount> = Category::BUILT_IN
            .iter()
            .map(|c| (c.to_string(), CategoryCount::default()))
            .collect();

        for category in self.domains.values() {
            by_category.entry(category.to_string()).or_default().domains += 1;
        }
        for category in self.ips.values() {
            by_category.entry(category.to_string()).or_default().ips += 1;
        }

        BlocklistStats {
            total_domains: self.domains.len(),
            total_ips: self.ips.len(),
            total_patterns: self.patterns.len(),
            by_category,
        }
    }

    /// Remove every domain, IP and pattern of a category. Returns how many
    /// were removed.
    pub fn clear_category(&mut self, category: &Category) -> Result<usize, StoreError> {
        let before = self.len();
        self.domains.retain(|_, c| c != category);
        self.ips.retain(|_, c| c != category);
        self.patterns.retain(|(_, c)| c != category);
        let removed = before - self.len();
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.domains.len() + self.ips.len() + self.patterns.len()
    }

    /// Write the blocklist to `path` in the given format.
    pub fn export(&self, path: &Path, format: ListFormat) -> Result<(), StoreError> {
        let content = match format {
            ListFormat::Json => serde_json::to_string_pretty(&self.document())?,
            ListFormat::Txt => {
                let mut out = String::from("# Domains\n");
                for domain in self.domains.keys() {
                    let _ = writeln!(out, "{domain}");
                }
                out.push_str("\n# IP Addresses\n");
                for ip in self.ips.keys() {
                    let _ = writeln!(out, "{ip}");
                }
                out
            }
        };

        std::fs::write(path, content).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn document(&self) -> BlocklistDocument {
        BlocklistDocument {
            domains: self
                .domains
                .iter()
                .map(|(value, category)| ListedValue {
                    value: value.clone(),
                    category: category.clone(),
                })
                .collect(),
            ips: self
                .ips
                .iter()
                .map(|(ip, category)| ListedValue {
                    value: ip.to_string(),
                    category: category.clone(),
                })
                .collect(),
            patterns: self
                .patterns
                .iter()
                .map(|(value, category)| ListedValue {
                    value: value.clone(),
                    category: category.clone(),
                })
                .collect(),
        }
    }

    fn save(&self) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(&self.document())?;
        std::fs::write(&self.path, content).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Compile a blocklist pattern the way the matcher uses it.
pub fn compile_pattern(pattern: &str) -> Result<regex::Regex, StoreError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (BlocklistStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = BlocklistStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn should_create_empty_file_when_missing() {
        let (store, dir) = open_store();

        assert!(dir.path().join(BlocklistStore::FILE_NAME).exists());
        assert_eq!(store.domains().count(), 0);
    }

    #[test]
    fn should_normalize_domains() {
        assert_eq!(normalize_domain(" Ads.Example.COM. "), Some("ads.example.com".into()));
        assert_eq!(normalize_domain("*.tracker.net"), Some("tracker.net".into()));
        assert_eq!(normalize_domain(""), None);
        assert_eq!(normalize_domain("example.com/path"), None);
        assert_eq!(normalize_domain("two words"), None);
    }

    #[test]
    fn should_persist_domains_with_categories() {
        let (mut store, dir) = open_store();

        assert!(store.add_domain("Ads.Example.com", Category::Advertising).unwrap());
        assert!(!store.add_domain("ads.example.com", Category::Advertising).unwrap());
        store.add_ip("203.0.113.7", Category::Malware).unwrap();
        store.add_pattern("^track", Category::Advertising).unwrap();

        let reopened = BlocklistStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.domains().collect::<Vec<_>>(),
            vec![("ads.example.com", &Category::Advertising)]
        );
        assert_eq!(
            reopened.ips().collect::<Vec<_>>(),
            vec![("203.0.113.7".parse().unwrap(), &Category::Malware)]
        );
        assert_eq!(
            reopened.patterns().collect::<Vec<_>>(),
            vec![("^track", &Category::Advertising)]
        );
    }

    #[test]
    fn should_reject_invalid_values() {
        let (mut store, _dir) = open_store();

        assert!(matches!(
            store.add_domain("bad/domain", Category::Custom),
            Err(StoreError::InvalidDomain(_))
        ));
        assert!(matches!(
            store.add_ip("999.1.1.1", Category::Custom),
            Err(StoreError::InvalidIp(_))
        ));
        assert!(matches!(
            store.add_pattern("(unclosed", Category::Custom),
            Err(StoreError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn should_remove_entries() {
        let (mut store, _dir) = open_store();
        store.add_domain("a.example.com", Category::Custom).unwrap();
        store.add_ip("10.0.0.1", Category::Custom).unwrap();
        store.add_pattern("^ads", Category::Custom).unwrap();

        assert!(store.remove_domain("A.example.com").unwrap());
        assert!(!store.remove_domain("a.example.com").unwrap());
        assert!(store.remove_ip("10.0.0.1").unwrap());
        assert!(store.remove_pattern("^ads").unwrap());
        assert_eq!(store.statistics().total_domains, 0);
        assert_eq!(store.statistics().total_ips, 0);
        assert_eq!(store.statistics().total_patterns, 0);
    }

    #[test]
    fn should_add_parsed_entries_with_default_category() {
        let (mut store, _dir) = open_store();
        let entries = vec![
            Entry::domain("one.example.com"),
            Entry::domain("two.example.com").with_category(Category::Phishing),
            Entry::domain("bad/one"),
            Entry::ip("10.1.1.1".parse().unwrap()),
        ];

        let accepted = store.add_entries(entries, &Category::Malware).unwrap();

        assert_eq!(accepted, 3);
        let stats = store.statistics();
        assert_eq!(stats.by_category["malware"].domains, 1);
        assert_eq!(stats.by_category["malware"].ips, 1);
        assert_eq!(stats.by_category["phishing"].domains, 1);
    }

    #[test]
    fn should_open_file_with_categorised_patterns() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(BlocklistStore::FILE_NAME),
            r#"{"domains":[{"value":"ads.example.com","category":"advertising"}],"ips":[],"patterns":[{"value":"^track","category":"advertising"}]}"#,
        )
        .unwrap();

        let store = BlocklistStore::open(dir.path()).unwrap();

        assert_eq!(
            store.patterns().collect::<Vec<_>>(),
            vec![("^track", &Category::Advertising)]
        );
    }

    #[test]
    fn should_keep_pattern_category_from_parsed_entries() {
        let (mut store, dir) = open_store();

        store
            .add_entries(
                vec![Entry::pattern("^track").with_category(Category::Advertising)],
                &Category::Custom,
            )
            .unwrap();

        let saved = std::fs::read_to_string(dir.path().join(BlocklistStore::FILE_NAME)).unwrap();
        let document: BlocklistDocument = serde_json::from_str(&saved).unwrap();
        assert_eq!(
            document.patterns,
            vec![ListedValue {
                value: "^track".into(),
                category: Category::Advertising,
            }]
        );
        assert!(!store.add_pattern("^track", Category::Advertising).unwrap());
        assert!(store.add_pattern("^track", Category::Malware).unwrap());
        assert_eq!(store.statistics().total_patterns, 1);
    }

    #[test]
    fn should_report_built_in_categories_even_when_empty() {
        let (store, _dir) = open_store();
        let stats = store.statistics();

        for category in Category::BUILT_IN {
            assert_eq!(stats.by_category[category.as_str()], CategoryCount::default());
        }
    }

    #[test]
    fn should_clear_a_single_category() {
        let (mut store, _dir) = open_store();
        store.add_domain("ads.example.com", Category::Advertising).unwrap();
        store.add_domain("evil.example.com", Category::Malware).unwrap();
        store.add_ip("10.0.0.9", Category::Advertising).unwrap();
        store.add_pattern("^banner", Category::Advertising).unwrap();

        let removed = store.clear_category(&Category::Advertising).unwrap();

        assert_eq!(removed, 3);
        assert_eq!(store.patterns().count(), 0);
        assert_eq!(
            store.domains().collect::<Vec<_>>(),
            vec![("evil.example.com", &Category::Malware)]
        );
    }

    #[test]
    fn should_export_text_with_sections() {
        let (mut store, dir) = open_store();
        store.add_domain("b.example.com", Category::Custom).unwrap();
        store.add_domain("a.example.com", Category::Custom).unwrap();
        store.add_ip("10.0.0.1", Category::Custom).unwrap();

        let path = dir.path().join("export.txt");
        store.export(&path, ListFormat::Txt).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(
            content,
            "# Domains\na.example.com\nb.example.com\n\n# IP Addresses\n10.0.0.1\n"
        );
    }

    #[test]
    fn should_export_json_document() {
        let (mut store, dir) = open_store();
        store.add_domain("a.example.com", Category::Gambling).unwrap();

        let path = dir.path().join("export.json");
        store.export(&path, ListFormat::Json).unwrap();

        let document: BlocklistDocument =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(document.domains[0].category, Category::Gambling);
    }
}
