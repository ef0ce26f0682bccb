//! Blocklist entries, categories and file format parsers.
//!
//! # Supported Formats
//!
//! - **Domain List**: one domain or IP address per line, `#` comments
//! - **Hosts File**: standard hosts format (`0.0.0.0 ads.example.com`)
//! - **JSON**: the `blocklist.json` document written by [`store::BlocklistStore`]
//!
//! # Example
//!
//! ```
//! use defensiq::blocklist::{BlocklistParser, DomainListParser, Entry};
//! use std::io::BufReader;
//!
//! let content = "# Comment\nexample.com\n10.0.0.1";
//! let entries = DomainListParser.parse(&mut BufReader::new(content.as_bytes())).unwrap();
//! assert_eq!(entries, vec![Entry::domain("example.com"), Entry::ip("10.0.0.1".parse().unwrap())]);
//! ```

mod domains;
pub mod hosts;
mod json;
pub mod loader;
pub mod manager;
pub mod remote;
pub mod store;

use std::fmt;
use std::io::BufRead;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub use domains::DomainListParser;
pub use hosts::HostsFileParser;
pub use json::{BlocklistDocument, JsonBlocklistParser, ListedValue};
pub use manager::BlocklistManager;
pub use store::BlocklistStore;

use crate::config::BlocklistFormat;

/// Category attached to every blocked domain and IP.
///
/// The five built-in categories can be toggled in settings. `custom` holds
/// user additions; any other name (a feed name, `nextdns`) is kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Malware,
    Phishing,
    Advertising,
    Gambling,
    Adult,
    Custom,
    Other(String),
}

impl Category {
    /// Categories reported by blocklist statistics even when empty.
    pub const BUILT_IN: [Self; 6] = [
        Self::Malware,
        Self::Phishing,
        Self::Advertising,
        Self::Gambling,
        Self::Adult,
        Self::Custom,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Malware => "malware",
            Self::Phishing => "phishing",
            Self::Advertising => "advertising",
            Self::Gambling => "gambling",
            Self::Adult => "adult",
            Self::Custom => "custom",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for Category {
    fn from(value: &str) -> Self {
        let value = value.trim().to_lowercase();
        match value.as_str() {
            "malware" => Self::Malware,
            "phishing" => Self::Phishing,
            "advertising" => Self::Advertising,
            "gambling" => Self::Gambling,
            "adult" => Self::Adult,
            "custom" | "" => Self::Custom,
            _ => Self::Other(value),
        }
    }
}

impl From<String> for Category {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a blocklist entry matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A domain and all of its subdomains.
    Domain(String),
    /// A single IP address.
    Ip(IpAddr),
    /// A case-insensitive regular expression searched in domain names.
    Pattern(String),
}

/// A parsed blocklist entry, optionally carrying its own category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub target: Target,
    pub category: Option<Category>,
}

impl Entry {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            target: Target::Domain(domain.into()),
            category: None,
        }
    }

    pub fn ip(ip: IpAddr) -> Self {
        Self {
            target: Target::Ip(ip),
            category: None,
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            target: Target::Pattern(pattern.into()),
            category: None,
        }
    }

    #[must_use]
    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    /// The entry's own category, or `fallback` when it has none.
    pub fn category_or<'a>(&'a self, fallback: &'a Category) -> &'a Category {
        self.category.as_ref().unwrap_or(fallback)
    }
}

/// Error type for blocklist parsing operations.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// I/O error during reading.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The JSON document is malformed.
    #[error("invalid JSON blocklist: {0}")]
    Json(#[from] serde_json::Error),
}

/// Trait for blocklist parsers.
///
/// Each parser implementation handles a specific blocklist format and extracts
/// the entries that feed the [`Matcher`](crate::dns::Matcher).
pub trait BlocklistParser: Send + Sync {
    /// Parse blocklist content and return its entries.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] if reading fails or the content is malformed.
    fn parse(&self, reader: &mut dyn BufRead) -> Result<Vec<Entry>, ParseError>;
}

/// Returns a boxed parser for the given blocklist format.
#[must_use]
pub fn parser_for_format(format: BlocklistFormat) -> Box<dyn BlocklistParser> {
    match format {
        BlocklistFormat::Domains => Box::new(DomainListParser),
        BlocklistFormat::Hosts => Box::new(HostsFileParser),
        BlocklistFormat::Json => Box::new(JsonBlocklistParser),
    }
}

/// Guess the format of a file to import from its extension.
pub fn format_for_path(path: &std::path::Path) -> BlocklistFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => BlocklistFormat::Json,
        _ => BlocklistFormat::Domains,
    }
}
