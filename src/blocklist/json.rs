//! JSON blocklist documents.
//!
//! The same shape is used for the persisted user blocklist and for imports:
//!
//! ```json
//! {
//!   "domains": [{"value": "ads.example.com", "category": "advertising"}],
//!   "ips": [{"value": "203.0.113.7", "category": "malware"}],
//!   "patterns": [{"value": "^track(er)?\\.", "category": "advertising"}]
//! }
//! ```
//!
//! Imported files may also list plain strings instead of objects.

use std::io::BufRead;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::{BlocklistParser, Category, Entry, ParseError};

/// A listed domain, IP or pattern with its category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedValue {
    pub value: String,
    #[serde(default = "custom")]
    pub category: Category,
}

fn custom() -> Category {
    Category::Custom
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum LooseValue {
    Listed(ListedValue),
    Plain(String),
}

impl From<LooseValue> for ListedValue {
    fn from(value: LooseValue) -> Self {
        match value {
            LooseValue::Listed(listed) => listed,
            LooseValue::Plain(value) => Self {
                value,
                category: Category::Custom,
            },
        }
    }
}

fn loose_list<'de, D>(deserializer: D) -> Result<Vec<ListedValue>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values = Vec::<LooseValue>::deserialize(deserializer)?;
    Ok(values.into_iter().map(ListedValue::from).collect())
}

/// On-disk blocklist document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocklistDocument {
    #[serde(default, deserialize_with = "loose_list")]
    pub domains: Vec<ListedValue>,
    #[serde(default, deserialize_with = "loose_list")]
    pub ips: Vec<ListedValue>,
    #[serde(default, deserialize_with = "loose_list")]
    pub patterns: Vec<ListedValue>,
}

impl BlocklistDocument {
    /// Flatten the document into entries, keeping each value's category.
    ///
    /// IP values that do not parse are dropped.
    pub fn into_entries(self) -> Vec<Entry> {
        let domains = self
            .domains
            .into_iter()
            .map(|listed| Entry::domain(listed.value).with_category(listed.category));

        let ips = self.ips.into_iter().filter_map(|listed| {
            match listed.value.trim().parse::<IpAddr>() {
                Ok(ip) => Some(Entry::ip(ip).with_category(listed.category)),
                Err(_) => {
                    tracing::debug!(value = %listed.value, "skipping invalid IP in blocklist document");
                    None
                }
            }
        });

        let patterns = self
            .patterns
            .into_iter()
            .map(|listed| Entry::pattern(listed.value).with_category(listed.category));

        domains.chain(ips).chain(patterns).collect()
    }
}

/// Parser for JSON blocklist documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBlocklistParser;

impl BlocklistParser for JsonBlocklistParser {
    fn parse(&self, reader: &mut dyn BufRead) -> Result<Vec<Entry>, ParseError> {
        let document: BlocklistDocument = serde_json::from_reader(reader)?;
        Ok(document.into_entries())
    }
}
