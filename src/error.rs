//! Error types for Defensiq.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for Defensiq operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("packet driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::ProtoError),

    #[error("resolver error: {0}")]
    Resolver(String),

    #[error("blocklist error: {0}")]
    Blocklist(#[from] crate::blocklist::manager::ManagerError),

    #[error("DoH error: {0}")]
    Doh(#[from] crate::dns::DohError),

    #[error("command error: {0}")]
    Command(#[from] crate::platform::CommandError),

    #[error("NextDNS error: {0}")]
    NextDns(#[from] crate::nextdns::NextDnsError),

    #[error("filtering is disabled in settings")]
    FilteringDisabled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write settings file {path:?}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("setting {0:?} does not exist")]
    UnknownKey(String),

    #[error("setting {key:?} rejected: {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for settings values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("monitoring.update_interval must be greater than 0")]
    ZeroUpdateInterval,

    #[error("cia_triad.dos_threshold must be greater than 0")]
    ZeroDosThreshold,

    #[error("dns.cache_ttl_seconds must be greater than 0")]
    ZeroCacheTtl,

    #[error("dns.custom_server must be an https:// URL when dns.provider is custom: {0:?}")]
    InvalidCustomServer(String),

    #[error("blocklist feed name cannot be empty")]
    EmptyFeedName,

    #[error("duplicate blocklist feed name: {name:?}")]
    DuplicateFeedName { name: String },

    #[error("blocklist feed {name:?} has empty file path")]
    EmptyFeedPath { name: String },

    #[error("blocklist feed {name:?} has invalid URL (must start with http:// or https://): {url:?}")]
    InvalidFeedUrl { name: String, url: String },
}

/// Network-related errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("packet construction failed: {0}")]
    PacketConstruction(String),
}

/// Errors raised by the packet interception driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("packet interception is only available on Windows")]
    Unsupported,

    #[error("failed to open WinDivert handle with filter {filter:?}: {message}")]
    Open { filter: String, message: String },

    #[error("failed to receive packet: {0}")]
    Recv(String),

    #[error("failed to send packet: {0}")]
    Send(String),

    #[error("driver handle closed")]
    Closed,
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
