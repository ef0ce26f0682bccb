//! Defensiq - a network security dashboard for Windows.
//!
//! Defensiq intercepts outbound traffic through the WinDivert driver, drops
//! DNS queries and HTTP requests for blocklisted domains, and keeps an audit
//! trail of every decision. Around the filter it watches active connections,
//! tracks confidentiality, integrity and availability alerts, and offers
//! diagnostics, DNS-over-HTTPS and per-application rules.
//!
//! # Architecture
//!
//! - [`config`]: JSON settings with dot-path access and integrity checks
//! - [`events`]: security event log and its activity, security and error log files
//! - [`blocklist`]: entries, parsers, feeds and the persisted blocklist
//! - [`dns`]: domain matching, DNS-over-HTTPS and upstream resolution
//! - [`cache`]: TTL cache for DNS answers
//! - [`network`]: packet parsing, the packet driver, monitoring and app rules
//! - [`filter`]: the per-packet decision and the capture loop
//! - [`security`]: CIA triad monitoring
//! - [`diagnostics`]: connectivity checks and repairs
//! - [`nextdns`]: NextDNS profile API client
//! - [`platform`]: firewall rules, service registration and system commands
//! - [`app`]: wiring of the components above
//! - [`dashboard`]: the desktop window
//!
//! # Testing
//!
//! Components that touch the system sit behind traits with mock
//! implementations, so they can be tested without a driver or network:
//!
//! ```rust
//! use defensiq::blocklist::Category;
//! use defensiq::dns::Matcher;
//!
//! let mut matcher = Matcher::new();
//! matcher.insert_domain("ads.example.com", Category::Advertising);
//! assert!(matcher.is_blocked("tracker.ads.example.com"));
//! ```

pub mod app;
pub mod blocklist;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod diagnostics;
pub mod dns;
pub mod error;
pub mod events;
pub mod filter;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod nextdns;
pub mod platform;
pub mod security;

pub use app::{Paths, Services};
pub use config::{ConfigStore, Settings};
pub use error::{Error, Result};
