//! DNS matching and resolution.

pub mod doh;
pub mod matcher;
pub mod resolver;

pub use doh::{DohError, DohProvider, DohResolver};
pub use matcher::{Matcher, Verdict};
pub use resolver::{DnsResolver, UpstreamResolver};
