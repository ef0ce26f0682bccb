//! Compiled blocklist lookups.
//!
//! A [`Matcher`] is an immutable snapshot of the user blocklist and every
//! enabled feed. Lookups never touch disk and do not allocate beyond
//! lowercasing the queried name.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use regex::Regex;

use crate::blocklist::Category;
use crate::blocklist::store::{compile_pattern, normalize_domain};

/// Why something was blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub category: Category,
    /// `Exact match`, `Parent domain match: <parent>` or `Pattern match: <regex>`.
    pub reason: String,
}

#[derive(Debug, Clone)]
struct PatternRule {
    source: String,
    regex: Regex,
    category: Category,
}

/// A compiled blocklist for efficient domain and IP lookups.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    /// Blocked domains (lowercase, without trailing dot).
    domains: HashMap<String, Category>,
    ips: HashMap<IpAddr, Category>,
    patterns: Vec<PatternRule>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block a domain and its subdomains. The first category inserted wins.
    pub fn insert_domain(&mut self, domain: &str, category: Category) {
        if let Some(domain) = normalize_domain(domain) {
            self.domains.entry(domain).or_insert(category);
        }
    }

    pub fn insert_ip(&mut self, ip: IpAddr, category: Category) {
        self.ips.entry(ip).or_insert(category);
    }

    /// Add a case-insensitive regex searched anywhere in the domain.
    ///
    /// Invalid patterns are ignored; the store validates them on insert.
    pub fn insert_pattern(&mut self, pattern: &str, category: Category) {
        if let Ok(regex) = compile_pattern(pattern) {
            self.patterns.push(PatternRule {
                source: pattern.to_string(),
                regex,
                category,
            });
        }
    }

    /// Check a domain: exact match, then each parent domain from the nearest
    /// one up, then the regex patterns.
    pub fn check_domain(&self, domain: &str) -> Option<Verdict> {
        let domain = domain.trim_end_matches('.').to_lowercase();

        if let Some(category) = self.domains.get(&domain) {
            return Some(Verdict {
                category: category.clone(),
                reason: "Exact match".to_string(),
            });
        }

        for (idx, _) in domain.match_indices('.') {
            let parent = &domain[idx + 1..];
            if let Some(category) = self.domains.get(parent) {
                return Some(Verdict {
                    category: category.clone(),
                    reason: format!("Parent domain match: {parent}"),
                });
            }
        }

        self.patterns
            .iter()
            .find(|rule| rule.regex.is_match(&domain))
            .map(|rule| Verdict {
                category: rule.category.clone(),
                reason: format!("Pattern match: {}", rule.source),
            })
    }

    /// Check a DNS name.
    #[inline]
    pub fn check_name(&self, name: &Name) -> Option<Verdict> {
        self.check_domain(&name.to_utf8())
    }

    pub fn check_ip(&self, ip: IpAddr) -> Option<Verdict> {
        self.ips.get(&ip).map(|category| Verdict {
            category: category.clone(),
            reason: "Exact match".to_string(),
        })
    }

    #[inline]
    pub fn is_blocked(&self, domain: &str) -> bool {
        self.check_domain(domain).is_some()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.ips.is_empty() && self.patterns.is_empty()
    }

    /// Total number of domains, IPs and patterns.
    #[inline]
    pub fn len(&self) -> usize {
        self.domains.len() + self.ips.len() + self.patterns.len()
    }

    /// Create a sinkhole response for a blocked DNS query.
    ///
    /// Returns unspecified addresses:
    /// - A records → `0.0.0.0`
    /// - AAAA records → `::`
    pub fn blocked_response(query: &Message) -> Message {
        let mut response = Message::new();
        response
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(query.recursion_desired())
            .set_recursion_available(true)
            .set_response_code(ResponseCode::NoError);

        for q in query.queries() {
            response.add_query(q.clone());
        }

        if let Some(query_record) = query.queries().first() {
            let name = query_record.name().clone();
            let record = match query_record.query_type() {
                RecordType::AAAA => {
                    Record::from_rdata(name, 300, RData::AAAA(AAAA(Ipv6Addr::UNSPECIFIED)))
                }
                _ => Record::from_rdata(name, 300, RData::A(A(Ipv4Addr::UNSPECIFIED))),
            };
            response.add_answer(record);
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn matcher(domains: &[&str]) -> Matcher {
        let mut matcher = Matcher::new();
        for domain in domains {
            matcher.insert_domain(domain, Category::Custom);
        }
        matcher
    }

    #[test]
    fn should_report_exact_match() {
        let matcher = matcher(&["ads.example.com"]);

        let verdict = matcher.check_domain("ads.example.com").unwrap();
        assert_eq!(verdict.category, Category::Custom);
        assert_eq!(verdict.reason, "Exact match");
    }

    #[test]
    fn should_match_case_insensitively_and_ignore_root_dot() {
        let matcher = matcher(&["Google.COM"]);

        assert!(matcher.is_blocked("google.com"));
        assert!(matcher.is_blocked("GoOgLe.CoM."));
    }

    #[test]
    fn should_report_nearest_parent_domain() {
        let mut matcher = Matcher::new();
        matcher.insert_domain("example.com", Category::Malware);
        matcher.insert_domain("ads.example.com", Category::Advertising);

        let verdict = matcher.check_domain("x.tracker.ads.example.com").unwrap();
        assert_eq!(verdict.category, Category::Advertising);
        assert_eq!(verdict.reason, "Parent domain match: ads.example.com");

        let verdict = matcher.check_domain("www.example.com").unwrap();
        assert_eq!(verdict.category, Category::Malware);
        assert_eq!(verdict.reason, "Parent domain match: example.com");
    }

    #[test]
    fn should_not_match_lookalike_suffixes() {
        let matcher = matcher(&["ads.com"]);

        assert!(!matcher.is_blocked("notads.com"));
        assert!(!matcher.is_blocked("ads.com.evil.net"));
    }

    #[test]
    fn should_fall_back_to_patterns() {
        let mut matcher = matcher(&["other.com"]);
        matcher.insert_pattern("^track(er)?\\.", Category::Custom);

        let verdict = matcher.check_domain("Tracker.example.net").unwrap();
        assert_eq!(verdict.reason, "Pattern match: ^track(er)?\\.");
        assert!(!matcher.is_blocked("example.net"));
    }

    #[test]
    fn should_prefer_domain_match_over_pattern() {
        let mut matcher = matcher(&["tracker.example.net"]);
        matcher.insert_pattern("tracker", Category::Malware);

        let verdict = matcher.check_domain("tracker.example.net").unwrap();
        assert_eq!(verdict.reason, "Exact match");
        assert_eq!(verdict.category, Category::Custom);
    }

    #[test]
    fn should_keep_first_category_inserted() {
        let mut matcher = Matcher::new();
        matcher.insert_domain("ads.example.com", Category::Custom);
        matcher.insert_domain("ads.example.com", Category::Advertising);

        assert_eq!(
            matcher.check_domain("ads.example.com").unwrap().category,
            Category::Custom
        );
    }

    #[test]
    fn should_match_ips_exactly() {
        let mut matcher = Matcher::new();
        matcher.insert_ip("203.0.113.7".parse().unwrap(), Category::Malware);

        let verdict = matcher.check_ip("203.0.113.7".parse().unwrap()).unwrap();
        assert_eq!(verdict.category, Category::Malware);
        assert_eq!(verdict.reason, "Exact match");
        assert!(matcher.check_ip("203.0.113.8".parse().unwrap()).is_none());
    }

    #[test]
    fn should_check_dns_names() {
        let matcher = matcher(&["blocked.com"]);
        let name = Name::from_str("www.blocked.com.").unwrap();

        assert!(matcher.check_name(&name).is_some());
    }

    #[test]
    fn should_count_entries() {
        let mut matcher = Matcher::default();
        assert!(matcher.is_empty());

        matcher.insert_domain("a.com", Category::Custom);
        matcher.insert_ip("10.0.0.1".parse().unwrap(), Category::Custom);
        matcher.insert_pattern("^x", Category::Custom);
        assert_eq!(matcher.len(), 3);
        assert!(!matcher.is_empty());
    }

    fn query(domain: &str, record_type: RecordType, id: u16) -> Message {
        let mut query = Message::new();
        query.set_id(id);
        query.add_query({
            let mut q = hickory_proto::op::Query::new();
            q.set_name(Name::from_str(domain).unwrap());
            q.set_query_type(record_type);
            q
        });
        query
    }

    #[test]
    fn should_return_unspecified_address_for_blocked_ipv4_query() {
        let response = Matcher::blocked_response(&query("blocked.com", RecordType::A, 1234));

        assert_eq!(response.id(), 1234);
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.queries().len(), 1);
        let Some(a) = response.answers()[0].data().as_a() else {
            panic!("Expected A record");
        };
        assert_eq!(a.0, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn should_return_unspecified_address_for_blocked_ipv6_query() {
        let response = Matcher::blocked_response(&query("blocked.com", RecordType::AAAA, 5678));

        let Some(aaaa) = response.answers()[0].data().as_aaaa() else {
            panic!("Expected AAAA record");
        };
        assert_eq!(aaaa.0, Ipv6Addr::UNSPECIFIED);
    }
}
