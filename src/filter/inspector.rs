//! Per-packet blocking decisions.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::RwLock;

use crate::blocklist::Category;
use crate::dns::{Matcher, Verdict};
use crate::network::packet::{
    HTTP_PORT, PacketMeta, Transport, dns_answer_addresses, dns_query_name, http_host,
};

/// Addresses remembered with the domain they were resolved for.
const DOMAIN_CACHE_CAPACITY: u64 = 10_000;
const DOMAIN_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// What matched a blocked packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// Destination address is blocklisted.
    Ip,
    /// DNS question for a blocklisted domain.
    Dns,
    /// Web traffic to an address resolved from a blocklisted domain.
    Web,
    /// HTTP request whose `Host` header is blocklisted.
    HttpHost,
}

impl Mechanism {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Dns => "dns",
            Self::Web => "web",
            Self::HttpHost => "http_host",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block {
        mechanism: Mechanism,
        category: Category,
        /// Full log message, e.g. `Blocked DNS (custom): ads.example.com - Exact match`.
        reason: String,
    },
}

impl Decision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block { .. })
    }

    fn block(mechanism: Mechanism, verdict: Verdict, reason: String) -> Self {
        Self::Block {
            mechanism,
            category: verdict.category,
            reason,
        }
    }
}

/// Decides the fate of packets against the shared blocklist matcher.
///
/// DNS answers and HTTP `Host` headers seen on the way are remembered per
/// address, so later connections to those addresses can be attributed to a
/// domain.
pub struct PacketInspector {
    matcher: Arc<RwLock<Matcher>>,
    domains: Cache<IpAddr, String>,
}

impl PacketInspector {
    pub fn new(matcher: Arc<RwLock<Matcher>>) -> Self {
        Self {
            matcher,
            domains: Cache::builder()
                .max_capacity(DOMAIN_CACHE_CAPACITY)
                .time_to_live(DOMAIN_CACHE_TTL)
                .build(),
        }
    }

    /// Domain last associated with `ip`.
    pub fn domain_for(&self, ip: IpAddr) -> Option<String> {
        self.domains.get(&ip)
    }

    pub fn inspect(&self, packet: &PacketMeta<'_>) -> Decision {
        let matcher = self.matcher.read();

        if let Some(verdict) = matcher.check_ip(packet.dst_ip) {
            let reason = format!("Blocked IP ({}): {}", verdict.category, verdict.reason);
            return Decision::block(Mechanism::Ip, verdict, reason);
        }

        if packet.is_dns()
            && let Some(domain) = dns_query_name(packet.payload)
        {
            if packet.is_dns_response() {
                for address in dns_answer_addresses(packet.payload) {
                    self.domains.insert(address, domain.clone());
                }
            }
            if let Some(verdict) = matcher.check_domain(&domain) {
                let reason = format!(
                    "Blocked DNS ({}): {} - {}",
                    verdict.category, domain, verdict.reason
                );
                return Decision::block(Mechanism::Dns, verdict, reason);
            }
        }

        if packet.is_web() {
            if let Some(domain) = self.domains.get(&packet.dst_ip)
                && let Some(verdict) = matcher.check_domain(&domain)
            {
                let reason = format!(
                    "Blocked HTTP/HTTPS to {} ({}): {}",
                    domain, verdict.category, verdict.reason
                );
                return Decision::block(Mechanism::Web, verdict, reason);
            }

            if packet.transport == Transport::Tcp
                && packet.dst_port == HTTP_PORT
                && let Some(host) = http_host(packet.payload)
            {
                self.domains.insert(packet.dst_ip, host.clone());
                if let Some(verdict) = matcher.check_domain(&host) {
                    let reason = format!(
                        "Blocked HTTP Host ({}): {} - {}",
                        verdict.category, host, verdict.reason
                    );
                    return Decision::block(Mechanism::HttpHost, verdict, reason);
                }
            }
        }

        Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::fixtures::{dns_answer, dns_query, http_get, tcp_v4, udp_v4};
    use std::net::Ipv4Addr;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    const RESOLVER: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
    const WEB: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

    fn inspector(build: impl FnOnce(&mut Matcher)) -> PacketInspector {
        let mut matcher = Matcher::new();
        build(&mut matcher);
        PacketInspector::new(Arc::new(RwLock::new(matcher)))
    }

    fn reason(decision: Decision) -> String {
        match decision {
            Decision::Block { reason, .. } => reason,
            Decision::Allow => panic!("expected a blocked packet"),
        }
    }

    #[test]
    fn should_block_listed_destination_ip() {
        let inspector = inspector(|m| m.insert_ip(IpAddr::V4(WEB), Category::Malware));
        let bytes = tcp_v4((CLIENT, 50000), (WEB, 8443), b"");

        let decision = inspector.inspect(&PacketMeta::parse(&bytes).unwrap());

        assert_eq!(reason(decision), "Blocked IP (malware): Exact match");
    }

    #[test]
    fn should_block_dns_query_for_listed_domain() {
        let inspector = inspector(|m| m.insert_domain("ads.example.com", Category::Custom));
        let bytes = udp_v4((CLIENT, 50000), (RESOLVER, 53), &dns_query("ads.example.com", 1));

        let decision = inspector.inspect(&PacketMeta::parse(&bytes).unwrap());

        assert!(matches!(decision, Decision::Block { mechanism: Mechanism::Dns, .. }));
        assert_eq!(reason(decision), "Blocked DNS (custom): ads.example.com - Exact match");
    }

    #[test]
    fn should_report_parent_domain_in_dns_reason() {
        let inspector = inspector(|m| m.insert_domain("example.com", Category::Phishing));
        let bytes = udp_v4((CLIENT, 50000), (RESOLVER, 53), &dns_query("login.example.com", 1));

        let decision = inspector.inspect(&PacketMeta::parse(&bytes).unwrap());

        assert_eq!(
            reason(decision),
            "Blocked DNS (phishing): login.example.com - Parent domain match: example.com"
        );
    }

    #[test]
    fn should_allow_unlisted_traffic() {
        let inspector = inspector(|m| m.insert_domain("ads.example.com", Category::Custom));
        let query = udp_v4((CLIENT, 50000), (RESOLVER, 53), &dns_query("example.org", 1));
        let web = tcp_v4((CLIENT, 50001), (WEB, 443), b"");

        assert_eq!(inspector.inspect(&PacketMeta::parse(&query).unwrap()), Decision::Allow);
        assert_eq!(inspector.inspect(&PacketMeta::parse(&web).unwrap()), Decision::Allow);
    }

    #[test]
    fn should_attribute_web_traffic_to_resolved_domain() {
        let inspector = inspector(|m| m.insert_domain("tracker.example.com", Category::Advertising));
        let answer = udp_v4(
            (RESOLVER, 53),
            (CLIENT, 50000),
            &dns_answer("cdn.tracker.example.com", &[IpAddr::V4(WEB)]),
        );
        // The answer itself names a blocked domain.
        assert!(inspector.inspect(&PacketMeta::parse(&answer).unwrap()).is_blocked());
        assert_eq!(
            inspector.domain_for(IpAddr::V4(WEB)).as_deref(),
            Some("cdn.tracker.example.com")
        );

        let https = tcp_v4((CLIENT, 50001), (WEB, 443), b"");
        let decision = inspector.inspect(&PacketMeta::parse(&https).unwrap());

        assert_eq!(
            reason(decision),
            "Blocked HTTP/HTTPS to cdn.tracker.example.com (advertising): \
             Parent domain match: tracker.example.com"
        );
    }

    #[test]
    fn should_block_http_host_header() {
        let inspector = inspector(|m| m.insert_domain("blocked.test", Category::Gambling));
        let bytes = tcp_v4((CLIENT, 50002), (WEB, 80), &http_get("blocked.test:8080"));

        let decision = inspector.inspect(&PacketMeta::parse(&bytes).unwrap());

        assert!(matches!(decision, Decision::Block { mechanism: Mechanism::HttpHost, .. }));
        assert_eq!(reason(decision), "Blocked HTTP Host (gambling): blocked.test - Exact match");
        assert_eq!(inspector.domain_for(IpAddr::V4(WEB)).as_deref(), Some("blocked.test"));
    }

    #[test]
    fn should_see_matcher_updates_immediately() {
        let matcher = Arc::new(RwLock::new(Matcher::new()));
        let inspector = PacketInspector::new(matcher.clone());
        let bytes = udp_v4((CLIENT, 50000), (RESOLVER, 53), &dns_query("late.example.com", 1));
        assert_eq!(inspector.inspect(&PacketMeta::parse(&bytes).unwrap()), Decision::Allow);

        matcher.write().insert_domain("late.example.com", Category::Custom);

        assert!(inspector.inspect(&PacketMeta::parse(&bytes).unwrap()).is_blocked());
    }
}
