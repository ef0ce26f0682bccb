//! DNS resolver trait and implementations.
//!
//! [`DnsResolver`] is the seam between code that needs answers (diagnostics,
//! provider tests) and the transport that produces them: plain UDP here,
//! DNS-over-HTTPS in [`doh`](super::doh), mocks in tests.

use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// Maximum DNS message size over UDP.
pub const MAX_UDP_DNS_SIZE: usize = 512;

/// How long to wait for an upstream UDP answer.
const UDP_TIMEOUT: Duration = Duration::from_secs(3);

/// Trait for DNS resolution.
pub trait DnsResolver: Send + Sync + Clone + 'static {
    /// Resolve a DNS query and return the response.
    fn resolve(&self, query: &Message) -> impl Future<Output = Result<Message>> + Send;
}

/// Build a recursive query for `domain`.
///
/// The message ID is 0, which keeps DNS-over-HTTPS answers cacheable by
/// intermediaries.
pub fn build_query(domain: &str, record_type: RecordType) -> Result<Message> {
    let name = Name::from_str(domain)?;

    let mut message = Message::new();
    message
        .set_id(0)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    Ok(message)
}

/// Render the answers of `record_type` as strings.
///
/// A and AAAA give addresses, CNAME gives the target name without the root
/// dot. Other record types are ignored.
pub fn answer_strings(response: &Message, record_type: RecordType) -> Vec<String> {
    response
        .answers()
        .iter()
        .filter_map(|record| match (record_type, record.data()) {
            (RecordType::A, RData::A(a)) => Some(a.0.to_string()),
            (RecordType::AAAA, RData::AAAA(aaaa)) => Some(aaaa.0.to_string()),
            (RecordType::CNAME, RData::CNAME(cname)) => {
                Some(cname.0.to_utf8().trim_end_matches('.').to_string())
            }
            _ => None,
        })
        .collect()
}

/// Upstream DNS resolver using UDP.
///
/// Diagnostics query it directly when the system resolver fails.
#[derive(Clone)]
pub struct UpstreamResolver {
    upstream_addr: SocketAddr,
}

impl UpstreamResolver {
    /// Create a new upstream resolver.
    pub const fn new(upstream_addr: SocketAddr) -> Self {
        Self { upstream_addr }
    }
}

impl DnsResolver for UpstreamResolver {
    async fn resolve(&self, query: &Message) -> Result<Message> {
        let bind_addr = if self.upstream_addr.is_ipv6() {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.upstream_addr).await?;

        let query_bytes = query.to_bytes()?;
        socket.send(&query_bytes).await?;

        let mut response_buf = [0u8; MAX_UDP_DNS_SIZE];
        let len = tokio::time::timeout(UDP_TIMEOUT, socket.recv(&mut response_buf))
            .await
            .map_err(|_| Error::Resolver(format!("{} did not answer", self.upstream_addr)))??;

        let response = Message::from_bytes(&response_buf[..len])?;
        Ok(response)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::Record;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::RwLock;

    /// Mock resolver for testing.
    ///
    /// Allows pre-configuring responses and tracking resolve calls.
    #[derive(Clone, Default)]
    pub struct MockResolver {
        /// Pre-configured responses by domain name.
        pub responses: Arc<RwLock<HashMap<Name, Message>>>,
        /// Count of resolve calls.
        pub resolve_count: Arc<AtomicU64>,
        /// If set, resolve will return this error.
        pub error: Arc<RwLock<Option<String>>>,
    }

    impl MockResolver {
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a pre-configured response for a domain.
        pub async fn add_response(&self, name: Name, response: Message) {
            self.responses.write().await.insert(name, response);
        }

        /// Configure the resolver to return an error.
        pub async fn set_error(&self, error: &str) {
            *self.error.write().await = Some(error.to_string());
        }

        /// Get the number of resolve calls.
        pub fn resolve_count(&self) -> u64 {
            self.resolve_count.load(Ordering::SeqCst)
        }
    }

    impl DnsResolver for MockResolver {
        async fn resolve(&self, query: &Message) -> Result<Message> {
            self.resolve_count.fetch_add(1, Ordering::SeqCst);

            if let Some(error) = self.error.read().await.as_ref() {
                return Err(Error::Resolver(error.clone()));
            }

            if let Some(q) = query.queries().first()
                && let Some(response) = self.responses.read().await.get(q.name())
            {
                let mut resp = response.clone();
                resp.set_id(query.id());
                return Ok(resp);
            }

            let mut response = Message::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_response_code(ResponseCode::NXDomain);
            Ok(response)
        }
    }

    /// A `NoError` answer for `domain` carrying `records`.
    pub fn response_with(domain: &str, records: Vec<RData>) -> Message {
        let name = Name::from_str(domain).unwrap();
        let mut response = Message::new();
        response
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(ResponseCode::NoError);
        for rdata in records {
            response.add_answer(Record::from_rdata(name.clone(), 60, rdata));
        }
        response
    }

    #[test]
    fn should_build_recursive_query_with_zero_id() {
        let query = build_query("example.com", RecordType::AAAA).unwrap();

        assert_eq!(query.id(), 0);
        assert!(query.recursion_desired());
        assert_eq!(query.queries()[0].query_type(), RecordType::AAAA);
        assert_eq!(query.queries()[0].name().to_utf8(), "example.com");
    }

    #[test]
    fn should_reject_invalid_domain() {
        let long_label = "a".repeat(64);
        assert!(build_query(&format!("{long_label}.com"), RecordType::A).is_err());
    }

    #[test]
    fn should_extract_answers_of_requested_type() {
        let response = response_with(
            "example.com.",
            vec![
                RData::CNAME(CNAME(Name::from_str("edge.example.net.").unwrap())),
                RData::A(A("93.184.216.34".parse().unwrap())),
                RData::AAAA(AAAA("2606:2800::1".parse().unwrap())),
            ],
        );

        assert_eq!(answer_strings(&response, RecordType::A), vec!["93.184.216.34"]);
        assert_eq!(answer_strings(&response, RecordType::AAAA), vec!["2606:2800::1"]);
        assert_eq!(
            answer_strings(&response, RecordType::CNAME),
            vec!["edge.example.net"]
        );
        assert!(answer_strings(&response, RecordType::MX).is_empty());
    }

    #[tokio::test]
    async fn should_return_nxdomain_when_no_response_configured() {
        let resolver = MockResolver::new();
        let query = build_query("example.com", RecordType::A).unwrap();

        let response = resolver.resolve(&query).await.unwrap();

        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(resolver.resolve_count(), 1);
    }

    #[tokio::test]
    async fn should_return_configured_response_for_domain() {
        let resolver = MockResolver::new();
        resolver
            .add_response(
                Name::from_str("example.com").unwrap(),
                response_with("example.com", vec![RData::A(A("10.0.0.1".parse().unwrap()))]),
            )
            .await;

        let query = build_query("example.com", RecordType::A).unwrap();
        let result = resolver.resolve(&query).await.unwrap();

        assert_eq!(answer_strings(&result, RecordType::A), vec!["10.0.0.1"]);
    }

    #[tokio::test]
    async fn should_return_error_when_resolver_configured_to_fail() {
        let resolver = MockResolver::new();
        resolver.set_error("connection refused").await;

        let query = build_query("example.com", RecordType::A).unwrap();
        let result = resolver.resolve(&query).await;

        assert!(matches!(result, Err(Error::Resolver(_))));
    }
}
