//! IP packet parsing and DNS reply construction.
//!
//! The diverter hands over raw IP packets (no link-layer header). Parsing
//! borrows the payload straight from the captured buffer.

// DNS replies are small (max 512 bytes for standard UDP DNS), so the
// usize to u16 casts below never truncate.
#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet_packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::{MutableUdpPacket, UdpPacket};

use crate::error::{NetworkError, Result};

/// IPv4 header size in bytes (without options).
const IPV4_HEADER_SIZE: usize = 20;
/// IPv6 header size in bytes.
const IPV6_HEADER_SIZE: usize = 40;
/// UDP header size in bytes.
const UDP_HEADER_SIZE: usize = 8;
/// DNS header size in bytes.
const DNS_HEADER_SIZE: usize = 12;

pub const DNS_PORT: u16 = 53;
pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Other(u8),
}

impl Transport {
    fn from_protocol(protocol: IpNextHeaderProtocol) -> Self {
        if protocol == IpNextHeaderProtocols::Tcp {
            Self::Tcp
        } else if protocol == IpNextHeaderProtocols::Udp {
            Self::Udp
        } else {
            Self::Other(protocol.0)
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
            Self::Other(number) => write!(f, "IP/{number}"),
        }
    }
}

/// Addressing of a captured packet and a view on its transport payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMeta<'a> {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub transport: Transport,
    /// Zero for transports without ports.
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> PacketMeta<'a> {
    /// Parse an IPv4 or IPv6 packet.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let version = data
            .first()
            .map(|b| b >> 4)
            .ok_or(NetworkError::MalformedPacket("empty packet"))?;

        let (src_ip, dst_ip, protocol, segment) = match version {
            4 => {
                let ipv4 =
                    Ipv4Packet::new(data).ok_or(NetworkError::MalformedPacket("short IPv4 header"))?;
                let header_len = usize::from(ipv4.get_header_length()) * 4;
                let total_len = usize::from(ipv4.get_total_length()).min(data.len());
                if header_len < IPV4_HEADER_SIZE || header_len > total_len {
                    return Err(NetworkError::MalformedPacket("bad IPv4 header length").into());
                }
                (
                    IpAddr::V4(ipv4.get_source()),
                    IpAddr::V4(ipv4.get_destination()),
                    ipv4.get_next_level_protocol(),
                    &data[header_len..total_len],
                )
            }
            6 => {
                let ipv6 =
                    Ipv6Packet::new(data).ok_or(NetworkError::MalformedPacket("short IPv6 header"))?;
                let end = (IPV6_HEADER_SIZE + usize::from(ipv6.get_payload_length())).min(data.len());
                (
                    IpAddr::V6(ipv6.get_source()),
                    IpAddr::V6(ipv6.get_destination()),
                    ipv6.get_next_header(),
                    &data[IPV6_HEADER_SIZE..end],
                )
            }
            _ => return Err(NetworkError::MalformedPacket("not an IP packet").into()),
        };

        let transport = Transport::from_protocol(protocol);
        let (src_port, dst_port, payload) = match transport {
            Transport::Udp => {
                let udp =
                    UdpPacket::new(segment).ok_or(NetworkError::MalformedPacket("short UDP header"))?;
                (udp.get_source(), udp.get_destination(), &segment[UDP_HEADER_SIZE..])
            }
            Transport::Tcp => {
                let tcp =
                    TcpPacket::new(segment).ok_or(NetworkError::MalformedPacket("short TCP header"))?;
                let offset = (usize::from(tcp.get_data_offset()) * 4).min(segment.len());
                (tcp.get_source(), tcp.get_destination(), &segment[offset..])
            }
            Transport::Other(_) => (0, 0, segment),
        };

        Ok(Self {
            src_ip,
            dst_ip,
            transport,
            src_port,
            dst_port,
            payload,
        })
    }

    /// UDP with port 53 on either side.
    pub fn is_dns(&self) -> bool {
        self.transport == Transport::Udp && (self.src_port == DNS_PORT || self.dst_port == DNS_PORT)
    }

    /// A DNS answer coming back from a server.
    pub fn is_dns_response(&self) -> bool {
        self.transport == Transport::Udp && self.src_port == DNS_PORT
    }

    /// TCP towards a web port.
    pub fn is_web(&self) -> bool {
        self.transport == Transport::Tcp
            && (self.dst_port == HTTP_PORT || self.dst_port == HTTPS_PORT)
    }
}

/// Extract the first query name of a DNS message.
///
/// Falls back to walking the QNAME labels when the message does not decode
/// (truncated captures). Returns a lowercase name without the root dot.
pub fn dns_query_name(payload: &[u8]) -> Option<String> {
    if let Ok(message) = Message::from_bytes(payload)
        && let Some(query) = message.queries().first()
    {
        let name = query.name().to_utf8();
        let name = name.trim_end_matches('.');
        return (!name.is_empty()).then(|| name.to_lowercase());
    }

    qname_labels(payload)
}

fn qname_labels(payload: &[u8]) -> Option<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = DNS_HEADER_SIZE;

    while let Some(&len) = payload.get(pos) {
        // Zero terminates the name; a compression pointer ends what we can
        // read without following it.
        if len == 0 || len & 0xC0 == 0xC0 {
            break;
        }
        let start = pos + 1;
        let end = start + usize::from(len);
        let label = payload.get(start..end)?;
        labels.push(String::from_utf8_lossy(label).to_lowercase());
        pos = end;
    }

    (!labels.is_empty()).then(|| labels.join("."))
}

/// Addresses carried by the A and AAAA answers of a DNS response.
pub fn dns_answer_addresses(payload: &[u8]) -> Vec<IpAddr> {
    let Ok(message) = Message::from_bytes(payload) else {
        return Vec::new();
    };
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// Extract the `Host` header of an HTTP request, without port.
///
/// Only `GET`, `POST` and `HEAD` requests are inspected.
pub fn http_host(payload: &[u8]) -> Option<String> {
    const METHODS: [&[u8]; 3] = [b"GET ", b"POST ", b"HEAD "];
    if !METHODS.iter().any(|method| payload.starts_with(method)) {
        return None;
    }

    let text = String::from_utf8_lossy(payload);
    let headers = text.split("\r\n\r\n").next().unwrap_or_default();

    headers.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("host") {
            return None;
        }
        let host = strip_port(value.trim());
        (!host.is_empty()).then(|| host.to_lowercase())
    })
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Build an IP/UDP packet carrying `response` back to the sender of
/// `original`, with addresses and ports swapped and checksums set.
pub fn build_dns_reply(original: &PacketMeta<'_>, response: &Message) -> Result<Vec<u8>> {
    let dns_bytes = response
        .to_bytes()
        .map_err(|e| NetworkError::PacketConstruction(e.to_string()))?;

    match (original.src_ip, original.dst_ip) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            build_ipv4_reply(&dns_bytes, original, src_ip, dst_ip)
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            build_ipv6_reply(&dns_bytes, original, src_ip, dst_ip)
        }
        _ => Err(NetworkError::PacketConstruction("mixed IPv4/IPv6 addresses".into()).into()),
    }
}

fn write_udp(buffer: &mut [u8], original: &PacketMeta<'_>, dns_bytes: &[u8]) -> Result<()> {
    let mut udp = MutableUdpPacket::new(buffer)
        .ok_or_else(|| NetworkError::PacketConstruction("UDP packet creation failed".into()))?;
    udp.set_source(original.dst_port);
    udp.set_destination(original.src_port);
    udp.set_length((UDP_HEADER_SIZE + dns_bytes.len()) as u16);
    udp.set_payload(dns_bytes);
    Ok(())
}

fn build_ipv4_reply(
    dns_bytes: &[u8],
    original: &PacketMeta<'_>,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
) -> Result<Vec<u8>> {
    let udp_len = UDP_HEADER_SIZE + dns_bytes.len();
    let total_len = IPV4_HEADER_SIZE + udp_len;
    let mut packet = vec![0u8; total_len];

    write_udp(&mut packet[IPV4_HEADER_SIZE..], original, dns_bytes)?;

    {
        let mut ipv4 = MutableIpv4Packet::new(&mut packet)
            .ok_or_else(|| NetworkError::PacketConstruction("IPv4 packet creation failed".into()))?;
        ipv4.set_version(4);
        ipv4.set_header_length(5);
        ipv4.set_total_length(total_len as u16);
        ipv4.set_ttl(64);
        ipv4.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        // The reply travels from the original destination to the original source.
        ipv4.set_source(dst_ip);
        ipv4.set_destination(src_ip);
        ipv4.set_checksum(pnet_packet::ipv4::checksum(&ipv4.to_immutable()));
    }

    let checksum = {
        let udp = UdpPacket::new(&packet[IPV4_HEADER_SIZE..])
            .ok_or_else(|| NetworkError::PacketConstruction("UDP checksum failed".into()))?;
        pnet_packet::udp::ipv4_checksum(&udp, &dst_ip, &src_ip)
    };
    MutableUdpPacket::new(&mut packet[IPV4_HEADER_SIZE..])
        .ok_or_else(|| NetworkError::PacketConstruction("UDP checksum failed".into()))?
        .set_checksum(checksum);

    Ok(packet)
}

fn build_ipv6_reply(
    dns_bytes: &[u8],
    original: &PacketMeta<'_>,
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
) -> Result<Vec<u8>> {
    let udp_len = UDP_HEADER_SIZE + dns_bytes.len();
    let mut packet = vec![0u8; IPV6_HEADER_SIZE + udp_len];

    write_udp(&mut packet[IPV6_HEADER_SIZE..], original, dns_bytes)?;

    {
        let mut ipv6 = MutableIpv6Packet::new(&mut packet)
            .ok_or_else(|| NetworkError::PacketConstruction("IPv6 packet creation failed".into()))?;
        ipv6.set_version(6);
        ipv6.set_payload_length(udp_len as u16);
        ipv6.set_next_header(IpNextHeaderProtocols::Udp);
        ipv6.set_hop_limit(64);
        ipv6.set_source(dst_ip);
        ipv6.set_destination(src_ip);
    }

    let checksum = {
        let udp = UdpPacket::new(&packet[IPV6_HEADER_SIZE..])
            .ok_or_else(|| NetworkError::PacketConstruction("UDP checksum failed".into()))?;
        pnet_packet::udp::ipv6_checksum(&udp, &dst_ip, &src_ip)
    };
    MutableUdpPacket::new(&mut packet[IPV6_HEADER_SIZE..])
        .ok_or_else(|| NetworkError::PacketConstruction("UDP checksum failed".into()))?
        .set_checksum(checksum);

    Ok(packet)
}

/// Packet builders shared by tests and benches.
#[doc(hidden)]
pub mod fixtures {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use pnet_packet::tcp::MutableTcpPacket;
    use std::str::FromStr;

    fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: IpNextHeaderProtocol, segment: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; IPV4_HEADER_SIZE + segment.len()];
        packet[IPV4_HEADER_SIZE..].copy_from_slice(segment);
        if let Some(mut ipv4) = MutableIpv4Packet::new(&mut packet) {
            ipv4.set_version(4);
            ipv4.set_header_length(5);
            ipv4.set_total_length((IPV4_HEADER_SIZE + segment.len()) as u16);
            ipv4.set_ttl(64);
            ipv4.set_next_level_protocol(protocol);
            ipv4.set_source(src);
            ipv4.set_destination(dst);
        }
        packet
    }

    /// An IPv4/UDP packet.
    pub fn udp_v4(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
        let mut segment = vec![0u8; UDP_HEADER_SIZE + payload.len()];
        let segment_len = segment.len();
        if let Some(mut udp) = MutableUdpPacket::new(&mut segment) {
            udp.set_source(src.1);
            udp.set_destination(dst.1);
            udp.set_length(segment_len as u16);
            udp.set_payload(payload);
        }
        ipv4_packet(src.0, dst.0, IpNextHeaderProtocols::Udp, &segment)
    }

    /// An IPv4/TCP packet with a 20-byte TCP header.
    pub fn tcp_v4(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
        let mut segment = vec![0u8; 20 + payload.len()];
        if let Some(mut tcp) = MutableTcpPacket::new(&mut segment) {
            tcp.set_source(src.1);
            tcp.set_destination(dst.1);
            tcp.set_data_offset(5);
            tcp.set_payload(payload);
        }
        ipv4_packet(src.0, dst.0, IpNextHeaderProtocols::Tcp, &segment)
    }

    /// Wire bytes of an `A` query for `domain`.
    pub fn dns_query(domain: &str, id: u16) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(id);
        if let Ok(name) = Name::from_str(domain) {
            message.add_query(Query::query(name, RecordType::A));
        }
        message.to_bytes().unwrap_or_default()
    }

    /// Wire bytes of a response answering `domain` with `addresses`.
    pub fn dns_answer(domain: &str, addresses: &[IpAddr]) -> Vec<u8> {
        let mut message = Message::new();
        message.set_message_type(hickory_proto::op::MessageType::Response);
        if let Ok(name) = Name::from_str(domain) {
            message.add_query(Query::query(name.clone(), RecordType::A));
            for address in addresses {
                let rdata = match address {
                    IpAddr::V4(v4) => RData::A(hickory_proto::rr::rdata::A(*v4)),
                    IpAddr::V6(v6) => RData::AAAA(hickory_proto::rr::rdata::AAAA(*v6)),
                };
                message.add_answer(hickory_proto::rr::Record::from_rdata(name.clone(), 60, rdata));
            }
        }
        message.to_bytes().unwrap_or_default()
    }

    /// Wire bytes of an HTTP GET with the given `Host` header.
    pub fn http_get(host: &str) -> Vec<u8> {
        format!("GET / HTTP/1.1\r\nHost: {host}\r\nUser-Agent: test\r\n\r\n").into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, ResponseCode};
    use pnet_packet::Packet;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    const SERVER: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);

    #[test]
    fn should_parse_udp_dns_query() {
        let bytes = udp_v4((CLIENT, 50000), (SERVER, 53), &dns_query("Ads.Example.com", 7));

        let meta = PacketMeta::parse(&bytes).unwrap();

        assert_eq!(meta.src_ip, IpAddr::V4(CLIENT));
        assert_eq!(meta.dst_ip, IpAddr::V4(SERVER));
        assert_eq!(meta.transport, Transport::Udp);
        assert_eq!((meta.src_port, meta.dst_port), (50000, 53));
        assert!(meta.is_dns());
        assert!(!meta.is_dns_response());
        assert_eq!(dns_query_name(meta.payload).as_deref(), Some("ads.example.com"));
    }

    #[test]
    fn should_parse_tcp_payload_after_header() {
        let bytes = tcp_v4((CLIENT, 50001), (SERVER, 80), &http_get("example.com"));

        let meta = PacketMeta::parse(&bytes).unwrap();

        assert_eq!(meta.transport, Transport::Tcp);
        assert!(meta.is_web());
        assert!(meta.payload.starts_with(b"GET / HTTP/1.1"));
    }

    #[test]
    fn should_reject_non_ip_data() {
        assert!(PacketMeta::parse(&[]).is_err());
        assert!(PacketMeta::parse(&[0x20, 0, 0]).is_err());
        assert!(PacketMeta::parse(&[0x45, 0, 0]).is_err());
    }

    #[test]
    fn should_walk_labels_of_truncated_query() {
        let mut bytes = dns_query("tracker.example.net", 1);
        // Drop QTYPE/QCLASS so the message no longer decodes.
        bytes.truncate(bytes.len() - 4);

        assert_eq!(dns_query_name(&bytes).as_deref(), Some("tracker.example.net"));
    }

    #[test]
    fn should_return_none_for_empty_dns_payload() {
        assert_eq!(dns_query_name(&[0u8; 12]), None);
        assert_eq!(dns_query_name(&[1, 2, 3]), None);
    }

    #[test]
    fn should_collect_answer_addresses() {
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let payload = dns_answer("ads.example.com", &[IpAddr::V4(SERVER), v6]);

        assert_eq!(dns_answer_addresses(&payload), vec![IpAddr::V4(SERVER), v6]);
        assert!(dns_answer_addresses(&dns_query("ads.example.com", 1)).is_empty());
        assert!(dns_answer_addresses(b"garbage").is_empty());
    }

    #[test]
    fn should_extract_http_host_without_port() {
        assert_eq!(
            http_host(&http_get("WWW.Example.com:8080")).as_deref(),
            Some("www.example.com")
        );
        assert_eq!(
            http_host(b"HEAD / HTTP/1.1\r\nhost:  example.org\r\n\r\n").as_deref(),
            Some("example.org")
        );
        assert_eq!(
            http_host(b"GET / HTTP/1.1\r\nHost: [::1]:80\r\n\r\n").as_deref(),
            Some("::1")
        );
    }

    #[test]
    fn should_ignore_other_methods_and_bodies() {
        assert_eq!(http_host(b"PUT / HTTP/1.1\r\nHost: example.com\r\n\r\n"), None);
        assert_eq!(http_host(b"\x16\x03\x01\x02\x00"), None);
        assert_eq!(
            http_host(b"POST / HTTP/1.1\r\nAccept: */*\r\n\r\nHost: body.example.com"),
            None
        );
    }

    fn response(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(ResponseCode::NoError);
        msg
    }

    #[test]
    fn should_build_ipv4_reply_with_swapped_addresses() {
        let query = udp_v4((CLIENT, 50000), (SERVER, 53), &dns_query("blocked.com", 9));
        let meta = PacketMeta::parse(&query).unwrap();

        let reply = build_dns_reply(&meta, &response(9)).unwrap();

        let ipv4 = Ipv4Packet::new(&reply).unwrap();
        assert_eq!(ipv4.get_source(), SERVER);
        assert_eq!(ipv4.get_destination(), CLIENT);
        assert_eq!(ipv4.get_checksum(), pnet_packet::ipv4::checksum(&ipv4));

        let udp = UdpPacket::new(ipv4.payload()).unwrap();
        assert_eq!(udp.get_source(), 53);
        assert_eq!(udp.get_destination(), 50000);
        assert_eq!(
            udp.get_checksum(),
            pnet_packet::udp::ipv4_checksum(&udp, &SERVER, &CLIENT)
        );
        assert_eq!(Message::from_bytes(udp.payload()).unwrap().id(), 9);
    }

    #[test]
    fn should_build_ipv6_reply() {
        let original = PacketMeta {
            src_ip: IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            dst_ip: IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2)),
            transport: Transport::Udp,
            src_port: 40000,
            dst_port: 53,
            payload: &[],
        };

        let reply = build_dns_reply(&original, &response(1)).unwrap();

        let meta = PacketMeta::parse(&reply).unwrap();
        assert_eq!(meta.src_ip, original.dst_ip);
        assert_eq!(meta.dst_ip, original.src_ip);
        assert_eq!((meta.src_port, meta.dst_port), (53, 40000));
    }

    #[test]
    fn should_reject_mixed_ip_versions() {
        let original = PacketMeta {
            src_ip: IpAddr::V4(CLIENT),
            dst_ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            transport: Transport::Udp,
            src_port: 40000,
            dst_port: 53,
            payload: &[],
        };

        assert!(build_dns_reply(&original, &response(1)).is_err());
    }
}
