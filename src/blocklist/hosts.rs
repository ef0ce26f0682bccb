//! Hosts file format parser.
//!
//! Parses the standard hosts format used by published blocklists and by the
//! Windows `drivers\etc\hosts` file.

use std::io::BufRead;
use std::net::IpAddr;

use super::{BlocklistParser, Entry, ParseError};

/// Parser for hosts file format.
///
/// Only lines that point a name at `0.0.0.0` or `127.0.0.1` are blocklist
/// entries. System names such as `localhost` and anything that is itself an
/// address are skipped.
///
/// ```text
/// 127.0.0.1 localhost
/// 0.0.0.0 ads.example.com tracker.example.com
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct HostsFileParser;

/// Names that appear in every hosts file.
const IGNORED_DOMAINS: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
    "ip6-allhosts",
];

/// Addresses that mark a name as blocked.
pub const BLOCK_IPS: &[&str] = &["0.0.0.0", "127.0.0.1"];

/// Split a hosts line into its address and host names.
///
/// Returns `None` for blank lines, comments and lines without a host name.
pub fn host_mapping(line: &str) -> Option<(&str, Vec<&str>)> {
    let content = line.split('#').next().unwrap_or_default().trim();
    let mut parts = content.split_whitespace();
    let address = parts.next()?;
    let names: Vec<&str> = parts.collect();
    if names.is_empty() {
        return None;
    }
    Some((address, names))
}

impl BlocklistParser for HostsFileParser {
    fn parse(&self, reader: &mut dyn BufRead) -> Result<Vec<Entry>, ParseError> {
        let mut entries = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }

            let Some((address, names)) = host_mapping(&line) else {
                continue;
            };
            if !BLOCK_IPS.contains(&address) {
                continue;
            }

            for name in names {
                let lowered = name.to_lowercase();
                if IGNORED_DOMAINS.contains(&lowered.as_str()) {
                    continue;
                }
                if lowered.parse::<IpAddr>().is_ok() || looks_numeric(&lowered) {
                    continue;
                }
                entries.push(Entry::domain(lowered));
            }
        }

        Ok(entries)
    }
}

/// Malformed dotted numbers such as `0.0.0.0.0` that are not valid addresses.
fn looks_numeric(name: &str) -> bool {
    name.contains('.') && name.split('.').all(|part| part.parse::<u8>().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn parse(content: &str) -> Vec<String> {
        HostsFileParser
            .parse(&mut BufReader::new(content.as_bytes()))
            .unwrap()
            .into_iter()
            .map(|entry| match entry.target {
                super::super::Target::Domain(domain) => domain,
                other => panic!("unexpected entry {other:?}"),
            })
            .collect()
    }

    #[test]
    fn should_parse_simple_hosts_line() {
        assert_eq!(parse("0.0.0.0 ads.example.com"), vec!["ads.example.com"]);
        assert_eq!(parse("127.0.0.1 ads.example.com"), vec!["ads.example.com"]);
    }

    #[test]
    fn should_parse_multiple_domains_per_line() {
        let content = "0.0.0.0\tads.example.com   tracker.example.com  ";
        assert_eq!(parse(content), vec!["ads.example.com", "tracker.example.com"]);
    }

    #[test]
    fn should_strip_comments() {
        let content = "# Comment\n0.0.0.0 ads.example.com # inline\n# Another";
        assert_eq!(parse(content), vec!["ads.example.com"]);
    }

    #[test]
    fn should_ignore_system_names_case_insensitively() {
        let content = "127.0.0.1 localhost\n127.0.0.1 LocalHost\n0.0.0.0 ip6-allnodes\n0.0.0.0 ads.example.com";
        assert_eq!(parse(content), vec!["ads.example.com"]);
    }

    #[test]
    fn should_ignore_non_blocking_addresses() {
        let content = "192.168.1.1 router.local\n10.0.0.1 internal.example.com\n0.0.0.0 blocked.example.com";
        assert_eq!(parse(content), vec!["blocked.example.com"]);
    }

    #[test]
    fn should_ignore_address_like_names() {
        let content = "0.0.0.0 0.0.0.0\n0.0.0.0 0.0.0.0.0.0\n0.0.0.0 ::1\n0.0.0.0 real.example.com";
        assert_eq!(parse(content), vec!["real.example.com"]);
    }

    #[test]
    fn should_skip_malformed_lines() {
        let content = "0.0.0.0\njust-a-word\n0.0.0.0 ok.example.com";
        assert_eq!(parse(content), vec!["ok.example.com"]);
    }

    #[test]
    fn should_parse_steven_black_sample() {
        let content = r"
# Title: StevenBlack/hosts
127.0.0.1 localhost
127.0.0.1 localhost.localdomain
255.255.255.255 broadcasthost
::1 localhost
0.0.0.0 0.0.0.0

# Start StevenBlack
0.0.0.0 1-1ads.com
0.0.0.0 101com.com
0.0.0.0 101order.com
";
        assert_eq!(parse(content), vec!["1-1ads.com", "101com.com", "101order.com"]);
    }

    #[test]
    fn should_split_host_mappings() {
        assert_eq!(
            host_mapping("10.0.0.5  bank.example.com www.bank.example.com # note"),
            Some(("10.0.0.5", vec!["bank.example.com", "www.bank.example.com"]))
        );
        assert_eq!(host_mapping("# 10.0.0.5 example.com"), None);
        assert_eq!(host_mapping("   "), None);
        assert_eq!(host_mapping("10.0.0.5"), None);
    }
}
