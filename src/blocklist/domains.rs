//! Domain list format parser.
//!
//! Parses simple blocklist files with one domain or IP address per line.
//! Comments start with `#` and are ignored.

use std::io::BufRead;
use std::net::IpAddr;

use super::{BlocklistParser, Entry, ParseError};

/// Parser for simple domain list format.
///
/// # Format
///
/// - One domain or IP address per line
/// - Comments start with `#`
/// - Empty lines are ignored
/// - Whitespace is trimmed
/// - `*.example.com` is read as `example.com`, which already covers every
///   subdomain
///
/// # Example
///
/// ```text
/// # This is a comment
/// example.com
/// *.ads.example.com
/// 203.0.113.7
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainListParser;

impl BlocklistParser for DomainListParser {
    fn parse(&self, reader: &mut dyn BufRead) -> Result<Vec<Entry>, ParseError> {
        let mut entries = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line)?;
            if bytes_read == 0 {
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Ok(ip) = trimmed.parse::<IpAddr>() {
                entries.push(Entry::ip(ip));
                continue;
            }

            let domain = trimmed.strip_prefix("*.").unwrap_or(trimmed);
            entries.push(Entry::domain(domain));
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn parse(content: &str) -> Vec<Entry> {
        DomainListParser
            .parse(&mut BufReader::new(content.as_bytes()))
            .unwrap()
    }

    fn domains(entries: &[&str]) -> Vec<Entry> {
        entries.iter().map(|d| Entry::domain(*d)).collect()
    }

    #[test]
    fn should_parse_one_domain_per_line() {
        let entries = parse("example.com\ntest.org\nanother.net");
        assert_eq!(entries, domains(&["example.com", "test.org", "another.net"]));
    }

    #[test]
    fn should_skip_comments_and_empty_lines() {
        let entries = parse("# Comment line\nexample.com\n\n\n  # indented\ntest.org\n");
        assert_eq!(entries, domains(&["example.com", "test.org"]));
    }

    #[test]
    fn should_trim_whitespace() {
        let entries = parse("  example.com  \n\ttest.org\t");
        assert_eq!(entries, domains(&["example.com", "test.org"]));
    }

    #[test]
    fn should_read_wildcards_as_parent_domains() {
        let entries = parse("*.example.com\n*.ads.test.org");
        assert_eq!(entries, domains(&["example.com", "ads.test.org"]));
    }

    #[test]
    fn should_parse_ip_lines_as_ip_entries() {
        let entries = parse("203.0.113.7\nads.example.com\n2001:db8::1");
        assert_eq!(
            entries,
            vec![
                Entry::ip("203.0.113.7".parse().unwrap()),
                Entry::domain("ads.example.com"),
                Entry::ip("2001:db8::1".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn should_return_nothing_for_comment_only_file() {
        assert!(parse("# Comment 1\n# Comment 2").is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn should_handle_windows_line_endings() {
        let entries = parse("example.com\r\ntest.org\r\n");
        assert_eq!(entries, domains(&["example.com", "test.org"]));
    }
}
