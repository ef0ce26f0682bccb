//! Security event log.
//!
//! Events are what the user sees in the dashboard and what gets exported:
//! blocked traffic, rule changes, integrity violations. They are kept in a
//! bounded in-memory buffer, appended to plain-text files under the log
//! directory, and mirrored to `tracing`.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Write as _};
use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::config::ExportFormat;

/// Number of events kept in memory.
pub const MAX_RECENT_EVENTS: usize = 1000;

pub const ACTIVITY_LOG: &str = "activity.log";
pub const SECURITY_LOG: &str = "security_events.log";
pub const ERROR_LOG: &str = "errors.log";

const LINE_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TrafficAllowed,
    TrafficBlocked,
    RuleAdded,
    RuleRemoved,
    ConfigChanged,
    ThreatDetected,
    CiaViolation,
    ServiceStarted,
    ServiceStopped,
    ErrorOccurred,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TrafficAllowed => "TRAFFIC_ALLOWED",
            Self::TrafficBlocked => "TRAFFIC_BLOCKED",
            Self::RuleAdded => "RULE_ADDED",
            Self::RuleRemoved => "RULE_REMOVED",
            Self::ConfigChanged => "CONFIG_CHANGED",
            Self::ThreatDetected => "THREAT_DETECTED",
            Self::CiaViolation => "CIA_VIOLATION",
            Self::ServiceStarted => "SERVICE_STARTED",
            Self::ServiceStopped => "SERVICE_STOPPED",
            Self::ErrorOccurred => "ERROR_OCCURRED",
        }
    }

    /// Security-relevant kinds, written to the security log.
    pub const fn is_security(self) -> bool {
        matches!(
            self,
            Self::TrafficBlocked | Self::ThreatDetected | Self::CiaViolation
        )
    }

    const fn sink(self) -> &'static str {
        match self {
            Self::TrafficBlocked | Self::ThreatDetected | Self::CiaViolation => SECURITY_LOG,
            Self::ErrorOccurred => ERROR_LOG,
            _ => ACTIVITY_LOG,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Local>,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub message: String,
    pub metadata: Map<String, Value>,
}

impl SecurityEvent {
    pub fn new(kind: EventType, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            kind,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        if let Value::Object(map) = metadata {
            self.metadata = map;
        }
        self
    }

    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.format(LINE_TIMESTAMP).to_string()
    }
}

/// `[2026-01-01 12:00:00] TRAFFIC_BLOCKED: Blocked DNS (custom): ads.example.com - Exact match`
impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.formatted_timestamp(),
            self.kind,
            self.message
        )
    }
}

/// Event counts over a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub period_hours: u32,
    pub total_events: usize,
    pub events_by_type: BTreeMap<String, usize>,
    pub blocked_connections: usize,
    pub allowed_connections: usize,
    pub threats_detected: usize,
}

/// Bounded, file-backed log of security events.
#[derive(Debug)]
pub struct EventLog {
    dir: Option<PathBuf>,
    recent: Mutex<VecDeque<SecurityEvent>>,
}

impl EventLog {
    /// Create a log writing its files under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: Some(dir),
            recent: Mutex::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        })
    }

    /// Create a log that only keeps events in memory.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn log(&self, kind: EventType, message: impl Into<String>) -> SecurityEvent {
        self.record(SecurityEvent::new(kind, message))
    }

    pub fn log_with(
        &self,
        kind: EventType,
        message: impl Into<String>,
        metadata: Value,
    ) -> SecurityEvent {
        self.record(SecurityEvent::new(kind, message).with_metadata(metadata))
    }

    /// Record a traffic decision.
    ///
    /// Blocked traffic uses `reason` as the message, so the log line reads
    /// `Blocked <mechanism> (<category>): <host> - <match reason>`.
    pub fn log_traffic(
        &self,
        allowed: bool,
        protocol: &str,
        src: IpAddr,
        dst: IpAddr,
        dst_port: u16,
        reason: &str,
    ) -> SecurityEvent {
        let metadata = json!({
            "protocol": protocol,
            "src_ip": src.to_string(),
            "dst_ip": dst.to_string(),
            "dst_port": dst_port,
            "reason": reason,
        });

        let (kind, message) = if allowed {
            let mut message = format!("ALLOWED {protocol} {src} -> {dst}:{dst_port}");
            if !reason.is_empty() {
                let _ = write!(message, " ({reason})");
            }
            (EventType::TrafficAllowed, message)
        } else if reason.is_empty() {
            (
                EventType::TrafficBlocked,
                format!("BLOCKED {protocol} {src} -> {dst}:{dst_port}"),
            )
        } else {
            (EventType::TrafficBlocked, reason.to_string())
        };

        self.log_with(kind, message, metadata)
    }

    /// Store a pre-built event.
    pub fn record(&self, event: SecurityEvent) -> SecurityEvent {
        match event.kind {
            kind if kind.is_security() => {
                tracing::warn!(kind = %kind, metadata = ?event.metadata, "{}", event.message);
            }
            EventType::ErrorOccurred => {
                tracing::error!(metadata = ?event.metadata, "{}", event.message);
            }
            kind => {
                tracing::info!(kind = %kind, "{}", event.message);
            }
        }

        if let Some(dir) = &self.dir {
            let path = dir.join(event.kind.sink());
            if let Err(err) = append_line(&path, &event.to_string()) {
                tracing::warn!(path = ?path, error = %err, "failed to append event");
            }
        }

        let mut recent = self.recent.lock();
        if recent.len() == MAX_RECENT_EVENTS {
            recent.pop_front();
        }
        recent.push_back(event.clone());
        event
    }

    /// The last `count` events, optionally of one kind, oldest first.
    pub fn recent(&self, count: usize, kind: Option<EventType>) -> Vec<SecurityEvent> {
        let recent = self.recent.lock();
        let mut events: Vec<SecurityEvent> = recent
            .iter()
            .rev()
            .filter(|event| kind.is_none_or(|k| event.kind == k))
            .take(count)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    pub fn len(&self) -> usize {
        self.recent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.lock().is_empty()
    }

    /// Write the in-memory events between `from` and `to` (inclusive) to
    /// `path`. Returns the number of events written.
    pub fn export(
        &self,
        path: &Path,
        format: ExportFormat,
        from: Option<DateTime<Local>>,
        to: Option<DateTime<Local>>,
    ) -> io::Result<usize> {
        let events: Vec<SecurityEvent> = self
            .recent
            .lock()
            .iter()
            .filter(|event| from.is_none_or(|from| event.timestamp >= from))
            .filter(|event| to.is_none_or(|to| event.timestamp <= to))
            .cloned()
            .collect();

        let content = match format {
            ExportFormat::Json => serde_json::to_string_pretty(&events)?,
            ExportFormat::Csv => {
                let mut out = String::from("timestamp,type,message\n");
                for event in &events {
                    let _ = writeln!(
                        out,
                        "{},{},{}",
                        event.formatted_timestamp(),
                        event.kind,
                        csv_field(&event.message)
                    );
                }
                out
            }
            ExportFormat::Txt => events.iter().fold(String::new(), |mut out, event| {
                let _ = writeln!(out, "{event}");
                out
            }),
        };

        fs::write(path, content)?;
        tracing::info!(path = ?path, count = events.len(), ?format, "exported events");
        Ok(events.len())
    }

    /// Count the events of the last `hours`.
    pub fn summary(&self, hours: u32) -> EventSummary {
        let cutoff = Local::now() - Duration::hours(i64::from(hours));
        let mut summary = EventSummary {
            period_hours: hours,
            ..EventSummary::default()
        };

        for event in self.recent.lock().iter().filter(|e| e.timestamp > cutoff) {
            summary.total_events += 1;
            *summary
                .events_by_type
                .entry(event.kind.to_string())
                .or_default() += 1;
            match event.kind {
                EventType::TrafficBlocked => summary.blocked_connections += 1,
                EventType::TrafficAllowed => summary.allowed_connections += 1,
                EventType::ThreatDetected => summary.threats_detected += 1,
                _ => {}
            }
        }

        summary
    }
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(event: SecurityEvent, y: i32, m: u32, d: u32) -> SecurityEvent {
        SecurityEvent {
            timestamp: Local.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap(),
            ..event
        }
    }

    #[test]
    fn should_format_display_line() {
        let event = at(
            SecurityEvent::new(
                EventType::TrafficBlocked,
                "Blocked DNS (custom): ads.example.com - Exact match",
            ),
            2026,
            1,
            1,
        );

        assert_eq!(
            event.to_string(),
            "[2026-01-01 12:00:00] TRAFFIC_BLOCKED: Blocked DNS (custom): ads.example.com - Exact match"
        );
    }

    #[test]
    fn should_use_reason_as_blocked_message() {
        let log = EventLog::in_memory();

        let event = log.log_traffic(
            false,
            "UDP",
            "10.0.0.2".parse().unwrap(),
            "1.1.1.1".parse().unwrap(),
            53,
            "Blocked DNS (malware): bad.example.com - Exact match",
        );

        assert_eq!(event.kind, EventType::TrafficBlocked);
        assert_eq!(
            event.message,
            "Blocked DNS (malware): bad.example.com - Exact match"
        );
        assert_eq!(event.metadata["dst_port"], 53);
        assert_eq!(event.metadata["protocol"], "UDP");
    }

    #[test]
    fn should_describe_allowed_traffic() {
        let log = EventLog::in_memory();

        let event = log.log_traffic(
            true,
            "TCP",
            "10.0.0.2".parse().unwrap(),
            "93.184.216.34".parse().unwrap(),
            443,
            "",
        );

        assert_eq!(event.kind, EventType::TrafficAllowed);
        assert_eq!(event.message, "ALLOWED TCP 10.0.0.2 -> 93.184.216.34:443");
    }

    #[test]
    fn should_drop_oldest_events_beyond_capacity() {
        let log = EventLog::in_memory();

        for i in 0..MAX_RECENT_EVENTS + 5 {
            log.log(EventType::ConfigChanged, format!("change {i}"));
        }

        assert_eq!(log.len(), MAX_RECENT_EVENTS);
        let oldest = &log.recent(MAX_RECENT_EVENTS, None)[0];
        assert_eq!(oldest.message, "change 5");
    }

    #[test]
    fn should_filter_recent_events_by_kind() {
        let log = EventLog::in_memory();
        log.log(EventType::RuleAdded, "one");
        log.log(EventType::ConfigChanged, "two");
        log.log(EventType::RuleAdded, "three");
        log.log(EventType::RuleAdded, "four");

        let events = log.recent(2, Some(EventType::RuleAdded));

        let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["three", "four"]);
    }

    #[test]
    fn should_route_events_to_their_files() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::open(dir.path()).unwrap();

        log.log(EventType::TrafficBlocked, "Blocked IP (malware): Exact match");
        log.log(EventType::ErrorOccurred, "boom");
        log.log(EventType::ServiceStarted, "started");

        let security = fs::read_to_string(dir.path().join(SECURITY_LOG)).unwrap();
        let errors = fs::read_to_string(dir.path().join(ERROR_LOG)).unwrap();
        let activity = fs::read_to_string(dir.path().join(ACTIVITY_LOG)).unwrap();

        assert!(security.trim_end().ends_with("TRAFFIC_BLOCKED: Blocked IP (malware): Exact match"));
        assert!(errors.contains("ERROR_OCCURRED: boom"));
        assert!(activity.contains("SERVICE_STARTED: started"));
        assert!(!activity.contains("boom"));
    }

    #[test]
    fn should_export_csv_with_quoted_fields() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::in_memory();
        log.record(at(
            SecurityEvent::new(EventType::RuleAdded, "Added rule: chrome.exe, block"),
            2026,
            3,
            1,
        ));

        let path = dir.path().join("events.csv");
        let count = log.export(&path, ExportFormat::Csv, None, None).unwrap();

        assert_eq!(count, 1);
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "timestamp,type,message\n2026-03-01 12:00:00,RULE_ADDED,\"Added rule: chrome.exe, block\"\n"
        );
    }

    #[test]
    fn should_export_date_range_as_json() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::in_memory();
        log.record(at(SecurityEvent::new(EventType::RuleAdded, "old"), 2025, 1, 1));
        log.record(at(SecurityEvent::new(EventType::RuleAdded, "new"), 2026, 1, 1));

        let path = dir.path().join("events.json");
        let from = Local.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let count = log
            .export(&path, ExportFormat::Json, Some(from), None)
            .unwrap();

        assert_eq!(count, 1);
        let exported: Vec<SecurityEvent> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(exported[0].message, "new");
        assert_eq!(exported[0].kind, EventType::RuleAdded);
    }

    #[test]
    fn should_export_txt_lines() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::in_memory();
        log.record(at(SecurityEvent::new(EventType::ServiceStopped, "bye"), 2026, 2, 2));

        let path = dir.path().join("events.txt");
        log.export(&path, ExportFormat::Txt, None, None).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "[2026-02-02 12:00:00] SERVICE_STOPPED: bye\n"
        );
    }

    #[test]
    fn should_summarize_recent_window() {
        let log = EventLog::in_memory();
        log.record(at(SecurityEvent::new(EventType::TrafficBlocked, "ancient"), 2000, 1, 1));
        log.log(EventType::TrafficBlocked, "a");
        log.log(EventType::TrafficBlocked, "b");
        log.log(EventType::TrafficAllowed, "c");
        log.log(EventType::ThreatDetected, "d");

        let summary = log.summary(24);

        assert_eq!(summary.total_events, 4);
        assert_eq!(summary.blocked_connections, 2);
        assert_eq!(summary.allowed_connections, 1);
        assert_eq!(summary.threats_detected, 1);
        assert_eq!(summary.events_by_type["TRAFFIC_BLOCKED"], 2);
    }
}
