//! Confidentiality, integrity and availability checks.
//!
//! - Confidentiality: connections to cleartext ports (HTTP, FTP, Telnet,
//!   SMTP).
//! - Integrity: SHA-256 of the critical configuration files against the
//!   values taken at startup.
//! - Availability: packet rate and bandwidth against thresholds.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, TimeDelta};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::config::ConfigStore;
use crate::events::{EventLog, EventType};

const OBSERVATION_CAPACITY: usize = 100;
const SAMPLE_CAPACITY: usize = 60;
const HTTP_PORT: u16 = 80;
/// FTP, Telnet and SMTP.
const CLEARTEXT_PORTS: [u16; 3] = [21, 23, 25];
/// Bandwidth above which availability is reported degraded, in Mbps.
const BANDWIDTH_THRESHOLD: f64 = 80.0;

fn recent_window() -> TimeDelta {
    TimeDelta::minutes(5)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    HttpDetected,
    CleartextProtocol,
    FileMissing,
    FileModified,
    HighPacketRate,
    HighBandwidth,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Local>,
}

impl Alert {
    fn new(kind: AlertKind, severity: Severity, message: String) -> Self {
        Self {
            kind,
            severity,
            message,
            timestamp: Local::now(),
        }
    }
}

/// Health of one CIA aspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Secure,
    AtRisk,
    Intact,
    Compromised,
    Normal,
    Degraded,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Secure => "SECURE",
            Self::AtRisk => "AT_RISK",
            Self::Intact => "INTACT",
            Self::Compromised => "COMPROMISED",
            Self::Normal => "NORMAL",
            Self::Degraded => "DEGRADED",
        }
    }

    /// Whether the aspect needs attention.
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Secure | Self::Intact | Self::Normal)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub status: Status,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidentialityStatus {
    pub status: Status,
    pub https_percentage: f64,
    pub recent_http_count: usize,
    pub cleartext_protocol_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityStatus {
    pub status: Status,
    pub files_monitored: usize,
    pub violations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailabilityStatus {
    pub status: Status,
    pub avg_packet_rate: f64,
    pub avg_bandwidth: f64,
    pub dos_alerts_recent: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CiaStatus {
    pub confidentiality: ConfidentialityStatus,
    pub integrity: IntegrityStatus,
    pub availability: AvailabilityStatus,
    pub timestamp: DateTime<Local>,
}

#[derive(Default)]
struct State {
    http: VecDeque<(SocketAddr, DateTime<Local>)>,
    cleartext: VecDeque<(SocketAddr, DateTime<Local>)>,
    checksums: BTreeMap<PathBuf, String>,
    packet_rates: VecDeque<f64>,
    bandwidths: VecDeque<f64>,
    dos_alerts: Vec<DateTime<Local>>,
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T, capacity: usize) {
    if queue.len() == capacity {
        queue.pop_front();
    }
    queue.push_back(value);
}

fn average(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// SHA-256 of a file, hex encoded.
pub fn file_checksum(path: &Path) -> std::io::Result<String> {
    let content = std::fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&content)))
}

/// Tracks the CIA triad of the local machine.
pub struct CiaMonitor {
    config: Arc<ConfigStore>,
    events: Arc<EventLog>,
    state: Mutex<State>,
}

impl CiaMonitor {
    /// Start monitoring; `files` that exist now are baselined.
    pub fn new(config: Arc<ConfigStore>, events: Arc<EventLog>, files: &[PathBuf]) -> Self {
        let mut state = State::default();
        for path in files {
            match file_checksum(path) {
                Ok(checksum) => {
                    state.checksums.insert(path.clone(), checksum);
                }
                Err(err) => {
                    tracing::debug!(path = ?path, error = %err, "not monitoring file integrity");
                }
            }
        }
        Self {
            config,
            events,
            state: Mutex::new(state),
        }
    }

    /// Look at one connection's remote endpoint.
    pub fn check_connection(&self, remote: SocketAddr) -> CheckReport {
        let (enabled, http_warning) = self
            .config
            .read(|s| (s.cia_triad.confidentiality_checks, s.cia_triad.http_warning));
        let mut alerts = Vec::new();
        if !enabled {
            return CheckReport {
                status: Status::Secure,
                alerts,
            };
        }

        let now = Local::now();
        let mut state = self.state.lock();
        let port = remote.port();
        if port == HTTP_PORT {
            push_bounded(&mut state.http, (remote, now), OBSERVATION_CAPACITY);
            if http_warning {
                alerts.push(Alert::new(
                    AlertKind::HttpDetected,
                    Severity::Warning,
                    format!("Unencrypted HTTP connection detected to {remote}"),
                ));
            }
        }
        if CLEARTEXT_PORTS.contains(&port) {
            push_bounded(&mut state.cleartext, (remote, now), OBSERVATION_CAPACITY);
            alerts.push(Alert::new(
                AlertKind::CleartextProtocol,
                Severity::High,
                format!("Cleartext protocol detected on port {port}"),
            ));
        }

        CheckReport {
            status: if alerts.is_empty() { Status::Secure } else { Status::AtRisk },
            alerts,
        }
    }

    /// Share of encrypted traffic, estimated against a floor of 100
    /// connections since only cleartext ones are recorded.
    fn https_percentage(state: &State) -> f64 {
        if state.http.is_empty() {
            return 100.0;
        }
        let http = state.http.len() as f64;
        let total = http + OBSERVATION_CAPACITY as f64;
        (total - http) / total * 100.0
    }

    pub fn confidentiality_status(&self) -> ConfidentialityStatus {
        let state = self.state.lock();
        let since = Local::now() - recent_window();
        let recent_http_count = state.http.iter().filter(|(_, at)| *at >= since).count();
        ConfidentialityStatus {
            status: if recent_http_count == 0 { Status::Secure } else { Status::AtRisk },
            https_percentage: Self::https_percentage(&state),
            recent_http_count,
            cleartext_protocol_count: state.cleartext.len(),
        }
    }

    /// Compare the monitored files with their baseline.
    ///
    /// A modified file is reported once: its new checksum becomes the
    /// baseline.
    pub fn check_integrity(&self) -> CheckReport {
        let mut alerts = Vec::new();
        if !self.config.read(|s| s.cia_triad.integrity_checks) {
            return CheckReport {
                status: Status::Intact,
                alerts,
            };
        }

        let mut state = self.state.lock();
        for (path, stored) in &mut state.checksums {
            let current = match file_checksum(path) {
                Ok(current) => current,
                Err(_) => {
                    alerts.push(Alert::new(
                        AlertKind::FileMissing,
                        Severity::Critical,
                        format!("Critical file missing: {}", path.display()),
                    ));
                    continue;
                }
            };
            if current != *stored {
                alerts.push(Alert::new(
                    AlertKind::FileModified,
                    Severity::Warning,
                    format!("File integrity check failed: {}", path.display()),
                ));
                self.events.log_with(
                    EventType::CiaViolation,
                    format!("Integrity violation detected: {}", path.display()),
                    json!({ "file": path.display().to_string(), "expected": stored, "actual": current }),
                );
                *stored = current;
            }
        }

        CheckReport {
            status: if alerts.is_empty() { Status::Intact } else { Status::Compromised },
            alerts,
        }
    }

    /// Re-baseline a file after a deliberate change.
    pub fn accept_file(&self, path: &Path) -> std::io::Result<()> {
        let checksum = file_checksum(path)?;
        self.state
            .lock()
            .checksums
            .insert(path.to_path_buf(), checksum.clone());
        self.events.log_with(
            EventType::ConfigChanged,
            format!("Configuration file checksum updated: {}", path.display()),
            json!({ "checksum": checksum }),
        );
        Ok(())
    }

    pub fn integrity_status(&self) -> IntegrityStatus {
        let report = self.check_integrity();
        IntegrityStatus {
            status: report.status,
            files_monitored: self.state.lock().checksums.len(),
            violations: report.alerts.len(),
        }
    }

    /// Record a packet rate (per second) and bandwidth (Mbps) sample.
    pub fn check_availability(&self, packet_rate: f64, bandwidth_mbps: f64) -> CheckReport {
        let (enabled, threshold) = self
            .config
            .read(|s| (s.cia_triad.availability_checks, s.cia_triad.dos_threshold));
        let mut alerts = Vec::new();
        if !enabled {
            return CheckReport {
                status: Status::Normal,
                alerts,
            };
        }

        let mut state = self.state.lock();
        push_bounded(&mut state.packet_rates, packet_rate, SAMPLE_CAPACITY);
        push_bounded(&mut state.bandwidths, bandwidth_mbps, SAMPLE_CAPACITY);

        if packet_rate > threshold as f64 {
            alerts.push(Alert::new(
                AlertKind::HighPacketRate,
                Severity::Critical,
                format!(
                    "Unusually high packet rate detected: {packet_rate:.0} pps (threshold: {threshold})"
                ),
            ));
            state.dos_alerts.push(Local::now());
            self.events.log_with(
                EventType::CiaViolation,
                "Availability risk: High packet rate (possible DoS)",
                json!({ "packet_rate": packet_rate, "threshold": threshold }),
            );
        }

        if bandwidth_mbps > BANDWIDTH_THRESHOLD {
            alerts.push(Alert::new(
                AlertKind::HighBandwidth,
                Severity::Warning,
                format!("High bandwidth usage: {bandwidth_mbps:.1} Mbps"),
            ));
        }

        CheckReport {
            status: if alerts.is_empty() { Status::Normal } else { Status::Degraded },
            alerts,
        }
    }

    pub fn availability_status(&self) -> AvailabilityStatus {
        let mut state = self.state.lock();
        let since = Local::now() - recent_window();
        state.dos_alerts.retain(|at| *at >= since);
        let dos_alerts_recent = state.dos_alerts.len();
        AvailabilityStatus {
            status: if dos_alerts_recent == 0 { Status::Normal } else { Status::AtRisk },
            avg_packet_rate: average(&state.packet_rates),
            avg_bandwidth: average(&state.bandwidths),
            dos_alerts_recent,
        }
    }

    pub fn overall_status(&self) -> CiaStatus {
        CiaStatus {
            confidentiality: self.confidentiality_status(),
            integrity: self.integrity_status(),
            availability: self.availability_status(),
            timestamp: Local::now(),
        }
    }
}
