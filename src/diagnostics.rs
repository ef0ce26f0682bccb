//! Network health checks and repairs.
//!
//! Checks never fail: each one reports a [`CheckResult`] whose status tells
//! the dashboard how to render it. Repairs change system settings and need
//! administrator rights.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;

use hickory_proto::rr::RecordType;

use crate::blocklist::hosts::host_mapping;
use crate::dns::resolver::{answer_strings, build_query};
use crate::dns::{DnsResolver, UpstreamResolver};
use crate::error::Result;
use crate::events::{EventLog, EventType};
use crate::network::driver_status;
use crate::platform::{CommandRunner, FirewallStatus, SystemRunner};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const SPEED_TEST_TIMEOUT: Duration = Duration::from_secs(10);

const PROBE_TARGETS: [&str; 3] = ["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"];
const RESOLVE_DOMAINS: [&str; 2] = ["google.com", "cloudflare.com"];
const RECOMMENDED_DNS: [&str; 4] = ["1.1.1.1", "1.0.0.1", "9.9.9.9", "8.8.8.8"];
/// Names a hijacking hosts file typically redirects.
const SUSPICIOUS_NAMES: [&str; 4] = ["google", "facebook", "microsoft", "bank"];

pub const SPEED_TEST_URL: &str =
    "https://www.google.com/images/branding/googlelogo/2x/googlelogo_color_272x92dp.png";

const DEFAULT_HOSTS: &str = "# Copyright (c) 1993-2009 Microsoft Corp.
#
# This is a sample HOSTS file used by Microsoft TCP/IP for Windows.
#
127.0.0.1       localhost
::1             localhost
";

const DNS_SERVERS_SCRIPT: &str = "Get-DnsClientServerAddress -AddressFamily IPv4 | \
     Select-Object -ExpandProperty ServerAddresses";
const RESET_DNS_SCRIPT: &str =
    "Get-NetAdapter | Set-DnsClientServerAddress -ResetServerAddresses";

/// Location of the system hosts file.
pub fn system_hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub message: String,
    pub details: Value,
}

impl CheckResult {
    fn new(status: CheckStatus, message: impl Into<String>, details: Value) -> Self {
        Self {
            status,
            message: message.into(),
            details,
        }
    }
}

/// Outcome of [`Diagnostics::run_full_check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticReport {
    pub internet_connectivity: CheckResult,
    pub dns_resolution: CheckResult,
    pub dns_health: CheckResult,
    pub firewall_status: CheckResult,
    pub hosts_file: CheckResult,
    pub windivert_driver: CheckResult,
    pub network_adapters: CheckResult,
}

impl DiagnosticReport {
    /// Checks with their display labels, in run order.
    pub fn checks(&self) -> [(&'static str, &CheckResult); 7] {
        [
            ("Internet Connectivity", &self.internet_connectivity),
            ("DNS Resolution", &self.dns_resolution),
            ("DNS Health", &self.dns_health),
            ("Firewall Status", &self.firewall_status),
            ("HOSTS File", &self.hosts_file),
            ("WinDivert Driver", &self.windivert_driver),
            ("Network Adapters", &self.network_adapters),
        ]
    }

    pub fn all_ok(&self) -> bool {
        self.checks()
            .iter()
            .all(|(_, check)| check.status == CheckStatus::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedTest {
    pub download_speed_mbps: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Adapter {
    pub name: String,
    pub state: String,
}

/// Adapters from `netsh interface show interface`, after the dashed header
/// rule.
pub fn parse_adapters(output: &str) -> Vec<Adapter> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            (parts.len() >= 4).then(|| Adapter {
                name: parts[3..].join(" "),
                state: parts[1].to_string(),
            })
        })
        .collect()
}

/// Hosts file lines that map a well-known name somewhere.
pub fn suspicious_hosts_entries(content: &str) -> Vec<&str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| host_mapping(line).is_some())
        .filter(|line| {
            let lower = line.to_lowercase();
            SUSPICIOUS_NAMES.iter().any(|name| lower.contains(name))
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Runs the health checks and repairs.
#[derive(Clone)]
pub struct Diagnostics<R: CommandRunner = SystemRunner> {
    runner: R,
    events: Arc<EventLog>,
    client: Client,
    hosts_path: PathBuf,
    speed_test_url: String,
    probe_targets: Vec<SocketAddr>,
    upstream: SocketAddr,
}

impl Diagnostics<SystemRunner> {
    pub fn new(events: Arc<EventLog>) -> Self {
        Self::with_runner(SystemRunner, events)
    }
}

impl<R: CommandRunner> Diagnostics<R> {
    pub fn with_runner(runner: R, events: Arc<EventLog>) -> Self {
        Self {
            runner,
            events,
            client: Client::new(),
            hosts_path: system_hosts_path(),
            speed_test_url: SPEED_TEST_URL.to_string(),
            probe_targets: PROBE_TARGETS
                .iter()
                .filter_map(|target| target.parse().ok())
                .collect(),
            upstream: SocketAddr::from(([1, 1, 1, 1], 53)),
        }
    }

    pub fn with_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hosts_path = path.into();
        self
    }

    pub fn with_speed_test_url(mut self, url: impl Into<String>) -> Self {
        self.speed_test_url = url.into();
        self
    }

    pub fn with_probe_targets(mut self, targets: Vec<SocketAddr>) -> Self {
        self.probe_targets = targets;
        self
    }

    /// Resolver queried directly when the system resolver fails.
    pub fn with_upstream(mut self, upstream: SocketAddr) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn hosts_path(&self) -> &Path {
        &self.hosts_path
    }

    pub async fn run_full_check(&self) -> DiagnosticReport {
        let report = DiagnosticReport {
            internet_connectivity: self.check_internet().await,
            dns_resolution: self.check_dns().await,
            dns_health: self.check_dns_health().await,
            firewall_status: self.check_firewall().await,
            hosts_file: self.check_hosts_file(),
            windivert_driver: self.check_windivert().await,
            network_adapters: self.check_adapters().await,
        };
        tracing::info!(all_ok = report.all_ok(), "diagnostics finished");
        report
    }

    /// Connect to the first reachable public resolver.
    pub async fn check_internet(&self) -> CheckResult {
        for target in &self.probe_targets {
            if let Ok(Ok(_)) = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target)).await
            {
                return CheckResult::new(
                    CheckStatus::Ok,
                    "Internet connected",
                    json!({ "tested_host": target.ip().to_string() }),
                );
            }
        }
        CheckResult::new(
            CheckStatus::Error,
            "No internet connectivity",
            json!({ "tested_host": null }),
        )
    }

    pub async fn check_dns(&self) -> CheckResult {
        for domain in RESOLVE_DOMAINS {
            if let Ok(mut addresses) = tokio::net::lookup_host((domain, 0)).await
                && let Some(address) = addresses.next()
            {
                let ip = address.ip();
                return CheckResult::new(
                    CheckStatus::Ok,
                    format!("DNS working ({domain} -> {ip})"),
                    json!({ "domain": domain, "ip": ip.to_string() }),
                );
            }
        }
        self.check_upstream_dns().await
    }

    /// Ask the fallback resolver directly, bypassing the system resolver.
    ///
    /// An answer here means DNS works but the system resolver does not.
    pub async fn check_upstream_dns(&self) -> CheckResult {
        let resolver = UpstreamResolver::new(self.upstream);
        for domain in RESOLVE_DOMAINS {
            let Ok(query) = build_query(domain, RecordType::A) else {
                continue;
            };
            if let Ok(response) = resolver.resolve(&query).await
                && let Some(ip) = answer_strings(&response, RecordType::A).into_iter().next()
            {
                return CheckResult::new(
                    CheckStatus::Warning,
                    format!("System DNS failed; {domain} resolved via {}", self.upstream),
                    json!({ "domain": domain, "ip": ip, "resolver": self.upstream.to_string() }),
                );
            }
        }
        CheckResult::new(
            CheckStatus::Error,
            "DNS resolution failed",
            json!({ "domain": null }),
        )
    }

    /// Whether the system resolvers include a recommended public one.
    pub async fn check_dns_health(&self) -> CheckResult {
        let output = match self
            .runner
            .run("powershell", &["-Command", DNS_SERVERS_SCRIPT])
            .await
        {
            Ok(output) if output.success() => output,
            Ok(_) => {
                return CheckResult::new(
                    CheckStatus::Warning,
                    "Could not check DNS servers",
                    json!({ "dns_servers": [] }),
                );
            }
            Err(err) => {
                return CheckResult::new(
                    CheckStatus::Error,
                    format!("Error checking DNS: {err}"),
                    json!({ "dns_servers": [] }),
                );
            }
        };

        let servers: Vec<&str> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        let secure = servers.iter().any(|s| RECOMMENDED_DNS.contains(s));
        let (status, message) = if secure {
            (CheckStatus::Ok, "Using recommended DNS")
        } else {
            (CheckStatus::Warning, "Consider using secure DNS")
        };
        CheckResult::new(
            status,
            message,
            json!({ "dns_servers": servers, "secure": secure }),
        )
    }

    pub async fn check_firewall(&self) -> CheckResult {
        match self
            .runner
            .run("netsh", &["advfirewall", "show", "currentprofile"])
            .await
        {
            Ok(output) if output.success() => {
                let status = FirewallStatus::parse(&output.stdout);
                if status.enabled {
                    CheckResult::new(CheckStatus::Ok, "Firewall enabled", json!({ "enabled": true }))
                } else {
                    CheckResult::new(
                        CheckStatus::Warning,
                        "Firewall disabled",
                        json!({ "enabled": false }),
                    )
                }
            }
            Ok(_) => CheckResult::new(
                CheckStatus::Error,
                "Could not check firewall",
                json!({ "enabled": false }),
            ),
            Err(err) => CheckResult::new(
                CheckStatus::Error,
                format!("Error: {err}"),
                json!({ "enabled": false }),
            ),
        }
    }

    pub fn check_hosts_file(&self) -> CheckResult {
        let path = self.hosts_path.display().to_string();
        if !self.hosts_path.exists() {
            return CheckResult::new(CheckStatus::Error, "HOSTS file not found", json!({ "path": path }));
        }

        match std::fs::read_to_string(&self.hosts_path) {
            Ok(content) => {
                let suspicious = suspicious_hosts_entries(&content);
                if suspicious.is_empty() {
                    CheckResult::new(CheckStatus::Ok, "HOSTS file looks clean", json!({ "path": path }))
                } else {
                    CheckResult::new(
                        CheckStatus::Warning,
                        format!("Found {} suspicious entries", suspicious.len()),
                        json!({ "path": path, "suspicious_count": suspicious.len(), "entries": suspicious }),
                    )
                }
            }
            Err(err) => CheckResult::new(
                CheckStatus::Error,
                format!("Error reading HOSTS file: {err}"),
                json!({ "path": path }),
            ),
        }
    }

    pub async fn check_windivert(&self) -> CheckResult {
        let status = tokio::task::spawn_blocking(driver_status).await;
        match status {
            Ok(status) if status.available => CheckResult::new(
                CheckStatus::Ok,
                status.message,
                json!({ "available": true }),
            ),
            Ok(status) => CheckResult::new(
                CheckStatus::Warning,
                status.message,
                json!({ "available": false }),
            ),
            Err(err) => CheckResult::new(
                CheckStatus::Error,
                format!("Error: {err}"),
                json!({ "available": false }),
            ),
        }
    }

    pub async fn check_adapters(&self) -> CheckResult {
        match self
            .runner
            .run("netsh", &["interface", "show", "interface"])
            .await
        {
            Ok(output) if output.success() => {
                let adapters = parse_adapters(&output.stdout);
                let connected = adapters.iter().filter(|a| a.state == "Connected").count();
                CheckResult::new(
                    if connected > 0 { CheckStatus::Ok } else { CheckStatus::Warning },
                    format!("{connected} adapter(s) connected"),
                    json!({ "adapters": adapters, "connected_count": connected }),
                )
            }
            Ok(_) => CheckResult::new(
                CheckStatus::Error,
                "Could not check adapters",
                json!({ "adapters": [] }),
            ),
            Err(err) => CheckResult::new(
                CheckStatus::Error,
                format!("Error: {err}"),
                json!({ "adapters": [] }),
            ),
        }
    }

    /// Flush the resolver cache and return every adapter to automatic DNS.
    pub async fn repair_dns(&self) -> Result<String> {
        self.runner.run("ipconfig", &["/flushdns"]).await?.check("ipconfig")?;
        self.runner
            .run("powershell", &["-Command", RESET_DNS_SCRIPT])
            .await?
            .check("powershell")?;
        self.events
            .log(EventType::ConfigChanged, "DNS settings reset to default");
        Ok("DNS reset successful".to_string())
    }

    pub async fn repair_firewall(&self) -> Result<String> {
        self.runner
            .run("netsh", &["advfirewall", "reset"])
            .await?
            .check("netsh")?;
        self.events
            .log(EventType::ConfigChanged, "Firewall reset to defaults");
        Ok("Firewall reset successful".to_string())
    }

    /// Move the hosts file aside and write the stock one.
    pub fn repair_hosts_file(&self) -> Result<String> {
        let backup = self.hosts_path.with_extension("backup");
        if self.hosts_path.exists() {
            std::fs::rename(&self.hosts_path, &backup)?;
        }
        std::fs::write(&self.hosts_path, DEFAULT_HOSTS)?;
        self.events.log_with(
            EventType::ConfigChanged,
            "HOSTS file restored to default",
            json!({ "backup": backup.display().to_string() }),
        );
        let name = backup
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("HOSTS file restored (backup: {name})"))
    }

    /// Time the download of a small file.
    pub async fn speed_test(&self) -> std::result::Result<SpeedTest, reqwest::Error> {
        let start = Instant::now();
        let body = self
            .client
            .get(&self.speed_test_url)
            .timeout(SPEED_TEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let seconds = start.elapsed().as_secs_f64().max(f64::EPSILON);
        let size_mb = body.len() as f64 / (1024.0 * 1024.0);
        Ok(SpeedTest {
            download_speed_mbps: round2(size_mb / seconds * 8.0),
            latency_ms: round2(seconds * 1000.0),
        })
    }
}
