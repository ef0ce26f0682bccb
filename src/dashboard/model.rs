//! What the dashboard shows and the actions behind its controls, without
//! any widget code.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use crate::app::Services;
use crate::blocklist::Category;
use crate::blocklist::store::ListFormat;
use crate::config::{ExportFormat, Theme};
use crate::dns::DohProvider;
use crate::error::{Error, Result};
use crate::events::EventType;
use crate::network::ConnectionSource;
use crate::network::app_control::ProcessInfo;
use crate::nextdns::blocklist_entries;
use crate::security::CiaStatus;

/// Points kept per chart.
pub const CHART_POINTS: usize = 60;
/// Lines shown in the log panel.
pub const LOG_LINES: usize = 50;
const NEXTDNS_CATEGORY: &str = "nextdns";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tab {
    #[default]
    Dashboard,
    Monitor,
    Blocklist,
    AppControl,
    Dns,
    Diagnostics,
    Logs,
    Settings,
}

impl Tab {
    pub const ALL: [Self; 8] = [
        Self::Dashboard,
        Self::Monitor,
        Self::Blocklist,
        Self::AppControl,
        Self::Dns,
        Self::Diagnostics,
        Self::Logs,
        Self::Settings,
    ];

    pub const fn title(self) -> &'static str {
        match self {
            Self::Dashboard => "Dashboard",
            Self::Monitor => "Monitor",
            Self::Blocklist => "Blocklist",
            Self::AppControl => "App Control",
            Self::Dns => "DNS",
            Self::Diagnostics => "Diagnostics",
            Self::Logs => "Logs",
            Self::Settings => "Settings",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatCard {
    pub title: &'static str,
    pub value: String,
    pub subtitle: String,
}

impl StatCard {
    fn new(title: &'static str, value: String, subtitle: String) -> Self {
        Self {
            title,
            value,
            subtitle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocklistRow {
    pub kind: &'static str,
    pub value: String,
    pub category: String,
}

/// Everything the dashboard tab renders for one refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub filtering: bool,
    pub status_label: &'static str,
    pub packets_sent: StatCard,
    pub packets_received: StatCard,
    pub active_connections: StatCard,
    pub blocked: StatCard,
    pub bandwidth: Vec<f64>,
    pub connections: Vec<f64>,
    /// Allowed and blocked packet counts, or a single "Monitoring Only" slice.
    pub traffic_split: Vec<(&'static str, u64)>,
    pub log_lines: Vec<String>,
    pub cia: CiaStatus,
}

/// Group digits by thousands: `1234567` becomes `1,234,567`.
pub fn thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            out.push(',');
        }
        out.push(digit);
    }
    out
}

fn push_point(series: &mut VecDeque<f64>, value: f64) {
    if series.len() == CHART_POINTS {
        series.pop_front();
    }
    series.push_back(value);
}

pub struct DashboardModel<S: ConnectionSource> {
    services: Arc<Services<S>>,
    pub tab: Tab,
    bandwidth: VecDeque<f64>,
    connections: VecDeque<f64>,
}

impl<S: ConnectionSource> DashboardModel<S> {
    pub fn new(services: Arc<Services<S>>) -> Self {
        services
            .events
            .log(EventType::ServiceStarted, "GUI launched");
        Self::detached(services)
    }

    /// A model for a one-off background action; records no launch event.
    pub fn detached(services: Arc<Services<S>>) -> Self {
        Self {
            services,
            tab: Tab::default(),
            bandwidth: VecDeque::with_capacity(CHART_POINTS),
            connections: VecDeque::with_capacity(CHART_POINTS),
        }
    }

    pub fn services(&self) -> &Arc<Services<S>> {
        &self.services
    }

    pub fn theme(&self) -> Theme {
        self.services.config.read(|s| s.app.theme)
    }

    /// Build the dashboard view from the latest sample and append one point
    /// to each chart.
    pub fn refresh(&mut self) -> Snapshot {
        let services = &self.services;
        let stats = services
            .latest_sample()
            .map(|sample| sample.stats)
            .unwrap_or_else(|| services.monitor.stats());
        let filtering = services.engine.is_running();
        let filter_stats = services.engine.stats();

        push_point(&mut self.bandwidth, stats.bandwidth_mbps());
        push_point(&mut self.connections, stats.connections_active as f64);

        let blocked = if filtering {
            filter_stats.packets_blocked.to_string()
        } else {
            "--".to_string()
        };
        let traffic_split = if filtering {
            vec![
                ("Allowed", filter_stats.packets_allowed),
                ("Blocked", filter_stats.packets_blocked),
            ]
        } else {
            vec![("Monitoring Only", 100)]
        };

        let mut log_lines: Vec<String> = services
            .events
            .recent(LOG_LINES, None)
            .iter()
            .map(ToString::to_string)
            .collect();
        log_lines.reverse();

        Snapshot {
            filtering,
            status_label: if filtering { "Filtering Active" } else { "Monitoring Active" },
            packets_sent: StatCard::new(
                "Packets Sent",
                thousands(stats.packets_sent),
                format!("{:.2} Mbps", stats.bandwidth_sent_mbps),
            ),
            packets_received: StatCard::new(
                "Packets Received",
                thousands(stats.packets_recv),
                format!("{:.2} Mbps", stats.bandwidth_recv_mbps),
            ),
            active_connections: StatCard::new(
                "Active Connections",
                stats.connections_active.to_string(),
                String::new(),
            ),
            blocked: StatCard::new("Blocked", blocked, String::new()),
            bandwidth: self.bandwidth.iter().copied().collect(),
            connections: self.connections.iter().copied().collect(),
            traffic_split,
            log_lines,
            cia: services.cia.overall_status(),
        }
    }

    /// Persist `filtering.enabled` and start or stop the engine.
    ///
    /// A failed start switches the setting back off.
    pub async fn set_filtering(&self, enabled: bool) -> Result<()> {
        let services = &self.services;
        services.config.update(|s| s.filtering.enabled = enabled)?;
        services.settings_changed();

        if enabled {
            if let Err(err) = services.engine.start() {
                services.config.update(|s| s.filtering.enabled = false)?;
                services.settings_changed();
                return Err(err);
            }
            services
                .events
                .log(EventType::ConfigChanged, "Packet filtering enabled");
        } else {
            services.engine.stop().await;
            services
                .events
                .log(EventType::ConfigChanged, "Packet filtering disabled");
        }
        Ok(())
    }

    pub fn set_theme(&self, theme: Theme) -> Result<()> {
        self.services.config.update(|s| s.app.theme = theme)?;
        self.services.settings_changed();
        Ok(())
    }

    pub fn set_dns(&self, enabled: bool, provider: DohProvider) -> Result<()> {
        self.services.config.update(|s| {
            s.dns.enabled = enabled;
            s.dns.provider = provider;
        })?;
        self.services.settings_changed();
        self.services.events.log(
            EventType::ConfigChanged,
            format!("DNS settings changed: provider {provider}, enabled {enabled}"),
        );
        Ok(())
    }

    pub fn blocklist_summary(&self) -> String {
        let stats = self.services.blocklist.statistics();
        format!(
            "Total: {} domains, {} IPs",
            stats.total_domains, stats.total_ips
        )
    }

    pub fn blocklist_rows(&self) -> Vec<BlocklistRow> {
        let blocklist = &self.services.blocklist;
        let domains = blocklist.domain_rows().into_iter().map(|(domain, category)| BlocklistRow {
            kind: "Domain",
            value: domain,
            category: category.to_string(),
        });
        let ips = blocklist.ip_rows().into_iter().map(|(ip, category)| BlocklistRow {
            kind: "IP",
            value: ip.to_string(),
            category: category.to_string(),
        });
        domains.chain(ips).collect()
    }

    pub fn add_domain(&self, domain: &str) -> Result<bool> {
        let added = self.services.blocklist.add_domain(domain, Category::Custom)?;
        if added {
            self.services.blocklist_changed();
            self.services
                .events
                .log(EventType::RuleAdded, format!("Added domain to blocklist: {domain}"));
        }
        Ok(added)
    }

    pub fn add_ip(&self, ip: &str) -> Result<bool> {
        let added = self.services.blocklist.add_ip(ip, Category::Custom)?;
        if added {
            self.services.blocklist_changed();
            self.services
                .events
                .log(EventType::RuleAdded, format!("Added IP to blocklist: {ip}"));
        }
        Ok(added)
    }

    /// Remove a domain or an IP, whichever `value` is.
    pub fn remove_entry(&self, value: &str) -> Result<bool> {
        let blocklist = &self.services.blocklist;
        let removed = if value.parse::<IpAddr>().is_ok() {
            blocklist.remove_ip(value)?
        } else {
            blocklist.remove_domain(value)?
        };
        if removed {
            self.services.blocklist_changed();
            self.services
                .events
                .log(EventType::RuleRemoved, format!("Removed from blocklist: {value}"));
        }
        Ok(removed)
    }

    pub async fn import_blocklist(&self, path: &Path) -> Result<usize> {
        let count = self
            .services
            .blocklist
            .import_file(path, Category::Custom)
            .await?;
        self.services.blocklist_changed();
        Ok(count)
    }

    /// Export as JSON when `path` ends in `.json`, plain text otherwise.
    pub fn export_blocklist(&self, path: &Path) -> Result<()> {
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ListFormat::Json,
            _ => ListFormat::Txt,
        };
        self.services.blocklist.export_file(path, format)?;
        Ok(())
    }

    /// Export the event log in the format named by the extension, falling
    /// back to `logging.export_format`.
    pub fn export_logs(&self, path: &Path) -> Result<usize> {
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => ExportFormat::Json,
            Some("txt") => ExportFormat::Txt,
            Some("csv") => ExportFormat::Csv,
            _ => self.services.config.read(|s| s.logging.export_format),
        };
        Ok(self.services.events.export(path, format, None, None)?)
    }

    /// Pull the NextDNS denylist into the blocklist.
    pub async fn fetch_nextdns(&self) -> Result<usize> {
        let list = self.services.nextdns.fetch_denylist(false).await?;
        let accepted = self
            .services
            .blocklist
            .merge_cloud_entries(blocklist_entries(&list), Category::from(NEXTDNS_CATEGORY))?;
        if accepted > 0 {
            self.services.blocklist_changed();
        }
        Ok(accepted)
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        let connections = self.services.monitor.active_connections(usize::MAX);
        self.services.app_control.running_processes(&connections)
    }

    /// Wraps an error for a message box.
    pub fn describe(err: &Error) -> String {
        match err {
            Error::FilteringDisabled => "Filtering is disabled in settings.".to_string(),
            Error::Driver(_) => format!(
                "Could not start the filtering engine: {err}\n\n\
                 Run as Administrator with the WinDivert driver installed."
            ),
            other => other.to_string(),
        }
    }
}
