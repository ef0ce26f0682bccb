//! egui window over [`DashboardModel`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eframe::egui::{self, Color32, RichText, Sense, Stroke, Ui};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use super::model::{DashboardModel, Snapshot, Tab, thousands};
use crate::app::Services;
use crate::config::Theme;
use crate::diagnostics::{CheckStatus, DiagnosticReport};
use crate::dns::DohProvider;
use crate::network::monitor::ProcessUsage;
use crate::network::{ConnectionSource, RuleAction};
use crate::security::Status;

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);
const CONNECTION_ROWS: usize = 100;
const TOP_PROCESSES: usize = 10;
const OK_COLOR: Color32 = Color32::from_rgb(0x2e, 0xcc, 0x71);
const WARN_COLOR: Color32 = Color32::from_rgb(0xf3, 0x9c, 0x12);
const ERROR_COLOR: Color32 = Color32::from_rgb(0xe7, 0x4c, 0x3c);

/// Result slots written by background tasks and read by the next frame.
#[derive(Default)]
struct Pending {
    notice: Option<String>,
    diagnostics: Option<DiagnosticReport>,
    provider_test: Option<String>,
}

pub struct DashboardApp<S: ConnectionSource> {
    model: DashboardModel<S>,
    runtime: Handle,
    pending: Arc<Mutex<Pending>>,
    snapshot: Option<Snapshot>,
    last_refresh: Option<Instant>,
    notice: Option<String>,
    domain_input: String,
    ip_input: String,
    path_input: String,
    app_input: String,
    diagnostics: Option<DiagnosticReport>,
    provider_test: Option<String>,
    top_processes: Vec<ProcessUsage>,
}

impl<S: ConnectionSource> DashboardApp<S> {
    pub fn new(services: Arc<Services<S>>, runtime: Handle) -> Self {
        Self {
            model: DashboardModel::new(services),
            runtime,
            pending: Arc::default(),
            snapshot: None,
            last_refresh: None,
            notice: None,
            domain_input: String::new(),
            ip_input: String::new(),
            path_input: String::new(),
            app_input: String::new(),
            diagnostics: None,
            provider_test: None,
            top_processes: Vec::new(),
        }
    }

    fn services(&self) -> Arc<Services<S>> {
        Arc::clone(self.model.services())
    }

    fn notify(&mut self, message: impl Into<String>) {
        self.notice = Some(message.into());
    }

    /// Run `task` on the runtime and show its message when it finishes.
    fn spawn_notice<F>(&self, task: F)
    where
        F: std::future::Future<Output = String> + Send + 'static,
    {
        let pending = Arc::clone(&self.pending);
        self.runtime.spawn(async move {
            let message = task.await;
            pending.lock().notice = Some(message);
        });
    }

    fn collect_pending(&mut self) {
        let mut pending = self.pending.lock();
        if let Some(notice) = pending.notice.take() {
            self.notice = Some(notice);
        }
        if let Some(report) = pending.diagnostics.take() {
            self.diagnostics = Some(report);
        }
        if let Some(test) = pending.provider_test.take() {
            self.provider_test = Some(test);
        }
    }

    fn show_dashboard(&mut self, ui: &mut Ui) {
        let Some(snapshot) = self.snapshot.clone() else {
            ui.label("Collecting statistics...");
            return;
        };

        ui.horizontal(|ui| {
            let mut enabled = snapshot.filtering;
            if ui.checkbox(&mut enabled, "Packet filtering").changed() {
                self.toggle_filtering(enabled);
            }
            let color = if snapshot.filtering { OK_COLOR } else { ui.visuals().text_color() };
            ui.label(RichText::new(snapshot.status_label).color(color).strong());
        });
        ui.separator();

        ui.columns(4, |columns| {
            for (column, card) in columns.iter_mut().zip([
                &snapshot.packets_sent,
                &snapshot.packets_received,
                &snapshot.active_connections,
                &snapshot.blocked,
            ]) {
                column.group(|ui| {
                    ui.label(RichText::new(card.title).small());
                    ui.label(RichText::new(&card.value).size(22.0).strong());
                    if !card.subtitle.is_empty() {
                        ui.label(RichText::new(&card.subtitle).small());
                    }
                });
            }
        });

        ui.columns(2, |columns| {
            columns[0].label("Bandwidth (MB/s)");
            line_chart(&mut columns[0], &snapshot.bandwidth, OK_COLOR);
            columns[1].label("Active connections");
            line_chart(&mut columns[1], &snapshot.connections, WARN_COLOR);
        });

        ui.horizontal(|ui| {
            for (label, value) in &snapshot.traffic_split {
                ui.label(format!("{label}: {value}"));
            }
        });

        ui.separator();
        ui.label(RichText::new("CIA status").strong());
        ui.horizontal(|ui| {
            status_label(ui, "Confidentiality", snapshot.cia.confidentiality.status);
            status_label(ui, "Integrity", snapshot.cia.integrity.status);
            status_label(ui, "Availability", snapshot.cia.availability.status);
        });

        ui.separator();
        ui.label(RichText::new("Recent events").strong());
        log_panel(ui, &snapshot.log_lines, 200.0);
    }

    fn toggle_filtering(&mut self, enabled: bool) {
        let services = self.services();
        self.spawn_notice(async move {
            let model = DashboardModel::detached(services);
            match model.set_filtering(enabled).await {
                Ok(()) if enabled => "Packet filtering enabled".to_string(),
                Ok(()) => "Packet filtering disabled".to_string(),
                Err(err) => DashboardModel::<S>::describe(&err),
            }
        });
    }

    fn show_monitor(&mut self, ui: &mut Ui) {
        let services = self.services();
        ui.horizontal(|ui| {
            ui.label(RichText::new("Top processes by I/O").strong());
            if ui.small_button("Refresh").clicked() {
                self.top_processes = services.monitor.top_processes(TOP_PROCESSES);
            }
        });
        egui::Grid::new("top_processes").striped(true).show(ui, |ui| {
            for process in &self.top_processes {
                ui.label(&process.name);
                ui.label(process.pid.to_string());
                ui.label(format!("{} written", thousands(process.bytes_sent)));
                ui.label(format!("{} read", thousands(process.bytes_recv)));
                ui.end_row();
            }
        });
        ui.separator();

        let connections = services.monitor.active_connections(CONNECTION_ROWS);
        ui.label(format!("{} established connections", connections.len()));
        egui::ScrollArea::vertical().show(ui, |ui| {
            egui::Grid::new("connections").striped(true).show(ui, |ui| {
                for header in ["Local", "Remote", "Process", "PID", "Seen"] {
                    ui.label(RichText::new(header).strong());
                }
                ui.end_row();
                for connection in connections {
                    ui.label(connection.local.to_string());
                    ui.label(connection.remote.to_string());
                    ui.label(&connection.process);
                    ui.label(connection.pid.to_string());
                    ui.label(connection.observed_at.format("%H:%M:%S").to_string());
                    ui.end_row();
                }
            });
        });
    }

    fn show_blocklist(&mut self, ui: &mut Ui) {
        ui.label(self.model.blocklist_summary());
        ui.horizontal(|ui| {
            ui.text_edit_singleline(&mut self.domain_input);
            if ui.button("Add domain").clicked() {
                let domain = std::mem::take(&mut self.domain_input);
                match self.model.add_domain(&domain) {
                    Ok(true) => self.notify(format!("Added domain: {domain}")),
                    Ok(false) => self.notify(format!("Already blocked: {domain}")),
                    Err(err) => self.notify(err.to_string()),
                }
            }
            ui.text_edit_singleline(&mut self.ip_input);
            if ui.button("Add IP").clicked() {
                let ip = std::mem::take(&mut self.ip_input);
                match self.model.add_ip(&ip) {
                    Ok(true) => self.notify(format!("Added IP: {ip}")),
                    Ok(false) => self.notify(format!("Already blocked: {ip}")),
                    Err(err) => self.notify(err.to_string()),
                }
            }
        });
        ui.horizontal(|ui| {
            ui.label("File:");
            ui.text_edit_singleline(&mut self.path_input);
            if ui.button("Import").clicked() {
                let path = PathBuf::from(self.path_input.trim());
                let services = self.services();
                self.spawn_notice(async move {
                    match DashboardModel::detached(services).import_blocklist(&path).await {
                        Ok(count) => format!("Imported {count} entries"),
                        Err(err) => err.to_string(),
                    }
                });
            }
            if ui.button("Export").clicked() {
                let path = PathBuf::from(self.path_input.trim());
                match self.model.export_blocklist(&path) {
                    Ok(()) => self.notify("Blocklist exported"),
                    Err(err) => self.notify(err.to_string()),
                }
            }
            if ui.button("Fetch NextDNS").clicked() {
                let services = self.services();
                self.spawn_notice(async move {
                    match DashboardModel::detached(services).fetch_nextdns().await {
                        Ok(count) => format!("Merged {count} NextDNS entries"),
                        Err(err) => err.to_string(),
                    }
                });
            }
        });
        self.show_feeds(ui);
        ui.separator();

        let mut remove = None;
        egui::ScrollArea::vertical().show(ui, |ui| {
            egui::Grid::new("blocklist").striped(true).show(ui, |ui| {
                for row in self.model.blocklist_rows() {
                    ui.label(row.kind);
                    ui.label(&row.value);
                    ui.label(&row.category);
                    if ui.small_button("Remove").clicked() {
                        remove = Some(row.value.clone());
                    }
                    ui.end_row();
                }
            });
        });
        if let Some(value) = remove
            && let Err(err) = self.model.remove_entry(&value)
        {
            self.notify(err.to_string());
        }
    }

    fn show_feeds(&mut self, ui: &mut Ui) {
        let services = self.services();
        let feeds = services.config.read(|s| s.blocklist.feeds.clone());
        if feeds.is_empty() {
            return;
        }
        let stats = services.blocklist.feed_stats();
        ui.separator();
        ui.label(RichText::new("Feeds").strong());
        egui::Grid::new("feeds").striped(true).show(ui, |ui| {
            for feed in feeds {
                let mut enabled = feed.enabled;
                if ui.checkbox(&mut enabled, &feed.name).changed() {
                    let services = Arc::clone(&services);
                    let name = feed.name.clone();
                    self.spawn_notice(async move {
                        if let Err(err) = services.blocklist.set_feed_enabled(&name, enabled).await {
                            return err.to_string();
                        }
                        let saved = services.config.update(|s| {
                            if let Some(feed) = s.blocklist.feeds.iter_mut().find(|f| f.name == name) {
                                feed.enabled = enabled;
                            }
                        });
                        services.settings_changed();
                        match saved {
                            Ok(()) if enabled => format!("Feed enabled: {name}"),
                            Ok(()) => format!("Feed disabled: {name}"),
                            Err(err) => err.to_string(),
                        }
                    });
                }
                ui.label(feed.category.to_string());
                let count = stats.get(&feed.name).map_or(0, |s| s.entry_count);
                ui.label(format!("{} entries", thousands(count as u64)));
                if ui.small_button("Refresh").clicked() {
                    let services = Arc::clone(&services);
                    let name = feed.name.clone();
                    self.spawn_notice(async move {
                        match services.blocklist.refresh_feed(&name).await {
                            Ok(count) => format!("Refreshed {name}: {count} entries"),
                            Err(err) => err.to_string(),
                        }
                    });
                }
                ui.end_row();
            }
        });
    }

    fn show_app_control(&mut self, ui: &mut Ui) {
        let services = self.services();
        let stats = services.app_control.statistics();
        ui.label(format!(
            "{} rules, {} blocking",
            stats.total_rules, stats.blocked_apps
        ));
        ui.horizontal(|ui| {
            ui.label("Process:");
            ui.text_edit_singleline(&mut self.app_input);
            for action in [RuleAction::Block, RuleAction::Allow] {
                if ui.button(action.as_str()).clicked() {
                    let name = self.app_input.trim().to_string();
                    let services = Arc::clone(&services);
                    self.spawn_notice(async move {
                        let result = services.app_control.add_rule(&name, action, None).await;
                        services.settings_changed();
                        match result {
                            Ok(rule) => format!("Rule saved: {} -> {}", rule.process_name, rule.action.as_str()),
                            Err(err) => err.to_string(),
                        }
                    });
                }
            }
        });
        ui.separator();

        egui::Grid::new("rules").striped(true).show(ui, |ui| {
            for rule in services.app_control.rules() {
                ui.label(&rule.process_name);
                ui.label(rule.action.as_str());
                let mut enabled = rule.enabled;
                if ui.checkbox(&mut enabled, "enabled").changed() {
                    let services = Arc::clone(&services);
                    let name = rule.process_name.clone();
                    self.spawn_notice(async move {
                        let result = services.app_control.toggle_rule(&name, enabled).await;
                        services.settings_changed();
                        match result {
                            Ok(_) => format!("Rule for {name} {}", if enabled { "enabled" } else { "disabled" }),
                            Err(err) => err.to_string(),
                        }
                    });
                }
                if ui.small_button("Remove").clicked() {
                    let services = Arc::clone(&services);
                    let name = rule.process_name.clone();
                    self.spawn_notice(async move {
                        let result = services.app_control.remove_rule(&name).await;
                        services.settings_changed();
                        match result {
                            Ok(_) => format!("Rule removed: {name}"),
                            Err(err) => err.to_string(),
                        }
                    });
                }
                ui.end_row();
            }
        });
        ui.separator();

        egui::ScrollArea::vertical().show(ui, |ui| {
            egui::Grid::new("processes").striped(true).show(ui, |ui| {
                for header in ["Process", "PID", "Connections", "Rule"] {
                    ui.label(RichText::new(header).strong());
                }
                ui.end_row();
                for process in self.model.processes() {
                    ui.label(&process.name);
                    ui.label(process.pid.to_string());
                    ui.label(process.connections_count.to_string());
                    let rule = process.rule.as_ref().map_or("-", |rule| rule.action.as_str());
                    let color = if process.blocked { ERROR_COLOR } else { ui.visuals().text_color() };
                    ui.label(RichText::new(rule).color(color));
                    ui.end_row();
                }
            });
        });
    }

    fn show_dns(&mut self, ui: &mut Ui) {
        let services = self.services();
        let (mut enabled, current) = services.config.read(|s| (s.dns.enabled, s.dns.provider));
        let mut provider = current;

        let toggled = ui.checkbox(&mut enabled, "Use DNS-over-HTTPS").changed();
        egui::ComboBox::from_label("Provider")
            .selected_text(provider.display_name())
            .show_ui(ui, |ui| {
                for info in services.doh.available_providers() {
                    let choice = DohProvider::from(info.id);
                    ui.selectable_value(&mut provider, choice, info.name)
                        .on_hover_text(info.description);
                }
            });
        if (toggled || provider != current)
            && let Err(err) = self.model.set_dns(enabled, provider)
        {
            self.notify(err.to_string());
        }

        ui.horizontal(|ui| {
            if ui.button("Test provider").clicked() {
                let pending = Arc::clone(&self.pending);
                let services = Arc::clone(&services);
                self.runtime.spawn(async move {
                    let test = services.doh.test_provider(provider).await;
                    pending.lock().provider_test = Some(test.message);
                });
            }
            if ui.button("Clear cache").clicked() {
                services.doh.clear_cache();
            }
            ui.label(format!("{} cached answers", services.doh.cached_entries()));
        });
        if let Some(test) = &self.provider_test {
            ui.label(test);
        }
    }

    fn show_diagnostics(&mut self, ui: &mut Ui) {
        let services = self.services();
        ui.horizontal(|ui| {
            if ui.button("Run diagnostics").clicked() {
                let pending = Arc::clone(&self.pending);
                let services = Arc::clone(&services);
                self.runtime.spawn(async move {
                    let report = services.diagnostics.run_full_check().await;
                    pending.lock().diagnostics = Some(report);
                });
            }
            if ui.button("Speed test").clicked() {
                let services = Arc::clone(&services);
                self.spawn_notice(async move {
                    match services.diagnostics.speed_test().await {
                        Ok(result) => format!(
                            "Download {:.2} Mbps, latency {:.0} ms",
                            result.download_speed_mbps, result.latency_ms
                        ),
                        Err(err) => format!("Speed test failed: {err}"),
                    }
                });
            }
        });
        ui.horizontal(|ui| {
            if ui.button("Repair DNS").clicked() {
                let services = Arc::clone(&services);
                self.spawn_notice(async move {
                    services
                        .diagnostics
                        .repair_dns()
                        .await
                        .unwrap_or_else(|err| format!("Failed to reset DNS: {err}"))
                });
            }
            if ui.button("Repair firewall").clicked() {
                let services = Arc::clone(&services);
                self.spawn_notice(async move {
                    services
                        .diagnostics
                        .repair_firewall()
                        .await
                        .unwrap_or_else(|err| format!("Failed to reset firewall: {err}"))
                });
            }
            if ui.button("Restore HOSTS file").clicked() {
                let message = services
                    .diagnostics
                    .repair_hosts_file()
                    .unwrap_or_else(|err| format!("Failed to repair HOSTS file: {err}"));
                self.notify(message);
            }
        });
        ui.separator();

        if let Some(report) = &self.diagnostics {
            egui::Grid::new("diagnostics").striped(true).show(ui, |ui| {
                for (label, check) in report.checks() {
                    let color = match check.status {
                        CheckStatus::Ok => OK_COLOR,
                        CheckStatus::Warning => WARN_COLOR,
                        CheckStatus::Error => ERROR_COLOR,
                    };
                    ui.label(label);
                    ui.label(RichText::new(check.status.to_string()).color(color));
                    ui.label(&check.message);
                    ui.end_row();
                }
            });
        }
    }

    fn show_logs(&mut self, ui: &mut Ui) {
        ui.horizontal(|ui| {
            ui.label("Export to:");
            ui.text_edit_singleline(&mut self.path_input);
            if ui.button("Export").clicked() {
                let path = PathBuf::from(self.path_input.trim());
                match self.model.export_logs(&path) {
                    Ok(count) => self.notify(format!("Exported {count} events")),
                    Err(err) => self.notify(err.to_string()),
                }
            }
        });
        if let Some(snapshot) = &self.snapshot {
            log_panel(ui, &snapshot.log_lines, f32::INFINITY);
        }
    }

    fn show_settings(&mut self, ui: &mut Ui) {
        let mut theme = self.model.theme();
        ui.horizontal(|ui| {
            ui.label("Theme:");
            ui.selectable_value(&mut theme, Theme::Light, "Light");
            ui.selectable_value(&mut theme, Theme::Dark, "Dark");
        });
        if theme != self.model.theme()
            && let Err(err) = self.model.set_theme(theme)
        {
            self.notify(err.to_string());
        }

        let services = self.services();
        let mut log_all = services.config.read(|s| s.monitoring.log_all_traffic);
        if ui.checkbox(&mut log_all, "Log allowed traffic").changed() {
            if let Err(err) = services.config.update(|s| s.monitoring.log_all_traffic = log_all) {
                self.notify(err.to_string());
            }
            services.settings_changed();
        }
        let mut firewall = services.config.read(|s| s.windows.firewall_integration);
        if ui.checkbox(&mut firewall, "Enforce app rules with Windows Firewall").changed() {
            if let Err(err) = services.config.update(|s| s.windows.firewall_integration = firewall) {
                self.notify(err.to_string());
            }
            services.settings_changed();
        }
        ui.separator();
        ui.label(format!("Settings file: {}", services.config.settings_path().display()));
        ui.horizontal(|ui| {
            ui.label("File:");
            ui.text_edit_singleline(&mut self.path_input);
            let path = PathBuf::from(self.path_input.trim());
            if ui.button("Export settings").clicked() {
                match services.config.export_to(&path) {
                    Ok(()) => self.notify(format!("Settings exported to {}", path.display())),
                    Err(err) => self.notify(err.to_string()),
                }
            }
            if ui.button("Import settings").clicked() {
                match services.config.import_from(&path) {
                    Ok(()) => {
                        services.settings_changed();
                        self.notify("Settings imported");
                    }
                    Err(err) => self.notify(err.to_string()),
                }
            }
            if ui.button("Reset to defaults").clicked() {
                match services.config.reset_to_defaults() {
                    Ok(()) => {
                        services.settings_changed();
                        self.notify("Settings reset to defaults");
                    }
                    Err(err) => self.notify(err.to_string()),
                }
            }
        });
    }
}

fn status_label(ui: &mut Ui, name: &str, status: Status) {
    let color = if status.is_healthy() { OK_COLOR } else { ERROR_COLOR };
    ui.label(format!("{name}:"));
    ui.label(RichText::new(status.as_str()).color(color).strong());
}

fn log_panel(ui: &mut Ui, lines: &[String], max_height: f32) {
    egui::ScrollArea::vertical()
        .max_height(max_height)
        .show(ui, |ui| {
            for line in lines {
                ui.label(RichText::new(line).monospace());
            }
        });
}

fn line_chart(ui: &mut Ui, values: &[f64], color: Color32) {
    let size = egui::vec2(ui.available_width(), 120.0);
    let (rect, _) = ui.allocate_exact_size(size, Sense::hover());
    ui.painter()
        .rect_stroke(rect, 4.0, Stroke::new(1.0, ui.visuals().weak_text_color()));
    if values.len() < 2 {
        return;
    }
    let max = values.iter().copied().fold(f64::EPSILON, f64::max);
    let step = rect.width() / (values.len() - 1) as f32;
    let points = values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            egui::pos2(
                rect.left() + step * index as f32,
                rect.bottom() - (value / max) as f32 * rect.height(),
            )
        })
        .collect();
    ui.painter().add(egui::Shape::line(points, Stroke::new(1.5, color)));
}

impl<S: ConnectionSource> eframe::App for DashboardApp<S> {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.collect_pending();
        if self.last_refresh.is_none_or(|at| at.elapsed() >= REFRESH_INTERVAL) {
            self.snapshot = Some(self.model.refresh());
            self.last_refresh = Some(Instant::now());
        }

        ctx.set_visuals(match self.model.theme() {
            Theme::Dark => egui::Visuals::dark(),
            Theme::Light => egui::Visuals::light(),
        });

        egui::TopBottomPanel::top("tabs").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.heading("Defensiq Network Security");
                ui.separator();
                for tab in Tab::ALL {
                    ui.selectable_value(&mut self.model.tab, tab, tab.title());
                }
            });
        });

        egui::TopBottomPanel::bottom("notice").show(ctx, |ui| {
            ui.horizontal(|ui| {
                match &self.notice {
                    Some(notice) => ui.label(notice),
                    None => ui.label(""),
                };
                if self.notice.is_some() && ui.small_button("x").clicked() {
                    self.notice = None;
                }
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| match self.model.tab {
            Tab::Dashboard => self.show_dashboard(ui),
            Tab::Monitor => self.show_monitor(ui),
            Tab::Blocklist => self.show_blocklist(ui),
            Tab::AppControl => self.show_app_control(ui),
            Tab::Dns => self.show_dns(ui),
            Tab::Diagnostics => self.show_diagnostics(ui),
            Tab::Logs => self.show_logs(ui),
            Tab::Settings => self.show_settings(ui),
        });

        ctx.request_repaint_after(REFRESH_INTERVAL);
    }
}

/// Open the dashboard window; returns when it is closed.
pub fn run<S: ConnectionSource>(services: Arc<Services<S>>, runtime: Handle) -> eframe::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("Defensiq Network Security")
            .with_inner_size([1200.0, 800.0]),
        ..Default::default()
    };
    eframe::run_native(
        "Defensiq Network Security",
        options,
        Box::new(move |_cc| Ok(Box::new(DashboardApp::new(services, runtime)))),
    )
}
