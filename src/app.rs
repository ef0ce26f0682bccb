//! Application context: every long-lived component, built once and shared.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blocklist::manager::ManagerError;
use crate::blocklist::{BlocklistManager, BlocklistStore};
use crate::config::ConfigStore;
use crate::diagnostics::Diagnostics;
use crate::dns::DohResolver;
use crate::error::Result;
use crate::events::EventLog;
use crate::filter::FilterEngine;
use crate::network::{AppControl, ConnectionSource, NetstatSource, NetworkMonitor, NetworkStats};
use crate::nextdns::NextDnsClient;
use crate::platform::{Firewall, ServiceManager};
use crate::security::{Alert, CiaMonitor};

/// Where settings and logs live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("config"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

/// One tick of the background sampler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    pub stats: NetworkStats,
    /// Packets per second since the previous sample.
    pub packet_rate: f64,
    /// Megabits per second, averaged since the monitor started.
    pub bandwidth_mbit: f64,
    pub alerts: Vec<Alert>,
}

#[derive(Default)]
struct SamplerState {
    last: Option<(Instant, u64)>,
    seen: HashSet<(SocketAddr, SocketAddr)>,
    latest: Option<Sample>,
}

pub struct Services<S: ConnectionSource = NetstatSource> {
    pub paths: Paths,
    pub config: Arc<ConfigStore>,
    pub events: Arc<EventLog>,
    pub blocklist: BlocklistManager,
    pub engine: FilterEngine,
    pub monitor: NetworkMonitor<S>,
    pub app_control: AppControl,
    pub cia: CiaMonitor,
    pub doh: DohResolver,
    pub nextdns: NextDnsClient,
    pub diagnostics: Diagnostics,
    pub firewall: Firewall,
    pub service: ServiceManager,
    sampler: Mutex<SamplerState>,
}

impl Services<NetstatSource> {
    pub fn open(paths: Paths) -> Result<Self> {
        Self::with_source(paths, NetstatSource::default())
    }
}

impl<S: ConnectionSource> Services<S> {
    pub fn with_source(paths: Paths, source: S) -> Result<Self> {
        let config = Arc::new(ConfigStore::open(&paths.config_dir)?);
        let events = Arc::new(EventLog::open(&paths.log_dir)?);
        let settings = config.settings();

        let store = BlocklistStore::open(&paths.config_dir).map_err(ManagerError::from)?;
        let blocklist_path = store.path().to_path_buf();
        let blocklist = BlocklistManager::new(&settings.blocklist, store)?;
        let engine = FilterEngine::new(config.clone(), events.clone(), blocklist.matcher());
        let cia = CiaMonitor::new(
            config.clone(),
            events.clone(),
            &[config.settings_path(), blocklist_path],
        );
        let doh = DohResolver::new(&settings.dns, &settings.nextdns.profile_id)?;
        let nextdns = NextDnsClient::new(config.clone(), events.clone())?;

        Ok(Self {
            monitor: NetworkMonitor::with_source(source),
            app_control: AppControl::new(config.clone(), events.clone()),
            diagnostics: Diagnostics::new(events.clone()),
            firewall: Firewall::new(events.clone()),
            service: ServiceManager::new(),
            sampler: Mutex::default(),
            paths,
            config,
            events,
            blocklist,
            engine,
            cia,
            doh,
            nextdns,
        })
    }

    /// Load remote feeds. Failing feeds are logged and skipped.
    pub async fn initialize(&self) -> Result<()> {
        self.blocklist.initialize().await?;
        info!(entries = self.blocklist.total_entries(), "blocklist ready");
        Ok(())
    }

    /// Push edited settings to the components that cache them and accept
    /// the new settings file as the integrity baseline.
    pub fn settings_changed(&self) {
        let settings = self.config.settings();
        self.blocklist.apply_settings(&settings.blocklist);
        self.doh
            .apply_settings(&settings.dns, &settings.nextdns.profile_id);
        if let Err(err) = self.cia.accept_file(&self.config.settings_path()) {
            warn!(error = %err, "failed to re-baseline settings file");
        }
    }

    /// Accept the current blocklist file after a deliberate edit.
    pub fn blocklist_changed(&self) {
        let path = self.paths.config_dir.join(BlocklistStore::FILE_NAME);
        if let Err(err) = self.cia.accept_file(&path) {
            warn!(error = %err, "failed to re-baseline blocklist file");
        }
    }

    /// Refresh the monitor and feed the CIA checks.
    ///
    /// Each connection is checked once, on the first sample it appears in.
    pub async fn sample(&self) -> Sample {
        let stats = self.monitor.update().await;
        let connections = self.monitor.active_connections(usize::MAX);
        let now = Instant::now();
        let packets = stats.packets_sent + stats.packets_recv;

        let mut sampler = self.sampler.lock();
        let packet_rate = match sampler.last {
            Some((at, previous)) => {
                let seconds = now.duration_since(at).as_secs_f64();
                if seconds > 0.0 {
                    packets.saturating_sub(previous) as f64 / seconds
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        sampler.last = Some((now, packets));

        let mut alerts = Vec::new();
        let current: HashSet<(SocketAddr, SocketAddr)> =
            connections.iter().map(|c| (c.local, c.remote)).collect();
        for connection in &connections {
            if !sampler.seen.contains(&(connection.local, connection.remote)) {
                alerts.extend(self.cia.check_connection(connection.remote).alerts);
            }
        }
        sampler.seen = current;

        let bandwidth_mbit = stats.bandwidth_mbps() * 8.0;
        alerts.extend(self.cia.check_availability(packet_rate, bandwidth_mbit).alerts);

        let sample = Sample {
            stats,
            packet_rate,
            bandwidth_mbit,
            alerts,
        };
        sampler.latest = Some(sample.clone());
        sample
    }

    /// Wait until `shutdown` resolves or the filtering engine stops on its
    /// own. With `debug`, filter statistics are logged periodically.
    pub async fn supervise(&self, shutdown: impl Future<Output = ()>, debug: bool) {
        tokio::pin!(shutdown);
        let mut stats_ticker = tokio::time::interval(DEBUG_STATS_INTERVAL);
        let mut liveness = tokio::time::interval(ENGINE_CHECK_INTERVAL);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = liveness.tick() => {
                    if !self.engine.is_running() {
                        warn!("filtering engine stopped unexpectedly");
                        break;
                    }
                }
                _ = stats_ticker.tick(), if debug => {
                    let stats = self.engine.stats();
                    debug!(
                        inspected = stats.packets_inspected,
                        allowed = stats.packets_allowed,
                        blocked = stats.packets_blocked,
                        "filter statistics"
                    );
                }
            }
        }
    }

    /// The most recent sample taken by [`sample`](Self::sample).
    pub fn latest_sample(&self) -> Option<Sample> {
        self.sampler.lock().latest.clone()
    }
}

/// Sample every `monitoring.update_interval` milliseconds until aborted.
pub fn spawn_sampler<S: ConnectionSource>(services: Arc<Services<S>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let sample = services.sample().await;
            if !sample.alerts.is_empty() {
                debug!(alerts = sample.alerts.len(), "security alerts raised");
            }
            let interval = services.config.read(|s| s.monitoring.update_interval);
            tokio::time::sleep(Duration::from_millis(interval)).await;
        }
    })
}

const DEBUG_STATS_INTERVAL: Duration = Duration::from_secs(10);
const ENGINE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How often feeds are checked against their refresh interval.
const FEED_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Refresh blocklist feeds that declare `refresh_interval_hours`.
pub fn spawn_feed_refresher<S: ConnectionSource>(services: Arc<Services<S>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FEED_CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            let refreshed = services.blocklist.refresh_due_feeds().await;
            if refreshed > 0 {
                info!(refreshed, "scheduled blocklist feed refresh");
            }
        }
    })
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::network::monitor::tests::{MockConnectionSource, connection};
    use crate::security::AlertKind;
    use tempfile::TempDir;

    pub fn services(dir: &TempDir, source: MockConnectionSource) -> Services<MockConnectionSource> {
        let paths = Paths {
            config_dir: dir.path().join("config"),
            log_dir: dir.path().join("logs"),
        };
        Services::with_source(paths, source).unwrap()
    }

    #[tokio::test]
    async fn should_create_settings_and_blocklist_files() {
        let dir = TempDir::new().unwrap();

        let services = services(&dir, MockConnectionSource::with(Vec::new()));

        assert!(services.config.settings_path().exists());
        assert!(dir.path().join("config").join("blocklist.json").exists());
        assert!(!services.engine.is_running());
    }

    #[tokio::test]
    async fn should_check_each_connection_once() {
        let dir = TempDir::new().unwrap();
        let source = MockConnectionSource::with(vec![connection("93.184.216.34:80", 42)]);
        let services = services(&dir, source);

        let first = services.sample().await;
        let second = services.sample().await;

        assert!(first.alerts.iter().any(|a| a.kind == AlertKind::HttpDetected));
        assert!(!second.alerts.iter().any(|a| a.kind == AlertKind::HttpDetected));
        assert_eq!(services.latest_sample().unwrap().stats.connections_active, 1);
    }

    #[tokio::test]
    async fn should_accept_settings_edits_as_baseline() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir, MockConnectionSource::with(Vec::new()));

        services.config.update(|s| s.app.theme = crate::config::Theme::Dark).unwrap();
        services.settings_changed();

        assert!(services.cia.check_integrity().alerts.is_empty());
    }

    #[tokio::test]
    async fn should_stop_supervising_when_engine_dies() {
        use crate::network::divert::tests::MockDiverter;

        let dir = TempDir::new().unwrap();
        let services = services(&dir, MockConnectionSource::with(Vec::new()));
        services.config.update(|s| s.filtering.enabled = true).unwrap();
        services
            .engine
            .start_with(|| Ok(MockDiverter::new(vec![])))
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            services.supervise(std::future::pending(), false),
        )
        .await
        .unwrap();

        assert!(!services.engine.is_running());
    }

    #[tokio::test]
    async fn should_stop_supervising_on_shutdown_signal() {
        use crate::network::divert::tests::MockDiverter;

        let dir = TempDir::new().unwrap();
        let services = services(&dir, MockConnectionSource::with(Vec::new()));
        services.config.update(|s| s.filtering.enabled = true).unwrap();
        services
            .engine
            .start_with(|| Ok(MockDiverter::held_open(vec![])))
            .unwrap();

        services.supervise(std::future::ready(()), true).await;

        assert!(services.engine.is_running());
        services.engine.stop().await;
    }
}
