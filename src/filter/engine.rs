//! Packet filtering loop and its lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::inspector::{Decision, Mechanism, PacketInspector};
use crate::config::{BlockMode, ConfigStore};
use crate::dns::Matcher;
use crate::error::{DriverError, Error, Result};
use crate::events::{EventLog, EventType};
use crate::network::divert::{self, Diverted, DriverShutdown, PacketDiverter, SystemDiverter};
use crate::network::packet::{PacketMeta, build_dns_reply};

/// Pause after a failed receive before trying again.
const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);
/// How long `stop` waits for the capture loop to finish.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Counters {
    inspected: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
}

/// Filtering statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterStats {
    pub packets_inspected: u64,
    pub packets_allowed: u64,
    pub packets_blocked: u64,
    pub start_time: Option<DateTime<Local>>,
    pub uptime_seconds: f64,
    pub packets_per_second: f64,
}

/// Everything the capture loop needs, shared with the engine.
#[derive(Clone)]
pub struct FilterContext {
    config: Arc<ConfigStore>,
    events: Arc<EventLog>,
    inspector: Arc<PacketInspector>,
    counters: Arc<Counters>,
}

impl FilterContext {
    /// Inspect one packet and act on the decision: reinject it, drop it, or
    /// drop it and answer with a sinkhole reply.
    pub fn process<D: PacketDiverter>(&self, diverter: &mut D, packet: &Diverted<D::Address>) {
        self.counters.inspected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("defensiq_packets_inspected_total").increment(1);

        let meta = match PacketMeta::parse(&packet.data) {
            Ok(meta) => meta,
            Err(err) => {
                debug!(error = %err, "passing unparsable packet through");
                self.allow(diverter, packet, None);
                return;
            }
        };

        match self.inspector.inspect(&meta) {
            Decision::Allow => self.allow(diverter, packet, Some(&meta)),
            Decision::Block {
                mechanism,
                category,
                reason,
            } => {
                self.counters.blocked.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(
                    "defensiq_packets_blocked_total",
                    "mechanism" => mechanism.as_str(),
                    "category" => category.to_string()
                )
                .increment(1);

                let (block_mode, log_blocked) = self
                    .config
                    .read(|s| (s.filtering.block_mode, s.filtering.log_blocked));
                if log_blocked {
                    self.events.log_traffic(
                        false,
                        &meta.transport.to_string(),
                        meta.src_ip,
                        meta.dst_ip,
                        meta.dst_port,
                        &reason,
                    );
                }
                if block_mode == BlockMode::Reject
                    && mechanism == Mechanism::Dns
                    && !meta.is_dns_response()
                {
                    self.reject_dns(diverter, packet, &meta);
                }
            }
        }
    }

    fn allow<D: PacketDiverter>(
        &self,
        diverter: &mut D,
        packet: &Diverted<D::Address>,
        meta: Option<&PacketMeta<'_>>,
    ) {
        self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("defensiq_packets_allowed_total").increment(1);

        if let Some(meta) = meta
            && self.config.read(|s| s.monitoring.log_all_traffic)
        {
            self.events.log_traffic(
                true,
                &meta.transport.to_string(),
                meta.src_ip,
                meta.dst_ip,
                meta.dst_port,
                "",
            );
        }

        if let Err(err) = diverter.reinject(packet) {
            warn!(error = %err, "failed to reinject packet");
        }
    }

    fn reject_dns<D: PacketDiverter>(
        &self,
        diverter: &mut D,
        packet: &Diverted<D::Address>,
        meta: &PacketMeta<'_>,
    ) {
        let reply = Message::from_bytes(meta.payload)
            .map_err(Error::from)
            .and_then(|query| build_dns_reply(meta, &Matcher::blocked_response(&query)));
        match reply {
            Ok(reply) => {
                if let Err(err) = diverter.inject_reply(packet, reply) {
                    warn!(error = %err, "failed to send sinkhole reply");
                }
            }
            Err(err) => debug!(error = %err, "no sinkhole reply for blocked query"),
        }
    }

    fn stats(&self, started: Option<(Instant, DateTime<Local>)>) -> FilterStats {
        let inspected = self.counters.inspected.load(Ordering::Relaxed);
        let mut stats = FilterStats {
            packets_inspected: inspected,
            packets_allowed: self.counters.allowed.load(Ordering::Relaxed),
            packets_blocked: self.counters.blocked.load(Ordering::Relaxed),
            ..FilterStats::default()
        };
        if let Some((instant, at)) = started {
            let uptime = instant.elapsed().as_secs_f64();
            stats.start_time = Some(at);
            stats.uptime_seconds = uptime;
            stats.packets_per_second = if uptime > 0.0 {
                inspected as f64 / uptime
            } else {
                0.0
            };
        }
        stats
    }
}

/// Receive packets until `running` is cleared or the driver closes, then
/// close the driver.
///
/// Blocks the calling thread; run it on a blocking task.
pub fn run_loop<D: PacketDiverter>(mut diverter: D, context: &FilterContext, running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        match diverter.recv() {
            Ok(packet) => context.process(&mut diverter, &packet),
            Err(DriverError::Closed) => break,
            Err(err) => {
                warn!(error = %err, "packet receive failed");
                std::thread::sleep(RECV_RETRY_DELAY);
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    if let Err(err) = diverter.close() {
        warn!(error = %err, "failed to close packet driver");
    }
    debug!("capture loop finished");
}

/// One capture loop and the means to end it.
struct ActiveRun {
    running: Arc<AtomicBool>,
    shutdown: Box<dyn DriverShutdown>,
    task: JoinHandle<()>,
}

/// Intercepts outbound traffic and drops what the blocklist matches.
pub struct FilterEngine {
    context: FilterContext,
    active: Mutex<Option<ActiveRun>>,
    started: Mutex<Option<(Instant, DateTime<Local>)>>,
}

impl FilterEngine {
    pub fn new(
        config: Arc<ConfigStore>,
        events: Arc<EventLog>,
        matcher: Arc<parking_lot::RwLock<Matcher>>,
    ) -> Self {
        Self {
            context: FilterContext {
                config,
                events,
                inspector: Arc::new(PacketInspector::new(matcher)),
                counters: Arc::default(),
            },
            active: Mutex::new(None),
            started: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &FilterContext {
        &self.context
    }

    /// Whether a capture loop is receiving packets. Turns false on its own
    /// when the driver closes underneath the loop.
    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|run| run.running.load(Ordering::SeqCst))
    }

    /// Open the system driver and start filtering.
    pub fn start(&self) -> Result<()> {
        self.start_with(|| SystemDiverter::open(divert::FILTER))
    }

    /// Start filtering packets from the diverter returned by `open`.
    ///
    /// Fails when filtering is disabled in the settings or the driver cannot
    /// be opened. Starting a running engine does nothing. Must be called from
    /// within a Tokio runtime.
    pub fn start_with<D, F>(&self, open: F) -> Result<()>
    where
        D: PacketDiverter,
        F: FnOnce() -> std::result::Result<D, DriverError>,
    {
        let events = &self.context.events;
        if !self.context.config.read(|s| s.filtering.enabled) {
            events.log(EventType::ErrorOccurred, "Filtering not enabled in configuration");
            return Err(Error::FilteringDisabled);
        }

        let mut active = self.active.lock();
        if active
            .as_ref()
            .is_some_and(|run| run.running.load(Ordering::SeqCst))
        {
            return Ok(());
        }

        let diverter = match open() {
            Ok(diverter) => diverter,
            Err(err) => {
                events.log_with(
                    EventType::ErrorOccurred,
                    format!("Failed to start filtering engine: {err}"),
                    json!({ "error": err.to_string() }),
                );
                return Err(err.into());
            }
        };

        *self.started.lock() = Some((Instant::now(), Local::now()));

        let running = Arc::new(AtomicBool::new(true));
        let shutdown: Box<dyn DriverShutdown> = Box::new(diverter.shutdown_handle());
        let context = self.context.clone();
        let task = {
            let running = Arc::clone(&running);
            tokio::task::spawn_blocking(move || run_loop(diverter, &context, &running))
        };
        *active = Some(ActiveRun {
            running,
            shutdown,
            task,
        });

        events.log(EventType::ServiceStarted, "Packet filtering engine started");
        info!("packet filtering started");
        Ok(())
    }

    /// Stop filtering: shut the driver down, then wait for the capture loop
    /// to close it.
    pub async fn stop(&self) {
        let run = self.active.lock().take();
        let Some(run) = run else {
            return;
        };
        run.running.store(false, Ordering::SeqCst);
        run.shutdown.shutdown();

        match tokio::time::timeout(STOP_TIMEOUT, run.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "capture loop panicked"),
            Err(_) => warn!("capture loop did not exit after shutdown, detaching it"),
        }

        let stats = self.stats();
        self.context.events.log_with(
            EventType::ServiceStopped,
            "Packet filtering engine stopped",
            serde_json::to_value(&stats).unwrap_or_default(),
        );
        info!(
            inspected = stats.packets_inspected,
            blocked = stats.packets_blocked,
            "packet filtering stopped"
        );
    }

    pub fn stats(&self) -> FilterStats {
        self.context.stats(*self.started.lock())
    }
}
