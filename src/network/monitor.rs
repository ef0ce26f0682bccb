//! Passive network statistics.
//!
//! Interface counters come from `sysinfo` and are reported relative to a
//! baseline taken when the monitor is created. Established TCP connections
//! come from a [`ConnectionSource`]; the default one parses `netstat -ano`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Networks, Pid, ProcessesToUpdate, System};

use crate::platform::{CommandError, CommandRunner, SystemRunner};

/// Connections kept in the history before the oldest are dropped.
pub const MAX_HISTORY: usize = 10_000;

const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;

/// An established TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub pid: u32,
    /// Owning process name, `Unknown` when it could not be resolved.
    pub process: String,
    pub observed_at: DateTime<Local>,
}

impl Connection {
    pub fn family(&self) -> &'static str {
        if self.remote.is_ipv4() { "IPv4" } else { "IPv6" }
    }
}

/// Lists established connections.
pub trait ConnectionSource: Send + Sync + Clone + 'static {
    fn established(&self) -> impl Future<Output = Result<Vec<Connection>, CommandError>> + Send;
}

/// Reads `netstat -ano`. Process names are left `Unknown`.
#[derive(Debug, Clone, Default)]
pub struct NetstatSource<R: CommandRunner = SystemRunner> {
    runner: R,
}

impl<R: CommandRunner> NetstatSource<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> ConnectionSource for NetstatSource<R> {
    async fn established(&self) -> Result<Vec<Connection>, CommandError> {
        let output = self
            .runner
            .run("netstat", &["-ano"])
            .await?
            .check("netstat")?;
        Ok(parse_netstat(&output.stdout))
    }
}

/// Parse the TCP `ESTABLISHED` rows of `netstat -ano`.
pub fn parse_netstat(output: &str) -> Vec<Connection> {
    let now = Local::now();
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [proto, local, remote, state, pid] = fields.as_slice() else {
                return None;
            };
            if !proto.eq_ignore_ascii_case("TCP") || *state != "ESTABLISHED" {
                return None;
            }
            Some(Connection {
                local: local.parse().ok()?,
                remote: remote.parse().ok()?,
                pid: pid.parse().ok()?,
                process: "Unknown".to_string(),
                observed_at: now,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    bytes_sent: u64,
    bytes_recv: u64,
    packets_sent: u64,
    packets_recv: u64,
}

impl Counters {
    fn read(networks: &Networks) -> Self {
        networks.list().values().fold(Self::default(), |acc, data| Self {
            bytes_sent: acc.bytes_sent + data.total_transmitted(),
            bytes_recv: acc.bytes_recv + data.total_received(),
            packets_sent: acc.packets_sent + data.total_packets_transmitted(),
            packets_recv: acc.packets_recv + data.total_packets_received(),
        })
    }

    fn since(self, baseline: Self) -> Self {
        Self {
            bytes_sent: self.bytes_sent.saturating_sub(baseline.bytes_sent),
            bytes_recv: self.bytes_recv.saturating_sub(baseline.bytes_recv),
            packets_sent: self.packets_sent.saturating_sub(baseline.packets_sent),
            packets_recv: self.packets_recv.saturating_sub(baseline.packets_recv),
        }
    }
}

/// Traffic since the monitor started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NetworkStats {
    pub uptime_seconds: f64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub connections_active: usize,
    pub connections_total: usize,
    /// Average send rate over the uptime, in megabytes per second.
    pub bandwidth_sent_mbps: f64,
    pub bandwidth_recv_mbps: f64,
}

impl NetworkStats {
    fn compute(
        delta: Counters,
        uptime_seconds: f64,
        connections_active: usize,
        connections_total: usize,
    ) -> Self {
        let rate = |bytes: u64| {
            if uptime_seconds > 0.0 {
                bytes as f64 / uptime_seconds / BYTES_PER_MEGABYTE
            } else {
                0.0
            }
        };
        Self {
            uptime_seconds,
            bytes_sent: delta.bytes_sent,
            bytes_recv: delta.bytes_recv,
            packets_sent: delta.packets_sent,
            packets_recv: delta.packets_recv,
            connections_active,
            connections_total,
            bandwidth_sent_mbps: rate(delta.bytes_sent),
            bandwidth_recv_mbps: rate(delta.bytes_recv),
        }
    }

    /// Combined send and receive rate.
    pub fn bandwidth_mbps(&self) -> f64 {
        self.bandwidth_sent_mbps + self.bandwidth_recv_mbps
    }
}

/// Disk I/O of a process, the closest per-process counter available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessUsage {
    pub name: String,
    pub pid: u32,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

struct MonitorState {
    networks: Networks,
    system: System,
    counters: Counters,
    connections: Vec<Connection>,
    history: VecDeque<Connection>,
}

/// Samples interface counters and established connections.
pub struct NetworkMonitor<S: ConnectionSource = NetstatSource> {
    source: S,
    started: Instant,
    baseline: Counters,
    state: Mutex<MonitorState>,
}

impl NetworkMonitor<NetstatSource> {
    pub fn new() -> Self {
        Self::with_source(NetstatSource::default())
    }
}

impl Default for NetworkMonitor<NetstatSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ConnectionSource> NetworkMonitor<S> {
    pub fn with_source(source: S) -> Self {
        let networks = Networks::new_with_refreshed_list();
        let baseline = Counters::read(&networks);
        Self {
            source,
            started: Instant::now(),
            baseline,
            state: Mutex::new(MonitorState {
                networks,
                system: System::new(),
                counters: baseline,
                connections: Vec::new(),
                history: VecDeque::new(),
            }),
        }
    }

    /// Refresh counters and connections.
    ///
    /// A failing connection source keeps the previous connection list.
    pub async fn update(&self) -> NetworkStats {
        let connections = match self.source.established().await {
            Ok(connections) => Some(connections),
            Err(err) => {
                tracing::warn!(error = %err, "failed to list connections");
                None
            }
        };

        let mut state = self.state.lock();
        state.networks.refresh(true);
        state.counters = Counters::read(&state.networks);

        if let Some(mut connections) = connections {
            state.system.refresh_processes(ProcessesToUpdate::All, true);
            for connection in &mut connections {
                if let Some(process) = state.system.process(Pid::from_u32(connection.pid)) {
                    connection.process = process.name().to_string_lossy().into_owned();
                }
            }
            for connection in &connections {
                if state.history.len() == MAX_HISTORY {
                    state.history.pop_front();
                }
                state.history.push_back(connection.clone());
            }
            state.connections = connections;
        }

        self.stats_locked(&state)
    }

    fn stats_locked(&self, state: &MonitorState) -> NetworkStats {
        NetworkStats::compute(
            state.counters.since(self.baseline),
            self.started.elapsed().as_secs_f64(),
            state.connections.len(),
            state.history.len(),
        )
    }

    /// Statistics as of the last update.
    pub fn stats(&self) -> NetworkStats {
        self.stats_locked(&self.state.lock())
    }

    pub fn active_connections(&self, limit: usize) -> Vec<Connection> {
        self.state.lock().connections.iter().take(limit).cloned().collect()
    }

    /// The most recent `limit` observations, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Connection> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Connection count per process id for the last update.
    pub fn connections_per_pid(&self) -> HashMap<u32, usize> {
        let mut counts = HashMap::new();
        for connection in &self.state.lock().connections {
            *counts.entry(connection.pid).or_insert(0) += 1;
        }
        counts
    }

    /// Processes with the most I/O, busiest first.
    pub fn top_processes(&self, limit: usize) -> Vec<ProcessUsage> {
        let mut state = self.state.lock();
        state.system.refresh_processes(ProcessesToUpdate::All, true);
        let mut processes: Vec<ProcessUsage> = state
            .system
            .processes()
            .values()
            .map(|process| {
                let usage = process.disk_usage();
                ProcessUsage {
                    name: process.name().to_string_lossy().into_owned(),
                    pid: process.pid().as_u32(),
                    bytes_sent: usage.total_written_bytes,
                    bytes_recv: usage.total_read_bytes,
                }
            })
            .collect();
        processes.sort_by_key(|p| std::cmp::Reverse(p.bytes_sent + p.bytes_recv));
        processes.truncate(limit);
        processes
    }
}
