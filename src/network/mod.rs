//! Packet parsing, interception, passive monitoring and per-application
//! control.

pub mod app_control;
pub mod divert;
pub mod monitor;
pub mod packet;

pub use app_control::{AppControl, AppRule, RuleAction};
pub use divert::{Diverted, DriverShutdown, PacketDiverter, SystemDiverter, driver_status};
pub use monitor::{Connection, ConnectionSource, NetstatSource, NetworkMonitor, NetworkStats};
pub use packet::{PacketMeta, Transport};
