//! Security posture of the host, framed as the CIA triad.

pub mod cia;

pub use cia::{Alert, AlertKind, CheckReport, CiaMonitor, CiaStatus, Severity, Status};
