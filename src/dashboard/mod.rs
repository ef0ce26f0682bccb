//! The desktop dashboard.
//!
//! [`model`] holds the view state and the actions behind each control and is
//! always built; the egui window in `gui` needs the `gui` feature.

#[cfg(feature = "gui")]
pub mod gui;
pub mod model;

pub use model::{BlocklistRow, DashboardModel, Snapshot, StatCard, Tab};
