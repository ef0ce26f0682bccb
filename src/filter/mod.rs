//! Traffic filtering.
//!
//! [`PacketInspector`] decides per packet against the shared blocklist
//! matcher; [`FilterEngine`] owns the capture loop that feeds it from the
//! packet driver and drops what it blocks.

mod engine;
mod inspector;

pub use engine::{FilterContext, FilterEngine, FilterStats, run_loop};
pub use inspector::{Decision, Mechanism, PacketInspector};
