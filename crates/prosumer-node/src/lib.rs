//! Prosumer Node - Local Agent Runner
//!
//! Hosts a [`prosumer_core::ProsumerAgent`] together with a small HTTP endpoint
//! that exposes the live meter reading and agent report.
//!
//! # HTTP Endpoints
//!
//! - `GET /reading` - latest meter reading
//! - `GET /report`  - stored energy, balances, phase and counters
//! - `GET /health`  - liveness and agent phase

pub mod buyer;
pub mod error;
pub mod server;

pub use buyer::SimulatedBuyer;
pub use error::{NodeError, Result};
pub use server::ReportServer;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
