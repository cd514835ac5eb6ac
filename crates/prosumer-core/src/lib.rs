//! Prosumer Core - Energy Market Agent
//!
//! This crate implements the prosumer side of a peer-to-peer energy market:
//! a meter agent that turns locally produced energy into on-chain auctions.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      ProsumerAgent                        │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌───────────────────┐  ┌───────────┐  │
//! │  │ SensorSource │──▶│ EnergyAccumulator │─▶│ Telemetry │  │
//! │  └──────────────┘   └─────────┬─────────┘  └───────────┘  │
//! │                               │ over threshold            │
//! │                      ┌────────▼────────┐                  │
//! │                      │  MarketClient   │◀─────────┐       │
//! │                      └────────┬────────┘          │       │
//! │                               │ events            │       │
//! │                      ┌────────▼────────┐  ┌───────┴────┐  │
//! │                      │ EventReconciler │─▶│ CloseSched │  │
//! │                      └────────┬────────┘  └────────────┘  │
//! │                               │                           │
//! │                      ┌────────▼────────┐                  │
//! │                      │ ReportSnapshot  │                  │
//! │                      └─────────────────┘                  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Threshold auctions**: stored energy above the threshold becomes `generateEnergy`
//! - **Exactly-once reconciliation**: events are deduplicated by block and log index
//! - **Delayed closing**: own auctions are closed after a configurable delay
//! - **Pluggable seams**: chain gateway, sensor and telemetry are traits

pub mod accumulator;
pub mod agent;
pub mod chain;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod scheduler;
pub mod sensor;
pub mod snapshot;
pub mod telemetry;
pub mod types;

pub use accumulator::{EnergyAccumulator, SampleOutcome};
pub use agent::{
    stop_channel, AgentDeps, AgentSettings, AgentSummary, CycleReport, GenerationOutcome,
    ProsumerAgent, RegistrationStatus, StopHandle, StopSignal,
};
pub use chain::{ChainGateway, ContractAbi, MarketClient, SimulatedMarket};
pub use config::{AgentConfig, EventStart, PendingClosePolicy};
pub use error::{ProsumerError, Result};
pub use reconciler::{EventReconciler, ReconcileStats};
pub use scheduler::{AuctionCloseScheduler, PendingAuctionClose, ShutdownOutcome};
pub use sensor::{ScriptedSensor, SensorSource, SimulatedSensor};
pub use snapshot::{AccountBalances, AgentPhase, MeterReport, ReportSnapshot};
pub use telemetry::{AdafruitIoSink, LogSink, NoopSink, TelemetrySink};
pub use types::{Address, AuctionId, ChainEvent, EventId, EventKind, MarketEvent, MeterReading};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
