//! Lock-consistent view of the meter for external readers
//!
//! The accumulator, the reconciler and the agent loop all write into one
//! [`MeterCell`] behind a single mutex. Readers copy out of it and never wait on
//! chain I/O, because no writer holds the lock across an `.await`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::MeterReading;

/// Lifecycle phase of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Initializing,
    Registering,
    Running,
    Stopping,
    Stopped,
}

/// Balances derived from the market contract
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalances {
    pub coin_balance: Option<u64>,
    pub energy_balance: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Full report served to external readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterReport {
    pub reading: MeterReading,
    pub stored_energy: f64,
    pub in_flight_energy: f64,
    pub balances: AccountBalances,
    pub phase: AgentPhase,
    pub cycles_completed: u64,
    pub auctions_submitted: u64,
    pub pending_closes: usize,
}

/// Mutable meter state; every field is guarded by the same lock
#[derive(Debug, Clone)]
pub(crate) struct MeterCell {
    pub(crate) stored: f64,
    pub(crate) in_flight: f64,
    pub(crate) reading: MeterReading,
    pub(crate) balances: AccountBalances,
    pub(crate) phase: AgentPhase,
    pub(crate) cycles_completed: u64,
    pub(crate) auctions_submitted: u64,
    pub(crate) pending_closes: usize,
}

impl MeterCell {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            stored: 0.0,
            in_flight: 0.0,
            reading: MeterReading::zero(started_at),
            balances: AccountBalances::default(),
            phase: AgentPhase::Initializing,
            cycles_completed: 0,
            auctions_submitted: 0,
            pending_closes: 0,
        }
    }
}

pub(crate) type SharedMeter = Arc<Mutex<MeterCell>>;

pub(crate) fn new_shared_meter() -> SharedMeter {
    Arc::new(Mutex::new(MeterCell::new(Utc::now())))
}

/// Cheap, cloneable reader handle over the meter state
#[derive(Clone)]
pub struct ReportSnapshot {
    meter: SharedMeter,
}

impl ReportSnapshot {
    pub(crate) fn new(meter: SharedMeter) -> Self {
        Self { meter }
    }

    /// Copy of the most recent reading
    pub fn current_reading(&self) -> MeterReading {
        self.meter.lock().reading
    }

    /// Copy of everything the agent exposes, taken under one lock
    pub fn report(&self) -> MeterReport {
        let cell = self.meter.lock();
        MeterReport {
            reading: cell.reading,
            stored_energy: cell.stored,
            in_flight_energy: cell.in_flight,
            balances: cell.balances,
            phase: cell.phase,
            cycles_completed: cell.cycles_completed,
            auctions_submitted: cell.auctions_submitted,
            pending_closes: cell.pending_closes,
        }
    }

    pub fn phase(&self) -> AgentPhase {
        self.meter.lock().phase
    }

    pub fn balances(&self) -> AccountBalances {
        self.meter.lock().balances
    }

    pub(crate) fn set_phase(&self, phase: AgentPhase) {
        self.meter.lock().phase = phase;
    }

    pub(crate) fn update_balances(&self, coin: Option<u64>, energy: Option<u64>) {
        let mut cell = self.meter.lock();
        if coin.is_some() {
            cell.balances.coin_balance = coin;
        }
        if energy.is_some() {
            cell.balances.energy_balance = energy;
        }
        cell.balances.updated_at = Some(Utc::now());
    }

    pub(crate) fn set_pending_closes(&self, pending: usize) {
        self.meter.lock().pending_closes = pending;
    }

    pub(crate) fn record_cycle(&self) {
        self.meter.lock().cycles_completed += 1;
    }

    pub(crate) fn record_auction_submitted(&self) {
        self.meter.lock().auctions_submitted += 1;
    }
}

impl std::fmt::Debug for ReportSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportSnapshot")
            .field("report", &self.report())
            .finish()
    }
}
