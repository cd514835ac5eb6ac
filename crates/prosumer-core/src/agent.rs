//! The prosumer agent loop
//!
//! `Initializing → Registering → Running → Stopping → Stopped`, one direction only.
//! Initialization either yields a fully wired [`ProsumerAgent`] or an error; there is
//! no degraded mode. Each Running cycle reads the sensor, folds the sample into the
//! accumulator, opens an auction when the threshold is crossed, keeps the account
//! unlocked, and reconciles new market events. Cycles never overlap.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::accumulator::EnergyAccumulator;
use crate::chain::{ChainGateway, ContractAbi, MarketClient};
use crate::config::{AgentConfig, EventStart, PendingClosePolicy};
use crate::reconciler::{EventReconciler, ReconcileStats};
use crate::scheduler::ShutdownOutcome;
use crate::sensor::SensorSource;
use crate::snapshot::{AgentPhase, ReportSnapshot};
use crate::telemetry::TelemetrySink;
use crate::types::{Address, EventKind, MeterReading, TxHandle};
use crate::{ProsumerError, Result};

/// Runtime settings of the agent, with durations resolved
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub account: Option<Address>,
    pub passphrase: Option<String>,
    pub contract_address: Option<Address>,
    pub poll_interval: Duration,
    pub energy_threshold: f64,
    pub energy_price: u64,
    pub sample_weight: f64,
    pub call_timeout: Duration,
    pub auction_close_delay: Duration,
    pub event_start: EventStart,
    pub pending_close_policy: PendingClosePolicy,
    pub shutdown_grace: Duration,
    pub telemetry_series: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

impl AgentSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            account: config.account.clone(),
            passphrase: config.account_passphrase.clone(),
            contract_address: config.contract_address.clone(),
            poll_interval: config.poll_interval(),
            energy_threshold: config.energy_threshold,
            energy_price: config.energy_price,
            sample_weight: config.sample_weight(),
            call_timeout: config.call_timeout(),
            auction_close_delay: config.auction_close_delay(),
            event_start: config.event_start,
            pending_close_policy: config.pending_close_policy,
            shutdown_grace: config.shutdown_grace(),
            telemetry_series: config.telemetry.series.clone(),
        }
    }
}

/// External collaborators injected into the agent
#[derive(Clone)]
pub struct AgentDeps {
    pub gateway: Arc<dyn ChainGateway>,
    pub sensor: Arc<dyn SensorSource>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

/// Sender half of the cooperative stop signal
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask the agent to stop after the current cycle
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver half of the cooperative stop signal
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop has been requested
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // every handle is gone, so no stop can ever arrive
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected stop handle and signal
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: Arc::new(tx) }, StopSignal { rx })
}

/// Registration state of the agent's account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Not checked yet, or the last check failed
    Unknown,
    /// `registerUser` was submitted; not awaited
    Submitted,
    /// The contract reported the account as registered
    Registered,
}

/// Block each event kind is next queried from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCursors {
    pub generated: u64,
    pub consumed: u64,
}

impl EventCursors {
    fn starting_at(block: u64) -> Self {
        Self {
            generated: block,
            consumed: block,
        }
    }

    pub fn get(&self, kind: EventKind) -> u64 {
        match kind {
            EventKind::Generated => self.generated,
            EventKind::Consumed => self.consumed,
        }
    }

    fn advance(&mut self, kind: EventKind, to: u64) {
        let cursor = match kind {
            EventKind::Generated => &mut self.generated,
            EventKind::Consumed => &mut self.consumed,
        };
        *cursor = (*cursor).max(to);
    }

    pub fn lowest(&self) -> u64 {
        self.generated.min(self.consumed)
    }
}

/// What happened to an over-threshold capture
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Submitted { amount: u64, tx: TxHandle },
    Failed { amount: u64, error: String },
    /// Captured value was below one whole unit and was put back
    BelowUnit,
}

/// Record of one Running cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub reading: Option<MeterReading>,
    pub stored_energy: f64,
    pub generation: Option<GenerationOutcome>,
    pub events_processed: usize,
    pub errors: Vec<String>,
}

/// Totals reported when the agent stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSummary {
    pub cycles: u64,
    pub auctions_submitted: u64,
    pub reconcile: ReconcileStats,
    pub shutdown: ShutdownOutcome,
}

/// Fully initialized prosumer agent
pub struct ProsumerAgent {
    settings: AgentSettings,
    market: Arc<MarketClient>,
    sensor: Arc<dyn SensorSource>,
    telemetry: Arc<dyn TelemetrySink>,
    accumulator: EnergyAccumulator,
    snapshot: ReportSnapshot,
    reconciler: EventReconciler,
    cursors: EventCursors,
    registration: RegistrationStatus,
    cycle: u64,
}

impl ProsumerAgent {
    /// Validate `config`, load its ABI, and initialize against `deps`
    pub async fn from_config(config: &AgentConfig, deps: AgentDeps) -> Result<Self> {
        config.validate().map_err(initialization)?;
        if config.contract_address.is_none() {
            return Err(ProsumerError::Initialization(
                "contract_address is not configured".to_string(),
            ));
        }
        let abi = ContractAbi::from_file(&config.abi_path).map_err(initialization)?;
        Self::initialize(AgentSettings::from_config(config), &abi, deps).await
    }

    /// Initializing phase: check the ABI and contract, resolve the account, place event cursors
    pub async fn initialize(settings: AgentSettings, abi: &ContractAbi, deps: AgentDeps) -> Result<Self> {
        abi.ensure_market_interface().map_err(initialization)?;
        check_contract(settings.contract_address.as_ref(), deps.gateway.as_ref())?;

        let accounts = bounded_init(settings.call_timeout, "accounts", deps.gateway.accounts()).await?;
        let account = match &settings.account {
            Some(account) => {
                if !accounts.contains(account) {
                    warn!("Configured account {} is not listed by the chain client", account);
                }
                account.clone()
            }
            None => accounts.first().cloned().ok_or_else(|| {
                ProsumerError::Initialization("chain client exposes no accounts".to_string())
            })?,
        };

        let head = bounded_init(
            settings.call_timeout,
            "eth_blockNumber",
            deps.gateway.current_block_number(),
        )
        .await?;
        let start_block = match settings.event_start {
            EventStart::Latest => head + 1,
            EventStart::Earliest => 0,
            EventStart::Block(block) => block,
        };

        info!("Connected to {} chain at block {}", deps.gateway.name(), head);
        info!("Account: {}", account);
        if let Some(contract) = &settings.contract_address {
            info!("Energy market contract: {}", contract);
        }
        info!(
            "Watching {} and {} from block {} ({:?})",
            EventKind::Generated,
            EventKind::Consumed,
            start_block,
            settings.event_start
        );

        let market = Arc::new(MarketClient::new(
            deps.gateway.clone(),
            account,
            settings.call_timeout,
        ));
        let accumulator = EnergyAccumulator::with_sample_weight(settings.sample_weight);
        let snapshot = accumulator.snapshot();
        let reconciler =
            EventReconciler::new(market.clone(), snapshot.clone(), settings.auction_close_delay);

        Ok(Self {
            settings,
            market,
            sensor: deps.sensor,
            telemetry: deps.telemetry,
            accumulator,
            snapshot,
            reconciler,
            cursors: EventCursors::starting_at(start_block),
            registration: RegistrationStatus::Unknown,
            cycle: 0,
        })
    }

    pub fn snapshot(&self) -> ReportSnapshot {
        self.snapshot.clone()
    }

    pub fn account(&self) -> &Address {
        self.market.account()
    }

    pub fn contract_address(&self) -> Option<&Address> {
        self.settings.contract_address.as_ref()
    }

    pub fn accumulator(&self) -> &EnergyAccumulator {
        &self.accumulator
    }

    pub fn reconciler(&self) -> &EventReconciler {
        &self.reconciler
    }

    pub fn cursors(&self) -> EventCursors {
        self.cursors
    }

    pub fn registration(&self) -> RegistrationStatus {
        self.registration
    }

    /// Registering phase: make sure the account is known to the market
    pub async fn register(&mut self) -> RegistrationStatus {
        self.snapshot.set_phase(AgentPhase::Registering);

        match self.market.available_energy().await {
            Ok(available) => info!("Prosumer running. Available energy = {}", available),
            Err(e) => warn!("Could not read available energy: {}", e),
        }

        self.check_registration().await
    }

    async fn check_registration(&mut self) -> RegistrationStatus {
        match self.market.is_registered().await {
            Ok(true) => {
                self.registration = RegistrationStatus::Registered;
                match self.market.coin_balance().await {
                    Ok(balance) => {
                        self.snapshot.update_balances(Some(balance), None);
                        info!("Coin balance: {}", balance);
                    }
                    Err(e) => warn!("Could not read coin balance: {}", e),
                }
            }
            Ok(false) => match self.market.register_user().await {
                Ok(tx) => {
                    self.registration = RegistrationStatus::Submitted;
                    info!("Submitted registerUser for {} ({})", self.account(), tx);
                }
                Err(e) => {
                    warn!("registerUser failed, will check again next cycle: {}", e);
                }
            },
            Err(e) => {
                warn!("Registration check failed, will retry next cycle: {}", e);
            }
        }
        self.registration
    }

    /// Register, then run cycles until `stop` fires; pending closes are handled
    /// per the configured policy on the way out
    pub async fn run(mut self, mut stop: StopSignal) -> AgentSummary {
        if !stop.is_stopped() {
            self.register().await;
        }
        self.snapshot.set_phase(AgentPhase::Running);

        while !stop.is_stopped() {
            let report = self.run_cycle().await;
            for e in &report.errors {
                debug!("Cycle {} error: {}", report.cycle, e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = stop.stopped() => {}
            }
        }

        info!("Stop requested after {} cycles", self.cycle);
        self.snapshot.set_phase(AgentPhase::Stopping);
        let shutdown = self
            .reconciler
            .shutdown(self.settings.pending_close_policy, self.settings.shutdown_grace)
            .await;
        self.snapshot.set_phase(AgentPhase::Stopped);

        let report = self.snapshot.report();
        info!("Prosumer agent stopped");
        AgentSummary {
            cycles: self.cycle,
            auctions_submitted: report.auctions_submitted,
            reconcile: self.reconciler.stats(),
            shutdown,
        }
    }

    /// Execute one Running cycle; errors are recorded, never propagated
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let mut report = CycleReport {
            cycle: self.cycle,
            ..CycleReport::default()
        };

        if self.registration == RegistrationStatus::Unknown && self.cycle > 1 {
            self.check_registration().await;
        }

        self.sample(&mut report).await;

        if let Some(passphrase) = self.settings.passphrase.clone() {
            if let Err(e) = self.market.unlock(&passphrase).await {
                warn!("Account unlock failed: {}", e);
                report.errors.push(e.to_string());
            }
        }

        self.poll_events(&mut report).await;

        if let Some(reading) = report.reading {
            self.publish_telemetry(reading);
        }
        self.snapshot.record_cycle();
        report
    }

    async fn sample(&mut self, report: &mut CycleReport) {
        let sample = match tokio::time::timeout(self.settings.call_timeout, self.sensor.read_sample()).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                warn!("Sensor read failed, keeping previous reading: {}", e);
                report.errors.push(e.to_string());
                report.stored_energy = self.accumulator.total();
                return;
            }
            Err(_) => {
                let e = ProsumerError::Timeout {
                    operation: "sensor read".to_string(),
                    after: self.settings.call_timeout,
                };
                warn!("Sensor read failed, keeping previous reading: {}", e);
                report.errors.push(e.to_string());
                report.stored_energy = self.accumulator.total();
                return;
            }
        };

        let reading = MeterReading::from_sample(sample, Utc::now());
        let outcome = self
            .accumulator
            .accumulate(reading, self.settings.energy_threshold);
        debug!("Power: {}. Local energy: {}", reading.power, outcome.total);
        report.reading = Some(reading);

        if let Some(captured) = outcome.captured {
            report.generation = Some(self.submit_generation(captured).await);
        }
        report.stored_energy = self.accumulator.total();
    }

    async fn submit_generation(&mut self, captured: f64) -> GenerationOutcome {
        let amount = captured.floor() as u64;
        if amount == 0 {
            self.accumulator.restore(captured);
            return GenerationOutcome::BelowUnit;
        }

        info!(
            "Local storage exceeded {} ({}), opening auction for {} energy",
            self.settings.energy_threshold, captured, amount
        );
        match self
            .market
            .generate_energy(amount, self.settings.energy_price)
            .await
        {
            Ok(tx) => {
                self.accumulator.settle(captured, amount);
                self.snapshot.record_auction_submitted();
                info!("Submitted generateEnergy for {} ({})", amount, tx);
                GenerationOutcome::Submitted { amount, tx }
            }
            Err(e) => {
                self.accumulator.restore(captured);
                warn!(
                    "generateEnergy failed, keeping {} energy for the next cycle: {}",
                    captured, e
                );
                GenerationOutcome::Failed {
                    amount,
                    error: e.to_string(),
                }
            }
        }
    }

    fn publish_telemetry(&self, reading: MeterReading) {
        let sink = self.telemetry.clone();
        let series = self.settings.telemetry_series.clone();
        let bound = self.settings.call_timeout;

        tokio::spawn(async move {
            match tokio::time::timeout(bound, sink.publish(&series, reading.power, reading.timestamp)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Telemetry publish to {} failed: {}", sink.name(), e),
                Err(_) => warn!("Telemetry publish to {} timed out after {:?}", sink.name(), bound),
            }
        });
    }

    async fn poll_events(&mut self, report: &mut CycleReport) {
        let head = match self.market.current_block().await {
            Ok(head) => head,
            Err(e) => {
                warn!("Could not read block number, skipping event poll: {}", e);
                report.errors.push(e.to_string());
                return;
            }
        };

        for kind in [EventKind::Consumed, EventKind::Generated] {
            let from = self.cursors.get(kind);
            match self.market.events_since(kind, from).await {
                Ok(events) => {
                    if !events.is_empty() {
                        debug!("{} {} events from block {}", events.len(), kind, from);
                    }
                    let summary = self.reconciler.process_new_events(kind, events).await;
                    report.events_processed += summary.new_events;
                    self.cursors.advance(kind, head + 1);
                }
                Err(e) => {
                    warn!("Polling {} events failed, will retry from block {}: {}", kind, from, e);
                    report.errors.push(e.to_string());
                }
            }
        }

        self.reconciler.prune_seen_below(self.cursors.lowest());
    }
}

fn initialization(e: ProsumerError) -> ProsumerError {
    match e {
        ProsumerError::Initialization(_) => e,
        other => {
            error!("Initialization failed: {}", other);
            ProsumerError::Initialization(other.to_string())
        }
    }
}

/// The gateway must target the configured contract when it reports one
fn check_contract(configured: Option<&Address>, gateway: &dyn ChainGateway) -> Result<()> {
    let Some(configured) = configured else {
        return Ok(());
    };
    match gateway.contract() {
        Some(bound) if &bound != configured => Err(ProsumerError::Initialization(format!(
            "{} client is bound to contract {}, expected {}",
            gateway.name(),
            bound,
            configured
        ))),
        Some(_) => Ok(()),
        None => {
            warn!(
                "{} client does not report its contract; assuming {}",
                gateway.name(),
                configured
            );
            Ok(())
        }
    }
}

async fn bounded_init<T>(
    bound: Duration,
    operation: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(bound, fut).await {
        Ok(result) => result.map_err(initialization),
        Err(_) => Err(initialization(ProsumerError::Timeout {
            operation: operation.to_string(),
            after: bound,
        })),
    }
}
