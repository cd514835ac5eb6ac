//! Integration tests for the prosumer agent loop
//!
//! Every test drives a real `ProsumerAgent` against the in-process market.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use prosumer_core::chain::abi::ENERGY_MARKET_ABI;
use prosumer_core::chain::{CallArg, ContractValue};
use prosumer_core::types::TxHandle;
use prosumer_core::{
    stop_channel, Address, AgentConfig, AgentDeps, AgentPhase, AgentSettings, AuctionId,
    ChainEvent, ChainGateway, ContractAbi, EventKind, EventStart, GenerationOutcome,
    NoopSink, PendingClosePolicy, ProsumerAgent, ProsumerError, RegistrationStatus,
    ScriptedSensor, SensorSource, SimulatedMarket,
};

fn addr(last: u8) -> Address {
    Address::parse(&format!("0x{:040x}", last)).unwrap()
}

fn settings() -> AgentSettings {
    AgentSettings {
        poll_interval: Duration::from_millis(20),
        auction_close_delay: Duration::from_millis(30),
        call_timeout: Duration::from_millis(500),
        shutdown_grace: Duration::from_secs(1),
        ..AgentSettings::default()
    }
}

fn deps(gateway: Arc<dyn ChainGateway>, sensor: impl SensorSource + 'static) -> AgentDeps {
    AgentDeps {
        gateway,
        sensor: Arc::new(sensor),
        telemetry: Arc::new(NoopSink),
    }
}

/// Registered seller on a fresh market
fn market_with_seller() -> (Arc<SimulatedMarket>, Address) {
    let seller = addr(1);
    let market = Arc::new(SimulatedMarket::new(vec![seller.clone(), addr(2)]));
    market.preregister(&seller);
    (market, seller)
}

async fn agent(
    market: &Arc<SimulatedMarket>,
    settings: AgentSettings,
    sensor: impl SensorSource + 'static,
) -> ProsumerAgent {
    let abi = ContractAbi::energy_market().unwrap();
    ProsumerAgent::initialize(settings, &abi, deps(market.clone(), sensor))
        .await
        .expect("agent should initialize")
}

#[tokio::test]
async fn test_threshold_opens_and_closes_one_auction() {
    let (market, seller) = market_with_seller();
    let mut agent = agent(&market, settings(), ScriptedSensor::constant(8.0)).await;
    assert_eq!(agent.account(), &seller);
    assert_eq!(agent.register().await, RegistrationStatus::Registered);

    for cycle in 1..=6 {
        let report = agent.run_cycle().await;
        assert!(report.generation.is_none(), "cycle {} crossed too early", cycle);
        assert_eq!(report.stored_energy, 8.0 * cycle as f64);
    }

    let report = agent.run_cycle().await;
    match &report.generation {
        Some(GenerationOutcome::Submitted { amount, .. }) => assert_eq!(*amount, 56),
        other => panic!("expected a submission, got {:?}", other),
    }
    assert_eq!(report.stored_energy, 0.0);
    assert_eq!(report.events_processed, 1);

    let generated = market.transactions_for("generateEnergy");
    assert_eq!(generated.len(), 1);
    assert_eq!(generated[0].args, vec![CallArg::Uint(56), CallArg::Uint(10)]);
    assert_eq!(generated[0].from, seller);

    assert!(agent.reconciler().scheduler().is_pending(AuctionId(1)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!market.is_open(AuctionId(1)));
    assert_eq!(market.transactions_for("endAuction").len(), 1);

    let snapshot = agent.snapshot().report();
    assert_eq!(snapshot.auctions_submitted, 1);
    assert_eq!(snapshot.cycles_completed, 7);
    assert_eq!(snapshot.balances.energy_balance, Some(56));
    assert_eq!(snapshot.pending_closes, 0);
}

#[tokio::test]
async fn test_failed_generation_is_kept_and_resubmitted() {
    let (market, _) = market_with_seller();
    market.fail_next("generateEnergy", 1);
    let mut agent = agent(&market, settings(), ScriptedSensor::constant(8.0)).await;
    agent.register().await;

    for _ in 0..6 {
        agent.run_cycle().await;
    }

    let report = agent.run_cycle().await;
    assert!(matches!(
        report.generation,
        Some(GenerationOutcome::Failed { amount: 56, .. })
    ));
    assert_eq!(report.stored_energy, 56.0);
    assert_eq!(agent.accumulator().in_flight(), 0.0);
    assert!(market.transactions_for("generateEnergy").is_empty());

    let report = agent.run_cycle().await;
    assert!(matches!(
        report.generation,
        Some(GenerationOutcome::Submitted { amount: 64, .. })
    ));
    assert_eq!(report.stored_energy, 0.0);
    assert_eq!(market.call_count("generateEnergy"), 2);

    let generated = market.transactions_for("generateEnergy");
    assert_eq!(generated.len(), 1);
    assert_eq!(generated[0].args[0], CallArg::Uint(64));
}

#[tokio::test]
async fn test_fractional_remainder_is_carried() {
    let (market, _) = market_with_seller();
    let mut agent = agent(&market, settings(), ScriptedSensor::constant(12.8)).await;
    agent.register().await;

    for _ in 0..3 {
        agent.run_cycle().await;
    }
    let report = agent.run_cycle().await;
    assert!(matches!(
        report.generation,
        Some(GenerationOutcome::Submitted { amount: 51, .. })
    ));
    assert!((report.stored_energy - 0.2).abs() < 1e-6);

    let report = agent.run_cycle().await;
    assert!((report.stored_energy - 13.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_unregistered_account_registers() {
    let seller = addr(1);
    let market = Arc::new(SimulatedMarket::new(vec![seller.clone()]));
    let mut agent = agent(&market, settings(), ScriptedSensor::constant(1.0)).await;

    assert_eq!(agent.register().await, RegistrationStatus::Submitted);
    let registrations = market.transactions_for("registerUser");
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].from, seller);
}

#[tokio::test]
async fn test_registration_check_is_retried() {
    let (market, _) = market_with_seller();
    market.fail_next("isRegistered", 1);
    let mut agent = agent(&market, settings(), ScriptedSensor::constant(1.0)).await;

    assert_eq!(agent.register().await, RegistrationStatus::Unknown);
    agent.run_cycle().await;
    agent.run_cycle().await;

    assert_eq!(agent.registration(), RegistrationStatus::Registered);
    assert_eq!(market.call_count("isRegistered"), 2);
    assert!(market.transactions_for("registerUser").is_empty());
}

#[tokio::test]
async fn test_sensor_failure_skips_only_sampling() {
    let (market, _) = market_with_seller();
    let sensor = ScriptedSensor::from_script(vec![Ok(8.0), Err("i2c timeout".to_string())], 8.0);
    let settings = AgentSettings {
        passphrase: Some("hunter2".to_string()),
        ..settings()
    };
    let mut agent = agent(&market, settings, sensor).await;
    agent.register().await;

    agent.run_cycle().await;
    let report = agent.run_cycle().await;
    assert!(report.reading.is_none());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.stored_energy, 8.0);
    assert_eq!(agent.snapshot().current_reading().power, 8.0);
    assert_eq!(market.unlock_count(), 2);

    let report = agent.run_cycle().await;
    assert_eq!(report.stored_energy, 16.0);
}

#[tokio::test]
async fn test_failed_event_poll_is_retried() {
    let (market, _) = market_with_seller();
    let mut agent = agent(&market, settings(), ScriptedSensor::constant(8.0)).await;
    agent.register().await;

    for _ in 0..6 {
        agent.run_cycle().await;
    }
    market.fail_next("EnergyGenerated", 1);
    let report = agent.run_cycle().await;
    assert!(matches!(
        report.generation,
        Some(GenerationOutcome::Submitted { amount: 56, .. })
    ));
    assert_eq!(report.events_processed, 0);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("EnergyGenerated"));
    assert_eq!(agent.cursors().get(EventKind::Generated), 1);
    assert_eq!(agent.cursors().get(EventKind::Consumed), 2);
    assert!(!agent.reconciler().scheduler().is_pending(AuctionId(1)));

    let report = agent.run_cycle().await;
    assert!(report.errors.is_empty());
    assert_eq!(report.events_processed, 1);
    assert_eq!(agent.cursors().get(EventKind::Generated), 2);
    assert_eq!(agent.reconciler().stats().closes_scheduled, 1);
    assert!(agent.reconciler().scheduler().is_pending(AuctionId(1)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    agent.run_cycle().await;
    assert_eq!(market.call_count("endAuction"), 1);
    assert!(!market.is_open(AuctionId(1)));
}

#[tokio::test]
async fn test_unlock_failure_does_not_skip_event_poll() {
    let (market, _) = market_with_seller();
    market.fail_next("personal_unlockAccount", 1);
    let settings = AgentSettings {
        passphrase: Some("hunter2".to_string()),
        auction_close_delay: Duration::from_secs(60),
        ..settings()
    };
    let sensor = ScriptedSensor::from_script(vec![Ok(60.0)], 0.0);
    let mut agent = agent(&market, settings, sensor).await;
    agent.register().await;

    let report = agent.run_cycle().await;
    assert!(matches!(
        report.generation,
        Some(GenerationOutcome::Submitted { amount: 60, .. })
    ));
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("personal_unlockAccount"));
    assert_eq!(market.unlock_count(), 0);
    assert_eq!(report.events_processed, 1);
    assert!(agent.reconciler().scheduler().is_pending(AuctionId(1)));

    let report = agent.run_cycle().await;
    assert!(report.errors.is_empty());
    assert_eq!(market.unlock_count(), 1);
}

#[tokio::test]
async fn test_own_consumption_refreshes_balances() {
    let (market, seller) = market_with_seller();
    let buyer = addr(2);
    market.preregister(&buyer);
    let settings = AgentSettings {
        auction_close_delay: Duration::from_secs(60),
        ..settings()
    };
    let sensor = ScriptedSensor::from_script(vec![Ok(60.0)], 0.0);
    let mut agent = agent(&market, settings, sensor).await;
    agent.register().await;

    agent.run_cycle().await;
    market
        .transact("consumeEnergy", &[CallArg::Uint(1)], &buyer)
        .await
        .unwrap();
    agent.run_cycle().await;

    let balances = agent.snapshot().balances();
    assert_eq!(balances.coin_balance, Some(110));
    assert_eq!(balances.energy_balance, Some(0));
    assert_eq!(agent.reconciler().stats().own_consumed, 1);

    let coins = market
        .call("getCoinBalance", &[CallArg::Address(seller)])
        .await
        .unwrap();
    assert_eq!(coins, ContractValue::Uint(110));
}

#[tokio::test]
async fn test_event_start_earliest_sees_history() {
    let (market, seller) = market_with_seller();
    market
        .transact("generateEnergy", &[CallArg::Uint(70), CallArg::Uint(10)], &seller)
        .await
        .unwrap();

    let latest = agent(&market, settings(), ScriptedSensor::constant(0.0)).await;
    assert_eq!(latest.cursors().get(EventKind::Generated), 2);

    let settings = AgentSettings {
        event_start: EventStart::Earliest,
        ..settings()
    };
    let mut earliest = agent(&market, settings, ScriptedSensor::constant(0.0)).await;
    let report = earliest.run_cycle().await;
    assert_eq!(report.events_processed, 1);
    assert!(earliest.reconciler().scheduler().is_pending(AuctionId(1)));
}

/// Gateway whose reported head lags one block behind the chain
struct LaggingGateway {
    inner: Arc<SimulatedMarket>,
}

#[async_trait]
impl ChainGateway for LaggingGateway {
    async fn accounts(&self) -> prosumer_core::Result<Vec<Address>> {
        self.inner.accounts().await
    }

    async fn current_block_number(&self) -> prosumer_core::Result<u64> {
        Ok(self.inner.current_block_number().await?.saturating_sub(1))
    }

    async fn call(&self, method: &str, args: &[CallArg]) -> prosumer_core::Result<ContractValue> {
        self.inner.call(method, args).await
    }

    async fn transact(
        &self,
        method: &str,
        args: &[CallArg],
        from: &Address,
    ) -> prosumer_core::Result<TxHandle> {
        self.inner.transact(method, args, from).await
    }

    async fn events_since(
        &self,
        kind: EventKind,
        from_block: u64,
    ) -> prosumer_core::Result<Vec<ChainEvent>> {
        self.inner.events_since(kind, from_block).await
    }

    async fn unlock_account(&self, account: &Address, passphrase: &str) -> prosumer_core::Result<()> {
        self.inner.unlock_account(account, passphrase).await
    }

    fn contract(&self) -> Option<Address> {
        self.inner.contract()
    }

    fn name(&self) -> String {
        "lagging".to_string()
    }
}

#[tokio::test]
async fn test_redelivered_event_closes_auction_once() {
    let (market, _) = market_with_seller();
    let gateway = Arc::new(LaggingGateway {
        inner: market.clone(),
    });
    let abi = ContractAbi::energy_market().unwrap();
    let sensor = ScriptedSensor::from_script(vec![Ok(60.0)], 0.0);
    let mut agent = ProsumerAgent::initialize(settings(), &abi, deps(gateway, sensor))
        .await
        .unwrap();
    agent.register().await;

    for _ in 0..3 {
        agent.run_cycle().await;
    }
    assert!(agent.reconciler().stats().duplicates >= 1);
    assert_eq!(agent.reconciler().stats().closes_scheduled, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    agent.run_cycle().await;
    assert_eq!(market.call_count("endAuction"), 1);
    assert!(!market.is_open(AuctionId(1)));
}

#[tokio::test]
async fn test_stop_interrupts_sleep() {
    let (market, _) = market_with_seller();
    let settings = AgentSettings {
        poll_interval: Duration::from_secs(60),
        ..settings()
    };
    let agent = agent(&market, settings, ScriptedSensor::constant(8.0)).await;
    let snapshot = agent.snapshot();
    let (stop, signal) = stop_channel();
    let handle = tokio::spawn(agent.run(signal));

    timeout(Duration::from_secs(2), async {
        while snapshot.report().cycles_completed == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first cycle should complete");
    assert_eq!(snapshot.phase(), AgentPhase::Running);

    stop.stop();
    let summary = timeout(Duration::from_secs(1), handle)
        .await
        .expect("agent should stop promptly")
        .unwrap();
    assert_eq!(summary.cycles, 1);
    assert_eq!(snapshot.phase(), AgentPhase::Stopped);
}

#[tokio::test]
async fn test_stop_cancels_pending_closes() {
    let (market, _) = market_with_seller();
    let settings = AgentSettings {
        auction_close_delay: Duration::from_secs(60),
        pending_close_policy: PendingClosePolicy::Cancel,
        ..settings()
    };
    let sensor = ScriptedSensor::from_script(vec![Ok(60.0)], 0.0);
    let agent = agent(&market, settings, sensor).await;
    let snapshot = agent.snapshot();
    let (stop, signal) = stop_channel();
    let handle = tokio::spawn(agent.run(signal));

    timeout(Duration::from_secs(2), async {
        while snapshot.report().pending_closes == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("auction close should be scheduled");

    stop.stop();
    let summary = handle.await.unwrap();
    assert_eq!(summary.shutdown.cancelled, 1);
    assert_eq!(summary.auctions_submitted, 1);
    assert!(market.is_open(AuctionId(1)));
    assert_eq!(market.call_count("endAuction"), 0);
}

#[tokio::test]
async fn test_initialization_fails_fast() {
    let (market, _) = market_with_seller();

    let partial = ContractAbi::from_json(
        r#"[{"type":"function","name":"registerUser","inputs":[],"outputs":[]}]"#,
    )
    .unwrap();
    let result = ProsumerAgent::initialize(
        settings(),
        &partial,
        deps(market.clone(), ScriptedSensor::constant(0.0)),
    )
    .await;
    assert!(matches!(result, Err(ProsumerError::Initialization(_))));

    market.fail_next("eth_blockNumber", 1);
    let abi = ContractAbi::energy_market().unwrap();
    let result = ProsumerAgent::initialize(
        settings(),
        &abi,
        deps(market.clone(), ScriptedSensor::constant(0.0)),
    )
    .await;
    assert!(matches!(result, Err(ProsumerError::Initialization(_))));

    let empty = Arc::new(SimulatedMarket::new(Vec::new()));
    let result =
        ProsumerAgent::initialize(settings(), &abi, deps(empty, ScriptedSensor::constant(0.0)))
            .await;
    assert!(matches!(result, Err(ProsumerError::Initialization(_))));
}

#[tokio::test]
async fn test_from_config_requires_contract_and_abi() {
    let seller = addr(1);
    let contract = addr(0xc0);
    let market = Arc::new(
        SimulatedMarket::new(vec![seller.clone(), addr(2)]).with_contract(contract.clone()),
    );
    market.preregister(&seller);
    let dir = tempfile::tempdir().unwrap();
    let abi_path = dir.path().join("EnergyMarket.json");
    std::fs::write(&abi_path, ENERGY_MARKET_ABI).unwrap();

    let config = AgentConfig::default().with_abi_path(abi_path.to_string_lossy());
    let result =
        ProsumerAgent::from_config(&config, deps(market.clone(), ScriptedSensor::constant(0.0)))
            .await;
    assert!(matches!(result, Err(ProsumerError::Initialization(_))));

    let missing = config
        .clone()
        .with_contract_address(contract.clone())
        .with_abi_path(dir.path().join("missing.json").to_string_lossy());
    let result =
        ProsumerAgent::from_config(&missing, deps(market.clone(), ScriptedSensor::constant(0.0)))
            .await;
    assert!(matches!(result, Err(ProsumerError::Initialization(_))));

    let config = config.with_contract_address(contract.clone()).with_account(seller.clone());
    let agent =
        ProsumerAgent::from_config(&config, deps(market.clone(), ScriptedSensor::constant(0.0)))
            .await
            .unwrap();
    assert_eq!(agent.account(), &seller);
    assert_eq!(agent.contract_address(), Some(&contract));
    assert_eq!(agent.snapshot().phase(), AgentPhase::Initializing);
}

#[tokio::test]
async fn test_contract_mismatch_fails_initialization() {
    let seller = addr(1);
    let market = Arc::new(SimulatedMarket::new(vec![seller.clone()]).with_contract(addr(0xc0)));
    let abi = ContractAbi::energy_market().unwrap();

    let elsewhere = AgentSettings {
        contract_address: Some(addr(0xc1)),
        ..settings()
    };
    let result = ProsumerAgent::initialize(
        elsewhere,
        &abi,
        deps(market.clone(), ScriptedSensor::constant(0.0)),
    )
    .await;
    match result {
        Err(ProsumerError::Initialization(message)) => {
            assert!(message.contains(&addr(0xc1).to_string()))
        }
        Err(other) => panic!("expected an initialization error, got {}", other),
        Ok(_) => panic!("agent initialized against the wrong contract"),
    }

    let unbound = Arc::new(SimulatedMarket::new(vec![seller]));
    let settings = AgentSettings {
        contract_address: Some(addr(0xc1)),
        ..settings()
    };
    let agent =
        ProsumerAgent::initialize(settings, &abi, deps(unbound, ScriptedSensor::constant(0.0)))
            .await
            .unwrap();
    assert_eq!(agent.contract_address(), Some(&addr(0xc1)));
}
