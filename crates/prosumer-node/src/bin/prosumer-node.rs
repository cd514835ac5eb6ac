#!/usr/bin/env cargo
//! Prosumer Node Binary
//!
//! Runs the prosumer agent against the in-process market with a simulated sensor
//! and serves the meter report over HTTP.
//!
//! # Usage
//! ```bash
//! prosumer-node [--config prosumer.toml] [--host 127.0.0.1] [--port 5000] [--verbose] [--buyer]
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use prosumer_core::{
    stop_channel, AdafruitIoSink, Address, AgentConfig, AgentDeps, LogSink, ProsumerAgent,
    SimulatedMarket, SimulatedSensor, TelemetrySink,
};
use prosumer_node::{ReportServer, SimulatedBuyer};

const LOCAL_SELLER: &str = "0x00000000000000000000000000000000000000a1";
const LOCAL_BUYER: &str = "0x00000000000000000000000000000000000000b2";

/// Prosumer Node - energy market agent with a live meter endpoint
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host for the report endpoint (overrides the config)
    #[arg(long)]
    host: Option<String>,

    /// Port for the report endpoint (overrides the config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Spawn a simulated buyer that consumes this node's auctions
    #[arg(long)]
    buyer: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    dotenvy::dotenv().ok();
    init_tracing(args.verbose);

    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    config.apply_env().context("applying environment overrides")?;
    if let Some(host) = args.host {
        config.report.host = host;
    }
    if let Some(port) = args.port {
        config.report.port = port;
    }

    let seller = match &config.account {
        Some(account) => account.clone(),
        None => Address::parse(LOCAL_SELLER)?,
    };
    config.account = Some(seller.clone());
    let buyer = Address::parse(LOCAL_BUYER)?;

    let mut market = SimulatedMarket::new(vec![seller.clone(), buyer.clone()]);
    if let Some(contract) = &config.contract_address {
        market = market.with_contract(contract.clone());
    }
    let market = Arc::new(market);
    let telemetry: Arc<dyn TelemetrySink> = match &config.telemetry.adafruit {
        Some(settings) => Arc::new(AdafruitIoSink::new(settings.clone(), config.call_timeout())?),
        None => Arc::new(LogSink),
    };
    let deps = AgentDeps {
        gateway: market.clone(),
        sensor: Arc::new(SimulatedSensor::new(config.sensor.fixed_power)),
        telemetry,
    };

    let agent = ProsumerAgent::from_config(&config, deps)
        .await
        .context("initializing prosumer agent")?;
    let snapshot = agent.snapshot();
    let (stop, signal) = stop_channel();

    let server = ReportServer::new(snapshot, &config.report)?;
    let addr = server.addr();
    let mut server_signal = signal.clone();
    let server_task = tokio::spawn(server.serve(async move { server_signal.stopped().await }));

    if args.buyer {
        tokio::spawn(SimulatedBuyer::new(market.clone(), buyer, seller.clone()).run(signal.clone()));
    }
    let agent_task = tokio::spawn(agent.run(signal));

    print_banner(&addr.to_string(), &seller, args.buyer);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Ctrl-C received, stopping agent");
    stop.stop();

    let summary = agent_task.await.context("agent task panicked")?;
    info!(
        "Agent ran {} cycles, submitted {} auctions, scheduled {} closes",
        summary.cycles, summary.auctions_submitted, summary.reconcile.closes_scheduled
    );
    server_task.await.context("report server task panicked")??;

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if verbose {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn print_banner(addr: &str, account: &Address, buyer: bool) {
    println!();
    println!("╔═══════════════════════════════════════════════════════════════╗");
    println!("║                                                               ║");
    println!("║              ⚡  PROSUMER NODE — ENERGY MARKET  ⚡             ║");
    println!("║                                                               ║");
    println!("╚═══════════════════════════════════════════════════════════════╝");
    println!();
    println!("🔑 Account");
    println!("   └─ {}", account);
    println!();
    println!("🔗 HTTP Endpoints (http://{})", addr);
    println!("   ├─ GET  /reading  — Latest meter reading");
    println!("   ├─ GET  /report   — Stored energy, balances, phase");
    println!("   └─ GET  /health   — Health check");
    println!();
    if buyer {
        println!("🛒 Simulated buyer enabled");
        println!();
    }
    println!("─────────────────────────────────────────────────────────────────");
    println!("Press Ctrl+C to stop the node");
    println!();
}
