//! Simulated consumer for local runs
//!
//! Buys auctions opened by one seller on the in-process market so a local node
//! sees the full open → consumed cycle without a second participant.

use prosumer_core::chain::CallArg;
use prosumer_core::{Address, AuctionId, ChainGateway, SimulatedMarket, StopSignal};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Periodically consumes the seller's open auctions
pub struct SimulatedBuyer {
    market: Arc<SimulatedMarket>,
    buyer: Address,
    seller: Address,
    interval: Duration,
    purchase_probability: f64,
}

impl SimulatedBuyer {
    pub fn new(market: Arc<SimulatedMarket>, buyer: Address, seller: Address) -> Self {
        Self {
            market,
            buyer,
            seller,
            interval: Duration::from_secs(3),
            purchase_probability: 0.5,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Chance of buying a given open auction on each pass
    pub fn with_purchase_probability(mut self, probability: f64) -> Self {
        self.purchase_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// One pass over the open auctions; returns the auctions bought
    pub async fn buy_open_auctions(&self) -> Vec<AuctionId> {
        let candidates: Vec<AuctionId> = self
            .market
            .open_auctions()
            .into_iter()
            .filter(|(_, created_by, _)| created_by == &self.seller)
            .map(|(auction_id, _, _)| auction_id)
            .collect();

        let mut bought = Vec::new();
        for auction_id in candidates {
            if !rand::thread_rng().gen_bool(self.purchase_probability) {
                continue;
            }
            match self
                .market
                .transact("consumeEnergy", &[CallArg::Uint(auction_id.0)], &self.buyer)
                .await
            {
                Ok(tx) => {
                    info!("Buyer {} consumed auction {} ({})", self.buyer, auction_id, tx);
                    bought.push(auction_id);
                }
                Err(e) => debug!("Buyer skipped auction {}: {}", auction_id, e),
            }
        }
        bought
    }

    /// Run passes until `stop` fires
    pub async fn run(self, mut stop: StopSignal) {
        if !self.market.is_registered(&self.buyer) {
            if let Err(e) = self.market.transact("registerUser", &[], &self.buyer).await {
                warn!("Simulated buyer could not register: {}", e);
                return;
            }
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop.stopped() => break,
            }
            self.buy_open_auctions().await;
        }
        debug!("Simulated buyer stopped");
    }
}
