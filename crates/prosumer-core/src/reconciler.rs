//! Chain event reconciliation
//!
//! Log entries can come back more than once when poll ranges overlap, so every
//! event is keyed by its `(block, log index)` identity and processed at most once.
//! Only events created by the agent's own account affect local state.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chain::MarketClient;
use crate::config::PendingClosePolicy;
use crate::scheduler::{AuctionCloseScheduler, PendingAuctionClose, ShutdownOutcome};
use crate::snapshot::ReportSnapshot;
use crate::types::{Address, AuctionId, ChainEvent, EventId, EventKind, MarketEvent};

/// Counters describing what the reconciler has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub processed: u64,
    pub duplicates: u64,
    pub foreign: u64,
    pub mismatched: u64,
    pub own_generated: u64,
    pub own_consumed: u64,
    pub closes_scheduled: u64,
    pub balance_refreshes: u64,
    pub balance_failures: u64,
}

/// Result of one `process_new_events` batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub new_events: usize,
    pub duplicates: usize,
    pub own_events: usize,
}

/// Applies market events to local state exactly once
pub struct EventReconciler {
    self_address: Address,
    market: Arc<MarketClient>,
    snapshot: ReportSnapshot,
    scheduler: AuctionCloseScheduler,
    seen: BTreeSet<EventId>,
    stats: ReconcileStats,
}

impl EventReconciler {
    pub fn new(market: Arc<MarketClient>, snapshot: ReportSnapshot, close_delay: Duration) -> Self {
        let scheduler = AuctionCloseScheduler::new(market.clone(), close_delay, snapshot.clone());
        Self {
            self_address: market.account().clone(),
            market,
            snapshot,
            scheduler,
            seen: BTreeSet::new(),
            stats: ReconcileStats::default(),
        }
    }

    pub fn self_address(&self) -> &Address {
        &self.self_address
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    pub fn scheduler(&self) -> &AuctionCloseScheduler {
        &self.scheduler
    }

    pub fn pending_closes(&self) -> Vec<PendingAuctionClose> {
        self.scheduler.pending()
    }

    pub fn has_seen(&self, id: &EventId) -> bool {
        self.seen.contains(id)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Process a batch of `kind` events in arrival order
    pub async fn process_new_events(&mut self, kind: EventKind, events: Vec<ChainEvent>) -> BatchSummary {
        let mut summary = BatchSummary::default();

        for event in events {
            if !self.seen.insert(event.id) {
                summary.duplicates += 1;
                self.stats.duplicates += 1;
                debug!("Skipping already processed {} event {}", kind, event.id);
                continue;
            }
            summary.new_events += 1;
            self.stats.processed += 1;

            if event.kind() != kind {
                self.stats.mismatched += 1;
                warn!(
                    "Event {} delivered as {} but is {}, ignoring",
                    event.id,
                    kind,
                    event.kind()
                );
                continue;
            }

            if event.created_by() != &self.self_address {
                self.stats.foreign += 1;
                debug!(
                    "{} event {} for auction {} created by {}, not ours",
                    kind,
                    event.id,
                    event.auction_id(),
                    event.created_by()
                );
                continue;
            }

            summary.own_events += 1;
            match event.event {
                MarketEvent::Generated {
                    auction_id,
                    energy_amount,
                    ..
                } => self.on_own_generated(event.id, auction_id, energy_amount).await,
                MarketEvent::Consumed { auction_id, .. } => {
                    self.on_own_consumed(event.id, auction_id).await
                }
            }
        }

        summary
    }

    /// Forget identities below `block`; cursors never query below it again
    pub fn prune_seen_below(&mut self, block: u64) {
        self.seen = self.seen.split_off(&EventId::new(block, 0));
    }

    /// Apply the shutdown policy to pending closes
    pub async fn shutdown(&self, policy: PendingClosePolicy, grace: Duration) -> ShutdownOutcome {
        self.scheduler.shutdown(policy, grace).await
    }

    async fn on_own_generated(&mut self, id: EventId, auction_id: AuctionId, energy_amount: u64) {
        self.stats.own_generated += 1;

        match self.market.energy_balance().await {
            Ok(balance) => {
                self.stats.balance_refreshes += 1;
                self.snapshot.update_balances(None, Some(balance));
                info!(
                    "Auction {} opened with {} energy (event {}). Energy balance: {}",
                    auction_id, energy_amount, id, balance
                );
            }
            Err(e) => {
                self.stats.balance_failures += 1;
                warn!(
                    "Auction {} opened (event {}) but energy balance refresh failed: {}",
                    auction_id, id, e
                );
            }
        }

        if self.scheduler.schedule(auction_id) {
            self.stats.closes_scheduled += 1;
            debug!(
                "Auction {} close scheduled in {:?}",
                auction_id,
                self.scheduler.delay()
            );
        } else {
            debug!("Auction {} already has a pending close", auction_id);
        }
    }

    async fn on_own_consumed(&mut self, id: EventId, auction_id: AuctionId) {
        self.stats.own_consumed += 1;

        let coin = match self.market.coin_balance().await {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!("Coin balance refresh after event {} failed: {}", id, e);
                None
            }
        };
        let energy = match self.market.energy_balance().await {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!("Energy balance refresh after event {} failed: {}", id, e);
                None
            }
        };

        if coin.is_none() && energy.is_none() {
            self.stats.balance_failures += 1;
            return;
        }

        self.stats.balance_refreshes += 1;
        self.snapshot.update_balances(coin, energy);
        info!(
            "Energy consumed on auction {}. Coin balance: {}. Energy balance: {}",
            auction_id,
            display_balance(coin),
            display_balance(energy)
        );
    }
}

fn display_balance(balance: Option<u64>) -> String {
    balance
        .map(|b| b.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
