//! Delayed auction closing
//!
//! Each own auction gets one timer task that sleeps for the close delay and then
//! submits `endAuction`. Submission is fire-and-forget: a failure is logged and the
//! close is not retried. Tasks stay tracked until they finish so shutdown can apply
//! a [`PendingClosePolicy`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::chain::MarketClient;
use crate::config::PendingClosePolicy;
use crate::snapshot::ReportSnapshot;
use crate::types::AuctionId;

/// An auction close waiting for its timer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAuctionClose {
    pub auction_id: AuctionId,
    pub scheduled_at: DateTime<Utc>,
    pub fire_at: DateTime<Utc>,
}

/// What shutdown did with the pending closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub completed: usize,
    pub cancelled: usize,
    pub detached: usize,
}

struct PendingEntry {
    close: PendingAuctionClose,
    handle: JoinHandle<()>,
}

type PendingMap = Arc<Mutex<HashMap<AuctionId, PendingEntry>>>;

#[derive(Default)]
struct CloseCounters {
    submitted: AtomicU64,
    failed: AtomicU64,
}

/// Set of scheduled auction closes
pub struct AuctionCloseScheduler {
    market: Arc<MarketClient>,
    delay: Duration,
    snapshot: ReportSnapshot,
    pending: PendingMap,
    counters: Arc<CloseCounters>,
}

impl AuctionCloseScheduler {
    pub fn new(market: Arc<MarketClient>, delay: Duration, snapshot: ReportSnapshot) -> Self {
        Self {
            market,
            delay,
            snapshot,
            pending: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(CloseCounters::default()),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule a close for `auction_id`; returns false if one is already pending
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, auction_id: AuctionId) -> bool {
        let mut pending = self.pending.lock();
        if pending.contains_key(&auction_id) {
            return false;
        }

        let scheduled_at = Utc::now();
        let fire_at = scheduled_at
            + chrono::Duration::from_std(self.delay).unwrap_or_else(|_| chrono::Duration::zero());
        let close = PendingAuctionClose {
            auction_id,
            scheduled_at,
            fire_at,
        };

        let handle = tokio::spawn(fire_close(
            auction_id,
            self.delay,
            self.market.clone(),
            self.pending.clone(),
            self.counters.clone(),
            self.snapshot.clone(),
        ));
        pending.insert(auction_id, PendingEntry { close, handle });
        self.snapshot.set_pending_closes(pending.len());
        true
    }

    pub fn is_pending(&self, auction_id: AuctionId) -> bool {
        self.pending.lock().contains_key(&auction_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Pending closes ordered by fire time
    pub fn pending(&self) -> Vec<PendingAuctionClose> {
        let mut closes: Vec<_> = self
            .pending
            .lock()
            .values()
            .map(|entry| entry.close.clone())
            .collect();
        closes.sort_by_key(|close| (close.fire_at, close.auction_id));
        closes
    }

    /// Close transactions accepted by the gateway
    pub fn submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::Relaxed)
    }

    /// Close transactions that failed or timed out
    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Apply `policy` to every pending close
    pub async fn shutdown(&self, policy: PendingClosePolicy, grace: Duration) -> ShutdownOutcome {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        self.snapshot.set_pending_closes(0);

        let mut outcome = ShutdownOutcome::default();
        if entries.is_empty() {
            return outcome;
        }

        match policy {
            PendingClosePolicy::Cancel => {
                for entry in entries {
                    entry.handle.abort();
                    outcome.cancelled += 1;
                }
            }
            PendingClosePolicy::Detach => {
                outcome.detached = entries.len();
            }
            PendingClosePolicy::Await => {
                let deadline = tokio::time::Instant::now() + grace;
                for mut entry in entries {
                    match tokio::time::timeout_at(deadline, &mut entry.handle).await {
                        Ok(_) => outcome.completed += 1,
                        Err(_) => {
                            warn!(
                                "Auction {} close still pending after {:?} grace, detaching",
                                entry.close.auction_id, grace
                            );
                            outcome.detached += 1;
                        }
                    }
                }
            }
        }

        info!(
            "Pending auction closes on shutdown: {} completed, {} cancelled, {} detached",
            outcome.completed, outcome.cancelled, outcome.detached
        );
        outcome
    }
}

async fn fire_close(
    auction_id: AuctionId,
    delay: Duration,
    market: Arc<MarketClient>,
    pending: PendingMap,
    counters: Arc<CloseCounters>,
    snapshot: ReportSnapshot,
) {
    tokio::time::sleep(delay).await;

    match market.end_auction(auction_id).await {
        Ok(tx) => {
            counters.submitted.fetch_add(1, Ordering::Relaxed);
            info!("Submitted endAuction for auction {} ({})", auction_id, tx);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("endAuction for auction {} failed, not retrying: {}", auction_id, e);
        }
    }

    let mut pending = pending.lock();
    pending.remove(&auction_id);
    snapshot.set_pending_closes(pending.len());
}
