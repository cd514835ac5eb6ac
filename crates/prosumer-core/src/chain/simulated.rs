//! In-process energy market
//!
//! Behaves like the deployed contract as seen through a chain client: every
//! transaction is mined into its own block, events get `(block, log index)`
//! identities, and balances move the way the market moves them. Used for local runs
//! and as the chain backend in tests, with hooks for injected failures and latency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use super::{CallArg, ChainGateway, ContractValue};
use crate::types::{Address, AuctionId, ChainEvent, EventId, EventKind, TxHandle};
use crate::{ProsumerError, Result};

/// Coins credited to a newly registered user
pub const INITIAL_COIN_BALANCE: u64 = 100;

/// A transaction accepted by the simulated market
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTx {
    pub handle: TxHandle,
    pub method: String,
    pub args: Vec<CallArg>,
    pub from: Address,
    pub block_number: u64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Auction {
    created_by: Address,
    amount: u64,
    price: u64,
    open: bool,
}

#[derive(Default)]
struct MarketState {
    accounts: Vec<Address>,
    registered: HashSet<Address>,
    coins: HashMap<Address, u64>,
    energy: HashMap<Address, u64>,
    auctions: BTreeMap<AuctionId, Auction>,
    next_auction: u64,
    block_number: u64,
    logs: Vec<ChainEvent>,
    transactions: Vec<SubmittedTx>,
    call_counts: HashMap<String, usize>,
    unlocks: usize,
    failures: HashMap<String, usize>,
    latency: HashMap<String, Duration>,
}

/// Simulated energy market implementing [`ChainGateway`]
pub struct SimulatedMarket {
    contract: Option<Address>,
    state: Mutex<MarketState>,
}

impl SimulatedMarket {
    /// Market whose client can sign for `accounts`
    pub fn new(accounts: Vec<Address>) -> Self {
        Self {
            contract: None,
            state: Mutex::new(MarketState {
                accounts,
                next_auction: 1,
                ..MarketState::default()
            }),
        }
    }

    /// Report `contract` as the deployed market address
    pub fn with_contract(mut self, contract: Address) -> Self {
        self.contract = Some(contract);
        self
    }

    /// Make the next `times` invocations of `method` fail
    pub fn fail_next(&self, method: &str, times: usize) {
        self.state.lock().failures.insert(method.to_string(), times);
    }

    /// Delay every invocation of `method`
    pub fn set_latency(&self, method: &str, latency: Duration) {
        self.state.lock().latency.insert(method.to_string(), latency);
    }

    /// Register `account` directly, as if it had registered earlier
    pub fn preregister(&self, account: &Address) {
        let mut state = self.state.lock();
        state.registered.insert(account.clone());
        state.coins.entry(account.clone()).or_insert(INITIAL_COIN_BALANCE);
    }

    pub fn is_registered(&self, account: &Address) -> bool {
        self.state.lock().registered.contains(account)
    }

    /// Advance the chain by `blocks` empty blocks
    pub fn mine_empty_blocks(&self, blocks: u64) {
        self.state.lock().block_number += blocks;
    }

    /// Number of read calls and transactions made for `method`
    pub fn call_count(&self, method: &str) -> usize {
        self.state.lock().call_counts.get(method).copied().unwrap_or(0)
    }

    pub fn unlock_count(&self) -> usize {
        self.state.lock().unlocks
    }

    /// Every accepted transaction, oldest first
    pub fn transactions(&self) -> Vec<SubmittedTx> {
        self.state.lock().transactions.clone()
    }

    /// Accepted transactions for `method`
    pub fn transactions_for(&self, method: &str) -> Vec<SubmittedTx> {
        self.state
            .lock()
            .transactions
            .iter()
            .filter(|tx| tx.method == method)
            .cloned()
            .collect()
    }

    /// Auctions that are still open, oldest first
    pub fn open_auctions(&self) -> Vec<(AuctionId, Address, u64)> {
        self.state
            .lock()
            .auctions
            .iter()
            .filter(|(_, auction)| auction.open)
            .map(|(id, auction)| (*id, auction.created_by.clone(), auction.amount))
            .collect()
    }

    pub fn is_open(&self, auction_id: AuctionId) -> bool {
        self.state
            .lock()
            .auctions
            .get(&auction_id)
            .map(|auction| auction.open)
            .unwrap_or(false)
    }

    fn take_failure(state: &mut MarketState, method: &str) -> bool {
        match state.failures.get_mut(method) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    async fn delay(&self, method: &str) {
        let latency = self.state.lock().latency.get(method).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn apply_transaction(
        state: &mut MarketState,
        method: &str,
        args: &[CallArg],
        from: &Address,
    ) -> Result<u64> {
        let block = state.block_number + 1;
        let mut emitted = Vec::new();

        match method {
            "registerUser" => {
                if !state.registered.insert(from.clone()) {
                    return Err(ProsumerError::transaction(method, "user already registered"));
                }
                state.coins.insert(from.clone(), INITIAL_COIN_BALANCE);
            }
            "generateEnergy" => {
                ensure_registered(state, method, from)?;
                let amount = uint_arg(method, args, 0)?;
                let price = uint_arg(method, args, 1)?;
                if amount == 0 {
                    return Err(ProsumerError::transaction(method, "amount must be positive"));
                }
                let auction_id = AuctionId(state.next_auction);
                state.next_auction += 1;
                state.auctions.insert(
                    auction_id,
                    Auction {
                        created_by: from.clone(),
                        amount,
                        price,
                        open: true,
                    },
                );
                *state.energy.entry(from.clone()).or_default() += amount;
                emitted.push((auction_id, from.clone(), Some(amount)));
            }
            "consumeEnergy" => {
                ensure_registered(state, method, from)?;
                let auction_id = AuctionId(uint_arg(method, args, 0)?);
                let auction = state
                    .auctions
                    .get(&auction_id)
                    .filter(|auction| auction.open)
                    .cloned()
                    .ok_or_else(|| ProsumerError::transaction(method, "auction not open"))?;

                let buyer_coins = state.coins.entry(from.clone()).or_default();
                if *buyer_coins < auction.price {
                    return Err(ProsumerError::transaction(method, "insufficient coins"));
                }
                *buyer_coins -= auction.price;
                *state.coins.entry(auction.created_by.clone()).or_default() += auction.price;

                let seller_energy = state.energy.entry(auction.created_by.clone()).or_default();
                *seller_energy = seller_energy.saturating_sub(auction.amount);
                *state.energy.entry(from.clone()).or_default() += auction.amount;

                if let Some(stored) = state.auctions.get_mut(&auction_id) {
                    stored.open = false;
                }
                emitted.push((auction_id, auction.created_by, None));
            }
            "endAuction" => {
                let auction_id = AuctionId(uint_arg(method, args, 0)?);
                let auction = state
                    .auctions
                    .get_mut(&auction_id)
                    .ok_or_else(|| ProsumerError::transaction(method, "unknown auction"))?;
                if !auction.open {
                    return Err(ProsumerError::transaction(method, "auction already ended"));
                }
                auction.open = false;
            }
            other => {
                return Err(ProsumerError::transaction(other, "unknown method"));
            }
        }

        state.block_number = block;
        for (log_index, (auction_id, created_by, amount)) in emitted.into_iter().enumerate() {
            let id = EventId::new(block, log_index as u64);
            let event = match amount {
                Some(amount) => ChainEvent::generated(id, auction_id, created_by, amount),
                None => ChainEvent::consumed(id, auction_id, created_by),
            };
            state.logs.push(event);
        }
        Ok(block)
    }
}

fn ensure_registered(state: &MarketState, method: &str, from: &Address) -> Result<()> {
    if state.registered.contains(from) {
        Ok(())
    } else {
        Err(ProsumerError::transaction(method, "user not registered"))
    }
}

fn uint_arg(method: &str, args: &[CallArg], index: usize) -> Result<u64> {
    match args.get(index) {
        Some(CallArg::Uint(value)) => Ok(*value),
        other => Err(ProsumerError::transaction(
            method,
            format!("argument {index} must be uint, got {other:?}"),
        )),
    }
}

fn address_arg(method: &str, args: &[CallArg]) -> Result<Address> {
    match args.first() {
        Some(CallArg::Address(address)) => Ok(address.clone()),
        other => Err(ProsumerError::call(
            method,
            format!("argument 0 must be an address, got {other:?}"),
        )),
    }
}

#[async_trait]
impl ChainGateway for SimulatedMarket {
    async fn accounts(&self) -> Result<Vec<Address>> {
        Ok(self.state.lock().accounts.clone())
    }

    async fn current_block_number(&self) -> Result<u64> {
        self.delay("eth_blockNumber").await;
        let mut state = self.state.lock();
        if Self::take_failure(&mut state, "eth_blockNumber") {
            return Err(ProsumerError::call("eth_blockNumber", "injected failure"));
        }
        Ok(state.block_number)
    }

    async fn call(&self, method: &str, args: &[CallArg]) -> Result<ContractValue> {
        self.delay(method).await;
        let mut state = self.state.lock();
        *state.call_counts.entry(method.to_string()).or_default() += 1;
        if Self::take_failure(&mut state, method) {
            return Err(ProsumerError::call(method, "injected failure"));
        }

        match method {
            "isRegistered" => {
                let user = address_arg(method, args)?;
                Ok(ContractValue::Bool(state.registered.contains(&user)))
            }
            "getCoinBalance" => {
                let user = address_arg(method, args)?;
                Ok(ContractValue::Uint(state.coins.get(&user).copied().unwrap_or(0)))
            }
            "getEnergyBalance" => {
                let user = address_arg(method, args)?;
                Ok(ContractValue::Uint(state.energy.get(&user).copied().unwrap_or(0)))
            }
            "getAvailableEnergy" => Ok(ContractValue::Uint(
                state
                    .auctions
                    .values()
                    .filter(|auction| auction.open)
                    .map(|auction| auction.amount)
                    .sum(),
            )),
            other => Err(ProsumerError::call(other, "unknown method")),
        }
    }

    async fn transact(&self, method: &str, args: &[CallArg], from: &Address) -> Result<TxHandle> {
        self.delay(method).await;
        let mut state = self.state.lock();
        *state.call_counts.entry(method.to_string()).or_default() += 1;
        if Self::take_failure(&mut state, method) {
            return Err(ProsumerError::transaction(method, "injected failure"));
        }

        let block_number = Self::apply_transaction(&mut state, method, args, from)?;
        let handle = TxHandle(format!(
            "0x{}",
            hex::encode(rand::thread_rng().gen::<[u8; 32]>())
        ));
        state.transactions.push(SubmittedTx {
            handle: handle.clone(),
            method: method.to_string(),
            args: args.to_vec(),
            from: from.clone(),
            block_number,
            submitted_at: Utc::now(),
        });
        Ok(handle)
    }

    async fn events_since(&self, kind: EventKind, from_block: u64) -> Result<Vec<ChainEvent>> {
        let method = kind.event_name();
        self.delay(method).await;
        let mut state = self.state.lock();
        if Self::take_failure(&mut state, method) {
            return Err(ProsumerError::call(method, "injected failure"));
        }
        Ok(state
            .logs
            .iter()
            .filter(|event| event.kind() == kind && event.id.block_number >= from_block)
            .cloned()
            .collect())
    }

    async fn unlock_account(&self, account: &Address, _passphrase: &str) -> Result<()> {
        let mut state = self.state.lock();
        if Self::take_failure(&mut state, "personal_unlockAccount") {
            return Err(ProsumerError::call("personal_unlockAccount", "injected failure"));
        }
        if !state.accounts.contains(account) {
            return Err(ProsumerError::call(
                "personal_unlockAccount",
                format!("unknown account {account}"),
            ));
        }
        state.unlocks += 1;
        Ok(())
    }

    fn contract(&self) -> Option<Address> {
        self.contract.clone()
    }

    fn name(&self) -> String {
        "simulated".to_string()
    }
}
