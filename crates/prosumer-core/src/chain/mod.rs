//! Energy market contract access
//!
//! [`ChainGateway`] is the seam to whatever chain client backs the agent. The rest of
//! the crate talks to the contract through [`MarketClient`], which adds typed methods
//! and a time bound on every call.

pub mod abi;
pub mod market;
pub mod simulated;

pub use abi::ContractAbi;
pub use market::{MarketClient, MarketMethod};
pub use simulated::{SimulatedMarket, SubmittedTx};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Address, ChainEvent, EventKind, TxHandle};
use crate::Result;

/// Argument passed to a contract method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallArg {
    Address(Address),
    Uint(u64),
}

/// Decoded return value of a read-only contract call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractValue {
    Bool(bool),
    Uint(u64),
    Address(Address),
}

impl ContractValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContractValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            ContractValue::Uint(value) => Some(*value),
            _ => None,
        }
    }
}

/// Chain client capabilities the agent relies on
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Accounts the client can sign for
    async fn accounts(&self) -> Result<Vec<Address>>;

    /// Number of the latest block
    async fn current_block_number(&self) -> Result<u64>;

    /// Execute a read-only contract method
    async fn call(&self, method: &str, args: &[CallArg]) -> Result<ContractValue>;

    /// Submit a transaction; returns once it is accepted, not mined
    async fn transact(&self, method: &str, args: &[CallArg], from: &Address) -> Result<TxHandle>;

    /// Events of `kind` in blocks `from_block..=latest`, in block order
    async fn events_since(&self, kind: EventKind, from_block: u64) -> Result<Vec<ChainEvent>>;

    /// Unlock `account` for signing
    async fn unlock_account(&self, account: &Address, passphrase: &str) -> Result<()>;

    /// Energy market contract the client is bound to, if it reports one
    fn contract(&self) -> Option<Address>;

    /// Human readable backend name
    fn name(&self) -> String;
}
