//! Typed, time-bounded access to the energy market contract

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{CallArg, ChainGateway, ContractValue};
use crate::types::{Address, AuctionId, ChainEvent, EventKind, TxHandle};
use crate::{ProsumerError, Result};

/// Contract methods the agent uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketMethod {
    RegisterUser,
    IsRegistered,
    GetCoinBalance,
    GetEnergyBalance,
    GetAvailableEnergy,
    GenerateEnergy,
    EndAuction,
}

impl MarketMethod {
    pub const ALL: [MarketMethod; 7] = [
        MarketMethod::RegisterUser,
        MarketMethod::IsRegistered,
        MarketMethod::GetCoinBalance,
        MarketMethod::GetEnergyBalance,
        MarketMethod::GetAvailableEnergy,
        MarketMethod::GenerateEnergy,
        MarketMethod::EndAuction,
    ];

    /// Method name as declared in the ABI
    pub fn name(&self) -> &'static str {
        match self {
            MarketMethod::RegisterUser => "registerUser",
            MarketMethod::IsRegistered => "isRegistered",
            MarketMethod::GetCoinBalance => "getCoinBalance",
            MarketMethod::GetEnergyBalance => "getEnergyBalance",
            MarketMethod::GetAvailableEnergy => "getAvailableEnergy",
            MarketMethod::GenerateEnergy => "generateEnergy",
            MarketMethod::EndAuction => "endAuction",
        }
    }

    /// Number of ABI inputs
    pub fn arity(&self) -> usize {
        match self {
            MarketMethod::RegisterUser | MarketMethod::GetAvailableEnergy => 0,
            MarketMethod::IsRegistered
            | MarketMethod::GetCoinBalance
            | MarketMethod::GetEnergyBalance
            | MarketMethod::EndAuction => 1,
            MarketMethod::GenerateEnergy => 2,
        }
    }
}

/// Energy market client bound to one signing account
///
/// Shared between the agent loop and the reconciler; every method is bounded by
/// `call_timeout` and reports expiry as [`ProsumerError::Timeout`].
pub struct MarketClient {
    gateway: Arc<dyn ChainGateway>,
    account: Address,
    call_timeout: Duration,
}

impl MarketClient {
    pub fn new(gateway: Arc<dyn ChainGateway>, account: Address, call_timeout: Duration) -> Self {
        Self {
            gateway,
            account,
            call_timeout,
        }
    }

    /// The account transactions are signed with
    pub fn account(&self) -> &Address {
        &self.account
    }

    pub fn backend_name(&self) -> String {
        self.gateway.name()
    }

    pub async fn current_block(&self) -> Result<u64> {
        self.bounded("eth_blockNumber", self.gateway.current_block_number())
            .await
    }

    pub async fn events_since(&self, kind: EventKind, from_block: u64) -> Result<Vec<ChainEvent>> {
        self.bounded(kind.event_name(), self.gateway.events_since(kind, from_block))
            .await
    }

    pub async fn unlock(&self, passphrase: &str) -> Result<()> {
        self.bounded(
            "personal_unlockAccount",
            self.gateway.unlock_account(&self.account, passphrase),
        )
        .await
    }

    pub async fn is_registered(&self) -> Result<bool> {
        let method = MarketMethod::IsRegistered;
        let value = self
            .call(method, &[CallArg::Address(self.account.clone())])
            .await?;
        value
            .as_bool()
            .ok_or_else(|| unexpected_value(method, &value))
    }

    pub async fn coin_balance(&self) -> Result<u64> {
        self.uint_for_account(MarketMethod::GetCoinBalance).await
    }

    pub async fn energy_balance(&self) -> Result<u64> {
        self.uint_for_account(MarketMethod::GetEnergyBalance).await
    }

    pub async fn available_energy(&self) -> Result<u64> {
        let method = MarketMethod::GetAvailableEnergy;
        let value = self.call(method, &[]).await?;
        value
            .as_uint()
            .ok_or_else(|| unexpected_value(method, &value))
    }

    pub async fn register_user(&self) -> Result<TxHandle> {
        self.transact(MarketMethod::RegisterUser, &[]).await
    }

    /// Open an auction for `amount` energy units
    pub async fn generate_energy(&self, amount: u64, price: u64) -> Result<TxHandle> {
        self.transact(
            MarketMethod::GenerateEnergy,
            &[CallArg::Uint(amount), CallArg::Uint(price)],
        )
        .await
    }

    pub async fn end_auction(&self, auction_id: AuctionId) -> Result<TxHandle> {
        self.transact(MarketMethod::EndAuction, &[CallArg::Uint(auction_id.0)])
            .await
    }

    async fn uint_for_account(&self, method: MarketMethod) -> Result<u64> {
        let value = self
            .call(method, &[CallArg::Address(self.account.clone())])
            .await?;
        value
            .as_uint()
            .ok_or_else(|| unexpected_value(method, &value))
    }

    async fn call(&self, method: MarketMethod, args: &[CallArg]) -> Result<ContractValue> {
        self.bounded(method.name(), self.gateway.call(method.name(), args))
            .await
    }

    async fn transact(&self, method: MarketMethod, args: &[CallArg]) -> Result<TxHandle> {
        self.bounded(
            method.name(),
            self.gateway.transact(method.name(), args, &self.account),
        )
        .await
    }

    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProsumerError::Timeout {
                operation: operation.to_string(),
                after: self.call_timeout,
            }),
        }
    }
}

fn unexpected_value(method: MarketMethod, value: &ContractValue) -> ProsumerError {
    ProsumerError::call(method.name(), format!("unexpected return value {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SimulatedMarket;

    fn account() -> Address {
        Address::parse("0x00000000000000000000000000000000000000a1").unwrap()
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let market = Arc::new(SimulatedMarket::new(vec![account()]));
        let client = MarketClient::new(market.clone(), account(), Duration::from_secs(1));

        assert!(!client.is_registered().await.unwrap());
        client.register_user().await.unwrap();
        assert!(client.is_registered().await.unwrap());

        client.generate_energy(56, 10).await.unwrap();
        assert_eq!(client.energy_balance().await.unwrap(), 56);
        assert_eq!(client.available_energy().await.unwrap(), 56);
        assert_eq!(market.call_count("getEnergyBalance"), 1);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let market = Arc::new(SimulatedMarket::new(vec![account()]));
        market.set_latency("getCoinBalance", Duration::from_millis(500));
        let client = MarketClient::new(market, account(), Duration::from_millis(50));

        let err = client.coin_balance().await.unwrap_err();
        assert!(matches!(err, ProsumerError::Timeout { ref operation, .. } if operation == "getCoinBalance"));
    }

    #[test]
    fn test_method_names_and_arity() {
        assert_eq!(MarketMethod::GenerateEnergy.name(), "generateEnergy");
        assert_eq!(MarketMethod::GenerateEnergy.arity(), 2);
        assert_eq!(MarketMethod::RegisterUser.arity(), 0);
    }
}
