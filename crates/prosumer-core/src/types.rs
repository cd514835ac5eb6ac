//! Core domain types shared by the accumulator, reconciler and agent loop

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ProsumerError, Result};

/// Account or contract address (`0x` + 40 hex digits), stored lowercase
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and normalize an address
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| ProsumerError::InvalidAddress(format!("{raw}: missing 0x prefix")))?;

        if hex_part.len() != 40 {
            return Err(ProsumerError::InvalidAddress(format!(
                "{raw}: expected 40 hex digits, got {}",
                hex_part.len()
            )));
        }
        hex::decode(hex_part)
            .map_err(|e| ProsumerError::InvalidAddress(format!("{raw}: {e}")))?;

        Ok(Self(format!("0x{}", hex_part.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = ProsumerError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl std::str::FromStr for Address {
    type Err = ProsumerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-chain auction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuctionId(pub u64);

impl std::fmt::Display for AuctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identity of a log entry; ordered by block then log index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub block_number: u64,
    pub log_index: u64,
}

impl EventId {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// Market events the agent subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Generated,
    Consumed,
}

impl EventKind {
    /// Event name as declared in the contract ABI
    pub fn event_name(&self) -> &'static str {
        match self {
            EventKind::Generated => "EnergyGenerated",
            EventKind::Consumed => "EnergyConsumed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Decoded arguments of a market event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MarketEvent {
    Generated {
        auction_id: AuctionId,
        created_by: Address,
        energy_amount: u64,
    },
    Consumed {
        auction_id: AuctionId,
        created_by: Address,
    },
}

/// A market event together with its log identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub id: EventId,
    pub event: MarketEvent,
}

impl ChainEvent {
    pub fn generated(
        id: EventId,
        auction_id: AuctionId,
        created_by: Address,
        energy_amount: u64,
    ) -> Self {
        Self {
            id,
            event: MarketEvent::Generated {
                auction_id,
                created_by,
                energy_amount,
            },
        }
    }

    pub fn consumed(id: EventId, auction_id: AuctionId, created_by: Address) -> Self {
        Self {
            id,
            event: MarketEvent::Consumed {
                auction_id,
                created_by,
            },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.event {
            MarketEvent::Generated { .. } => EventKind::Generated,
            MarketEvent::Consumed { .. } => EventKind::Consumed,
        }
    }

    pub fn auction_id(&self) -> AuctionId {
        match &self.event {
            MarketEvent::Generated { auction_id, .. } | MarketEvent::Consumed { auction_id, .. } => {
                *auction_id
            }
        }
    }

    pub fn created_by(&self) -> &Address {
        match &self.event {
            MarketEvent::Generated { created_by, .. } | MarketEvent::Consumed { created_by, .. } => {
                created_by
            }
        }
    }
}

/// Raw sample produced by the sensor driver
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

/// Timestamped meter reading exposed to external readers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    pub timestamp: DateTime<Utc>,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

impl MeterReading {
    pub fn from_sample(sample: SensorSample, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            voltage: sample.voltage,
            current: sample.current,
            power: sample.power,
        }
    }

    /// Placeholder reading before the first sample
    pub fn zero(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
        }
    }
}

/// Handle returned for a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHandle(pub String);

impl std::fmt::Display for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
