//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::Address;
use crate::{ProsumerError, Result};

/// Environment variable overriding the account passphrase
pub const ENV_PASSPHRASE: &str = "PROSUMER_ACCOUNT_PASSPHRASE";
/// Environment variable overriding the contract address
pub const ENV_CONTRACT_ADDRESS: &str = "PROSUMER_CONTRACT_ADDRESS";
/// Environment variable overriding the signing account
pub const ENV_ACCOUNT: &str = "PROSUMER_ACCOUNT";

/// Main agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Signing account; the gateway's first account when unset
    pub account: Option<Address>,

    /// Passphrase used to keep the account unlocked
    pub account_passphrase: Option<String>,

    /// Deployed energy market contract
    pub contract_address: Option<Address>,

    /// Path of the contract ABI document
    pub abi_path: String,

    /// Seconds between agent cycles
    pub poll_interval_secs: u64,

    /// Stored energy above which an auction is created
    pub energy_threshold: f64,

    /// Seconds between observing an own auction and closing it
    pub auction_close_delay_secs: u64,

    /// Price argument passed with `generateEnergy`
    pub energy_price: u64,

    /// Accumulate power times the poll interval instead of raw power
    pub integrate_over_interval: bool,

    /// Upper bound on any single external call
    pub call_timeout_secs: u64,

    /// Where event cursors start
    pub event_start: EventStart,

    /// What happens to pending auction closes on shutdown
    pub pending_close_policy: PendingClosePolicy,

    /// Grace period for awaiting pending closes on shutdown
    pub shutdown_grace_secs: u64,

    /// Telemetry configuration
    pub telemetry: TelemetrySettings,

    /// Simulated sensor configuration
    pub sensor: SensorSettings,

    /// Report endpoint configuration
    pub report: ReportSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            account: None,
            account_passphrase: None,
            contract_address: None,
            abi_path: "./EnergyMarket.json".to_string(),
            poll_interval_secs: 5,
            energy_threshold: 50.0,
            auction_close_delay_secs: 10,
            energy_price: 10,
            integrate_over_interval: false,
            call_timeout_secs: 10,
            event_start: EventStart::Latest,
            pending_close_policy: PendingClosePolicy::Await,
            shutdown_grace_secs: 15,
            telemetry: TelemetrySettings::default(),
            sensor: SensorSettings::default(),
            report: ReportSettings::default(),
        }
    }
}

impl AgentConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the contract address
    pub fn with_contract_address(mut self, address: Address) -> Self {
        self.contract_address = Some(address);
        self
    }

    /// Set the signing account
    pub fn with_account(mut self, account: Address) -> Self {
        self.account = Some(account);
        self
    }

    /// Set the ABI document path
    pub fn with_abi_path(mut self, path: impl Into<String>) -> Self {
        self.abi_path = path.into();
        self
    }

    /// Set the energy threshold
    pub fn with_energy_threshold(mut self, threshold: f64) -> Self {
        self.energy_threshold = threshold;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Set the event start policy
    pub fn with_event_start(mut self, start: EventStart) -> Self {
        self.event_start = start;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn auction_close_delay(&self) -> Duration {
        Duration::from_secs(self.auction_close_delay_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Weight applied to each power sample when accumulating
    pub fn sample_weight(&self) -> f64 {
        if self.integrate_over_interval {
            self.poll_interval_secs as f64
        } else {
            1.0
        }
    }

    /// Check values that would make the agent misbehave
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(ProsumerError::InvalidConfig(
                "poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(ProsumerError::InvalidConfig(
                "call_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if !self.energy_threshold.is_finite() || self.energy_threshold < 0.0 {
            return Err(ProsumerError::InvalidConfig(format!(
                "energy_threshold must be a non-negative number, got {}",
                self.energy_threshold
            )));
        }
        if self.abi_path.trim().is_empty() {
            return Err(ProsumerError::InvalidConfig("abi_path is empty".to_string()));
        }
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(passphrase) = std::env::var(ENV_PASSPHRASE) {
            self.account_passphrase = Some(passphrase);
        }
        if let Ok(address) = std::env::var(ENV_CONTRACT_ADDRESS) {
            self.contract_address = Some(Address::parse(&address)?);
        }
        if let Ok(account) = std::env::var(ENV_ACCOUNT) {
            self.account = Some(Address::parse(&account)?);
        }
        Ok(())
    }

    /// Load configuration from a JSON or TOML file (by extension)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = if is_toml(path) {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    /// Save configuration to a JSON or TOML file (by extension)
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string_pretty(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

/// First block the event cursors query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStart {
    /// Only events emitted after the agent started
    Latest,
    /// Every event since genesis
    Earliest,
    /// Events from an explicit block onwards
    Block(u64),
}

/// Handling of auction closes still pending when the agent stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingClosePolicy {
    /// Wait up to the shutdown grace period, then detach the rest
    Await,
    /// Abort every pending close
    Cancel,
    /// Leave pending closes running in the background
    Detach,
}

/// Telemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Series (feed) name power samples are published to
    pub series: String,

    /// Adafruit IO credentials; log-only telemetry when unset
    pub adafruit: Option<AdafruitSettings>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            series: "solardata".to_string(),
            adafruit: None,
        }
    }
}

/// Adafruit IO connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdafruitSettings {
    pub username: String,
    pub key: String,
    #[serde(default = "default_adafruit_url")]
    pub base_url: String,
}

fn default_adafruit_url() -> String {
    "https://io.adafruit.com/api/v2".to_string()
}

/// Simulated sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Constant power reported by every sample; voltage times current when unset
    pub fixed_power: Option<f64>,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            fixed_power: Some(8.0),
        }
    }
}

/// Report endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}
