//! Error types for the prosumer agent
//!
//! Errors are split by how the agent reacts to them: sensor, call, transaction and
//! timeout failures are recoverable within a cycle, initialization failures are fatal.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for prosumer operations
pub type Result<T> = std::result::Result<T, ProsumerError>;

/// Main error type for prosumer operations
#[derive(Error, Debug)]
pub enum ProsumerError {
    /// The sensor could not produce a sample
    #[error("Sensor error: {0}")]
    Sensor(String),

    /// A read-only contract call failed
    #[error("Gateway call `{method}` failed: {message}")]
    GatewayCall { method: String, message: String },

    /// A transaction could not be submitted
    #[error("Gateway transaction `{method}` failed: {message}")]
    GatewayTransaction { method: String, message: String },

    /// An external call exceeded its time bound
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Startup could not complete; the agent must not run
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("ABI error: {0}")]
    Abi(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProsumerError {
    /// Build a call error for `method`
    pub fn call(method: impl Into<String>, message: impl ToString) -> Self {
        Self::GatewayCall {
            method: method.into(),
            message: message.to_string(),
        }
    }

    /// Build a transaction error for `method`
    pub fn transaction(method: impl Into<String>, message: impl ToString) -> Self {
        Self::GatewayTransaction {
            method: method.into(),
            message: message.to_string(),
        }
    }

    /// Whether the error aborts the agent rather than a single cycle
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Initialization(_) | Self::InvalidConfig(_) | Self::Abi(_) | Self::InvalidAddress(_)
        )
    }
}

impl From<serde_json::Error> for ProsumerError {
    fn from(e: serde_json::Error) -> Self {
        ProsumerError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for ProsumerError {
    fn from(e: toml::de::Error) -> Self {
        ProsumerError::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for ProsumerError {
    fn from(e: toml::ser::Error) -> Self {
        ProsumerError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for ProsumerError {
    fn from(e: reqwest::Error) -> Self {
        ProsumerError::Telemetry(e.to_string())
    }
}
