//! Error types for the node

use thiserror::Error;

/// Node error type
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Invalid bind address: {0}")]
    InvalidBindAddress(String),

    #[error("Agent error: {0}")]
    Agent(#[from] prosumer_core::ProsumerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server error: {0}")]
    Server(String),
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
