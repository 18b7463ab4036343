//! CAN transport errors

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

impl From<TransportError> for edge_core::AgentError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::InvalidConfig(msg) => edge_core::AgentError::InvalidInput(msg),
            TransportError::Unsupported(msg) => edge_core::AgentError::NotSupported(msg),
            other => edge_core::AgentError::Transport(other.to_string()),
        }
    }
}
