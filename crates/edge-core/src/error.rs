//! Common error types for the edge agent

use thiserror::Error;

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur anywhere in the acquisition pipeline
#[derive(Debug, Error)]
pub enum AgentError {
    /// Transport/communication error (hardware RPC 5xx, network, MQTT)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Hardware RPC answered with an error status
    #[error("Device I/O error {status}: {message}")]
    DeviceIo { status: u16, message: String },

    /// Input failed validation (VIN, formula, short response)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Response could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Resource unavailable (CAN socket, file system)
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    /// Remote resource does not exist (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote rejected the request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Operation not supported by this implementation
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Timeout waiting for a response
    #[error("Operation timed out")]
    Timeout,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by loops to decide how to react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Might succeed later; retry where the call site can afford it
    Transient,
    /// Bad input; drop the sample and count the failure
    InvalidInput,
    /// Local resource missing; log and continue (fatal at boot)
    Unavailable,
    /// Remote said no; never retry, fall back to cached values
    Terminal,
}

impl AgentError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::Transport(_) | AgentError::Timeout => ErrorClass::Transient,
            AgentError::DeviceIo { status, .. } if *status >= 500 => ErrorClass::Transient,
            AgentError::DeviceIo { .. } => ErrorClass::Terminal,
            AgentError::InvalidInput(_) | AgentError::Decode(_) => ErrorClass::InvalidInput,
            AgentError::Unavailable(_) | AgentError::Internal(_) => ErrorClass::Unavailable,
            AgentError::NotFound(_) | AgentError::BadRequest(_) | AgentError::NotSupported(_) => {
                ErrorClass::Terminal
            }
        }
    }

    /// Whether retrying this call can never help (400/404 and friends)
    pub fn is_terminal(&self) -> bool {
        self.class() == ErrorClass::Terminal
    }
}
