//! Error types for client operations

use edge_core::AgentError;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur during client operations
#[derive(Error, Debug)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Remote resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote rejected the request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Server returned an error response
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Service answered but refused the operation (GraphQL errors, auth denial)
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Timeout
    #[error("Request timed out")]
    Timeout,
}

impl ClientError {
    /// Create a server error from status code and message
    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status,
            message: message.into(),
        }
    }

    /// Errors that must never be retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientError::NotFound(_) | ClientError::BadRequest(_))
    }
}

impl From<ClientError> for AgentError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::NotFound(msg) => AgentError::NotFound(msg),
            ClientError::BadRequest(msg) => AgentError::BadRequest(msg),
            ClientError::ServerError { status, message } => AgentError::DeviceIo { status, message },
            ClientError::Timeout => AgentError::Timeout,
            ClientError::HttpError(e) if e.is_timeout() => AgentError::Timeout,
            ClientError::HttpError(e) => AgentError::Transport(e.to_string()),
            ClientError::ParseError(msg) => AgentError::Decode(msg),
            other => AgentError::Internal(other.to_string()),
        }
    }
}
