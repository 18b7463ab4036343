//! Error types for the pipeline stages

use edge_client::ClientError;
use edge_core::AgentError;
use thiserror::Error;

/// Template store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but does not hold the expected document
    #[error("Corrupt state file {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize {kind}: {source}")]
    Serialize {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Data sender failures
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("MQTT publish failed: {0}")]
    Transport(String),

    #[error("Publish timed out")]
    Timeout,

    #[error("No topic configured for {0}")]
    NoTopic(String),

    #[error("Outbox error: {0}")]
    Outbox(#[from] StoreError),
}

/// Fingerprint runner failures
#[derive(Error, Debug)]
pub enum FingerprintError {
    /// Power never reached a safe state
    #[error("Power not ready after {attempts} polls (last voltage {voltage:.2} V)")]
    PowerNotReady { attempts: u32, voltage: f64 },

    /// Every query, including the passive scan, came back empty
    #[error("No VIN found ({failed_attempts} failed boots)")]
    NoVin { failed_attempts: u32 },

    /// Too many failed boots on this fingerprint version
    #[error("Fingerprinting disabled after {failed_attempts} failed boots")]
    GaveUp { failed_attempts: u32 },

    /// Response lines did not yield a valid VIN
    #[error("Invalid VIN response: {0}")]
    Extract(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to publish fingerprint: {0}")]
    Publish(AgentError),
}

impl FingerprintError {
    /// Holds for every later boot on this fingerprint version
    pub fn is_permanent(&self) -> bool {
        matches!(self, FingerprintError::GaveUp { .. })
    }
}

/// Template resolver failures
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Configuration service error: {0}")]
    Api(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No template available for {0}")]
    NoTemplate(String),
}

/// Configuration file failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl From<SendError> for AgentError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Timeout => AgentError::Timeout,
            SendError::Transport(msg) => AgentError::Transport(msg),
            SendError::Outbox(e) => AgentError::Unavailable(e.to_string()),
            other => AgentError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        AgentError::Unavailable(e.to_string())
    }
}
