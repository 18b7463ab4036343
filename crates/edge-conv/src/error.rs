//! Error types for signal conversion

use thiserror::Error;

/// Errors that can occur while parsing formulas or decoding signals
#[derive(Debug, Error)]
pub enum ConvError {
    /// Formula text does not follow the signal grammar
    #[error("invalid formula '{formula}': {reason}")]
    InvalidFormula { formula: String, reason: String },

    /// Response is not a valid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// PID not present in the response after the framing window
    #[error("pid '{pid}' not found in response '{response}'")]
    PidNotFound { pid: String, response: String },

    /// Data too short for the signal
    #[error("data too short: expected {expected} bytes, got {actual}")]
    DataTooShort { expected: usize, actual: usize },

    /// Decoded value outside the declared range
    #[error("value out of range: {value} not in [{min}, {max}]")]
    ValueOutOfRange { value: f64, min: f64, max: f64 },

    /// Signal database text could not be parsed
    #[error("signal database line {line}: {reason}")]
    InvalidDatabase { line: usize, reason: String },
}

impl ConvError {
    pub(crate) fn formula(formula: &str, reason: impl Into<String>) -> Self {
        ConvError::InvalidFormula {
            formula: formula.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for conversion operations
pub type ConvResult<T> = Result<T, ConvError>;
