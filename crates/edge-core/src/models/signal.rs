//! Decoded signal samples

use serde::{Deserialize, Serialize};

/// A decoded value: numeric, or a string the hardware already evaluated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Number(f64),
    Text(String),
}

impl SignalValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Number(v) => Some(*v),
            SignalValue::Text(_) => None,
        }
    }
}

impl From<f64> for SignalValue {
    fn from(v: f64) -> Self {
        SignalValue::Number(v)
    }
}

impl From<String> for SignalValue {
    fn from(s: String) -> Self {
        SignalValue::Text(s)
    }
}

/// One decoded measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    pub name: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub value: SignalValue,
}

impl SignalSample {
    pub fn new(name: impl Into<String>, timestamp: i64, value: impl Into<SignalValue>) -> Self {
        Self {
            name: name.into(),
            timestamp,
            value: value.into(),
        }
    }
}
