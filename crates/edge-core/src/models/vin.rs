//! VIN models

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Length of every valid VIN
pub const VIN_LENGTH: usize = 17;

/// Reported to paired clients while no VIN is known
pub const SENTINEL_VIN: &str = "00000000000000000";

/// A validated 17-character vehicle identification number
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Vin(String);

impl Vin {
    /// Validate and wrap a VIN
    pub fn parse(s: &str) -> Result<Self, AgentError> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(AgentError::InvalidInput(format!("invalid VIN: {:?}", s)))
        }
    }

    /// Exactly 17 ASCII alphanumeric characters
    pub fn is_valid(s: &str) -> bool {
        s.len() == VIN_LENGTH && s.bytes().all(|b| b.is_ascii_alphanumeric())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Vin {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Vin> for String {
    fn from(vin: Vin) -> Self {
        vin.0
    }
}

impl fmt::Display for Vin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named way of asking the vehicle for its VIN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VinQuery {
    /// Unique name, persisted once a query succeeds
    pub name: &'static str,
    /// Hardware protocol id (e.g. "6" = ISO 15765-4 11-bit 500k, "7" = 29-bit 500k)
    pub protocol: &'static str,
    /// Request header (CAN id)
    pub header: u32,
    /// OBD/UDS service
    pub mode: u32,
    /// Parameter id
    pub pid: u32,
    /// Explicit response header, when it cannot be derived from `header`
    pub response_header: Option<u32>,
}

impl VinQuery {
    /// Whether this is the passive CAN scan sentinel
    pub fn is_passive(&self) -> bool {
        self.protocol.is_empty()
    }
}

/// Outcome of a successful fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VinResponse {
    pub vin: Vin,
    pub protocol: String,
    pub query_name: String,
}
