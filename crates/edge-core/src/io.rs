//! Hardware RPC seams
//!
//! The dongle exposes cryptography, power, radio and raw OBD issuance through
//! a single local endpoint. [`DeviceIo`] and [`Signer`] abstract that endpoint
//! so the pipeline can be exercised against an in-memory double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};
use crate::models::PowerStatus;

/// A raw OBD request as understood by the hardware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObdQuery {
    /// Signal name, used by the hardware for its own logging
    pub name: String,
    pub header: u32,
    pub mode: u32,
    pub pid: u32,
    /// Hardware protocol id
    pub protocol: String,
    /// Script formula the hardware evaluates; `None` returns raw frames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_control_id_pair: Option<String>,
    #[serde(default)]
    pub flow_control_clear: bool,
}

/// What the hardware answered to an [`ObdQuery`]
#[derive(Debug, Clone, PartialEq)]
pub enum ObdValue {
    /// Raw frames, one hex line per frame
    Hex(Vec<String>),
    /// Value evaluated by a script formula
    Number(f64),
    /// String evaluated by a script formula
    Text(String),
}

impl ObdValue {
    /// Raw hex lines, if this is a raw response
    pub fn hex_lines(&self) -> Option<&[String]> {
        match self {
            ObdValue::Hex(lines) => Some(lines),
            _ => None,
        }
    }
}

/// GNSS fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdop: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsat: Option<u32>,
}

/// Signs with the on-device key.
///
/// Signing shares the RPC channel with OBD issuance; implementations must
/// serialize both.
#[async_trait]
pub trait Signer: Send + Sync {
    /// 0x-prefixed Ethereum address of the device key
    async fn ethereum_address(&self) -> AgentResult<String>;

    /// Sign a 32-byte Keccak-256 prehash. Returns 65 bytes `r || s || v`.
    async fn sign_hash(&self, hash: [u8; 32]) -> AgentResult<Vec<u8>>;
}

/// Uniform request/response channel to the dongle hardware.
///
/// Implementations may leave default implementations for commands they do
/// not support.
#[async_trait]
pub trait DeviceIo: Send + Sync {
    // =========================================================================
    // Power and identity
    // =========================================================================

    /// Current electrical state and wake reason
    async fn power_status(&self) -> AgentResult<PowerStatus>;

    /// Unit serial
    async fn device_id(&self) -> AgentResult<String>;

    /// Hardware revision
    async fn hardware_revision(&self) -> AgentResult<String> {
        Err(AgentError::NotSupported("hardware_revision".to_string()))
    }

    /// Firmware/software version reported by the hardware
    async fn software_version(&self) -> AgentResult<String> {
        Err(AgentError::NotSupported("software_version".to_string()))
    }

    /// Push the sleep timer out by `seconds`
    async fn extend_sleep_timer(&self, seconds: u64) -> AgentResult<()> {
        let _ = seconds;
        Err(AgentError::NotSupported("extend_sleep_timer".to_string()))
    }

    // =========================================================================
    // OBD
    // =========================================================================

    /// Issue one OBD request. Never called concurrently with itself or signing.
    async fn obd_query(&self, query: &ObdQuery) -> AgentResult<ObdValue>;

    /// Let the hardware detect the bus protocol; returns the protocol id
    async fn auto_set_protocol(&self) -> AgentResult<String> {
        Err(AgentError::NotSupported("auto_set_protocol".to_string()))
    }

    /// Stored diagnostic trouble codes
    async fn read_dtcs(&self) -> AgentResult<Vec<String>> {
        Err(AgentError::NotSupported("read_dtcs".to_string()))
    }

    /// Clear stored diagnostic trouble codes
    async fn clear_dtcs(&self) -> AgentResult<()> {
        Err(AgentError::NotSupported("clear_dtcs".to_string()))
    }

    // =========================================================================
    // Radio and location
    // =========================================================================

    /// Modem signal strength document
    async fn modem_signal(&self) -> AgentResult<serde_json::Value> {
        Err(AgentError::NotSupported("modem_signal".to_string()))
    }

    /// Modem kind probe (e.g. "ec2x")
    async fn modem_kind(&self) -> AgentResult<String> {
        Err(AgentError::NotSupported("modem_kind".to_string()))
    }

    /// SIM IMSI
    async fn imsi(&self) -> AgentResult<String> {
        Err(AgentError::NotSupported("imsi".to_string()))
    }

    /// Modem IMEI
    async fn imei(&self) -> AgentResult<String> {
        Err(AgentError::NotSupported("imei".to_string()))
    }

    /// Wi-Fi status document
    async fn wifi_status(&self) -> AgentResult<serde_json::Value> {
        Err(AgentError::NotSupported("wifi_status".to_string()))
    }

    /// Join a Wi-Fi network
    async fn set_wifi(&self, ssid: &str, password: &str) -> AgentResult<()> {
        let _ = (ssid, password);
        Err(AgentError::NotSupported("set_wifi".to_string()))
    }

    /// Current GNSS fix, `None` while there is no fix
    async fn location(&self) -> AgentResult<Option<Location>> {
        Err(AgentError::NotSupported("location".to_string()))
    }
}
