//! Hardware RPC client
//!
//! Every command is a `POST /dongle/{serial}/execute_raw` with a
//! `{command, arg?, kwarg?}` body. OBD issuance and signing share this one
//! channel, so all calls are serialized behind a single async lock.

use std::time::Duration;

use async_trait::async_trait;
use edge_core::{AgentError, AgentResult, DeviceIo, Location, ObdQuery, ObdValue, PowerStatus, Signer};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{ClientError, Result};

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default connection timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Fixed command strings understood by the dongle
pub mod commands {
    pub const POWER_STATUS: &str = "power.status";
    pub const DEVICE_ID: &str = "config.device_id";
    pub const HARDWARE_VERSION: &str = "config.hw_version";
    pub const SOFTWARE_VERSION: &str = "config.sw_version";
    pub const SLEEP_TIMER_EXTEND: &str = "power.sleep_timer.extend";
    pub const ETH_ADDRESS: &str = "crypto.eth_address";
    pub const SIGN_HASH: &str = "crypto.sign_hash";
    pub const OBD_QUERY: &str = "obd.query";
    pub const AUTO_SET_PROTOCOL: &str = "obd.protocol.auto";
    pub const DTC_READ: &str = "obd.dtc.read";
    pub const DTC_CLEAR: &str = "obd.dtc.clear";
    pub const MODEM_SIGNAL: &str = "modem.signal_quality";
    pub const MODEM_KIND: &str = "modem.kind";
    pub const IMSI: &str = "modem.imsi";
    pub const IMEI: &str = "modem.imei";
    pub const WIFI_STATUS: &str = "wifi.status";
    pub const WIFI_SET: &str = "wifi.set";
    pub const LOCATION: &str = "gnss.location";
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arg: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kwarg: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(rename = "_stamp", default)]
    stamp: Option<Value>,
}

/// Dongle hardware client implementing [`DeviceIo`] and [`Signer`]
#[derive(Debug)]
pub struct DeviceIoClient {
    client: Client,
    execute_url: Url,
    channel: Mutex<()>,
}

impl DeviceIoClient {
    /// Create a client for the dongle with `serial`
    ///
    /// # Arguments
    /// * `base_url` - Local RPC endpoint (e.g., "http://localhost:9000")
    pub fn new(base_url: &str, serial: &str) -> Result<Self> {
        Self::with_config(base_url, serial, DEFAULT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_config(base_url: &str, serial: &str, timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()?;

        let execute_url = Url::parse(base_url)?.join(&format!("/dongle/{}/execute_raw", serial))?;

        Ok(Self {
            client,
            execute_url,
            channel: Mutex::new(()),
        })
    }

    /// Run one command and return its `value` (or `data`) field
    #[instrument(skip(self, arg, kwarg), level = "debug")]
    pub async fn execute(&self, command: &str, arg: Option<Value>, kwarg: Option<Value>) -> Result<Value> {
        let _channel = self.channel.lock().await;

        let body = RpcRequest { command, arg, kwarg };
        let response = self.client.post(self.execute_url.clone()).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| format!("HTTP {}", status));
            return Err(match status {
                StatusCode::NOT_FOUND => ClientError::NotFound(message),
                StatusCode::BAD_REQUEST => ClientError::BadRequest(message),
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ClientError::Timeout,
                _ => ClientError::server_error(status.as_u16(), message),
            });
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(e.to_string()))?;
        debug!(command, stamp = ?parsed.stamp, "RPC command complete");
        Ok(parsed.value.or(parsed.data).unwrap_or(Value::Null))
    }

    async fn execute_string(&self, command: &str) -> AgentResult<String> {
        let value = self.execute(command, None, None).await?;
        value_to_string(value)
    }
}

fn value_to_string(value: Value) -> AgentResult<String> {
    match value {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(AgentError::Decode(format!("expected string, got {}", other))),
    }
}

/// Interpret an OBD answer. Raw answers are hex lines; script answers are
/// already evaluated by the hardware.
pub fn parse_obd_value(value: Value, evaluated: bool) -> AgentResult<ObdValue> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(ObdValue::Number)
            .ok_or_else(|| AgentError::Decode(format!("non-finite number {}", n))),
        Value::String(s) if evaluated => match s.trim().parse::<f64>() {
            Ok(n) => Ok(ObdValue::Number(n)),
            Err(_) => Ok(ObdValue::Text(s)),
        },
        Value::String(s) => Ok(ObdValue::Hex(
            s.lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
        )),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.trim().to_string()),
                other => Err(AgentError::Decode(format!("expected hex line, got {}", other))),
            })
            .collect::<AgentResult<Vec<_>>>()
            .map(ObdValue::Hex),
        Value::Null => Err(AgentError::Decode("empty OBD response".to_string())),
        other => Err(AgentError::Decode(format!("unexpected OBD response {}", other))),
    }
}

#[async_trait]
impl DeviceIo for DeviceIoClient {
    async fn power_status(&self) -> AgentResult<PowerStatus> {
        let value = self.execute(commands::POWER_STATUS, None, None).await?;
        serde_json::from_value(value).map_err(|e| AgentError::Decode(e.to_string()))
    }

    async fn device_id(&self) -> AgentResult<String> {
        self.execute_string(commands::DEVICE_ID).await
    }

    async fn hardware_revision(&self) -> AgentResult<String> {
        self.execute_string(commands::HARDWARE_VERSION).await
    }

    async fn software_version(&self) -> AgentResult<String> {
        self.execute_string(commands::SOFTWARE_VERSION).await
    }

    async fn extend_sleep_timer(&self, seconds: u64) -> AgentResult<()> {
        self.execute(commands::SLEEP_TIMER_EXTEND, Some(json!([seconds])), None)
            .await?;
        Ok(())
    }

    async fn obd_query(&self, query: &ObdQuery) -> AgentResult<ObdValue> {
        let kwarg = serde_json::to_value(query).map_err(|e| AgentError::Internal(e.to_string()))?;
        let value = self.execute(commands::OBD_QUERY, None, Some(kwarg)).await?;
        parse_obd_value(value, query.formula.is_some())
    }

    async fn auto_set_protocol(&self) -> AgentResult<String> {
        self.execute_string(commands::AUTO_SET_PROTOCOL).await
    }

    async fn read_dtcs(&self) -> AgentResult<Vec<String>> {
        let value = self.execute(commands::DTC_READ, None, None).await?;
        match value {
            Value::Null => Ok(Vec::new()),
            Value::String(s) => Ok(s
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|code| !code.is_empty())
                .map(str::to_string)
                .collect()),
            other => serde_json::from_value(other).map_err(|e| AgentError::Decode(e.to_string())),
        }
    }

    async fn clear_dtcs(&self) -> AgentResult<()> {
        self.execute(commands::DTC_CLEAR, None, None).await?;
        Ok(())
    }

    async fn modem_signal(&self) -> AgentResult<Value> {
        Ok(self.execute(commands::MODEM_SIGNAL, None, None).await?)
    }

    async fn modem_kind(&self) -> AgentResult<String> {
        self.execute_string(commands::MODEM_KIND).await
    }

    async fn imsi(&self) -> AgentResult<String> {
        self.execute_string(commands::IMSI).await
    }

    async fn imei(&self) -> AgentResult<String> {
        self.execute_string(commands::IMEI).await
    }

    async fn wifi_status(&self) -> AgentResult<Value> {
        Ok(self.execute(commands::WIFI_STATUS, None, None).await?)
    }

    async fn set_wifi(&self, ssid: &str, password: &str) -> AgentResult<()> {
        self.execute(
            commands::WIFI_SET,
            None,
            Some(json!({ "ssid": ssid, "password": password })),
        )
        .await?;
        Ok(())
    }

    async fn location(&self) -> AgentResult<Option<Location>> {
        let value = self.execute(commands::LOCATION, None, None).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| AgentError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Signer for DeviceIoClient {
    async fn ethereum_address(&self) -> AgentResult<String> {
        let address = self.execute_string(commands::ETH_ADDRESS).await?;
        if address.starts_with("0x") {
            Ok(address)
        } else {
            Ok(format!("0x{}", address))
        }
    }

    async fn sign_hash(&self, hash: [u8; 32]) -> AgentResult<Vec<u8>> {
        let value = self
            .execute(commands::SIGN_HASH, Some(json!([hex::encode(hash)])), None)
            .await?;
        let signature = value_to_string(value)?;
        let bytes = hex::decode(signature.trim_start_matches("0x"))
            .map_err(|e| AgentError::Decode(format!("signature is not hex: {}", e)))?;
        if bytes.len() != 65 {
            return Err(AgentError::Decode(format!(
                "signature must be 65 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}
