//! Shared agent state read by the BLE façade
//!
//! The pipeline writes here; characteristic handlers only ever read through
//! the accessors, which substitute deterministic sentinels for missing data.

use parking_lot::RwLock;
use tracing::warn;

use crate::io::DeviceIo;
use crate::models::{VinResponse, SENTINEL_VIN};

/// DTC report when no codes are stored
pub const DTC_NONE: &str = "0";
/// DTC report when the last read failed
pub const DTC_ERROR: &str = "1";

#[derive(Debug, Default)]
struct Snapshot {
    vin: Option<VinResponse>,
    dtcs: Option<Result<Vec<String>, String>>,
    last_signature: Option<String>,
}

/// Last-known identity and diagnostics
#[derive(Debug, Default)]
pub struct AgentState {
    inner: RwLock<Snapshot>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_vin(&self, response: VinResponse) {
        self.inner.write().vin = Some(response);
    }

    pub fn vin(&self) -> Option<VinResponse> {
        self.inner.read().vin.clone()
    }

    /// VIN, or all zeros while the vehicle is unidentified
    pub fn vin_or_sentinel(&self) -> String {
        self.inner
            .read()
            .vin
            .as_ref()
            .map(|r| r.vin.to_string())
            .unwrap_or_else(|| SENTINEL_VIN.to_string())
    }

    /// Wire protocol of the last fingerprint, empty while unidentified
    pub fn protocol(&self) -> String {
        self.inner
            .read()
            .vin
            .as_ref()
            .map(|r| r.protocol.clone())
            .unwrap_or_default()
    }

    pub fn set_last_signature(&self, signature: String) {
        self.inner.write().last_signature = Some(signature);
    }

    pub fn last_signature(&self) -> Option<String> {
        self.inner.read().last_signature.clone()
    }

    pub fn set_dtcs(&self, result: Result<Vec<String>, String>) {
        self.inner.write().dtcs = Some(result);
    }

    /// Comma-separated codes, [`DTC_NONE`] when clear, [`DTC_ERROR`] on failure
    pub fn dtc_report(&self) -> String {
        match &self.inner.read().dtcs {
            Some(Ok(codes)) if !codes.is_empty() => codes.join(","),
            Some(Err(_)) => DTC_ERROR.to_string(),
            _ => DTC_NONE.to_string(),
        }
    }

    /// Read DTCs through the hardware and remember the outcome
    pub async fn refresh_dtcs(&self, device: &dyn DeviceIo) -> String {
        let result = device.read_dtcs().await.map_err(|e| {
            warn!(error = %e, "Failed to read DTCs");
            e.to_string()
        });
        self.set_dtcs(result);
        self.dtc_report()
    }

    /// Clear DTCs through the hardware, then report what is left
    pub async fn clear_dtcs(&self, device: &dyn DeviceIo) -> String {
        if let Err(e) = device.clear_dtcs().await {
            warn!(error = %e, "Failed to clear DTCs");
            self.set_dtcs(Err(e.to_string()));
            return self.dtc_report();
        }
        self.refresh_dtcs(device).await
    }
}
