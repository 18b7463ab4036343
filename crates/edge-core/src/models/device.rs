//! Device identity and power models

use serde::{Deserialize, Serialize};

/// Identity of the physical unit, built once at boot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    /// Unit serial (UUID)
    pub serial: String,
    /// Ethereum address derived from the on-device key (0x-prefixed hex)
    pub ethereum_address: String,
    /// Hardware revision
    pub hardware_revision: String,
    /// Agent software version
    pub software_version: String,
    /// Modem IMEI, when a modem is fitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imei: Option<String>,
}

/// What woke the device up most recently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeTrigger {
    VoltChange,
    VoltLevel,
    Stn,
    Rtc,
    Acc,
    Modem,
    #[default]
    #[serde(other)]
    Unknown,
}

impl WakeTrigger {
    /// Wake reasons that imply the vehicle itself is powered
    pub fn is_vehicle_wake(&self) -> bool {
        matches!(
            self,
            WakeTrigger::VoltChange | WakeTrigger::VoltLevel | WakeTrigger::Stn
        )
    }
}

/// Power status as reported by the hardware RPC
///
/// Mirrors the nested document the power manager returns:
/// `{"spm": {"battery": {"voltage": 13.4}, "last_trigger": {"up": "volt_change"}}, "rpi": {"uptime": {"seconds": 42}}}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PowerStatus {
    #[serde(default)]
    pub spm: SpmStatus,
    #[serde(default)]
    pub rpi: RpiStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpmStatus {
    #[serde(default)]
    pub battery: BatteryStatus,
    #[serde(default)]
    pub last_trigger: LastTrigger,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatteryStatus {
    #[serde(default)]
    pub voltage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastTrigger {
    #[serde(default)]
    pub up: WakeTrigger,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpiStatus {
    #[serde(default)]
    pub uptime: Uptime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Uptime {
    #[serde(default)]
    pub seconds: u64,
}

impl PowerStatus {
    /// Build a status from its three interesting values
    pub fn new(battery_voltage: f64, trigger: WakeTrigger, uptime_secs: u64) -> Self {
        Self {
            spm: SpmStatus {
                battery: BatteryStatus {
                    voltage: battery_voltage,
                },
                last_trigger: LastTrigger { up: trigger },
            },
            rpi: RpiStatus {
                uptime: Uptime {
                    seconds: uptime_secs,
                },
            },
        }
    }

    pub fn battery_voltage(&self) -> f64 {
        self.spm.battery.voltage
    }

    pub fn wake_trigger(&self) -> WakeTrigger {
        self.spm.last_trigger.up
    }

    pub fn uptime_secs(&self) -> u64 {
        self.rpi.uptime.seconds
    }
}
