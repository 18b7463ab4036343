//! Runtime tuning served by the device-settings endpoint

use serde::{Deserialize, Serialize};

/// Device settings; every field falls back to a built-in default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Below this voltage the device shuts itself down
    #[serde(default = "default_safety_cut_out_voltage")]
    pub safety_cut_out_voltage: f64,
    #[serde(default = "default_event_driven_interval")]
    pub sleep_timer_event_driven_interval_secs: u64,
    #[serde(default = "default_inactivity_after_sleep")]
    pub sleep_timer_inactivity_after_sleep_secs: u64,
    #[serde(default = "default_inactivity_fallback")]
    pub sleep_timer_inactivity_fallback_interval_secs: u64,
    #[serde(default = "default_obd_voltage")]
    pub wake_trigger_voltage_threshold: f64,
    /// OBD requests are only issued at or above this battery voltage
    #[serde(default = "default_obd_voltage", alias = "min_voltage_for_obd_loggers")]
    pub min_voltage_obd_loggers: f64,
    #[serde(default = "default_location_frequency")]
    pub location_frequency_secs: u64,
    #[serde(default = "default_network_interval")]
    pub network_interval_secs: u64,
    /// Minimum spacing between samples of one passively decoded signal
    #[serde(default = "default_passive_interval")]
    pub passive_sample_interval_secs: u64,
}

fn default_safety_cut_out_voltage() -> f64 {
    12.2
}

fn default_event_driven_interval() -> u64 {
    3600
}

fn default_inactivity_after_sleep() -> u64 {
    14400
}

fn default_inactivity_fallback() -> u64 {
    86400
}

fn default_obd_voltage() -> f64 {
    13.2
}

fn default_location_frequency() -> u64 {
    20
}

fn default_network_interval() -> u64 {
    60
}

fn default_passive_interval() -> u64 {
    1
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            safety_cut_out_voltage: default_safety_cut_out_voltage(),
            sleep_timer_event_driven_interval_secs: default_event_driven_interval(),
            sleep_timer_inactivity_after_sleep_secs: default_inactivity_after_sleep(),
            sleep_timer_inactivity_fallback_interval_secs: default_inactivity_fallback(),
            wake_trigger_voltage_threshold: default_obd_voltage(),
            min_voltage_obd_loggers: default_obd_voltage(),
            location_frequency_secs: default_location_frequency(),
            network_interval_secs: default_network_interval(),
            passive_sample_interval_secs: default_passive_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let settings: DeviceSettings =
            serde_json::from_str(r#"{"min_voltage_for_obd_loggers": 12.9}"#).unwrap();

        assert_eq!(settings.min_voltage_obd_loggers, 12.9);
        assert_eq!(settings.location_frequency_secs, 20);
        assert_eq!(settings.safety_cut_out_voltage, 12.2);
    }
}
