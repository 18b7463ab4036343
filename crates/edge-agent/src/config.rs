//! Agent configuration (TOML)
//!
//! Every field has a serde default so a partial file (or none at all) gives
//! a runnable agent pointed at a local dongle and broker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use edge_can::CanConfig;
use edge_client::AuthSettings;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fingerprint::FingerprintConfig;
use crate::scheduler::SchedulerConfig;
use crate::sender::{MqttSettings, TlsFiles, Topics};

/// Complete agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub services: ServicesSection,
    #[serde(default)]
    pub can: CanConfig,
    #[serde(default)]
    pub agent: AgentSection,
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn software_version(&self) -> String {
        self.device
            .software_version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    /// Broker settings; `certificate` is where the issued client certificate lives
    pub fn mqtt_settings(&self, certificate: PathBuf) -> MqttSettings {
        let tls = self.mqtt.tls.then(|| TlsFiles {
            ca: self.mqtt.ca_path.clone(),
            cert: self.mqtt.cert_path.clone().unwrap_or(certificate),
            key: self.mqtt.key_path.clone(),
        });
        MqttSettings {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            client_id: self.mqtt.client_id.clone().unwrap_or_else(|| self.device.serial.clone()),
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            qos: self.mqtt.qos,
            publish_timeout: Duration::from_secs(self.mqtt.publish_timeout_secs),
            reconnect_delay: Duration::from_secs(self.mqtt.reconnect_delay_secs),
            tls,
        }
    }

    /// Directory holding the template store
    pub fn template_dir(&self) -> PathBuf {
        self.agent.state_dir.join("templates")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        if self.mqtt.outbox_dir.is_absolute() {
            self.mqtt.outbox_dir.clone()
        } else {
            self.agent.state_dir.join(&self.mqtt.outbox_dir)
        }
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            auth_host: self.services.auth_host.clone(),
            ca_host: self.services.ca_host.clone(),
            client_id: self.services.client_id.clone(),
            domain: self.services.domain.clone(),
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(self.agent.scheduler_tick_ms),
            request_timeout: Duration::from_millis(self.agent.request_timeout_ms),
            quarantine_threshold: self.agent.quarantine_threshold,
        }
    }

    /// Fingerprint tuning. The power gate is local and independent of the
    /// remotely tuned OBD logger threshold.
    pub fn fingerprint(&self) -> FingerprintConfig {
        FingerprintConfig {
            power_poll_interval: Duration::from_secs(self.agent.power_poll_interval_secs),
            max_power_polls: self.agent.max_power_polls,
            min_voltage: self.agent.fingerprint_min_voltage,
            max_failed_attempts: self.agent.max_failed_attempts,
            query_timeout: Duration::from_secs(self.agent.vin_query_timeout_secs),
        }
    }
}

// =============================================================================
// [device]
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSection {
    /// Hardware RPC base URL
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Dongle serial (unit id)
    #[serde(default)]
    pub serial: String,
    /// Reported instead of the package version when set
    #[serde(default)]
    pub software_version: Option<String>,
}

fn default_rpc_url() -> String {
    "http://192.168.4.1:9000".to_string()
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            serial: String::new(),
            software_version: None,
        }
    }
}

// =============================================================================
// [mqtt]
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Defaults to the device serial
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,
    /// Defaults to the certificate issued into the state directory
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// Outbox location; relative paths resolve under the state directory
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,
    #[serde(default = "default_outbox_max_keys")]
    pub outbox_max_keys: usize,
    #[serde(default)]
    pub topics: Topics,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_publish_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_ca_path() -> PathBuf {
    PathBuf::from("/etc/edged/ca.pem")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/edged/client.key")
}

fn default_outbox_dir() -> PathBuf {
    PathBuf::from("outbox")
}

fn default_outbox_max_keys() -> usize {
    1000
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: None,
            qos: 0,
            keep_alive_secs: default_keep_alive(),
            publish_timeout_secs: default_publish_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            tls: false,
            ca_path: default_ca_path(),
            cert_path: None,
            key_path: default_key_path(),
            outbox_dir: default_outbox_dir(),
            outbox_max_keys: default_outbox_max_keys(),
            topics: Topics::default(),
        }
    }
}

// =============================================================================
// [services]
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesSection {
    /// Configuration API (template URLs, PIDs, settings, DBC)
    #[serde(default = "default_vehicle_host")]
    pub vehicle_host: String,
    /// Identity GraphQL API; vehicle enrichment is skipped when empty
    #[serde(default)]
    pub identity_host: String,
    #[serde(default)]
    pub auth_host: String,
    #[serde(default)]
    pub ca_host: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub domain: String,
    /// CSR submitted when no client certificate is stored
    #[serde(default)]
    pub csr_path: Option<PathBuf>,
    /// CloudEvents `source` attribute
    #[serde(default = "default_event_source")]
    pub event_source: String,
}

fn default_vehicle_host() -> String {
    "http://localhost:8080".to_string()
}

fn default_client_id() -> String {
    "edge-agent".to_string()
}

fn default_event_source() -> String {
    "edge/agent".to_string()
}

impl Default for ServicesSection {
    fn default() -> Self {
        Self {
            vehicle_host: default_vehicle_host(),
            identity_host: String::new(),
            auth_host: String::new(),
            ca_host: String::new(),
            client_id: default_client_id(),
            domain: String::new(),
            csr_path: None,
            event_source: default_event_source(),
        }
    }
}

// =============================================================================
// [agent]
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Use the CAN interface for passive VIN scans and signal listening
    #[serde(default = "default_true")]
    pub passive_can: bool,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_scheduler_tick")]
    pub scheduler_tick_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: u32,
    #[serde(default = "default_template_refresh")]
    pub template_refresh_secs: u64,
    #[serde(default = "default_dump_check")]
    pub dump_check_secs: u64,
    /// Overrides `DeviceSettings::location_frequency_secs`
    #[serde(default)]
    pub location_interval_secs: Option<u64>,
    /// Overrides `DeviceSettings::network_interval_secs`
    #[serde(default)]
    pub network_interval_secs: Option<u64>,
    #[serde(default = "default_power_poll_interval")]
    pub power_poll_interval_secs: u64,
    #[serde(default = "default_max_power_polls")]
    pub max_power_polls: u32,
    /// Battery voltage the fingerprint waits for
    #[serde(default = "default_fingerprint_min_voltage")]
    pub fingerprint_min_voltage: f64,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    #[serde(default = "default_vin_query_timeout")]
    pub vin_query_timeout_secs: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/edged")
}

fn default_true() -> bool {
    true
}

fn default_flush_interval() -> u64 {
    30
}

fn default_scheduler_tick() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    2000
}

fn default_quarantine_threshold() -> u32 {
    10
}

fn default_template_refresh() -> u64 {
    3600
}

fn default_dump_check() -> u64 {
    30
}

fn default_power_poll_interval() -> u64 {
    2
}

fn default_max_power_polls() -> u32 {
    100
}

fn default_fingerprint_min_voltage() -> f64 {
    13.2
}

fn default_max_failed_attempts() -> u32 {
    5
}

fn default_vin_query_timeout() -> u64 {
    10
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            passive_can: true,
            flush_interval_secs: default_flush_interval(),
            scheduler_tick_ms: default_scheduler_tick(),
            request_timeout_ms: default_request_timeout(),
            quarantine_threshold: default_quarantine_threshold(),
            template_refresh_secs: default_template_refresh(),
            dump_check_secs: default_dump_check(),
            location_interval_secs: None,
            network_interval_secs: None,
            power_poll_interval_secs: default_power_poll_interval(),
            max_power_polls: default_max_power_polls(),
            fingerprint_min_voltage: default_fingerprint_min_voltage(),
            max_failed_attempts: default_max_failed_attempts(),
            vin_query_timeout_secs: default_vin_query_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: AgentConfig = toml::from_str("").unwrap();
        assert_eq!(config.device.rpc_url, "http://192.168.4.1:9000");
        assert_eq!(config.mqtt.topics, Topics::default());
        assert_eq!(config.can.interface, "can0");
        assert_eq!(config.agent.quarantine_threshold, 10);
        assert!(config.agent.passive_can);
        assert_eq!(config.fingerprint().min_voltage, 13.2);
    }

    #[test]
    fn test_fingerprint_gate_is_local() {
        let config: AgentConfig = toml::from_str("[agent]\nfingerprint_min_voltage = 12.6\n").unwrap();
        let fingerprint = config.fingerprint();
        assert_eq!(fingerprint.min_voltage, 12.6);
        assert_eq!(fingerprint.max_failed_attempts, 5);
    }

    #[test]
    fn test_partial_sections() {
        let config: AgentConfig = toml::from_str(
            r#"
            [device]
            serial = "b4c2a1f0"

            [mqtt]
            host = "mqtt.example.com"
            port = 8883
            tls = true
            qos = 1

            [mqtt.topics]
            status = "fleet/status"

            [can]
            interface = "vcan0"

            [agent]
            state_dir = "/tmp/edged"
            location_interval_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.topics.status, "fleet/status");
        assert_eq!(config.mqtt.topics.logs, "devices/logs");
        assert_eq!(config.can.interface, "vcan0");
        assert_eq!(config.agent.location_interval_secs, Some(5));
        assert_eq!(config.outbox_dir(), PathBuf::from("/tmp/edged/outbox"));

        let mqtt = config.mqtt_settings(PathBuf::from("/tmp/edged/templates/client.pem"));
        assert_eq!(mqtt.client_id, "b4c2a1f0");
        assert_eq!(mqtt.port, 8883);
        let tls = mqtt.tls.unwrap();
        assert_eq!(tls.cert, PathBuf::from("/tmp/edged/templates/client.pem"));
        assert_eq!(tls.key, PathBuf::from("/etc/edged/client.key"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edged.toml");
        std::fs::write(&path, "[agent]\nflush_interval_secs = 5\n").unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.agent.flush_interval_secs, 5);
        assert_eq!(config.scheduler().tick, Duration::from_secs(1));
        assert!(matches!(
            AgentConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));

        std::fs::write(&path, "[agent\n").unwrap();
        assert!(matches!(AgentConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
