//! Fingerprint runner
//!
//! Boot-time state machine that takes the agent from "just booted" to
//! "identified vehicle, safe to poll":
//!
//! ```text
//! Idle -> WaitingForPower -> QueryingVin -> (PassiveScan) -> Publishing -> Done
//!               |                 |               |
//!               +-----------------+---------------+--> Failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use edge_can::{scan_passive_vin, ResolvedLayout, ScanLimits, SharedFrameSource};
use edge_core::{
    AgentError, AgentState, Clock, DeviceIo, EventKind, FingerprintPayload, ObdValue, OutboundEvent,
    PowerStatus, Publisher, VinQuery, VinResponse,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::error::FingerprintError;
use crate::log_hook::error_event;
use crate::store::{TemplateStore, VinSettings};
use crate::vin::{extract_vin, ordered_queries, vin_obd_query, FINGERPRINT_VERSION};

/// Protocol recorded for VINs recovered from broadcast traffic
pub const PASSIVE_PROTOCOL: &str = "passive";

/// Where the runner currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintPhase {
    Idle,
    WaitingForPower,
    QueryingVin,
    PassiveScan,
    Publishing,
    Done,
    Failed,
}

/// Tuning for the runner
#[derive(Debug, Clone)]
pub struct FingerprintConfig {
    pub power_poll_interval: Duration,
    pub max_power_polls: u32,
    /// Battery voltage needed before any query is issued
    pub min_voltage: f64,
    /// Failed boots after which fingerprinting stops for this table version
    pub max_failed_attempts: u32,
    pub query_timeout: Duration,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            power_poll_interval: Duration::from_secs(2),
            max_power_polls: 100,
            min_voltage: 13.2,
            max_failed_attempts: 5,
            query_timeout: Duration::from_secs(10),
        }
    }
}

/// What the rest of the boot does with the fingerprint outcome
#[derive(Debug, Clone, PartialEq)]
pub enum BootPlan {
    /// Poll with the template of the identified vehicle
    Vehicle(VinResponse),
    /// Poll with the device template; a later boot may still identify it
    Device,
    /// Fingerprinting gave up: no template and no OBD polling
    Halted,
}

impl BootPlan {
    pub fn from_fingerprint(result: Result<VinResponse, FingerprintError>) -> Self {
        match result {
            Ok(response) => BootPlan::Vehicle(response),
            Err(e) if e.is_permanent() => {
                warn!(error = %e, "Vehicle not identified, scheduler stays off");
                BootPlan::Halted
            }
            Err(e) => {
                warn!(error = %e, "Vehicle not identified");
                BootPlan::Device
            }
        }
    }

    /// Key for template resolution, `None` when nothing should be polled
    pub fn template_key(&self, device_address: &str) -> Option<String> {
        match self {
            BootPlan::Vehicle(response) => Some(response.vin.as_str().to_string()),
            BootPlan::Device => Some(device_address.to_string()),
            BootPlan::Halted => None,
        }
    }

    pub fn runs_scheduler(&self) -> bool {
        !matches!(self, BootPlan::Halted)
    }
}

/// CAN access for the passive sentinel query
pub struct PassiveScan {
    pub source: SharedFrameSource,
    pub layouts: Vec<ResolvedLayout>,
    pub limits: ScanLimits,
}

pub struct FingerprintRunner {
    device: Arc<dyn DeviceIo>,
    store: Arc<TemplateStore>,
    publisher: Arc<dyn Publisher>,
    state: Arc<AgentState>,
    clock: Arc<dyn Clock>,
    passive: Option<PassiveScan>,
    config: FingerprintConfig,
    software_version: String,
    phase: Mutex<FingerprintPhase>,
}

impl FingerprintRunner {
    pub fn new(
        device: Arc<dyn DeviceIo>,
        store: Arc<TemplateStore>,
        publisher: Arc<dyn Publisher>,
        state: Arc<AgentState>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            device,
            store,
            publisher,
            state,
            clock,
            passive: None,
            config: FingerprintConfig::default(),
            software_version: String::new(),
            phase: Mutex::new(FingerprintPhase::Idle),
        }
    }

    pub fn with_config(mut self, config: FingerprintConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_passive_scan(mut self, passive: PassiveScan) -> Self {
        self.passive = Some(passive);
        self
    }

    pub fn with_software_version(mut self, version: impl Into<String>) -> Self {
        self.software_version = version.into();
        self
    }

    pub fn phase(&self) -> FingerprintPhase {
        *self.phase.lock()
    }

    fn enter(&self, phase: FingerprintPhase) {
        debug!(?phase, "Fingerprint phase");
        *self.phase.lock() = phase;
    }

    /// Run one fingerprint cycle
    #[instrument(skip(self), name = "fingerprint")]
    pub async fn run(&self) -> Result<VinResponse, FingerprintError> {
        let result = self.run_inner().await;
        self.enter(if result.is_ok() {
            FingerprintPhase::Done
        } else {
            FingerprintPhase::Failed
        });
        result
    }

    async fn run_inner(&self) -> Result<VinResponse, FingerprintError> {
        let mut settings = self.load_settings();
        if settings.failed_attempts >= self.config.max_failed_attempts {
            warn!(failed_attempts = settings.failed_attempts, "Fingerprinting disabled for this version");
            return Err(FingerprintError::GaveUp {
                failed_attempts: settings.failed_attempts,
            });
        }

        self.enter(FingerprintPhase::WaitingForPower);
        let power = match self.wait_for_power().await {
            Ok(power) => power,
            Err(e) => {
                error!(error = %e, "Vehicle never reached a safe power state");
                self.publish_error(&e.to_string()).await;
                return Err(e);
            }
        };

        self.enter(FingerprintPhase::QueryingVin);
        let cached = (!settings.vin_query_name.is_empty()).then_some(settings.vin_query_name.as_str());
        let mut found = None;
        for query in ordered_queries(cached) {
            let result = if query.is_passive() {
                self.passive_vin().await
            } else {
                self.query_vin(&query).await
            };
            if let Some(response) = result {
                found = Some(response);
                break;
            }
        }

        let Some(response) = found else {
            settings.failed_attempts += 1;
            self.store.write_vin_settings(&settings)?;
            warn!(failed_attempts = settings.failed_attempts, "No VIN found");

            if settings.failed_attempts >= self.config.max_failed_attempts {
                let err = FingerprintError::GaveUp {
                    failed_attempts: settings.failed_attempts,
                };
                self.publish_error(&err.to_string()).await;
                return Err(err);
            }
            return Err(FingerprintError::NoVin {
                failed_attempts: settings.failed_attempts,
            });
        };

        self.enter(FingerprintPhase::Publishing);
        self.publish(response, &power).await
    }

    /// Cached settings, reset when recorded against another table version
    fn load_settings(&self) -> VinSettings {
        let settings = self.store.read_vin_settings().unwrap_or_default();
        if settings.version == FINGERPRINT_VERSION {
            return settings;
        }
        if settings.version != 0 {
            info!(
                cached_version = settings.version,
                version = FINGERPRINT_VERSION,
                "Fingerprint table changed, starting over"
            );
        }
        VinSettings {
            version: FINGERPRINT_VERSION,
            ..VinSettings::default()
        }
    }

    async fn wait_for_power(&self) -> Result<PowerStatus, FingerprintError> {
        let mut voltage = 0.0;
        for attempt in 1..=self.config.max_power_polls {
            match self.device.power_status().await {
                Ok(power) => {
                    voltage = power.battery_voltage();
                    let trigger = power.wake_trigger();
                    if trigger.is_vehicle_wake() && voltage >= self.config.min_voltage {
                        info!(attempt, voltage, ?trigger, "Power ready");
                        return Ok(power);
                    }
                    debug!(attempt, voltage, ?trigger, "Waiting for power");
                }
                Err(e) => debug!(attempt, error = %e, "Power status unavailable"),
            }
            if attempt < self.config.max_power_polls {
                tokio::time::sleep(self.config.power_poll_interval).await;
            }
        }
        Err(FingerprintError::PowerNotReady {
            attempts: self.config.max_power_polls,
            voltage,
        })
    }

    async fn query_vin(&self, query: &VinQuery) -> Option<VinResponse> {
        let request = vin_obd_query(query);

        let value = match tokio::time::timeout(self.config.query_timeout, self.device.obd_query(&request)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                debug!(query = query.name, error = %e, "VIN query failed");
                return None;
            }
            Err(_) => {
                debug!(query = query.name, "VIN query timed out");
                return None;
            }
        };

        let ObdValue::Hex(lines) = value else {
            debug!(query = query.name, "VIN query returned an evaluated value");
            return None;
        };
        match extract_vin(&lines) {
            Ok(extracted) => {
                info!(
                    vin = %extracted.vin,
                    query = query.name,
                    protocol = query.protocol,
                    start_position = extracted.start_position,
                    "VIN found"
                );
                Some(VinResponse {
                    vin: extracted.vin,
                    protocol: query.protocol.to_string(),
                    query_name: query.name.to_string(),
                })
            }
            Err(e) => {
                debug!(query = query.name, error = %e, "No VIN in response");
                None
            }
        }
    }

    async fn passive_vin(&self) -> Option<VinResponse> {
        let passive = self.passive.as_ref()?;
        self.enter(FingerprintPhase::PassiveScan);

        let mut source = passive.source.lock().await;
        match scan_passive_vin(&mut *source, &passive.layouts, passive.limits).await {
            Ok(Some(found)) => Some(VinResponse {
                vin: found.vin,
                protocol: PASSIVE_PROTOCOL.to_string(),
                query_name: crate::vin::PASSIVE_QUERY_NAME.to_string(),
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Passive VIN scan failed");
                None
            }
        }
    }

    async fn publish(&self, response: VinResponse, power: &PowerStatus) -> Result<VinResponse, FingerprintError> {
        self.store.write_vin_settings(&VinSettings {
            vin: response.vin.to_string(),
            vin_query_name: response.query_name.clone(),
            protocol: response.protocol.clone(),
            version: FINGERPRINT_VERSION,
            failed_attempts: 0,
        })?;
        self.state.set_vin(response.clone());

        let payload = FingerprintPayload {
            vin: response.vin.to_string(),
            protocol: response.protocol.clone(),
            query_name: response.query_name.clone(),
            software_version: self.software_version.clone(),
            uptime_secs: power.uptime_secs(),
            battery_voltage: power.battery_voltage(),
            timestamp: self.clock.now_millis(),
        };
        let event = OutboundEvent::from_payload(EventKind::Fingerprint, &payload)
            .map_err(|e| FingerprintError::Publish(AgentError::Internal(e.to_string())))?;
        self.publisher
            .publish(event)
            .await
            .map_err(FingerprintError::Publish)?;

        info!(vin = %response.vin, protocol = %response.protocol, "Fingerprint published");
        Ok(response)
    }

    async fn publish_error(&self, message: &str) {
        let event = error_event(
            "edge_agent::fingerprint",
            message,
            self.clock.now_millis(),
            Some(&self.software_version),
        );
        if let Err(e) = self.publisher.publish(event).await {
            warn!(error = %e, "Failed to publish fingerprint error");
        }
    }
}

#[cfg(test)]
mod tests {
    use edge_can::{shared, MockFrameSource, RawFrame};
    use edge_core::WakeTrigger;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{ManualClock, MockDeviceIo, RecordingPublisher};
    use crate::vin::VIN_QUERIES;

    const PROTOCOL_6_VIN: [&str; 4] = [
        "7e8101b62f190314654",
        "7e8214557314350334e",
        "7e8224b453638353933",
        "7e82300000000000000",
    ];

    struct Harness {
        _dir: tempfile::TempDir,
        device: Arc<MockDeviceIo>,
        store: Arc<TemplateStore>,
        publisher: Arc<RecordingPublisher>,
        state: Arc<AgentState>,
    }

    impl Harness {
        fn new(device: MockDeviceIo) -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                store: Arc::new(TemplateStore::open(dir.path()).unwrap()),
                _dir: dir,
                device: Arc::new(device),
                publisher: Arc::new(RecordingPublisher::new()),
                state: Arc::new(AgentState::new()),
            }
        }

        fn runner(&self) -> FingerprintRunner {
            FingerprintRunner::new(
                self.device.clone(),
                self.store.clone(),
                self.publisher.clone(),
                self.state.clone(),
                Arc::new(ManualClock::default()),
            )
            .with_software_version("1.0.0")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_voltage_then_publishes() {
        let device = MockDeviceIo::new().with_voltages(&[12.8, 12.9, 13.1, 13.3], WakeTrigger::VoltChange);
        device.respond_hex("vin_7DF_09_02", &PROTOCOL_6_VIN);
        let h = Harness::new(device);
        let runner = h.runner();

        let response = runner.run().await.unwrap();
        assert_eq!(response.vin.as_str(), "1FTEW1CP3NKE68593");
        assert_eq!(response.protocol, "6");
        assert_eq!(h.device.power_polls(), 4);
        assert_eq!(runner.phase(), FingerprintPhase::Done);

        let events = h.publisher.of_kind(EventKind::Fingerprint);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["vin"], "1FTEW1CP3NKE68593");
        assert_eq!(events[0].data["batteryVoltage"], 13.3);
        assert_eq!(events[0].data["softwareVersion"], "1.0.0");

        let cached = h.store.read_vin_settings().unwrap();
        assert_eq!(cached.vin_query_name, "vin_7DF_09_02");
        assert_eq!(cached.failed_attempts, 0);
        assert_eq!(h.state.vin_or_sentinel(), "1FTEW1CP3NKE68593");
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_voltage_exhausts_polls() {
        let device = MockDeviceIo::new().with_voltages(&[12.8], WakeTrigger::VoltChange);
        let h = Harness::new(device);
        let runner = h.runner();

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, FingerprintError::PowerNotReady { attempts: 100, .. }));
        assert_eq!(h.device.power_polls(), 100);
        assert!(h.device.obd_calls().is_empty());
        assert_eq!(runner.phase(), FingerprintPhase::Failed);

        let events = h.publisher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Logs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_vehicle_wake_is_not_ready() {
        let device = MockDeviceIo::new().with_voltages(&[14.0], WakeTrigger::Rtc);
        let h = Harness::new(device);

        let err = h.runner().run().await.unwrap_err();
        assert!(matches!(err, FingerprintError::PowerNotReady { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_query_is_tried_first() {
        let device = MockDeviceIo::new();
        device.respond_hex(
            "vin_18DB33F1_09_02",
            &[
                "18daf1101014490201354a36",
                "18daf110215257324838394b",
                "18daf110224c303132333032",
            ],
        );
        let h = Harness::new(device);
        h.store
            .write_vin_settings(&VinSettings {
                vin: "5J6RW2H89KL012302".to_string(),
                vin_query_name: "vin_18DB33F1_09_02".to_string(),
                protocol: "7".to_string(),
                version: FINGERPRINT_VERSION,
                failed_attempts: 0,
            })
            .unwrap();

        let response = h.runner().run().await.unwrap();
        assert_eq!(response.vin.as_str(), "5J6RW2H89KL012302");
        assert_eq!(h.device.obd_call_names(), vec!["vin_18DB33F1_09_02".to_string()]);
        assert_eq!(h.device.obd_calls()[0].protocol, "7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_counts_and_gives_up() {
        let h = Harness::new(MockDeviceIo::new());
        let structured = VIN_QUERIES.iter().filter(|q| !q.is_passive()).count();

        for boot in 1..=4u32 {
            let err = h.runner().run().await.unwrap_err();
            assert!(matches!(err, FingerprintError::NoVin { failed_attempts } if failed_attempts == boot));
            assert_eq!(BootPlan::from_fingerprint(Err(err)), BootPlan::Device);
        }
        let err = h.runner().run().await.unwrap_err();
        assert!(matches!(err, FingerprintError::GaveUp { failed_attempts: 5 }));
        assert_eq!(h.device.obd_calls().len(), structured * 5);
        // Only the boot that crossed the limit reports it
        assert_eq!(h.publisher.of_kind(EventKind::Logs).len(), 1);

        let err = h.runner().run().await.unwrap_err();
        assert!(matches!(err, FingerprintError::GaveUp { failed_attempts: 5 }));
        assert_eq!(h.device.obd_calls().len(), structured * 5);
        assert_eq!(h.device.power_polls(), 5);
        assert_eq!(h.publisher.of_kind(EventKind::Logs).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_plan_after_giving_up() {
        let h = Harness::new(MockDeviceIo::new());
        h.store
            .write_vin_settings(&VinSettings {
                version: FINGERPRINT_VERSION,
                failed_attempts: 4,
                ..VinSettings::default()
            })
            .unwrap();

        let plan = BootPlan::from_fingerprint(h.runner().run().await);
        assert_eq!(plan, BootPlan::Halted);
        assert!(!plan.runs_scheduler());
        assert_eq!(plan.template_key("0xabc"), None);

        let plan = BootPlan::from_fingerprint(h.runner().run().await);
        assert_eq!(plan, BootPlan::Halted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_plan_keys() {
        let device = MockDeviceIo::new();
        device.respond_hex("vin_7DF_09_02", &PROTOCOL_6_VIN);
        let h = Harness::new(device);

        let plan = BootPlan::from_fingerprint(h.runner().run().await);
        assert!(plan.runs_scheduler());
        assert_eq!(plan.template_key("0xabc").as_deref(), Some("1FTEW1CP3NKE68593"));

        let plan = BootPlan::Device;
        assert!(plan.runs_scheduler());
        assert_eq!(plan.template_key("0xabc").as_deref(), Some("0xabc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_bump_resets_counter() {
        let device = MockDeviceIo::new();
        device.respond_hex("vin_7DF_09_02", &PROTOCOL_6_VIN);
        let h = Harness::new(device);
        h.store
            .write_vin_settings(&VinSettings {
                version: FINGERPRINT_VERSION - 1,
                failed_attempts: 5,
                vin_query_name: "vin_18DB33F1_09_02".to_string(),
                ..VinSettings::default()
            })
            .unwrap();

        let response = h.runner().run().await.unwrap();
        assert_eq!(response.query_name, "vin_7DF_09_02");
        assert_eq!(h.device.obd_call_names()[0], "vin_7DF_09_02");
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_scan_after_structured_queries() {
        let h = Harness::new(MockDeviceIo::new());
        let source = MockFrameSource::from_frames([
            RawFrame::new(0x3E0, b"1FTEW1CP"),
            RawFrame::new(0x3E1, b"3NKE6859"),
            RawFrame::new(0x3E2, b"3"),
        ]);
        let runner = h.runner().with_passive_scan(PassiveScan {
            source: shared(source),
            layouts: vec![ResolvedLayout::Standard {
                ids: [0x3E0, 0x3E1, 0x3E2],
            }],
            limits: ScanLimits {
                timeout: Duration::from_secs(10),
                frame_budget: 100,
            },
        });

        let response = runner.run().await.unwrap();
        assert_eq!(response.vin.as_str(), "1FTEW1CP3NKE68593");
        assert_eq!(response.protocol, PASSIVE_PROTOCOL);
        assert_eq!(response.query_name, "passive_can");
        assert_eq!(h.device.obd_calls().len(), VIN_QUERIES.len() - 1);
    }
}
