//! Test doubles for the pipeline
//!
//! In-memory stand-ins for the hardware RPC, the data sender and the clock,
//! so every stage can run without a dongle, a broker or real time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use edge_core::{
    AgentError, AgentResult, Clock, DeviceIo, EventKind, Location, ObdQuery, ObdValue, OutboundEvent,
    PowerStatus, Publisher, WakeTrigger,
};
use parking_lot::Mutex;

/// Scripted hardware RPC
pub struct MockDeviceIo {
    serial: String,
    power: Mutex<VecDeque<PowerStatus>>,
    last_power: Mutex<PowerStatus>,
    power_polls: AtomicUsize,
    obd: Mutex<HashMap<String, Result<ObdValue, String>>>,
    obd_calls: Mutex<Vec<ObdQuery>>,
    obd_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    dtcs: Mutex<Result<Vec<String>, String>>,
    location: Mutex<Option<Location>>,
    network: Mutex<Option<NetworkReadings>>,
}

/// Radio readings served by [`MockDeviceIo`]
#[derive(Debug, Clone)]
pub struct NetworkReadings {
    pub signal: serde_json::Value,
    pub modem: String,
    pub wifi: serde_json::Value,
}

impl Default for MockDeviceIo {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDeviceIo {
    /// A running vehicle: 13.8 V, woken by the bus
    pub fn new() -> Self {
        Self {
            serial: "b4c2a1f0-0000-4000-8000-000000000001".to_string(),
            power: Mutex::new(VecDeque::new()),
            last_power: Mutex::new(PowerStatus::new(13.8, WakeTrigger::Stn, 60)),
            power_polls: AtomicUsize::new(0),
            obd: Mutex::new(HashMap::new()),
            obd_calls: Mutex::new(Vec::new()),
            obd_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            dtcs: Mutex::new(Ok(Vec::new())),
            location: Mutex::new(None),
            network: Mutex::new(None),
        }
    }

    /// Queue power readings; the last one repeats once the queue drains
    pub fn with_voltages(self, voltages: &[f64], trigger: WakeTrigger) -> Self {
        {
            let mut power = self.power.lock();
            power.clear();
            power.extend(voltages.iter().map(|v| PowerStatus::new(*v, trigger, 60)));
        }
        if let Some(last) = voltages.last() {
            *self.last_power.lock() = PowerStatus::new(*last, trigger, 60);
        }
        self
    }

    pub fn set_voltage(&self, voltage: f64) {
        self.power.lock().clear();
        *self.last_power.lock() = PowerStatus::new(voltage, WakeTrigger::Stn, 60);
    }

    /// Answer queries named `name` with raw hex lines
    pub fn respond_hex(&self, name: &str, lines: &[&str]) {
        let lines = lines.iter().map(|l| l.to_string()).collect();
        self.obd.lock().insert(name.to_string(), Ok(ObdValue::Hex(lines)));
    }

    /// Answer queries named `name` with an evaluated value
    pub fn respond_value(&self, name: &str, value: ObdValue) {
        self.obd.lock().insert(name.to_string(), Ok(value));
    }

    /// Fail queries named `name`
    pub fn respond_error(&self, name: &str, message: &str) {
        self.obd.lock().insert(name.to_string(), Err(message.to_string()));
    }

    /// Hold every OBD call for `delay`, to expose overlapping callers
    pub fn set_obd_delay(&self, delay: Duration) {
        *self.obd_delay.lock() = delay;
    }

    pub fn set_dtcs(&self, dtcs: Result<Vec<String>, String>) {
        *self.dtcs.lock() = dtcs;
    }

    pub fn set_location(&self, location: Option<Location>) {
        *self.location.lock() = location;
    }

    /// Serve radio readings; `None` makes every radio call unsupported
    pub fn set_network(&self, readings: Option<NetworkReadings>) {
        *self.network.lock() = readings;
    }

    pub fn power_polls(&self) -> usize {
        self.power_polls.load(Ordering::SeqCst)
    }

    pub fn obd_calls(&self) -> Vec<ObdQuery> {
        self.obd_calls.lock().clone()
    }

    /// Names of every OBD query issued, in order
    pub fn obd_call_names(&self) -> Vec<String> {
        self.obd_calls.lock().iter().map(|q| q.name.clone()).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl MockDeviceIo {
    fn radio<T>(&self, pick: impl FnOnce(&NetworkReadings) -> T, command: &str) -> AgentResult<T> {
        self.network
            .lock()
            .as_ref()
            .map(pick)
            .ok_or_else(|| AgentError::NotSupported(command.to_string()))
    }
}

#[async_trait]
impl DeviceIo for MockDeviceIo {
    async fn power_status(&self) -> AgentResult<PowerStatus> {
        self.power_polls.fetch_add(1, Ordering::SeqCst);
        let next = self.power.lock().pop_front();
        Ok(next.unwrap_or_else(|| self.last_power.lock().clone()))
    }

    async fn device_id(&self) -> AgentResult<String> {
        Ok(self.serial.clone())
    }

    async fn software_version(&self) -> AgentResult<String> {
        Ok("0.1.0-test".to_string())
    }

    async fn obd_query(&self, query: &ObdQuery) -> AgentResult<ObdValue> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.obd_calls.lock().push(query.clone());

        let delay = *self.obd_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = self.obd.lock().get(&query.name).cloned();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match response {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(AgentError::DeviceIo { status: 500, message }),
            None => Err(AgentError::DeviceIo {
                status: 500,
                message: "NO DATA".to_string(),
            }),
        }
    }

    async fn read_dtcs(&self) -> AgentResult<Vec<String>> {
        self.dtcs.lock().clone().map_err(AgentError::Transport)
    }

    async fn clear_dtcs(&self) -> AgentResult<()> {
        let mut dtcs = self.dtcs.lock();
        match &*dtcs {
            Ok(_) => {
                *dtcs = Ok(Vec::new());
                Ok(())
            }
            Err(e) => Err(AgentError::Transport(e.clone())),
        }
    }

    async fn location(&self) -> AgentResult<Option<Location>> {
        Ok(self.location.lock().clone())
    }

    async fn modem_signal(&self) -> AgentResult<serde_json::Value> {
        self.radio(|n| n.signal.clone(), "modem_signal")
    }

    async fn modem_kind(&self) -> AgentResult<String> {
        self.radio(|n| n.modem.clone(), "modem_kind")
    }

    async fn wifi_status(&self) -> AgentResult<serde_json::Value> {
        self.radio(|n| n.wifi.clone(), "wifi_status")
    }
}

/// Publisher that records every event
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<OutboundEvent>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.events.lock().clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<OutboundEvent> {
        self.events.lock().iter().filter(|e| e.kind == kind).cloned().collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, event: OutboundEvent) -> AgentResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AgentError::Transport("broker unreachable".to_string()));
        }
        self.events.lock().push(event);
        Ok(())
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).single().unwrap_or_default())
    }
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        *self.now.lock() += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
