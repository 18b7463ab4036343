//! PID scheduler
//!
//! A single loop owns the OBD path. Each cycle:
//!
//! 1. picks up a reloaded template, if one arrived
//! 2. checks battery voltage against `min_voltage_obd_loggers`
//! 3. issues every due request in list order, one at a time
//! 4. lends the CAN socket to the passive listener for one window
//!
//! Requests that keep failing are quarantined for the rest of the process
//! (or until the template changes) and reported once on the logs topic.

use std::sync::Arc;
use std::time::Duration;

use edge_can::{PassiveListener, SharedFrameSource};
use edge_conv::{decode_obd_response, Formula};
use edge_core::{
    AgentError, Clock, DeviceIo, DeviceSettings, ObdQuery, ObdValue, PidRequest, Publisher, SignalSample, SignalValue,
    Sink, TemplatePids,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::dump::DumpJob;
use crate::log_hook::error_event;

/// Tuning for the scheduler loop
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between cycles
    pub tick: Duration,
    /// Deadline for one raw OBD call
    pub request_timeout: Duration,
    /// Consecutive failures tolerated before a request is quarantined
    pub quarantine_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            quarantine_threshold: 10,
        }
    }
}

/// Per-request runtime state
struct Entry {
    request: PidRequest,
    formula: Result<Formula, String>,
    last_run: Option<Instant>,
    failures: u32,
    quarantined: bool,
}

impl Entry {
    fn new(request: PidRequest) -> Self {
        let formula = request.formula.parse::<Formula>().map_err(|e| e.to_string());
        if let Err(e) = &formula {
            warn!(signal = %request.name, error = %e, "Unparseable formula");
        }
        Self {
            request,
            formula,
            last_run: None,
            failures: 0,
            quarantined: false,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        if self.quarantined {
            return false;
        }
        match self.last_run {
            None => true,
            Some(_) if self.request.is_boot_only() => false,
            Some(last) => now.duration_since(last) >= Duration::from_secs(self.request.interval_seconds.into()),
        }
    }
}

/// Passive CAN phase run at the end of each cycle
pub struct PassiveStage {
    pub listener: PassiveListener,
    pub source: SharedFrameSource,
    pub window: Duration,
}

/// What one cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub obd_enabled: bool,
    pub issued: usize,
    pub samples: usize,
    pub failures: usize,
    pub passive_samples: usize,
}

pub struct PidScheduler {
    device: Arc<dyn DeviceIo>,
    sink: Arc<dyn Sink>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    settings: DeviceSettings,
    config: SchedulerConfig,
    protocol: String,
    version: String,
    entries: Vec<Entry>,
    templates: Option<watch::Receiver<TemplatePids>>,
    passive: Option<PassiveStage>,
    dump: Option<Arc<DumpJob>>,
    software_version: Option<String>,
}

impl PidScheduler {
    pub fn new(
        device: Arc<dyn DeviceIo>,
        sink: Arc<dyn Sink>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        template: TemplatePids,
        settings: DeviceSettings,
    ) -> Self {
        let mut scheduler = Self {
            device,
            sink,
            publisher,
            clock,
            settings,
            config: SchedulerConfig::default(),
            protocol: String::new(),
            version: String::new(),
            entries: Vec::new(),
            templates: None,
            passive: None,
            dump: None,
            software_version: None,
        };
        scheduler.load(template);
        scheduler
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Protocol used for requests that do not name one (the fingerprint's)
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_template_updates(mut self, templates: watch::Receiver<TemplatePids>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn with_passive(mut self, passive: PassiveStage) -> Self {
        self.passive = Some(passive);
        self
    }

    pub fn with_dump(mut self, dump: Arc<DumpJob>) -> Self {
        self.dump = Some(dump);
        self
    }

    pub fn with_software_version(mut self, version: impl Into<String>) -> Self {
        self.software_version = Some(version.into());
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Names of requests taken out of rotation
    pub fn quarantined(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.quarantined)
            .map(|e| e.request.name.clone())
            .collect()
    }

    fn load(&mut self, template: TemplatePids) {
        info!(
            version = %template.version,
            template = %template.template_name,
            requests = template.requests.len(),
            "Loading PID template"
        );
        self.version = template.version;
        self.entries = template.requests.into_iter().map(Entry::new).collect();
    }

    /// Swap in a new template when its version differs
    fn check_reload(&mut self) {
        let Some(templates) = self.templates.as_mut() else {
            return;
        };
        if !templates.has_changed().unwrap_or(false) {
            return;
        }
        let template = templates.borrow_and_update().clone();
        if template.version != self.version {
            self.load(template);
        }
    }

    /// Run one scheduling cycle
    pub async fn run_cycle(&mut self) -> CycleStats {
        self.check_reload();

        let mut stats = CycleStats {
            obd_enabled: self.obd_enabled().await,
            ..CycleStats::default()
        };

        if stats.obd_enabled {
            let now = Instant::now();
            let due: Vec<usize> = (0..self.entries.len())
                .filter(|&i| self.entries[i].is_due(now))
                .collect();
            for idx in due {
                stats.issued += 1;
                if self.run_entry(idx).await {
                    stats.samples += 1;
                } else {
                    stats.failures += 1;
                }
            }
        }

        stats.passive_samples = self.run_passive().await;
        trace!(?stats, "Scheduler cycle");
        stats
    }

    async fn obd_enabled(&self) -> bool {
        match self.device.power_status().await {
            Ok(power) => {
                let enabled = power.battery_voltage() >= self.settings.min_voltage_obd_loggers;
                if !enabled {
                    debug!(
                        voltage = power.battery_voltage(),
                        min = self.settings.min_voltage_obd_loggers,
                        "OBD phase skipped on low voltage"
                    );
                }
                enabled
            }
            Err(e) => {
                warn!(error = %e, "Power status unavailable, skipping OBD phase");
                false
            }
        }
    }

    /// Issue one request; true when a sample was produced
    async fn run_entry(&mut self, idx: usize) -> bool {
        self.entries[idx].last_run = Some(Instant::now());
        let result = self.issue(idx).await;

        let entry = &mut self.entries[idx];
        let name = entry.request.name.clone();
        match result {
            Ok(value) => {
                entry.failures = 0;
                self.sink.push(SignalSample::new(name, self.clock.now_millis(), value));
                true
            }
            Err(e) => {
                self.record_failure(idx, e).await;
                false
            }
        }
    }

    /// Issue one request and turn the answer into a sample value
    async fn issue(&self, idx: usize) -> Result<SignalValue, AgentError> {
        let entry = &self.entries[idx];
        let request = &entry.request;
        let formula = entry
            .formula
            .as_ref()
            .map_err(|e| AgentError::InvalidInput(e.clone()))?;

        let mut query = self.query_for(request);
        if formula.is_script() {
            self.capture_for_dump(request, &query).await;
            query.formula = Some(request.formula.clone());
        }

        let value = match tokio::time::timeout(self.config.request_timeout, self.device.obd_query(&query)).await {
            Ok(result) => result?,
            Err(_) => return Err(AgentError::Timeout),
        };

        match (formula, value) {
            (Formula::SignalDatabase(signal), ObdValue::Hex(lines)) => {
                let header = format!("{:x}", request.response_header());
                let pid = request.pid_hex();
                let (matching, others): (Vec<_>, Vec<_>) = lines
                    .iter()
                    .map(|l| l.trim().to_ascii_lowercase())
                    .partition(|l| l.starts_with(&header));

                let mut last_error = None;
                for line in matching.iter().chain(others.iter()) {
                    match decode_obd_response(line, &pid, signal) {
                        Ok(decoded) => return Ok(SignalValue::Number(decoded.value)),
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(match last_error {
                    Some(e) => AgentError::Decode(e.to_string()),
                    None => AgentError::Decode("empty response".to_string()),
                })
            }
            (_, ObdValue::Number(v)) => Ok(SignalValue::Number(v)),
            (_, ObdValue::Text(s)) => Ok(SignalValue::Text(s)),
            (Formula::Script { .. }, ObdValue::Hex(_)) => {
                Err(AgentError::Decode("script formula returned raw frames".to_string()))
            }
        }
    }

    fn query_for(&self, request: &PidRequest) -> ObdQuery {
        request.raw_query(&self.protocol)
    }

    /// Fetch raw frames of a script request while the dump job wants them
    async fn capture_for_dump(&self, request: &PidRequest, raw: &ObdQuery) {
        let Some(dump) = self.dump.as_ref() else {
            return;
        };
        if !dump.wants(&request.name) {
            return;
        }
        match tokio::time::timeout(self.config.request_timeout, self.device.obd_query(raw)).await {
            Ok(Ok(ObdValue::Hex(lines))) => dump.record(request, &lines),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(signal = %request.name, error = %e, "Raw capture failed"),
            Err(_) => debug!(signal = %request.name, "Raw capture timed out"),
        }
    }

    async fn record_failure(&mut self, idx: usize, error: AgentError) {
        let threshold = self.config.quarantine_threshold;
        let entry = &mut self.entries[idx];
        entry.failures += 1;
        let total = self.sink.increment_failure(&entry.request.name);
        debug!(signal = %entry.request.name, failures = entry.failures, total, error = %error, "PID request failed");

        if entry.failures <= threshold || entry.quarantined {
            return;
        }
        entry.quarantined = true;
        let name = entry.request.name.clone();
        warn!(signal = %name, failures = entry.failures, error = %error, "PID request quarantined");

        let event = error_event(
            module_path!(),
            format!("PID request {} quarantined after {} failures: {}", name, threshold + 1, error),
            self.clock.now_millis(),
            self.software_version.as_deref(),
        );
        if let Err(e) = self.publisher.publish(event).await {
            warn!(error = %e, "Failed to publish quarantine event");
        }
    }

    async fn run_passive(&self) -> usize {
        let Some(passive) = self.passive.as_ref() else {
            return 0;
        };
        if passive.listener.is_empty() {
            return 0;
        }
        let mut source = passive.source.lock().await;
        match passive.listener.listen(&mut *source, passive.window).await {
            Ok(stats) => stats.samples,
            Err(e) => {
                warn!(error = %e, "Passive listening failed");
                0
            }
        }
    }

    /// Cycle every tick until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(version = %self.version, requests = self.entries.len(), "PID scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.run_cycle().await;
        }
        info!("PID scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use edge_can::{MockFrameSource, RawFrame};
    use edge_conv::SignalDatabase;
    use edge_core::EventKind;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::queue::SignalQueue;
    use crate::testing::{ManualClock, MockDeviceIo, RecordingPublisher};

    const ODOMETER: &str = r#"dbc:31|32@0+ (0.1,0) [1|4294967295] "km""#;
    const SPEED: &str = r#"dbc:31|8@0+ (1,0) [0|255] "km/h""#;

    fn request(name: &str, pid: u32, interval_seconds: u32, formula: &str) -> PidRequest {
        PidRequest {
            name: name.to_string(),
            header: 0x7DF,
            mode: 0x01,
            pid,
            interval_seconds,
            formula: formula.to_string(),
            protocol: None,
            can_flow_control_id_pair: None,
            can_flow_control_clear: false,
        }
    }

    fn template(version: &str, requests: Vec<PidRequest>) -> TemplatePids {
        TemplatePids {
            version: version.to_string(),
            template_name: "default-ice".to_string(),
            requests,
        }
    }

    struct Harness {
        device: Arc<MockDeviceIo>,
        queue: Arc<SignalQueue>,
        publisher: Arc<RecordingPublisher>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                device: Arc::new(MockDeviceIo::new()),
                queue: Arc::new(SignalQueue::default()),
                publisher: Arc::new(RecordingPublisher::new()),
            }
        }

        fn scheduler(&self, template: TemplatePids) -> PidScheduler {
            PidScheduler::new(
                self.device.clone(),
                self.queue.clone(),
                self.publisher.clone(),
                Arc::new(ManualClock::default()),
                template,
                DeviceSettings::default(),
            )
            .with_protocol("6")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_decodes_and_enqueues() {
        let h = Harness::new();
        h.device.respond_hex("odometer", &["7e80641a60008b24200"]);
        let mut scheduler = h.scheduler(template("v1", vec![request("odometer", 0xA6, 60, ODOMETER)]));

        let stats = scheduler.run_cycle().await;
        assert!(stats.obd_enabled);
        assert_eq!(stats.samples, 1);

        let samples = h.queue.drain();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "odometer");
        assert_eq!(samples[0].value, SignalValue::Number(56992.2));

        let calls = h.device.obd_calls();
        assert_eq!(calls[0].protocol, "6");
        assert_eq!(calls[0].formula, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefers_lines_from_expected_responder() {
        let h = Harness::new();
        // 7E9 answers first with a different value
        h.device.respond_hex("speed", &["7e903410d2a", "7e803410d3c"]);
        let mut scheduler = h.scheduler(template("v1", vec![request("speed", 0x0D, 10, SPEED)]));

        scheduler.run_cycle().await;
        assert_eq!(h.queue.drain()[0].value, SignalValue::Number(60.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_voltage_skips_obd_phase() {
        let h = Harness::new();
        h.device.set_voltage(12.1);
        h.device.respond_hex("speed", &["7e803410d3c"]);
        let mut scheduler = h.scheduler(template("v1", vec![request("speed", 0x0D, 10, SPEED)]));

        let stats = scheduler.run_cycle().await;
        assert!(!stats.obd_enabled);
        assert!(h.device.obd_calls().is_empty());

        h.device.set_voltage(13.9);
        assert_eq!(scheduler.run_cycle().await.samples, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intervals_and_boot_only() {
        let h = Harness::new();
        h.device.respond_hex("speed", &["7e803410d3c"]);
        h.device.respond_hex("odometer", &["7e80641a60008b24200"]);
        let mut scheduler = h.scheduler(template(
            "v1",
            vec![request("odometer", 0xA6, 0, ODOMETER), request("speed", 0x0D, 10, SPEED)],
        ));

        scheduler.run_cycle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        scheduler.run_cycle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        scheduler.run_cycle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        scheduler.run_cycle().await;

        assert_eq!(
            h.device.obd_call_names(),
            vec!["odometer", "speed", "speed", "speed"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_never_overlap() {
        let h = Harness::new();
        h.device.set_obd_delay(Duration::from_millis(500));
        for name in ["a", "b", "c"] {
            h.device.respond_hex(name, &["7e803410d3c"]);
        }
        let mut scheduler = h.scheduler(template(
            "v1",
            vec![request("a", 0x0D, 1, SPEED), request("b", 0x0D, 1, SPEED), request("c", 0x0D, 1, SPEED)],
        ));

        for _ in 0..3 {
            scheduler.run_cycle().await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert_eq!(h.device.obd_calls().len(), 9);
        assert_eq!(h.device.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let h = Harness::new();
        h.device.set_obd_delay(Duration::from_secs(5));
        h.device.respond_hex("speed", &["7e803410d3c"]);
        let mut scheduler = h.scheduler(template("v1", vec![request("speed", 0x0D, 1, SPEED)]));

        let stats = scheduler.run_cycle().await;
        assert_eq!(stats.failures, 1);
        assert_eq!(h.queue.failure_count("speed"), 1);
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quarantine_after_threshold() {
        let h = Harness::new();
        h.device.respond_error("speed", "CAN ERROR");
        let mut scheduler = h
            .scheduler(template("v1", vec![request("speed", 0x0D, 1, SPEED)]))
            .with_config(SchedulerConfig {
                quarantine_threshold: 3,
                ..SchedulerConfig::default()
            });

        for _ in 0..10 {
            scheduler.run_cycle().await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        // Threshold + 1 attempts, then out of rotation
        assert_eq!(h.device.obd_calls().len(), 4);
        assert_eq!(scheduler.quarantined(), vec!["speed".to_string()]);
        assert_eq!(h.publisher.of_kind(EventKind::Logs).len(), 1);
    }

    async fn tick(scheduler: &mut PidScheduler) {
        scheduler.run_cycle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let h = Harness::new();
        let mut scheduler = h
            .scheduler(template("v1", vec![request("speed", 0x0D, 1, SPEED)]))
            .with_config(SchedulerConfig {
                quarantine_threshold: 3,
                ..SchedulerConfig::default()
            });

        h.device.respond_error("speed", "NO DATA");
        for _ in 0..3 {
            tick(&mut scheduler).await;
        }
        h.device.respond_hex("speed", &["7e803410d3c"]);
        tick(&mut scheduler).await;
        h.device.respond_error("speed", "NO DATA");
        for _ in 0..3 {
            tick(&mut scheduler).await;
        }
        assert!(scheduler.quarantined().is_empty());

        tick(&mut scheduler).await;
        assert_eq!(scheduler.quarantined(), vec!["speed".to_string()]);
        assert_eq!(h.queue.failure_count("speed"), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_formula_fails_without_query() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(template("v1", vec![request("weird", 0x0D, 1, "lua: x")]));

        assert_eq!(scheduler.run_cycle().await.failures, 1);
        assert!(h.device.obd_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_script_formula_goes_to_hardware() {
        let h = Harness::new();
        h.device.respond_value("fuelType", ObdValue::Text("diesel".to_string()));
        let script = "python: FUEL_TYPES[int(data[6:8], 16)]";
        let mut scheduler = h.scheduler(template("v1", vec![request("fuelType", 0x51, 60, script)]));

        scheduler.run_cycle().await;
        assert_eq!(h.queue.drain()[0].value, SignalValue::Text("diesel".to_string()));
        assert_eq!(h.device.obd_calls()[0].formula.as_deref(), Some(script));
    }

    #[tokio::test(start_paused = true)]
    async fn test_template_reload_resets_state() {
        let h = Harness::new();
        h.device.respond_error("speed", "NO DATA");
        h.device.respond_hex("rpm", &["7e804410c0fa0"]);
        let (tx, rx) = watch::channel(template("v1", vec![request("speed", 0x0D, 1, SPEED)]));
        let mut scheduler = h
            .scheduler(tx.borrow().clone())
            .with_template_updates(rx)
            .with_config(SchedulerConfig {
                quarantine_threshold: 0,
                ..SchedulerConfig::default()
            });

        scheduler.run_cycle().await;
        assert_eq!(scheduler.quarantined(), vec!["speed".to_string()]);

        let rpm = request("rpm", 0x0C, 1, r#"dbc:31|16@0+ (0.25,0) [0|16383.75] "rpm""#);
        tx.send(template("v2", vec![request("speed", 0x0D, 1, SPEED), rpm])).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        scheduler.run_cycle().await;

        assert_eq!(scheduler.version(), "v2");
        assert_eq!(h.device.obd_call_names(), vec!["speed", "speed", "rpm"]);
        assert_eq!(h.queue.drain()[0].value, SignalValue::Number(1000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_phase_runs_even_when_obd_is_gated() {
        let h = Harness::new();
        h.device.set_voltage(11.9);
        let db = SignalDatabase::parse(
            "BO_ 1201 WheelSpeeds: 8 ECU\n SG_ FrontLeft : 0|16@1+ (0.01,0) [0|655.35] \"km/h\" Vector__XXX\n",
        )
        .unwrap();
        let clock = Arc::new(ManualClock::default());
        let listener = PassiveListener::new(db, h.queue.clone(), clock);
        let source = edge_can::shared(MockFrameSource::from_frames([RawFrame::new(
            1201,
            &[0x88, 0x13, 0, 0, 0, 0, 0, 0],
        )]));

        let mut scheduler = h.scheduler(template("v1", vec![])).with_passive(PassiveStage {
            listener,
            source,
            window: Duration::from_millis(200),
        });

        let stats = scheduler.run_cycle().await;
        assert!(!stats.obd_enabled);
        assert_eq!(stats.passive_samples, 1);
        assert_eq!(h.queue.drain()[0].value, SignalValue::Number(50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_captures_raw_frames_of_script_requests() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::store::TemplateStore::open(dir.path()).unwrap());
        let dump = Arc::new(DumpJob::new(store, Arc::new(ManualClock::default())));

        let h = Harness::new();
        // Raw and evaluated answers share the request name in the mock
        h.device.respond_hex("oilLife", &["7e805621e1c5a"]);
        let script = "python: int(data[8:10], 16)";
        let mut scheduler = h
            .scheduler(template("v1", vec![request("oilLife", 0x1E1C, 1, script)]))
            .with_dump(dump.clone());

        for _ in 0..3 {
            scheduler.run_cycle().await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let calls = h.device.obd_calls();
        let raw = calls.iter().filter(|q| q.formula.is_none()).count();
        assert_eq!(raw, 2);
        assert!(!dump.wants("oilLife"));
    }
}
