//! End-to-end pipeline tests
//!
//! Fingerprint, template resolution, OBD scheduling, queue flush and signed
//! publication wired together the way `edged` wires them, with the hardware,
//! configuration service and broker faked.

use std::sync::Arc;

use async_trait::async_trait;
use edge_agent::sender::{verify_message, LocalSigner};
use edge_agent::testing::{ManualClock, MockDeviceIo};
use edge_agent::{
    BundleOrigin, DataSender, EnvelopeBuilder, FingerprintRunner, Outbox, PidScheduler, SendError, SignalQueue,
    TemplateResolver, TemplateSource, TemplateStore, Topics, Transport,
};
use edge_client::ClientError;
use edge_core::{AgentState, DeviceSettings, PidRequest, SignalSample, TemplatePids, TemplateUrls};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::Value;

const SECRET: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
const VIN: &str = "1FTEW1CP3NKE68593";

const PROTOCOL_6_VIN: [&str; 4] = [
    "7e8101b62f190314654",
    "7e8214557314350334e",
    "7e8224b453638353933",
    "7e82300000000000000",
];

#[derive(Default)]
struct Broker {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    down: Mutex<bool>,
}

impl Broker {
    fn topics(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(topic, _)| topic.clone()).collect()
    }

    fn message(&self, index: usize) -> (String, Vec<u8>) {
        self.sent.lock()[index].clone()
    }
}

#[async_trait]
impl Transport for Broker {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), SendError> {
        if *self.down.lock() {
            return Err(SendError::Transport("not connected".to_string()));
        }
        self.sent.lock().push((topic.to_string(), payload));
        Ok(())
    }
}

struct ConfigService;

#[async_trait]
impl TemplateSource for ConfigService {
    async fn fetch_urls(&self, key: &str) -> Result<TemplateUrls, ClientError> {
        if key != VIN {
            return Err(ClientError::NotFound(key.to_string()));
        }
        Ok(TemplateUrls {
            version: "v3".to_string(),
            pid_url: "https://config.example.com/pids/ford-v3".to_string(),
            device_settings_url: None,
            dbc_url: None,
        })
    }

    async fn fetch_pids(&self, _url: &str) -> Result<TemplatePids, ClientError> {
        Ok(TemplatePids {
            version: "v3".to_string(),
            template_name: "ford-ice".to_string(),
            requests: vec![PidRequest {
                name: "odometer".to_string(),
                header: 0x7DF,
                mode: 0x01,
                pid: 0xA6,
                interval_seconds: 60,
                formula: r#"dbc:31|32@0+ (0.1,0) [1|4294967295] "km""#.to_string(),
                protocol: None,
                can_flow_control_id_pair: None,
                can_flow_control_clear: false,
            }],
        })
    }

    async fn fetch_settings(&self, url: &str) -> Result<DeviceSettings, ClientError> {
        Err(ClientError::NotFound(url.to_string()))
    }

    async fn fetch_dbc(&self, url: &str) -> Result<String, ClientError> {
        Err(ClientError::NotFound(url.to_string()))
    }
}

struct Agent {
    _dir: tempfile::TempDir,
    device: Arc<MockDeviceIo>,
    store: Arc<TemplateStore>,
    state: Arc<AgentState>,
    clock: Arc<ManualClock>,
    broker: Arc<Broker>,
    sender: Arc<DataSender>,
    queue: Arc<SignalQueue>,
}

impl Agent {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TemplateStore::open(dir.path().join("state")).unwrap());
        let outbox = Arc::new(Outbox::open(dir.path().join("outbox"), 100).unwrap());
        let clock = Arc::new(ManualClock::default());
        let broker = Arc::new(Broker::default());
        let state = Arc::new(AgentState::new());
        let signer = LocalSigner::from_bytes(&hex::decode(SECRET).unwrap()).unwrap();
        let sender = DataSender::new(
            broker.clone(),
            Arc::new(signer),
            clock.clone(),
            EnvelopeBuilder::new("edge/agent", ADDRESS),
            Topics::default(),
        )
        .with_outbox(outbox)
        .with_state(state.clone());

        Self {
            _dir: dir,
            device: Arc::new(MockDeviceIo::new()),
            store,
            state,
            clock,
            broker,
            sender: Arc::new(sender),
            queue: Arc::new(SignalQueue::default()),
        }
    }

    fn fingerprint(&self) -> FingerprintRunner {
        FingerprintRunner::new(
            self.device.clone(),
            self.store.clone(),
            self.sender.clone(),
            self.state.clone(),
            self.clock.clone(),
        )
        .with_software_version("1.4.2")
    }

    fn resolver(&self) -> TemplateResolver {
        TemplateResolver::new(Arc::new(ConfigService), self.store.clone())
    }
}

#[tokio::test(start_paused = true)]
async fn test_boot_to_signed_status() {
    let agent = Agent::new();
    agent.device.respond_hex("vin_7DF_09_02", &PROTOCOL_6_VIN);
    agent.device.respond_hex("odometer", &["7e80641a60008b24200"]);

    let identified = agent.fingerprint().run().await.unwrap();
    assert_eq!(identified.vin.as_str(), VIN);

    let resolution = agent.resolver().resolve(identified.vin.as_str()).await.unwrap();
    assert_eq!(resolution.origin, BundleOrigin::Fetched);

    let mut scheduler = PidScheduler::new(
        agent.device.clone(),
        agent.queue.clone(),
        agent.sender.clone(),
        agent.clock.clone(),
        resolution.bundle.pids,
        resolution.bundle.settings,
    )
    .with_protocol(identified.protocol.clone());
    assert_eq!(scheduler.run_cycle().await.samples, 1);

    let flushed = agent
        .queue
        .flush(agent.sender.as_ref(), agent.clock.as_ref(), "1.4.2")
        .await
        .unwrap();
    assert_eq!(flushed, 1);

    assert_eq!(agent.broker.topics(), vec!["devices/fingerprint", "devices/status"]);
    let (_, status) = agent.broker.message(1);
    assert!(verify_message(&status, ADDRESS).unwrap());

    let envelope: Value = serde_json::from_slice(&status).unwrap();
    assert_eq!(envelope["subject"], ADDRESS);
    assert_eq!(envelope["data"]["softwareVersion"], "1.4.2");
    assert_eq!(envelope["data"]["signals"][0]["name"], "odometer");
    assert_eq!(agent.state.last_signature().as_deref(), envelope["signature"].as_str());
}

#[tokio::test(start_paused = true)]
async fn test_second_boot_uses_cached_template_and_query() {
    let agent = Agent::new();
    agent.device.respond_hex("vin_7DF_09_02", &PROTOCOL_6_VIN);

    agent.fingerprint().run().await.unwrap();
    agent.resolver().resolve(VIN).await.unwrap();
    let first_boot_calls = agent.device.obd_calls().len();

    // Next boot: the cached query goes first and the template is unchanged
    agent.fingerprint().run().await.unwrap();
    assert_eq!(agent.device.obd_call_names()[first_boot_calls], "vin_7DF_09_02");
    assert_eq!(agent.device.obd_calls().len(), first_boot_calls + 1);

    let resolution = agent.resolver().resolve(VIN).await.unwrap();
    assert_eq!(resolution.origin, BundleOrigin::Cached);
    assert_eq!(resolution.bundle.pids.template_name, "ford-ice");
}

#[tokio::test]
async fn test_broker_outage_is_absorbed_by_outbox() {
    let agent = Agent::new();
    *agent.broker.down.lock() = true;

    agent.queue.enqueue(SignalSample::new("speed", 1_000, 42.0));
    let flushed = agent
        .queue
        .flush(agent.sender.as_ref(), agent.clock.as_ref(), "1.4.2")
        .await
        .unwrap();
    assert_eq!(flushed, 1);
    assert!(agent.queue.is_empty());
    assert!(agent.broker.topics().is_empty());

    *agent.broker.down.lock() = false;
    assert_eq!(agent.sender.replay_outbox().await.unwrap(), 1);
    let (topic, payload) = agent.broker.message(0);
    assert_eq!(topic, "devices/status");
    assert!(verify_message(&payload, ADDRESS).unwrap());
}

#[tokio::test]
async fn test_failed_flush_keeps_samples_in_order() {
    let agent = Agent::new();
    let signer = LocalSigner::from_bytes(&hex::decode(SECRET).unwrap()).unwrap();
    // No outbox: transport errors reach the queue
    let sender = DataSender::new(
        agent.broker.clone(),
        Arc::new(signer),
        agent.clock.clone(),
        EnvelopeBuilder::new("edge/agent", ADDRESS),
        Topics::default(),
    );
    *agent.broker.down.lock() = true;

    agent.queue.enqueue(SignalSample::new("speed", 1_000, 42.0));
    agent.queue.enqueue(SignalSample::new("rpm", 1_000, 900.0));
    assert!(agent.queue.flush(&sender, agent.clock.as_ref(), "1.4.2").await.is_err());
    agent.queue.enqueue(SignalSample::new("speed", 2_000, 43.0));

    *agent.broker.down.lock() = false;
    assert_eq!(agent.queue.flush(&sender, agent.clock.as_ref(), "1.4.2").await.unwrap(), 3);

    let (_, payload) = agent.broker.message(0);
    let envelope: Value = serde_json::from_slice(&payload).unwrap();
    let names: Vec<_> = envelope["data"]["signals"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["speed", "rpm", "speed"]);
}

#[tokio::test]
async fn test_dtc_report_follows_clear() {
    let agent = Agent::new();
    agent.device.set_dtcs(Ok(vec!["P0420".to_string()]));
    assert_eq!(agent.state.refresh_dtcs(agent.device.as_ref()).await, "P0420");

    assert_eq!(agent.state.clear_dtcs(agent.device.as_ref()).await, "0");

    agent.device.set_dtcs(Err("bus off".to_string()));
    assert_eq!(agent.state.clear_dtcs(agent.device.as_ref()).await, "1");
}
