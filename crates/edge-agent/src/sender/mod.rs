//! Data sender
//!
//! Turns [`OutboundEvent`]s into signed CloudEvents and hands them to the
//! transport on the topic configured for their kind. Messages the transport
//! refuses go to the on-disk outbox and are replayed after the next
//! (re)connect.

pub mod envelope;
pub mod mqtt;
pub mod outbox;
pub mod signing;

use std::sync::Arc;

use async_trait::async_trait;
use edge_core::{AgentResult, AgentState, Clock, EventKind, OutboundEvent, Publisher, Signer, VehicleInfo};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use envelope::EnvelopeBuilder;
pub use mqtt::{MqttConnection, MqttSettings, MqttTransport, TlsFiles};
pub use outbox::{Outbox, OutboxMessage};
pub use signing::{keccak256, recover_address, sign_event, verify_message, LocalSigner};

use crate::error::SendError;

/// Moves signed bytes to the broker
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), SendError>;
}

/// Topic per event kind; an empty name disables that kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub status: String,
    pub network: String,
    pub logs: String,
    pub fingerprint: String,
    pub dump: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            status: "devices/status".to_string(),
            network: "devices/network".to_string(),
            logs: "devices/logs".to_string(),
            fingerprint: "devices/fingerprint".to_string(),
            dump: "devices/candump".to_string(),
        }
    }
}

impl Topics {
    pub fn for_kind(&self, kind: EventKind) -> Option<&str> {
        let topic = match kind {
            EventKind::Status => &self.status,
            EventKind::Network => &self.network,
            EventKind::Logs => &self.logs,
            EventKind::Fingerprint => &self.fingerprint,
            EventKind::Dump => &self.dump,
        };
        (!topic.is_empty()).then_some(topic.as_str())
    }
}

pub struct DataSender {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    clock: Arc<dyn Clock>,
    envelopes: EnvelopeBuilder,
    topics: Topics,
    outbox: Option<Arc<Outbox>>,
    state: Option<Arc<AgentState>>,
    vehicle: RwLock<Option<VehicleInfo>>,
}

impl DataSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
        envelopes: EnvelopeBuilder,
        topics: Topics,
    ) -> Self {
        Self {
            transport,
            signer,
            clock,
            envelopes,
            topics,
            outbox: None,
            state: None,
            vehicle: RwLock::new(None),
        }
    }

    pub fn with_outbox(mut self, outbox: Arc<Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Record each signature for the BLE façade
    pub fn with_state(mut self, state: Arc<AgentState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Vehicle attributes attached to status events
    pub fn set_vehicle(&self, vehicle: Option<VehicleInfo>) {
        *self.vehicle.write() = vehicle;
    }

    pub fn vehicle(&self) -> Option<VehicleInfo> {
        self.vehicle.read().clone()
    }

    /// Sign and publish one event
    pub async fn send(&self, event: OutboundEvent) -> Result<(), SendError> {
        let kind = event.kind;
        let topic = self
            .topics
            .for_kind(kind)
            .ok_or_else(|| SendError::NoTopic(kind.to_string()))?;

        let vehicle = self.vehicle();
        let mut envelope = self.envelopes.build(event, self.clock.now(), vehicle.as_ref());
        let bytes = sign_event(&mut envelope, self.signer.as_ref()).await?;
        if let (Some(state), Some(signature)) = (&self.state, envelope.signature.clone()) {
            state.set_last_signature(signature);
        }

        let error = match self.transport.send(topic, bytes.clone()).await {
            Ok(()) => {
                debug!(%kind, topic, id = %envelope.id, bytes = bytes.len(), "Event published");
                return Ok(());
            }
            Err(e) => e,
        };

        if let Some(outbox) = &self.outbox {
            if outbox.store(topic, &bytes, self.clock.now_millis())? {
                debug!(%kind, topic, error = %error, "Publish deferred to outbox");
                return Ok(());
            }
        }
        Err(error)
    }

    /// Resend stored messages, oldest first, stopping at the first failure
    pub async fn replay_outbox(&self) -> Result<usize, SendError> {
        let Some(outbox) = &self.outbox else {
            return Ok(0);
        };

        let mut sent = 0;
        for (key, message) in outbox.pending()? {
            self.transport
                .send(&message.topic, message.payload.into_bytes())
                .await?;
            outbox.remove(&key)?;
            sent += 1;
        }
        if sent > 0 {
            info!(sent, "Outbox replayed");
        }
        Ok(sent)
    }

    /// Replay the outbox whenever the connection epoch moves
    pub async fn run_replay_loop(self: Arc<Self>, mut epochs: watch::Receiver<u64>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = epochs.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.replay_outbox().await {
                warn!(error = %e, "Outbox replay stopped");
            }
        }
    }
}

#[async_trait]
impl Publisher for DataSender {
    async fn publish(&self, event: OutboundEvent) -> AgentResult<()> {
        self.send(event).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    use super::*;
    use crate::testing::ManualClock;

    const SECRET: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    #[derive(Default)]
    struct FakeBroker {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        down: Mutex<bool>,
    }

    #[async_trait]
    impl Transport for FakeBroker {
        async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), SendError> {
            if *self.down.lock() {
                return Err(SendError::Transport("not connected".to_string()));
            }
            self.sent.lock().push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn sender(broker: Arc<FakeBroker>) -> DataSender {
        let signer = LocalSigner::from_bytes(&hex::decode(SECRET).unwrap()).unwrap();
        DataSender::new(
            broker,
            Arc::new(signer),
            Arc::new(ManualClock::default()),
            EnvelopeBuilder::new("edge/agent", ADDRESS),
            Topics::default(),
        )
    }

    #[tokio::test]
    async fn test_publishes_signed_event_on_kind_topic() {
        let broker = Arc::new(FakeBroker::default());
        let state = Arc::new(AgentState::new());
        let sender = sender(broker.clone()).with_state(state.clone());

        sender
            .publish(OutboundEvent::new(EventKind::Fingerprint, json!({"vin": "1FTEW1CP3NKE68593"})))
            .await
            .unwrap();

        let sent = broker.sent.lock();
        assert_eq!(sent[0].0, "devices/fingerprint");
        assert!(verify_message(&sent[0].1, ADDRESS).unwrap());

        let envelope: Value = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(envelope["type"], "com.edge.device.fingerprint");
        assert_eq!(state.last_signature().as_deref(), envelope["signature"].as_str());
    }

    #[tokio::test]
    async fn test_vehicle_info_on_status_only() {
        let broker = Arc::new(FakeBroker::default());
        let sender = sender(broker.clone());
        sender.set_vehicle(Some(VehicleInfo {
            token_id: 7,
            make: "Honda".to_string(),
            model: "CR-V".to_string(),
            year: 2019,
        }));

        sender.publish(OutboundEvent::new(EventKind::Status, json!({}))).await.unwrap();
        sender.publish(OutboundEvent::new(EventKind::Network, json!({}))).await.unwrap();

        let sent = broker.sent.lock();
        let status: Value = serde_json::from_slice(&sent[0].1).unwrap();
        let network: Value = serde_json::from_slice(&sent[1].1).unwrap();
        assert_eq!(status["vehicleTokenID"], 7);
        assert!(network.get("vehicleTokenID").is_none());
    }

    #[tokio::test]
    async fn test_disabled_topic_is_an_error() {
        let broker = Arc::new(FakeBroker::default());
        let sender = DataSender::new(
            broker,
            Arc::new(LocalSigner::from_bytes(&hex::decode(SECRET).unwrap()).unwrap()),
            Arc::new(ManualClock::default()),
            EnvelopeBuilder::new("edge/agent", ADDRESS),
            Topics {
                dump: String::new(),
                ..Topics::default()
            },
        );
        let err = sender.send(OutboundEvent::new(EventKind::Dump, json!({}))).await.unwrap_err();
        assert!(matches!(err, SendError::NoTopic(_)));
    }

    #[tokio::test]
    async fn test_outbox_defers_and_replays() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(FakeBroker::default());
        let outbox = Arc::new(Outbox::open(dir.path(), 1).unwrap());
        let sender = sender(broker.clone()).with_outbox(outbox.clone());

        *broker.down.lock() = true;
        sender.publish(OutboundEvent::new(EventKind::Status, json!({"n": 1}))).await.unwrap();
        // Outbox full: the second message surfaces the transport error
        assert!(sender.publish(OutboundEvent::new(EventKind::Status, json!({"n": 2}))).await.is_err());
        assert_eq!(outbox.len().unwrap(), 1);

        // Replay stops at the first failure while still down
        assert!(sender.replay_outbox().await.is_err());

        *broker.down.lock() = false;
        assert_eq!(sender.replay_outbox().await.unwrap(), 1);
        assert_eq!(outbox.len().unwrap(), 0);

        let sent = broker.sent.lock();
        assert_eq!(sent[0].0, "devices/status");
        assert!(verify_message(&sent[0].1, ADDRESS).unwrap());
    }

    #[tokio::test]
    async fn test_replay_loop_follows_connection_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(FakeBroker::default());
        let outbox = Arc::new(Outbox::open(dir.path(), 10).unwrap());
        let sender = Arc::new(sender(broker.clone()).with_outbox(outbox.clone()));

        *broker.down.lock() = true;
        sender.publish(OutboundEvent::new(EventKind::Logs, json!({}))).await.unwrap();
        *broker.down.lock() = false;

        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(sender.clone().run_replay_loop(epoch_rx, shutdown_rx));

        epoch_tx.send(1).unwrap();
        let drained = edge_client::testing::wait_for(
            || {
                let outbox = outbox.clone();
                async move { outbox.len().map(|n| n == 0).unwrap_or(false) }
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(drained);
        assert_eq!(broker.sent.lock().len(), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
