//! Short-lived MQTT uplink for `--send`
//!
//! Same signer, topics and outbox as the daemon. When the broker cannot be
//! reached in time, messages land in the outbox and `edged` replays them on
//! its next connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use edge_agent::{AgentConfig, DataSender, EnvelopeBuilder, MqttTransport, Outbox, StoreKind};
use edge_client::DeviceIoClient;
use edge_core::{Signer, SystemClock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to wait for the first CONNACK
const CONNECT_WAIT: Duration = Duration::from_secs(10);

/// Time the event loop gets to write queued publishes before disconnecting
const DRAIN_WAIT: Duration = Duration::from_millis(500);

pub struct Uplink {
    sender: Arc<DataSender>,
    shutdown: watch::Sender<bool>,
    connection: JoinHandle<()>,
}

impl Uplink {
    pub async fn connect(config: &AgentConfig, signer: Arc<dyn Signer>) -> Result<Self> {
        let address = signer
            .ethereum_address()
            .await
            .context("Failed to read device address")?;

        let mut settings = config.mqtt_settings(config.template_dir().join(StoreKind::Certificate.file_name()));
        // Distinct session so the daemon's connection is not taken over
        settings.client_id = format!("{}-cli", settings.client_id);

        let (transport, connection, mut epochs) = MqttTransport::new(&settings).context("Failed to configure MQTT")?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connection = tokio::spawn(connection.run(shutdown_rx));

        match tokio::time::timeout(CONNECT_WAIT, epochs.changed()).await {
            Ok(Ok(())) => debug!(host = %settings.host, address = %address, "Uplink connected"),
            _ => warn!(host = %settings.host, "Broker unreachable, messages go to the outbox"),
        }

        let outbox = Outbox::open(config.outbox_dir(), config.mqtt.outbox_max_keys).context("Failed to open outbox")?;
        let sender = DataSender::new(
            Arc::new(transport),
            signer,
            Arc::new(SystemClock),
            EnvelopeBuilder::new(&config.services.event_source, &address),
            config.mqtt.topics.clone(),
        )
        .with_outbox(Arc::new(outbox));

        Ok(Self {
            sender: Arc::new(sender),
            shutdown,
            connection,
        })
    }

    /// Build the uplink from the hardware RPC named in the config
    pub async fn from_config(config: &AgentConfig) -> Result<Self> {
        let dongle = DeviceIoClient::new(&config.device.rpc_url, &config.device.serial)
            .context("Failed to create hardware RPC client")?;
        Self::connect(config, Arc::new(dongle)).await
    }

    pub fn sender(&self) -> Arc<DataSender> {
        self.sender.clone()
    }

    pub async fn close(self) {
        tokio::time::sleep(DRAIN_WAIT).await;
        let _ = self.shutdown.send(true);
        if let Err(e) = self.connection.await {
            warn!(error = %e, "MQTT connection task failed");
        }
    }
}
