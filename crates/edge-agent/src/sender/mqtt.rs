//! MQTT transport
//!
//! One long-lived `rumqttc` client. The event loop runs in its own task
//! ([`MqttConnection::run`]); it tracks whether the broker session is up and
//! bumps a connection epoch on every ConnAck so the sender can replay its
//! outbox after a reconnect.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport as MqttWire};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::Transport;
use crate::error::SendError;

/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 64;

/// Client certificate material
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// 0, 1 or 2
    pub qos: u8,
    pub publish_timeout: Duration,
    pub reconnect_delay: Duration,
    pub tls: Option<TlsFiles>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "edge-agent".to_string(),
            keep_alive: Duration::from_secs(30),
            qos: 0,
            publish_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            tls: None,
        }
    }
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    qos: QoS,
    publish_timeout: Duration,
}

/// Drives the MQTT event loop
pub struct MqttConnection {
    eventloop: EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    epoch: watch::Sender<u64>,
    reconnect_delay: Duration,
}

impl MqttTransport {
    /// Build the client. Nothing touches the network until
    /// [`MqttConnection::run`] polls the event loop.
    pub fn new(settings: &MqttSettings) -> Result<(Self, MqttConnection, watch::Receiver<u64>), SendError> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);

        if let Some(tls) = &settings.tls {
            let read = |path: &PathBuf| {
                std::fs::read(path).map_err(|e| SendError::Transport(format!("{}: {}", path.display(), e)))
            };
            options.set_transport(MqttWire::tls_with_config(TlsConfiguration::Simple {
                ca: read(&tls.ca)?,
                alpn: None,
                client_auth: Some((read(&tls.cert)?, read(&tls.key)?)),
            }));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let (epoch, epochs) = watch::channel(0);

        let transport = Self {
            client: client.clone(),
            connected: connected.clone(),
            qos: qos_from_level(settings.qos),
            publish_timeout: settings.publish_timeout,
        };
        let connection = MqttConnection {
            eventloop,
            client,
            connected,
            epoch,
            reconnect_delay: settings.reconnect_delay,
        };
        Ok((transport, connection, epochs))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::Transport("not connected".to_string()));
        }
        match tokio::time::timeout(self.publish_timeout, self.client.publish(topic, self.qos, false, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendError::Transport(e.to_string())),
            Err(_) => Err(SendError::Timeout),
        }
    }
}

impl MqttConnection {
    /// Poll the event loop until shutdown, reconnecting after errors
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                event = self.eventloop.poll() => event,
                _ = shutdown.changed() => break,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    self.connected.store(true, Ordering::SeqCst);
                    self.epoch.send_modify(|epoch| *epoch += 1);
                    info!(code = ?ack.code, "MQTT connected");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    warn!("MQTT broker closed the session");
                }
                Ok(other) => debug!(event = ?other, "MQTT event"),
                Err(e) => {
                    let was_connected = self.connected.swap(false, Ordering::SeqCst);
                    if was_connected {
                        warn!(error = %e, "MQTT connection lost");
                    } else {
                        debug!(error = %e, "MQTT connect failed");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "MQTT disconnect request failed");
        }
        info!("MQTT connection stopped");
    }
}
