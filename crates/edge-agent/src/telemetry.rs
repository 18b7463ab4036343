//! Location and network reporters
//!
//! Two small periodic loops beside the PID scheduler. GNSS fixes become
//! ordinary signal samples on the queue; radio state is published directly
//! as a network event.

use std::sync::Arc;
use std::time::Duration;

use edge_core::{AgentError, AgentResult, Clock, DeviceIo, EventKind, OutboundEvent, Publisher, SignalSample, Sink};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct LocationReporter {
    device: Arc<dyn DeviceIo>,
    sink: Arc<dyn Sink>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl LocationReporter {
    pub fn new(device: Arc<dyn DeviceIo>, sink: Arc<dyn Sink>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            device,
            sink,
            clock,
            interval,
        }
    }

    /// Read one fix and push its samples. Returns the number pushed.
    pub async fn report_once(&self) -> AgentResult<usize> {
        let Some(location) = self.device.location().await? else {
            debug!("No GNSS fix");
            return Ok(0);
        };

        let now = self.clock.now_millis();
        let mut samples = vec![
            SignalSample::new("latitude", now, location.latitude),
            SignalSample::new("longitude", now, location.longitude),
        ];
        if let Some(hdop) = location.hdop {
            samples.push(SignalSample::new("hdop", now, hdop));
        }
        if let Some(nsat) = location.nsat {
            samples.push(SignalSample::new("nsat", now, f64::from(nsat)));
        }

        let count = samples.len();
        for sample in samples {
            self.sink.push(sample);
        }
        Ok(count)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.report_once().await {
                Ok(_) => {}
                Err(AgentError::NotSupported(_)) => {
                    debug!("Hardware has no GNSS, location reporter stopping");
                    break;
                }
                Err(e) => warn!(error = %e, "Location read failed"),
            }
        }
    }
}

/// Radio state published on the network topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkPayload {
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi: Option<serde_json::Value>,
}

impl NetworkPayload {
    fn is_empty(&self) -> bool {
        self.signal.is_none() && self.modem.is_none() && self.wifi.is_none()
    }
}

pub struct NetworkReporter {
    device: Arc<dyn DeviceIo>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl NetworkReporter {
    pub fn new(
        device: Arc<dyn DeviceIo>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            device,
            publisher,
            clock,
            interval,
        }
    }

    /// Collect whatever the radios report. Unsupported readings are left out.
    pub async fn collect(&self) -> NetworkPayload {
        NetworkPayload {
            timestamp: self.clock.now_millis(),
            signal: optional("modem_signal", self.device.modem_signal().await),
            modem: optional("modem_kind", self.device.modem_kind().await),
            wifi: optional("wifi_status", self.device.wifi_status().await),
        }
    }

    /// Publish one network event; false when the hardware reported nothing
    pub async fn report_once(&self) -> AgentResult<bool> {
        let payload = self.collect().await;
        if payload.is_empty() {
            return Ok(false);
        }
        let event = OutboundEvent::from_payload(EventKind::Network, &payload)
            .map_err(|e| AgentError::Internal(e.to_string()))?;
        self.publisher.publish(event).await?;
        Ok(true)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.report_once().await {
                warn!(error = %e, "Network report failed");
            }
        }
    }
}

fn optional<T>(reading: &str, result: AgentResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(AgentError::NotSupported(_)) => None,
        Err(e) => {
            debug!(reading, error = %e, "Radio reading failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use edge_core::Location;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::queue::SignalQueue;
    use crate::testing::{ManualClock, MockDeviceIo, NetworkReadings, RecordingPublisher};

    #[tokio::test]
    async fn test_location_samples() {
        let device = Arc::new(MockDeviceIo::new());
        device.set_location(Some(Location {
            latitude: 52.52,
            longitude: 13.405,
            hdop: Some(0.9),
            nsat: None,
        }));
        let queue = Arc::new(SignalQueue::new(16));
        let reporter = LocationReporter::new(device, queue.clone(), Arc::new(ManualClock::default()), Duration::from_secs(20));

        assert_eq!(reporter.report_once().await.unwrap(), 3);
        let names: Vec<_> = queue.drain().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["latitude", "longitude", "hdop"]);
    }

    #[tokio::test]
    async fn test_no_fix_pushes_nothing() {
        let queue = Arc::new(SignalQueue::new(16));
        let reporter = LocationReporter::new(
            Arc::new(MockDeviceIo::new()),
            queue.clone(),
            Arc::new(ManualClock::default()),
            Duration::from_secs(20),
        );
        assert_eq!(reporter.report_once().await.unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_network_event() {
        let device = Arc::new(MockDeviceIo::new());
        device.set_network(Some(NetworkReadings {
            signal: json!({"rssi": -71}),
            modem: "ec25".to_string(),
            wifi: json!({"connected": false}),
        }));
        let publisher = Arc::new(RecordingPublisher::new());
        let reporter = NetworkReporter::new(device, publisher.clone(), Arc::new(ManualClock::default()), Duration::from_secs(60));

        assert!(reporter.report_once().await.unwrap());
        let events = publisher.of_kind(EventKind::Network);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["modem"], "ec25");
        assert_eq!(events[0].data["signal"]["rssi"], -71);
    }

    #[tokio::test]
    async fn test_unsupported_radios_publish_nothing() {
        let publisher = Arc::new(RecordingPublisher::new());
        let reporter = NetworkReporter::new(
            Arc::new(MockDeviceIo::new()),
            publisher.clone(),
            Arc::new(ManualClock::default()),
            Duration::from_secs(60),
        );
        assert!(!reporter.report_once().await.unwrap());
        assert!(publisher.events().is_empty());
    }
}
