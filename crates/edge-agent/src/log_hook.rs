//! Forward selected error logs to the bus
//!
//! [`BusForwardLayer`] is a `tracing` layer. It picks up ERROR events that
//! carry `fatal = true` (always forwarded) or `forward = true` (forwarded
//! subject to per-callsite thresholds):
//!
//! ```ignore
//! tracing::error!(forward = true, log_after = 3u64, stop_after = 10u64, error = %e, "Scheduler cycle failed");
//! ```
//!
//! `log_after` skips the first N-1 occurrences and `stop_after` caps the
//! number of events a callsite may emit. The layer never blocks: payloads
//! go over an unbounded channel to a [`LogForwarder`] task that publishes
//! them on the logs topic.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use edge_core::{ErrorPayload, EventKind, OutboundEvent, Publisher};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::callsite::Identifier;
use tracing::field::{Field, Visit};
use tracing::{debug, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

const FATAL_FIELD: &str = "fatal";
const FORWARD_FIELD: &str = "forward";
const LOG_AFTER_FIELD: &str = "log_after";
const STOP_AFTER_FIELD: &str = "stop_after";

/// Build an error event for the logs topic
pub fn error_event(
    target: &str,
    message: impl Into<String>,
    timestamp: i64,
    software_version: Option<&str>,
) -> OutboundEvent {
    let payload = ErrorPayload {
        timestamp,
        level: "error".to_string(),
        target: target.to_string(),
        message: message.into(),
        fields: Map::new(),
        software_version: software_version.map(str::to_string),
    };
    OutboundEvent::new(EventKind::Logs, serde_json::to_value(payload).unwrap_or_default())
}

#[derive(Debug, Default, Clone, Copy)]
struct CallsiteCount {
    occurrences: u64,
    emitted: u64,
}

/// `tracing` layer that promotes marked errors to bus events
pub struct BusForwardLayer {
    tx: mpsc::UnboundedSender<ErrorPayload>,
    counts: Mutex<HashMap<Identifier, CallsiteCount>>,
    software_version: Option<String>,
}

impl BusForwardLayer {
    pub fn new(software_version: Option<String>) -> (Self, LogForwarder) {
        let (tx, rx) = mpsc::unbounded_channel();
        let layer = Self {
            tx,
            counts: Mutex::new(HashMap::new()),
            software_version,
        };
        (layer, LogForwarder { rx })
    }

    /// Apply the callsite thresholds; true when this occurrence is emitted
    fn admit(&self, callsite: Identifier, log_after: u64, stop_after: u64) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(callsite).or_default();
        count.occurrences += 1;

        if count.occurrences < log_after {
            return false;
        }
        if stop_after > 0 && count.emitted >= stop_after {
            return false;
        }
        count.emitted += 1;
        true
    }
}

impl<S: Subscriber> Layer<S> for BusForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() != Level::ERROR {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        if !fields.fatal {
            if !fields.forward {
                return;
            }
            if !self.admit(metadata.callsite(), fields.log_after, fields.stop_after) {
                return;
            }
        }

        let payload = ErrorPayload {
            timestamp: Utc::now().timestamp_millis(),
            level: if fields.fatal { "fatal" } else { "error" }.to_string(),
            target: metadata.target().to_string(),
            message: fields.message,
            fields: fields.extra,
            software_version: self.software_version.clone(),
        };
        // Receiver gone means we are shutting down
        let _ = self.tx.send(payload);
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fatal: bool,
    forward: bool,
    log_after: u64,
    stop_after: u64,
    extra: Map<String, Value>,
}

impl Visit for FieldCollector {
    fn record_bool(&mut self, field: &Field, value: bool) {
        match field.name() {
            FATAL_FIELD => self.fatal = value,
            FORWARD_FIELD => self.forward = value,
            name => {
                self.extra.insert(name.to_string(), Value::Bool(value));
            }
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            LOG_AFTER_FIELD => self.log_after = value,
            STOP_AFTER_FIELD => self.stop_after = value,
            name => {
                self.extra.insert(name.to_string(), Value::from(value));
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        match field.name() {
            LOG_AFTER_FIELD => self.log_after = value.max(0) as u64,
            STOP_AFTER_FIELD => self.stop_after = value.max(0) as u64,
            name => {
                self.extra.insert(name.to_string(), Value::from(value));
            }
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.extra.insert(field.name().to_string(), Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.extra.insert(field.name().to_string(), Value::from(value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.extra
                .insert(field.name().to_string(), Value::from(format!("{:?}", value)));
        }
    }
}

/// Receiving end of [`BusForwardLayer`]
pub struct LogForwarder {
    rx: mpsc::UnboundedReceiver<ErrorPayload>,
}

impl LogForwarder {
    /// Next queued payload without waiting
    pub fn try_next(&mut self) -> Option<ErrorPayload> {
        self.rx.try_recv().ok()
    }

    /// Publish payloads until shutdown or until the layer is dropped
    pub async fn run(mut self, publisher: Arc<dyn Publisher>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let payload = tokio::select! {
                payload = self.rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            let event = match OutboundEvent::from_payload(EventKind::Logs, &payload) {
                Ok(event) => event,
                Err(e) => {
                    debug!(error = %e, "Dropping unserializable log payload");
                    continue;
                }
            };
            // Failures here are logged below ERROR so they cannot loop back
            if let Err(e) = publisher.publish(event).await {
                debug!(error = %e, message = %payload.message, "Failed to forward log event");
            }
        }
    }
}
