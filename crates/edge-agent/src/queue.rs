//! Signal queue
//!
//! Bounded in-memory buffer between the producers (scheduler, passive
//! listener, location reporter) and the data sender. A flush drains the
//! buffer in one critical section and puts the samples back at the front if
//! the publish fails, so a cycle either hands everything over or loses
//! nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use edge_core::{AgentError, AgentResult, Clock, EventKind, OutboundEvent, Publisher, SignalSample, Sink, StatusPayload};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Default number of samples held before the oldest are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

#[derive(Default)]
struct QueueState {
    samples: VecDeque<SignalSample>,
    last_checked: HashMap<String, i64>,
    failures: HashMap<String, u32>,
    dropped: u64,
}

impl QueueState {
    fn trim_to(&mut self, capacity: usize) {
        while self.samples.len() > capacity {
            self.samples.pop_front();
            self.dropped += 1;
        }
    }
}

pub struct SignalQueue {
    state: Mutex<QueueState>,
    capacity: usize,
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl SignalQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn enqueue(&self, sample: SignalSample) {
        let mut state = self.state.lock();
        state.last_checked.insert(sample.name.clone(), sample.timestamp);
        state.samples.push_back(sample);
        if state.samples.len() > self.capacity {
            state.trim_to(self.capacity);
            warn!(capacity = self.capacity, dropped = state.dropped, "Signal queue full, dropping oldest");
        }
    }

    /// Remove and return every buffered sample, oldest first
    pub fn drain(&self) -> Vec<SignalSample> {
        self.state.lock().samples.drain(..).collect()
    }

    /// Put drained samples back in front of anything enqueued since
    pub fn restore(&self, samples: Vec<SignalSample>) {
        let mut state = self.state.lock();
        for sample in samples.into_iter().rev() {
            state.samples.push_front(sample);
        }
        state.trim_to(self.capacity);
    }

    pub fn contains(&self, sample: &SignalSample) -> bool {
        self.state.lock().samples.iter().any(|s| s == sample)
    }

    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples dropped because the buffer was full
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Publish everything buffered as one status event.
    ///
    /// Returns the number of samples handed over. On failure the samples are
    /// back in the queue and the publisher's error is returned.
    pub async fn flush(&self, publisher: &dyn Publisher, clock: &dyn Clock, software_version: &str) -> AgentResult<usize> {
        let signals = self.drain();
        if signals.is_empty() {
            return Ok(0);
        }

        let payload = StatusPayload {
            timestamp: clock.now_millis(),
            software_version: software_version.to_string(),
            signals,
        };
        let event = match OutboundEvent::from_payload(EventKind::Status, &payload) {
            Ok(event) => event,
            Err(e) => {
                self.restore(payload.signals);
                return Err(AgentError::Internal(e.to_string()));
            }
        };

        match publisher.publish(event).await {
            Ok(()) => {
                debug!(samples = payload.signals.len(), "Flushed signal queue");
                Ok(payload.signals.len())
            }
            Err(e) => {
                self.restore(payload.signals);
                Err(e)
            }
        }
    }

    /// Flush every `interval` until shutdown, then once more
    pub async fn run_flush_loop(
        self: Arc<Self>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        software_version: String,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let stopping = tokio::select! {
                _ = ticker.tick() => false,
                _ = shutdown.changed() => true,
            };

            if let Err(e) = self.flush(publisher.as_ref(), clock.as_ref(), &software_version).await {
                error!(
                    forward = true,
                    log_after = 3u64,
                    stop_after = 10u64,
                    error = %e,
                    pending = self.len(),
                    "Signal flush failed"
                );
            }

            if stopping {
                break;
            }
        }
    }
}

impl Sink for SignalQueue {
    fn push(&self, sample: SignalSample) {
        self.enqueue(sample);
    }

    fn last_checked(&self, name: &str) -> Option<i64> {
        self.state.lock().last_checked.get(name).copied()
    }

    fn failure_count(&self, name: &str) -> u32 {
        self.state.lock().failures.get(name).copied().unwrap_or(0)
    }

    fn increment_failure(&self, name: &str) -> u32 {
        let mut state = self.state.lock();
        let count = state.failures.entry(name.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}
