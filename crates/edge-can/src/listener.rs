//! Passive CAN listener
//!
//! Decodes broadcast frames against the signal database fetched with the
//! template and pushes the values into the sample sink. Each signal is
//! rate-limited through [`Sink::last_checked`] so a 100 Hz broadcast does
//! not flood the queue.

use std::sync::Arc;
use std::time::Duration;

use edge_conv::SignalDatabase;
use edge_core::{Clock, SignalSample, Sink};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::FrameFilter;
use crate::error::TransportError;
use crate::source::{CanFrameSource, RawFrame};

/// Counters for one listening window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenStats {
    pub frames: usize,
    pub samples: usize,
    pub failures: usize,
}

pub struct PassiveListener {
    database: SignalDatabase,
    sink: Arc<dyn Sink>,
    clock: Arc<dyn Clock>,
    sample_interval: Duration,
}

impl PassiveListener {
    pub fn new(database: SignalDatabase, sink: Arc<dyn Sink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            database,
            sink,
            clock,
            sample_interval: Duration::from_secs(1),
        }
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.database.is_empty()
    }

    /// Kernel filters covering every database message
    pub fn filters(&self) -> Vec<FrameFilter> {
        self.database
            .messages()
            .map(|m| FrameFilter {
                id: m.id,
                extended: m.extended,
            })
            .collect()
    }

    /// Decode one frame into the sink
    pub fn handle_frame(&self, frame: &RawFrame, stats: &mut ListenStats) {
        let Some(message) = self.database.message(frame.id) else {
            return;
        };
        if message.extended != frame.extended {
            return;
        }

        let now = self.clock.now_millis();
        let interval = self.sample_interval.as_millis() as i64;

        for (name, result) in message.decode(&frame.data) {
            match result {
                Ok(decoded) => {
                    if let Some(last) = self.sink.last_checked(name) {
                        if now - last < interval {
                            continue;
                        }
                    }
                    trace!(signal = name, value = decoded.value, unit = %decoded.unit, "Passive sample");
                    self.sink.push(SignalSample::new(name, now, decoded.value));
                    stats.samples += 1;
                }
                Err(e) => {
                    let failures = self.sink.increment_failure(name);
                    debug!(signal = name, failures, error = %e, "Failed to decode passive signal");
                    stats.failures += 1;
                }
            }
        }
    }

    /// Own the source for `window`, decoding everything that arrives
    pub async fn listen(
        &self,
        source: &mut dyn CanFrameSource,
        window: Duration,
    ) -> Result<ListenStats, TransportError> {
        let mut stats = ListenStats::default();
        if self.is_empty() {
            return Ok(stats);
        }

        source.set_filters(&self.filters())?;
        let deadline = Instant::now() + window;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if let Some(frame) = source.recv(remaining).await? {
                stats.frames += 1;
                self.handle_frame(&frame, &mut stats);
            }
        }

        source.set_filters(&[])?;
        debug!(
            frames = stats.frames,
            samples = stats.samples,
            failures = stats.failures,
            "Passive listening window complete"
        );
        Ok(stats)
    }
}
