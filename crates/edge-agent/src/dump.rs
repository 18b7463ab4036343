//! Raw frame dump for remote formula analysis
//!
//! While the `can_dump` job is due, the scheduler hands over the raw frames
//! of script-formula requests (at most two captures per request name). Once
//! nothing new has been captured for the idle window the collection goes out
//! as one dump event and the job is marked done. It comes due again 30 days
//! after the last successful send.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use edge_core::{AgentError, AgentResult, Clock, EventKind, OutboundEvent, PidRequest, Publisher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::{TemplateStore, CAN_DUMP_JOB};

/// Days between two dump runs
pub const DUMP_REPEAT_DAYS: i64 = 30;

/// Captures kept per request name
pub const MAX_CAPTURES_PER_SIGNAL: usize = 2;

/// Quiet period after the last capture before the dump is sent
pub const DUMP_IDLE_FLUSH: Duration = Duration::from_secs(180);

/// Raw response frames for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpCapture {
    pub timestamp: i64,
    pub header: u32,
    pub mode: u32,
    pub pid: u32,
    pub formula: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpPayload {
    pub timestamp: i64,
    pub captures: BTreeMap<String, Vec<DumpCapture>>,
}

#[derive(Default)]
struct DumpState {
    active: bool,
    /// A flush holds the captures; nothing new is collected meanwhile
    sending: bool,
    captures: BTreeMap<String, Vec<DumpCapture>>,
    last_capture: Option<DateTime<Utc>>,
}

pub struct DumpJob {
    store: Arc<TemplateStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<DumpState>,
}

impl DumpJob {
    /// Load the job marker and decide whether this boot collects frames
    pub fn new(store: Arc<TemplateStore>, clock: Arc<dyn Clock>) -> Self {
        let last_done = store.read_job_done(CAN_DUMP_JOB).unwrap_or_else(|e| {
            warn!(error = %e, "Unreadable dump marker, treating as never run");
            None
        });
        let active = is_due(last_done, clock.now());
        debug!(active, last_done = ?last_done, "Dump job loaded");

        Self {
            store,
            clock,
            state: Mutex::new(DumpState {
                active,
                ..DumpState::default()
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Whether another capture of `name` is wanted
    pub fn wants(&self, name: &str) -> bool {
        let state = self.state.lock();
        state.active && !state.sending && state.captures.get(name).map_or(0, Vec::len) < MAX_CAPTURES_PER_SIGNAL
    }

    /// Keep the raw lines of one response
    pub fn record(&self, request: &PidRequest, lines: &[String]) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.active || state.sending {
            return;
        }
        let captures = state.captures.entry(request.name.clone()).or_default();
        if captures.len() >= MAX_CAPTURES_PER_SIGNAL {
            return;
        }
        captures.push(DumpCapture {
            timestamp: now.timestamp_millis(),
            header: request.header,
            mode: request.mode,
            pid: request.pid,
            formula: request.formula.clone(),
            lines: lines.to_vec(),
        });
        state.last_capture = Some(now);
    }

    /// Captured something and has been idle for the flush window
    pub fn ready_to_flush(&self) -> bool {
        Self::is_ready(&self.state.lock(), self.clock.now())
    }

    fn is_ready(state: &DumpState, now: DateTime<Utc>) -> bool {
        let idle = chrono::Duration::from_std(DUMP_IDLE_FLUSH).unwrap_or_else(|_| chrono::Duration::zero());
        state.active
            && !state.sending
            && !state.captures.is_empty()
            && state
                .last_capture
                .is_some_and(|last| now - last >= idle)
    }

    /// Send the collected captures and mark the job done.
    ///
    /// Returns false when there was nothing ready. A failed publish keeps
    /// the captures for the next attempt.
    pub async fn flush(&self, publisher: &dyn Publisher) -> AgentResult<bool> {
        let now = self.clock.now();
        let captures = {
            let mut state = self.state.lock();
            if !Self::is_ready(&state, now) {
                return Ok(false);
            }
            state.sending = true;
            std::mem::take(&mut state.captures)
        };
        let payload = DumpPayload {
            timestamp: now.timestamp_millis(),
            captures,
        };
        let published = match serde_json::to_value(&payload) {
            Ok(data) => publisher.publish(OutboundEvent::new(EventKind::Dump, data)).await,
            Err(e) => Err(AgentError::Internal(e.to_string())),
        };

        if let Err(e) = published {
            let mut state = self.state.lock();
            state.sending = false;
            for (name, mut kept) in payload.captures {
                let slot = state.captures.entry(name).or_default();
                kept.append(slot);
                kept.truncate(MAX_CAPTURES_PER_SIGNAL);
                *slot = kept;
            }
            return Err(e);
        }

        let marked = self.store.mark_job_done(CAN_DUMP_JOB, now);
        {
            let mut state = self.state.lock();
            state.active = false;
            state.sending = false;
        }
        info!(signals = payload.captures.len(), "CAN dump sent");
        marked?;
        Ok(true)
    }

    /// Check for a ready dump every `interval` until sent or shut down
    pub async fn run(self: Arc<Self>, publisher: Arc<dyn Publisher>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        while self.is_active() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.flush(publisher.as_ref()).await {
                warn!(error = %e, "CAN dump flush failed");
            }
        }
    }
}

/// A job is due when it never ran or ran at least [`DUMP_REPEAT_DAYS`] ago
pub fn is_due(last_done: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_done {
        None => true,
        Some(at) => now - at >= chrono::Duration::days(DUMP_REPEAT_DAYS),
    }
}
