//! Narrow interfaces between pipeline stages
//!
//! The scheduler depends only on [`Sink`], the queue flush depends only on
//! [`Publisher`], and everything time-dependent reads a [`Clock`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AgentResult;
use crate::models::{OutboundEvent, SignalSample};

/// Accepts outbound events
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: OutboundEvent) -> AgentResult<()>;
}

/// Accepts decoded samples and keeps per-signal bookkeeping
pub trait Sink: Send + Sync {
    /// Append a sample
    fn push(&self, sample: SignalSample);

    /// Timestamp (unix millis) of the last sample accepted for `name`
    fn last_checked(&self, name: &str) -> Option<i64>;

    /// Failures recorded for `name`
    fn failure_count(&self, name: &str) -> u32;

    /// Record one failure for `name`, returning the new count
    fn increment_failure(&self, name: &str) -> u32;
}

/// Wall-clock source
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// The real clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
