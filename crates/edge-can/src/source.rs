//! Frame source abstraction
//!
//! A [`CanFrameSource`] yields raw frames from the bus. Sources are shared
//! as a [`SharedFrameSource`]; holding the lock is what makes a consumer the
//! single owner of the socket.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::FrameFilter;
use crate::error::TransportError;

/// One received CAN frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
    /// Unix milliseconds at receive time
    pub timestamp: i64,
}

impl RawFrame {
    pub fn new(id: u32, data: &[u8]) -> Self {
        Self {
            id,
            extended: id > 0x7FF,
            data: data.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// `7E8#0641A60008B242` in candump compact form
    pub fn to_candump(&self) -> String {
        if self.extended {
            format!("{:08X}#{}", self.id, hex::encode_upper(&self.data))
        } else {
            format!("{:03X}#{}", self.id, hex::encode_upper(&self.data))
        }
    }
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_candump())
    }
}

/// Anything that yields CAN frames
#[async_trait]
pub trait CanFrameSource: Send {
    /// Wait up to `timeout` for the next frame; `None` when the wait elapsed
    async fn recv(&mut self, timeout: Duration) -> Result<Option<RawFrame>, TransportError>;

    /// Restrict delivery to the given ids; an empty slice accepts everything
    fn set_filters(&mut self, filters: &[FrameFilter]) -> Result<(), TransportError>;

    /// Interface name for logging
    fn interface(&self) -> &str;
}

/// A source with exclusive-access semantics
pub type SharedFrameSource = Arc<tokio::sync::Mutex<dyn CanFrameSource>>;

/// Wrap a source for sharing between the listener and the fingerprint scan
pub fn shared<S: CanFrameSource + 'static>(source: S) -> SharedFrameSource {
    Arc::new(tokio::sync::Mutex::new(source))
}

/// Scripted frames for tests and offline tooling
#[derive(Clone, Default)]
pub struct MockFrameSource {
    frames: Arc<Mutex<VecDeque<RawFrame>>>,
    filters: Vec<FrameFilter>,
}

impl MockFrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_frames(frames: impl IntoIterator<Item = RawFrame>) -> Self {
        Self {
            frames: Arc::new(Mutex::new(frames.into_iter().collect())),
            filters: Vec::new(),
        }
    }

    /// Queue a frame; clones of this source share the queue
    pub fn push(&self, frame: RawFrame) {
        self.frames.lock().push_back(frame);
    }

    pub fn remaining(&self) -> usize {
        self.frames.lock().len()
    }

    fn accepts(&self, frame: &RawFrame) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(frame.id, frame.extended))
    }
}

#[async_trait]
impl CanFrameSource for MockFrameSource {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<RawFrame>, TransportError> {
        loop {
            let next = self.frames.lock().pop_front();
            match next {
                Some(frame) if self.accepts(&frame) => return Ok(Some(frame)),
                Some(_) => continue,
                None => {
                    tokio::time::sleep(timeout).await;
                    return Ok(None);
                }
            }
        }
    }

    fn set_filters(&mut self, filters: &[FrameFilter]) -> Result<(), TransportError> {
        self.filters = filters.to_vec();
        Ok(())
    }

    fn interface(&self) -> &str {
        "mock"
    }
}
