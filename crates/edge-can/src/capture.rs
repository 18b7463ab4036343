//! Raw frame capture for dump tooling

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::FrameFilter;
use crate::error::TransportError;
use crate::source::{CanFrameSource, RawFrame};

/// Collect up to `max_frames` frames or until `window` elapses
pub async fn capture_frames(
    source: &mut dyn CanFrameSource,
    filters: &[FrameFilter],
    max_frames: usize,
    window: Duration,
) -> Result<Vec<RawFrame>, TransportError> {
    source.set_filters(filters)?;

    let deadline = Instant::now() + window;
    let mut frames = Vec::with_capacity(max_frames.min(4096));
    while frames.len() < max_frames {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if let Some(frame) = source.recv(remaining).await? {
            frames.push(frame);
        }
    }

    source.set_filters(&[])?;
    debug!(interface = %source.interface(), captured = frames.len(), "Capture complete");
    Ok(frames)
}

/// `(1690000000.123) can0 7E8#0641A6` log lines
pub fn candump_lines(interface: &str, frames: &[RawFrame]) -> Vec<String> {
    frames
        .iter()
        .map(|f| {
            format!(
                "({}.{:03}) {} {}",
                f.timestamp.div_euclid(1000),
                f.timestamp.rem_euclid(1000),
                interface,
                f.to_candump()
            )
        })
        .collect()
}
