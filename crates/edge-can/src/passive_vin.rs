//! Passive VIN discovery
//!
//! Some vehicle families broadcast their VIN unprompted. The scan filters
//! the socket down to the configured ids, feeds every frame to one
//! assembler per layout and stops at the first complete VIN, the frame
//! budget, or the wall-clock timeout, whichever comes first.

use std::time::Duration;

use edge_core::{Vin, VIN_LENGTH};
use tracing::{debug, info};

use crate::config::{ResolvedLayout, ScanLimits};
use crate::error::TransportError;
use crate::source::{CanFrameSource, RawFrame};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SEQUENCE_SLOTS: usize = 3;

/// VIN recovered from broadcast traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassiveVin {
    pub vin: Vin,
    pub layout: &'static str,
    pub frames_seen: usize,
}

/// Collects VIN fragments for one layout
#[derive(Debug)]
pub struct VinAssembler {
    layout: ResolvedLayout,
    slots: [Option<Vec<u8>>; SEQUENCE_SLOTS],
}

impl VinAssembler {
    pub fn new(layout: ResolvedLayout) -> Self {
        Self {
            layout,
            slots: Default::default(),
        }
    }

    pub fn layout_name(&self) -> &'static str {
        match self.layout {
            ResolvedLayout::Standard { .. } => "standard",
            ResolvedLayout::Extended { .. } => "extended",
        }
    }

    /// Offer a frame; returns the VIN once all fragments are present and valid
    pub fn offer(&mut self, frame: &RawFrame) -> Option<Vin> {
        match self.layout {
            ResolvedLayout::Standard { ids } => {
                if frame.extended {
                    return None;
                }
                let slot = ids.iter().position(|id| *id == frame.id)?;
                self.slots[slot] = Some(frame.data.clone());
            }
            ResolvedLayout::Extended { id } => {
                if !frame.extended || frame.id != id {
                    return None;
                }
                let (seq, fragment) = frame.data.split_first()?;
                let slot = *seq as usize;
                if slot >= SEQUENCE_SLOTS {
                    debug!(seq, "Ignoring out-of-range VIN sequence byte");
                    return None;
                }
                self.slots[slot] = Some(fragment.to_vec());
            }
        }
        self.assemble()
    }

    fn assemble(&self) -> Option<Vin> {
        let mut chars = String::with_capacity(VIN_LENGTH);
        for slot in &self.slots {
            let fragment = slot.as_ref()?;
            chars.extend(
                fragment
                    .iter()
                    .filter(|b| b.is_ascii_alphanumeric())
                    .map(|b| *b as char),
            );
        }
        if chars.len() < VIN_LENGTH {
            return None;
        }
        Vin::parse(&chars[..VIN_LENGTH]).ok()
    }
}

/// Listen for a broadcast VIN on any of `layouts`.
///
/// Returns `Ok(None)` when the timeout or frame budget is exhausted.
pub async fn scan_passive_vin(
    source: &mut dyn CanFrameSource,
    layouts: &[ResolvedLayout],
    limits: ScanLimits,
) -> Result<Option<PassiveVin>, TransportError> {
    if layouts.is_empty() {
        return Ok(None);
    }

    let filters: Vec<_> = layouts.iter().flat_map(|l| l.filters()).collect();
    source.set_filters(&filters)?;

    info!(
        interface = %source.interface(),
        layouts = layouts.len(),
        timeout_secs = limits.timeout.as_secs(),
        frame_budget = limits.frame_budget,
        "Starting passive VIN scan"
    );

    let mut assemblers: Vec<VinAssembler> = layouts.iter().copied().map(VinAssembler::new).collect();
    let outcome = tokio::time::timeout(limits.timeout, collect(source, &mut assemblers, limits.frame_budget)).await;

    // Leave the socket unfiltered for the next owner
    source.set_filters(&[])?;

    match outcome {
        Ok(result) => result,
        Err(_) => {
            info!("Passive VIN scan timed out");
            Ok(None)
        }
    }
}

async fn collect(
    source: &mut dyn CanFrameSource,
    assemblers: &mut [VinAssembler],
    frame_budget: usize,
) -> Result<Option<PassiveVin>, TransportError> {
    let mut frames_seen = 0usize;

    while frames_seen < frame_budget {
        let Some(frame) = source.recv(POLL_INTERVAL).await? else {
            continue;
        };
        frames_seen += 1;

        for assembler in assemblers.iter_mut() {
            if let Some(vin) = assembler.offer(&frame) {
                info!(vin = %vin, layout = assembler.layout_name(), frames_seen, "Passive VIN found");
                return Ok(Some(PassiveVin {
                    vin,
                    layout: assembler.layout_name(),
                    frames_seen,
                }));
            }
        }
    }

    info!(frames_seen, "Passive VIN scan exhausted its frame budget");
    Ok(None)
}
