//! CAN interface and passive scan configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// CAN interface settings (`[can]` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanConfig {
    /// CAN interface name (e.g., "can0")
    #[serde(default = "default_interface")]
    pub interface: String,
    /// CAN bus bitrate
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Family layouts tried by the passive VIN scan, in order
    #[serde(default = "default_layouts")]
    pub passive_vin: Vec<PassiveVinLayout>,
    /// Wall-clock bound of one passive VIN scan (seconds)
    #[serde(default = "default_scan_timeout_secs")]
    pub passive_scan_timeout_secs: u64,
    /// Frames inspected before a passive VIN scan gives up
    #[serde(default = "default_frame_budget")]
    pub passive_frame_budget: usize,
    /// How long the passive listener holds the socket per scheduler cycle (ms)
    #[serde(default = "default_listen_window_ms")]
    pub listen_window_ms: u64,
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_bitrate() -> u32 {
    500000
}

fn default_layouts() -> Vec<PassiveVinLayout> {
    vec![
        PassiveVinLayout::Standard {
            ids: ["0x3E0".to_string(), "0x3E1".to_string(), "0x3E2".to_string()],
        },
        PassiveVinLayout::Extended {
            id: "0x18FEEC00".to_string(),
        },
    ]
}

fn default_scan_timeout_secs() -> u64 {
    10
}

fn default_frame_budget() -> usize {
    5000
}

fn default_listen_window_ms() -> u64 {
    500
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            bitrate: default_bitrate(),
            passive_vin: default_layouts(),
            passive_scan_timeout_secs: default_scan_timeout_secs(),
            passive_frame_budget: default_frame_budget(),
            listen_window_ms: default_listen_window_ms(),
        }
    }
}

impl CanConfig {
    pub fn scan_limits(&self) -> ScanLimits {
        ScanLimits {
            timeout: Duration::from_secs(self.passive_scan_timeout_secs),
            frame_budget: self.passive_frame_budget,
        }
    }

    pub fn listen_window(&self) -> Duration {
        Duration::from_millis(self.listen_window_ms)
    }
}

/// Where a vehicle family broadcasts its VIN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum PassiveVinLayout {
    /// Three 11-bit ids whose payloads concatenate to the VIN
    Standard { ids: [String; 3] },
    /// One 29-bit id; byte 0 is a sequence number 0..=2, bytes 1..8 carry the VIN
    Extended { id: String },
}

impl PassiveVinLayout {
    pub fn name(&self) -> &'static str {
        match self {
            PassiveVinLayout::Standard { .. } => "standard",
            PassiveVinLayout::Extended { .. } => "extended",
        }
    }

    /// Resolve configured ids to a frame matcher
    pub fn resolve(&self) -> Result<ResolvedLayout, TransportError> {
        match self {
            PassiveVinLayout::Standard { ids } => {
                let mut parsed = [0u32; 3];
                for (slot, id) in parsed.iter_mut().zip(ids.iter()) {
                    *slot = parse_can_id(id)?;
                }
                Ok(ResolvedLayout::Standard { ids: parsed })
            }
            PassiveVinLayout::Extended { id } => Ok(ResolvedLayout::Extended {
                id: parse_can_id(id)?,
            }),
        }
    }
}

/// [`PassiveVinLayout`] with numeric ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedLayout {
    Standard { ids: [u32; 3] },
    Extended { id: u32 },
}

impl ResolvedLayout {
    pub fn filters(&self) -> Vec<FrameFilter> {
        match self {
            ResolvedLayout::Standard { ids } => ids.iter().map(|id| FrameFilter::standard(*id)).collect(),
            ResolvedLayout::Extended { id } => vec![FrameFilter::extended(*id)],
        }
    }
}

/// Bounds of one passive scan
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub timeout: Duration,
    pub frame_budget: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(default_scan_timeout_secs()),
            frame_budget: default_frame_budget(),
        }
    }
}

/// Exact-match id filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFilter {
    pub id: u32,
    pub extended: bool,
}

impl FrameFilter {
    pub fn standard(id: u32) -> Self {
        Self { id, extended: false }
    }

    pub fn extended(id: u32) -> Self {
        Self { id, extended: true }
    }

    /// Pick the frame format from the id width
    pub fn for_id(id: u32) -> Self {
        Self {
            id,
            extended: id > 0x7FF,
        }
    }

    pub fn matches(&self, id: u32, extended: bool) -> bool {
        self.id == id && self.extended == extended
    }
}

/// Parse a CAN ID from string (supports hex with 0x prefix)
pub fn parse_can_id(s: &str) -> Result<u32, TransportError> {
    let s = s.trim();
    let (digits, radix) = if s.starts_with("0x") || s.starts_with("0X") {
        (&s[2..], 16)
    } else {
        (s, 10)
    };

    u32::from_str_radix(digits, radix)
        .map_err(|e| TransportError::InvalidConfig(format!("Invalid CAN ID '{}': {}", s, e)))
}
