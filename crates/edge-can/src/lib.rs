//! edge-can - CAN frame access for the edge agent
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │            SharedFrameSource                  │
//! │  (one owner at a time: scan OR listener)      │
//! │                                               │
//! │  ┌──────────────┐   ┌──────────────────────┐  │
//! │  │ passive_vin  │   │ PassiveListener      │  │
//! │  │ (fingerprint)│   │ (signal database)    │  │
//! │  └──────┬───────┘   └──────────┬───────────┘  │
//! │         └───────────┬──────────┘              │
//! │              ┌──────┴────────┐                │
//! │              │CanFrameSource │                │
//! │              │(SocketCAN/mock)│               │
//! │              └───────────────┘                │
//! └───────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod listener;
pub mod passive_vin;
pub mod source;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use capture::{candump_lines, capture_frames};
pub use config::{parse_can_id, CanConfig, FrameFilter, PassiveVinLayout, ResolvedLayout, ScanLimits};
pub use error::TransportError;
pub use listener::{ListenStats, PassiveListener};
pub use passive_vin::{scan_passive_vin, PassiveVin, VinAssembler};
pub use source::{shared, CanFrameSource, MockFrameSource, RawFrame, SharedFrameSource};

/// Open the platform frame source for `interface`
pub fn open_source(interface: &str) -> Result<SharedFrameSource, TransportError> {
    #[cfg(all(target_os = "linux", feature = "socketcan"))]
    {
        let source = crate::socketcan::SocketCanSource::open(interface)?;
        Ok(shared(source))
    }
    #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
    {
        Err(TransportError::Unsupported(format!(
            "SocketCAN on {} requires Linux and the 'socketcan' feature",
            interface
        )))
    }
}
