//! Command implementations for edge-cli

pub mod build_info;
pub mod candump;
pub mod dbc;
pub mod obd_dump;
pub mod vin;

pub use build_info::build_info;
pub use candump::{candump, CandumpArgs};
pub use dbc::dbc_scan;
pub use obd_dump::can_dump_v2;
pub use vin::{scan_j1939_vin, scan_vin};
