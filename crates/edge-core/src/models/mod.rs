//! Shared data models for the edge agent

mod device;
mod event;
mod pid;
mod settings;
mod signal;
mod vin;

pub use device::*;
pub use event::*;
pub use pid::*;
pub use settings::*;
pub use signal::*;
pub use vin::*;
