//! edge-core - Core traits and types for the vehicle edge agent
//!
//! This crate provides the domain model shared by every stage of the
//! acquisition pipeline, plus the narrow seams the stages talk through:
//!
//! - [`DeviceIo`] / [`Signer`] - the on-device hardware RPC surface
//! - [`Publisher`] - accepts outbound events (implemented by the data sender)
//! - [`Sink`] - accepts decoded samples (implemented by the signal queue)
//! - [`Clock`] - wall-clock source, swappable in tests

pub mod error;
pub mod io;
pub mod models;
pub mod pipeline;
pub mod state;

pub use error::{AgentError, AgentResult, ErrorClass};
pub use io::{DeviceIo, Location, ObdQuery, ObdValue, Signer};
pub use models::*;
pub use pipeline::{Clock, Publisher, Sink, SystemClock};
pub use state::AgentState;
