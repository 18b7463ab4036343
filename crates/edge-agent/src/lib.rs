//! edge-agent - Signal acquisition and publication pipeline
//!
//! The stages run as cooperative tasks in one process:
//!
//! - [`FingerprintRunner`] identifies the vehicle once per boot
//! - [`TemplateResolver`] turns the VIN into a PID template, signal database
//!   and device settings, falling back to the on-disk copy
//! - [`PidScheduler`] issues OBD requests (and listens passively on CAN) and
//!   pushes decoded samples into the [`SignalQueue`]
//! - [`SignalQueue::run_flush_loop`] batches samples into status events
//! - [`DataSender`] signs every event and publishes it over MQTT, parking
//!   undeliverable messages in the [`Outbox`]
//!
//! Errors logged anywhere in the process reach the bus through
//! [`BusForwardLayer`] when the event opts in with `forward = true`.

pub mod certificate;
pub mod config;
pub mod dump;
pub mod error;
pub mod fingerprint;
pub mod log_hook;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod sender;
pub mod store;
pub mod telemetry;
pub mod testing;
pub mod vin;

pub use certificate::ensure_certificate;
pub use config::AgentConfig;
pub use dump::{DumpJob, DumpPayload};
pub use error::{ConfigError, FingerprintError, ResolveError, SendError, StoreError, StoreResult};
pub use fingerprint::{BootPlan, FingerprintConfig, FingerprintPhase, FingerprintRunner, PassiveScan};
pub use log_hook::{error_event, BusForwardLayer, LogForwarder};
pub use queue::{SignalQueue, DEFAULT_QUEUE_CAPACITY};
pub use resolver::{BundleOrigin, Resolution, TemplateBundle, TemplateResolver, TemplateSource};
pub use scheduler::{CycleStats, PassiveStage, PidScheduler, SchedulerConfig};
pub use sender::{DataSender, EnvelopeBuilder, MqttConnection, MqttSettings, MqttTransport, Outbox, Topics, Transport};
pub use store::{StoreKind, TemplateStore, VinSettings};
pub use telemetry::{LocationReporter, NetworkReporter};
pub use vin::{extract_vin, FINGERPRINT_VERSION};
