//! HTTP clients for the edge agent
//!
//! - [`DeviceIoClient`]: the dongle's local RPC endpoint. Implements
//!   [`edge_core::DeviceIo`] and [`edge_core::Signer`].
//! - [`ConfigApiClient`]: template URLs, PID lists, settings and DBC files.
//! - [`IdentityClient`]: which vehicle a device is paired with.
//! - [`CertificateIssuer`]: web3 challenge login and CSR signing.
//!
//! # Example
//!
//! ```rust,no_run
//! use edge_client::{ConfigApiClient, DeviceIoClient};
//! use edge_core::DeviceIo;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = DeviceIoClient::new("http://localhost:9000", "dongle-serial")?;
//!     let power = device.power_status().await?;
//!     println!("battery at {:.1} V", power.battery_voltage());
//!
//!     let config = ConfigApiClient::new("https://device-config.example.com")?;
//!     let urls = config.fetch_urls("1FTEW1CP3NKE68593").await?;
//!     let pids = config.fetch_pids(&urls.pid_url).await?;
//!     println!("{} requests in {}", pids.requests.len(), pids.template_name);
//!     Ok(())
//! }
//! ```

pub mod auth;
mod config_api;
mod device_io;
mod error;
mod identity;
pub mod retry;
pub mod testing;

pub use auth::{personal_message_hash, AuthSettings, CertificateIssuer};
pub use config_api::ConfigApiClient;
pub use device_io::{commands, parse_obd_value, DeviceIoClient};
pub use error::{ClientError, Result};
pub use identity::IdentityClient;
pub use retry::{with_backoff, Backoff, RetryError};
