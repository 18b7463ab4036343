//! Remote configuration API client
//!
//! Resolves which template a vehicle uses and downloads its pieces. Every
//! call retries with backoff except 400/404, which are final.

use std::time::Duration;

use edge_core::{DeviceSettings, TemplatePids, TemplateUrls, VIN_LENGTH};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{ClientError, Result};
use crate::retry::{with_backoff, Backoff, RetryError};

/// Per-call timeout for cloud services
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the vehicle configuration service
#[derive(Debug, Clone)]
pub struct ConfigApiClient {
    client: Client,
    vehicle_host: Url,
    backoff: Backoff,
}

impl ConfigApiClient {
    /// # Arguments
    /// * `vehicle_host` - Base URL of the configuration service
    pub fn new(vehicle_host: &str) -> Result<Self> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            vehicle_host: Url::parse(vehicle_host)?,
            backoff: Backoff::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// URLs record keyed by VIN when `key` is a full VIN, else by device address
    #[instrument(skip(self))]
    pub async fn fetch_urls(&self, key: &str) -> Result<TemplateUrls> {
        let path = if key.len() == VIN_LENGTH {
            format!("/v1/device-config/vin/{}/urls", key)
        } else {
            format!("/v1/device-config/eth-addr/{}/urls", key)
        };
        let url = self.vehicle_host.join(&path)?;
        self.get_json(url).await
    }

    #[instrument(skip(self))]
    pub async fn fetch_pids(&self, pid_url: &str) -> Result<TemplatePids> {
        self.get_json(self.resolve(pid_url)?).await
    }

    #[instrument(skip(self))]
    pub async fn fetch_settings(&self, settings_url: &str) -> Result<DeviceSettings> {
        self.get_json(self.resolve(settings_url)?).await
    }

    /// Signal database text
    #[instrument(skip(self))]
    pub async fn fetch_dbc(&self, dbc_url: &str) -> Result<String> {
        let url = self.resolve(dbc_url)?;
        with_backoff(&self.backoff, || {
            let url = url.clone();
            async move {
                let response = self.client.get(url).send().await.map_err(ClientError::from)?;
                let response = check_status(response).await?;
                response
                    .text()
                    .await
                    .map_err(|e| RetryError::Transient(ClientError::from(e)))
            }
        })
        .await
    }

    /// Absolute URLs are used as-is; relative ones resolve against the host
    fn resolve(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(self.vehicle_host.join(url)?),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!(url = %url, "GET");
        with_backoff(&self.backoff, || {
            let url = url.clone();
            async move {
                let response = self.client.get(url).send().await.map_err(ClientError::from)?;
                let response = check_status(response).await?;
                response
                    .json::<T>()
                    .await
                    .map_err(|e| RetryError::Stop(ClientError::ParseError(e.to_string())))
            }
        })
        .await
    }
}

/// Map non-success statuses; 400/404 become [`RetryError::Stop`]
async fn check_status(response: reqwest::Response) -> std::result::Result<reqwest::Response, RetryError<ClientError>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_else(|_| format!("HTTP {}", status));
    let err = match status {
        StatusCode::NOT_FOUND => ClientError::NotFound(message),
        StatusCode::BAD_REQUEST => ClientError::BadRequest(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ClientError::Timeout,
        _ => ClientError::server_error(status.as_u16(), message),
    };
    Err(err.into())
}
