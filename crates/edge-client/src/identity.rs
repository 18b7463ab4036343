//! Identity API client (GraphQL)
//!
//! Looks up the vehicle a device is paired to, used to enrich status events.

use std::time::Duration;

use edge_core::VehicleInfo;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{ClientError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const VEHICLE_BY_DEVICE: &str = r#"query VehicleByDevice($address: Address!) {
  aftermarketDevice(by: {address: $address}) {
    vehicle {
      tokenId
      definition { make model year }
    }
  }
}"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<DeviceData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceData {
    aftermarket_device: Option<DeviceNode>,
}

#[derive(Debug, Deserialize)]
struct DeviceNode {
    vehicle: Option<VehicleNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VehicleNode {
    token_id: u64,
    definition: Definition,
}

#[derive(Debug, Deserialize)]
struct Definition {
    make: String,
    model: String,
    year: u32,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Clone)]
pub struct IdentityClient {
    client: Client,
    endpoint: Url,
}

impl IdentityClient {
    pub fn new(identity_host: &str) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(DEFAULT_TIMEOUT).build()?,
            endpoint: Url::parse(identity_host)?,
        })
    }

    /// Vehicle paired with `address`, `None` when the device is unpaired
    #[instrument(skip(self))]
    pub async fn vehicle_for_device(&self, address: &str) -> Result<Option<VehicleInfo>> {
        let body = json!({
            "query": VEHICLE_BY_DEVICE,
            "variables": { "address": address },
        });

        let response = self.client.post(self.endpoint.clone()).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| format!("HTTP {}", status));
            return Err(ClientError::server_error(status.as_u16(), message));
        }

        let parsed: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(e.to_string()))?;

        if let Some(first) = parsed.errors.first() {
            return Err(ClientError::Rejected(first.message.clone()));
        }

        let vehicle = parsed
            .data
            .and_then(|d| d.aftermarket_device)
            .and_then(|d| d.vehicle)
            .map(|v| VehicleInfo {
                token_id: v.token_id,
                make: v.definition.make,
                model: v.definition.model,
                year: v.definition.year,
            });
        debug!(found = vehicle.is_some(), "Identity lookup complete");
        Ok(vehicle)
    }
}
