//! scan-vin and scan-j1939vin

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use edge_agent::vin::{vin_obd_query, VIN_QUERIES};
use edge_agent::{extract_vin, AgentConfig, FingerprintRunner, TemplateStore};
use edge_can::{open_source, parse_can_id, scan_passive_vin, ResolvedLayout};
use edge_core::{AgentState, DeviceIo, ObdValue, SystemClock};
use tracing::debug;

use crate::output::{OutputContext, VinRow};
use crate::uplink::Uplink;

/// Default J1939 VIN parameter group, PGN 0xFEEC from any source
const J1939_VIN_ID: &str = "0x18FEEC00";

/// Query the VIN over OBD, optionally publishing a fingerprint event
pub async fn scan_vin(config: &AgentConfig, send: bool, ctx: &OutputContext) -> Result<()> {
    let row = if send {
        fingerprint_and_send(config).await?
    } else {
        let device = edge_client::DeviceIoClient::new(&config.device.rpc_url, &config.device.serial)
            .context("Failed to create hardware RPC client")?;
        let timeout = Duration::from_secs(config.agent.vin_query_timeout_secs);
        match query_vin(&device, timeout).await {
            Some(row) => row,
            None => bail!("No VIN query answered"),
        }
    };

    ctx.print(&[row]);
    Ok(())
}

/// Try every active VIN query in order and return the first VIN found
pub async fn query_vin(device: &dyn DeviceIo, timeout: Duration) -> Option<VinRow> {
    for query in VIN_QUERIES.iter().filter(|q| !q.is_passive()) {
        let request = vin_obd_query(query);
        let lines = match tokio::time::timeout(timeout, device.obd_query(&request)).await {
            Ok(Ok(ObdValue::Hex(lines))) => lines,
            Ok(Ok(other)) => {
                debug!(query = query.name, value = ?other, "Query did not return raw frames");
                continue;
            }
            Ok(Err(e)) => {
                debug!(query = query.name, error = %e, "Query failed");
                continue;
            }
            Err(_) => {
                debug!(query = query.name, "Query timed out");
                continue;
            }
        };
        match extract_vin(&lines) {
            Ok(extracted) => {
                return Some(VinRow {
                    query: query.name.to_string(),
                    protocol: query.protocol.to_string(),
                    vin: extracted.vin.as_str().to_string(),
                })
            }
            Err(e) => debug!(query = query.name, error = %e, "No VIN in response"),
        }
    }
    None
}

async fn fingerprint_and_send(config: &AgentConfig) -> Result<VinRow> {
    let dongle = Arc::new(
        edge_client::DeviceIoClient::new(&config.device.rpc_url, &config.device.serial)
            .context("Failed to create hardware RPC client")?,
    );
    let uplink = Uplink::connect(config, dongle.clone()).await?;
    let store = Arc::new(TemplateStore::open(config.template_dir()).context("Failed to open template store")?);

    let runner = FingerprintRunner::new(
        dongle,
        store,
        uplink.sender(),
        Arc::new(AgentState::new()),
        Arc::new(SystemClock),
    )
    .with_config(config.fingerprint())
    .with_software_version(&config.software_version());
    let result = runner.run().await;
    uplink.close().await;

    let response = result.context("Vehicle not identified")?;
    Ok(VinRow {
        query: response.query_name,
        protocol: response.protocol,
        vin: response.vin.as_str().to_string(),
    })
}

/// Listen for the J1939 VIN broadcast
pub async fn scan_j1939_vin(config: &AgentConfig, ctx: &OutputContext) -> Result<()> {
    let layouts = j1939_layouts(config)?;
    let source = open_source(&config.can.interface)
        .with_context(|| format!("Failed to open {}", config.can.interface))?;

    ctx.info(&format!("Listening on {} for the VIN broadcast...", config.can.interface));
    let found = {
        let mut source = source.lock().await;
        scan_passive_vin(&mut *source, &layouts, config.can.scan_limits()).await?
    };

    let Some(found) = found else {
        bail!("No VIN broadcast seen on {}", config.can.interface);
    };
    debug!(frames = found.frames_seen, "VIN broadcast assembled");
    ctx.print(&[VinRow {
        query: "passive_can".to_string(),
        protocol: found.layout.to_string(),
        vin: found.vin.as_str().to_string(),
    }]);
    Ok(())
}

/// Extended layouts from the config, or the standard VIN PGN when none are set
fn j1939_layouts(config: &AgentConfig) -> Result<Vec<ResolvedLayout>> {
    let configured = config
        .can
        .passive_vin
        .iter()
        .map(|layout| layout.resolve())
        .filter(|layout| !matches!(layout, Ok(ResolvedLayout::Standard { .. })))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid passive VIN layout")?;
    if !configured.is_empty() {
        return Ok(configured);
    }
    Ok(vec![ResolvedLayout::Extended {
        id: parse_can_id(J1939_VIN_ID)?,
    }])
}
