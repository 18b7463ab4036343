//! can-dump-v2 - raw OBD responses for the cached PID template

use std::time::Duration;

use anyhow::{bail, Context, Result};
use edge_agent::{AgentConfig, TemplateStore};
use edge_can::parse_can_id;
use edge_client::DeviceIoClient;
use edge_core::{DeviceIo, ObdValue, PidRequest};
use tracing::warn;

use crate::output::{OutputContext, RawLineRow};

/// Protocol used when the fingerprint never recorded one
const DEFAULT_PROTOCOL: &str = "6";

pub async fn can_dump_v2(config: &AgentConfig, header: Option<&str>, cycles: u32, ctx: &OutputContext) -> Result<()> {
    let store = TemplateStore::open(config.template_dir()).context("Failed to open template store")?;
    let Some(template) = store.read_pids() else {
        bail!("No cached PID template in {}", store.dir().display());
    };
    let protocol = store
        .read_vin_settings()
        .map(|s| s.protocol)
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string());

    let requests = select_requests(&template.requests, header)?;
    if requests.is_empty() {
        ctx.warn("No template requests match");
        return Ok(());
    }
    ctx.info(&format!(
        "{} request(s) from template {} on protocol {}",
        requests.len(),
        template.template_name,
        protocol
    ));

    let device = DeviceIoClient::new(&config.device.rpc_url, &config.device.serial)
        .context("Failed to create hardware RPC client")?;
    let timeout = Duration::from_millis(config.agent.request_timeout_ms);
    let rows = dump_requests(&device, &requests, &protocol, cycles, timeout).await;
    ctx.print(&rows);
    Ok(())
}

/// Requests on `header`, or all of them
fn select_requests(requests: &[PidRequest], header: Option<&str>) -> Result<Vec<PidRequest>> {
    let Some(header) = header else {
        return Ok(requests.to_vec());
    };
    let header = parse_can_id(header).with_context(|| format!("Invalid header: {}", header))?;
    Ok(requests.iter().filter(|r| r.header == header).cloned().collect())
}

/// Issue every request `cycles` times and collect the raw response lines
pub async fn dump_requests(
    device: &dyn DeviceIo,
    requests: &[PidRequest],
    protocol: &str,
    cycles: u32,
    timeout: Duration,
) -> Vec<RawLineRow> {
    let mut rows = Vec::new();
    for cycle in 1..=cycles {
        for request in requests {
            let query = request.raw_query(protocol);
            let lines = match tokio::time::timeout(timeout, device.obd_query(&query)).await {
                Ok(Ok(ObdValue::Hex(lines))) => lines,
                Ok(Ok(other)) => vec![format!("{:?}", other)],
                Ok(Err(e)) => {
                    warn!(name = %request.name, error = %e, "Request failed");
                    continue;
                }
                Err(_) => {
                    warn!(name = %request.name, "Request timed out");
                    continue;
                }
            };
            rows.extend(lines.into_iter().map(|line| RawLineRow {
                cycle,
                name: request.name.clone(),
                header: format!("{:x}", request.header),
                pid: request.pid_hex(),
                line,
            }));
        }
    }
    rows
}
