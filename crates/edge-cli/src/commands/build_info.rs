//! build-info - what this binary was built with

use anyhow::Result;
use edge_agent::{AgentConfig, FINGERPRINT_VERSION};

use crate::output::OutputContext;

pub fn build_info(config: &AgentConfig, ctx: &OutputContext) -> Result<()> {
    let pairs = vec![
        ("Name", env!("CARGO_PKG_NAME").to_string()),
        ("Version", env!("CARGO_PKG_VERSION").to_string()),
        ("Agent version", config.software_version()),
        ("Target", format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)),
        ("Profile", profile().to_string()),
        ("Fingerprint version", FINGERPRINT_VERSION.to_string()),
        ("CAN interface", config.can.interface.clone()),
        ("State dir", config.agent.state_dir.display().to_string()),
    ];
    ctx.print_kv(&pairs);
    Ok(())
}

fn profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}
