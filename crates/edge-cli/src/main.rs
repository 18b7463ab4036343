//! edge-cli - Operator tool for the vehicle edge agent
//!
//! One-shot diagnostics against the same hardware, CAN interface and state
//! directory that `edged` uses: VIN queries, raw bus captures, raw OBD dumps
//! and offline signal-database checks.

mod commands;
mod config;
mod output;
mod uplink;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::CandumpArgs;
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "edge-cli")]
#[command(author, version, about = "Vehicle edge agent operator CLI")]
#[command(propagate_version = true)]
struct Cli {
    /// Agent configuration file (TOML)
    #[arg(short, long, env = "EDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query the VIN over OBD
    ScanVin {
        /// Run the full fingerprint and publish the result
        #[arg(long)]
        send: bool,
    },

    /// Listen for the J1939 VIN broadcast on CAN
    #[command(name = "scan-j1939vin")]
    ScanJ1939Vin,

    /// Capture raw CAN traffic in candump format
    Candump {
        /// Number of capture cycles
        #[arg(long, default_value = "1")]
        cycle_count: u32,

        /// Frames per cycle
        #[arg(long, default_value = "500")]
        chunk_size: usize,

        /// Longest a cycle waits for its frames (milliseconds)
        #[arg(long, default_value = "5000")]
        window_ms: u64,

        /// Publish every cycle on the dump topic
        #[arg(long)]
        send: bool,

        /// Append every cycle to candump-<time>.log
        #[arg(long)]
        save: bool,
    },

    /// Issue the cached template's requests and print raw responses
    #[command(name = "can-dump-v2")]
    CanDumpV2 {
        /// Only requests on this header (e.g. 0x7DF)
        #[arg(long)]
        header: Option<String>,

        /// Rounds over the request list
        #[arg(long, default_value = "1")]
        cycles: u32,
    },

    /// Decode live CAN traffic with a local DBC file
    DbcScan {
        /// DBC file
        #[arg(long)]
        file: PathBuf,

        /// Listening time in seconds
        #[arg(long, default_value = "10")]
        seconds: u64,
    },

    /// Show build and configuration details
    BuildInfo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::registry()
        .with(cli.json_logs.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!cli.json_logs).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)))
        .with(filter)
        .init();

    let config = config::load_config(cli.config.as_deref())?;
    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    let result = match &cli.command {
        Commands::ScanVin { send } => commands::scan_vin(&config, *send, &ctx).await,

        Commands::ScanJ1939Vin => commands::scan_j1939_vin(&config, &ctx).await,

        Commands::Candump {
            cycle_count,
            chunk_size,
            window_ms,
            send,
            save,
        } => {
            let args = CandumpArgs {
                cycle_count: *cycle_count,
                chunk_size: *chunk_size,
                window: Duration::from_millis(*window_ms),
                send: *send,
                save: *save,
            };
            commands::candump(&config, &args, &ctx).await
        }

        Commands::CanDumpV2 { header, cycles } => {
            commands::can_dump_v2(&config, header.as_deref(), *cycles, &ctx).await
        }

        Commands::DbcScan { file, seconds } => commands::dbc_scan(&config, file, *seconds, &ctx).await,

        Commands::BuildInfo => commands::build_info(&config, &ctx),
    };

    if let Err(e) = result {
        ctx.error(&format!("Error: {:#}", e));
        std::process::exit(1);
    }
    Ok(())
}
