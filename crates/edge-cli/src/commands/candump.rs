//! candump - capture raw bus traffic in candump log format

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use edge_agent::AgentConfig;
use edge_can::{candump_lines, capture_frames, open_source};
use edge_core::{EventKind, OutboundEvent, Publisher};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::output::OutputContext;
use crate::uplink::Uplink;

#[derive(Debug, Clone)]
pub struct CandumpArgs {
    pub cycle_count: u32,
    pub chunk_size: usize,
    pub window: Duration,
    pub send: bool,
    pub save: bool,
}

/// One captured chunk as published on the dump topic
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandumpChunk {
    pub timestamp: i64,
    pub interface: String,
    pub cycle: u32,
    pub lines: Vec<String>,
}

pub async fn candump(config: &AgentConfig, args: &CandumpArgs, ctx: &OutputContext) -> Result<()> {
    let interface = config.can.interface.clone();
    let source = open_source(&interface).with_context(|| format!("Failed to open {}", interface))?;
    let uplink = if args.send {
        Some(Uplink::from_config(config).await?)
    } else {
        None
    };
    let log_path = args.save.then(|| log_file_name(Utc::now().timestamp()));

    let pb = if ctx.interactive() {
        ProgressBar::new(u64::from(args.cycle_count))
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress template")?,
    );

    let mut total = 0;
    let mut result = Ok(());
    for cycle in 1..=args.cycle_count {
        pb.set_message(format!("capturing {}", interface));
        let frames = {
            let mut source = source.lock().await;
            capture_frames(&mut *source, &[], args.chunk_size, args.window).await?
        };
        let lines = candump_lines(&interface, &frames);
        total += lines.len();

        if let Some(path) = &log_path {
            append_lines(path, &lines)?;
        }
        if let Some(uplink) = &uplink {
            let chunk = CandumpChunk {
                timestamp: Utc::now().timestamp_millis(),
                interface: interface.clone(),
                cycle,
                lines: lines.clone(),
            };
            let event = OutboundEvent::from_payload(EventKind::Dump, &chunk)?;
            if let Err(e) = uplink.sender().publish(event).await {
                result = Err(anyhow::Error::from(e).context(format!("Failed to publish cycle {}", cycle)));
                break;
            }
        }
        if !args.save && !args.send {
            pb.suspend(|| {
                for line in &lines {
                    println!("{}", line);
                }
            });
        }
        pb.inc(1);
    }
    pb.finish_with_message(format!("{} frames", total));

    if let Some(uplink) = uplink {
        uplink.close().await;
    }
    result?;

    if let Some(path) = log_path {
        ctx.success(&format!("Saved {} frames to {}", total, path.display()));
    }
    Ok(())
}

/// `candump-<unix seconds>.log` in the working directory
fn log_file_name(unix_seconds: i64) -> PathBuf {
    PathBuf::from(format!("candump-{}.log", unix_seconds))
}

fn append_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    for line in lines {
        writeln!(file, "{}", line).with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(log_file_name(1_690_000_000));
        assert!(path.ends_with("candump-1690000000.log"));

        append_lines(&path, &["(1690000000.001) can0 7E8#0641A6".to_string()]).unwrap();
        append_lines(&path, &["(1690000000.002) can0 7E8#0641A7".to_string()]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with("7E8#0641A7\n"));
    }
}
