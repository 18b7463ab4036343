//! dbc-scan - decode live bus traffic with a local signal database

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use edge_agent::{AgentConfig, SignalQueue};
use edge_can::{open_source, CanFrameSource, ListenStats, PassiveListener};
use edge_conv::SignalDatabase;
use edge_core::{SignalValue, SystemClock};

use crate::output::{OutputContext, SampleRow};

pub async fn dbc_scan(config: &AgentConfig, file: &Path, seconds: u64, ctx: &OutputContext) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let database = SignalDatabase::parse(&text).with_context(|| format!("Failed to parse {}", file.display()))?;

    let source = open_source(&config.can.interface)
        .with_context(|| format!("Failed to open {}", config.can.interface))?;
    ctx.info(&format!("Listening on {} for {}s...", config.can.interface, seconds));

    let (rows, stats) = {
        let mut source = source.lock().await;
        scan(database, &mut *source, Duration::from_secs(seconds)).await?
    };
    ctx.print(&rows);
    ctx.info(&format!(
        "{} frames, {} samples, {} decode failures",
        stats.frames, stats.samples, stats.failures
    ));
    Ok(())
}

/// Listen for `window` and return every decoded sample in arrival order
async fn scan(
    database: SignalDatabase,
    source: &mut dyn CanFrameSource,
    window: Duration,
) -> Result<(Vec<SampleRow>, ListenStats)> {
    let queue = Arc::new(SignalQueue::default());
    let listener = PassiveListener::new(database, queue.clone(), Arc::new(SystemClock)).with_sample_interval(Duration::ZERO);
    let stats = listener.listen(source, window).await?;

    let rows = queue
        .drain()
        .into_iter()
        .map(|sample| SampleRow {
            name: sample.name,
            timestamp: sample.timestamp,
            value: match sample.value {
                SignalValue::Number(v) => v.to_string(),
                SignalValue::Text(s) => s,
            },
        })
        .collect();
    Ok((rows, stats))
}

#[cfg(test)]
mod tests {
    use edge_can::{MockFrameSource, RawFrame};

    use super::*;

    const DBC: &str = r#"
BO_ 1201 WheelSpeeds: 8 ECU
 SG_ FrontLeft : 0|16@1+ (0.01,0) [0|655.35] "km/h" Vector__XXX
"#;

    #[tokio::test(start_paused = true)]
    async fn test_scan_decodes_every_frame() {
        let mut source = MockFrameSource::from_frames([
            RawFrame::new(1201, &[0x10, 0x27, 0, 0, 0, 0, 0, 0]),
            RawFrame::new(0x7E8, &[0x03, 0x41, 0x0D, 0x32]),
            RawFrame::new(1201, &[0x20, 0x4E, 0, 0, 0, 0, 0, 0]),
        ]);

        let database = SignalDatabase::parse(DBC).unwrap();
        let (rows, _) = scan(database, &mut source, Duration::from_secs(1)).await.unwrap();

        let values: Vec<_> = rows.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["100", "200"]);
        assert!(rows.iter().all(|r| r.name == "FrontLeft"));
    }
}
