//! edged - Vehicle edge agent daemon
//!
//! Identifies the vehicle, resolves its PID template, polls OBD and listens
//! on CAN, and publishes signed events over MQTT.
//!
//! Usage:
//!   edged [OPTIONS] [config.toml]
//!
//! Without a config file the agent runs with built-in defaults (local
//! dongle RPC, local plain-text broker).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use edge_agent::fingerprint::PassiveScan;
use edge_agent::sender::{DataSender, EnvelopeBuilder, MqttTransport, Outbox};
use edge_agent::{
    ensure_certificate, AgentConfig, BootPlan, BusForwardLayer, DumpJob, FingerprintRunner, LocationReporter, NetworkReporter, PassiveStage,
    PidScheduler, SignalQueue, StoreKind, TemplateBundle, TemplateResolver, TemplateStore,
};
use edge_can::{open_source, PassiveListener, SharedFrameSource};
use edge_client::{with_backoff, Backoff, CertificateIssuer, ConfigApiClient, DeviceIoClient, IdentityClient, RetryError};
use edge_conv::SignalDatabase;
use edge_core::{AgentState, Clock, DeviceIo, Signer, SystemClock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for loops to finish their final flush
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "edged")]
#[command(about = "Vehicle edge agent daemon")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    let software_version = config.software_version();

    let (bus_layer, log_forwarder) = BusForwardLayer::new(Some(software_version.clone()));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edged=info,edge_agent=info,edge_client=info,edge_can=debug".into()),
        )
        .with(args.json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.json_logs).then(tracing_subscriber::fmt::layer))
        .with(bus_layer)
        .init();

    info!(version = %software_version, "Starting edged (vehicle edge agent)");
    match &args.config {
        Some(path) => info!(path = %path.display(), "Loaded config"),
        None => info!("No config file provided, using defaults"),
    }

    let (shutdown_tx, shutdown) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Hardware and identity
    let dongle = Arc::new(
        DeviceIoClient::new(&config.device.rpc_url, &config.device.serial).context("creating hardware RPC client")?,
    );
    let device: Arc<dyn DeviceIo> = dongle.clone();
    let signer: Arc<dyn Signer> = dongle;
    let address = match device_address(signer.as_ref()).await {
        Ok(address) => address,
        Err(e) => {
            error!(fatal = true, error = %e, "Device has no signing identity");
            return Err(e);
        }
    };
    info!(address = %address, serial = %config.device.serial, "Device identity");

    let store = Arc::new(TemplateStore::open(config.template_dir()).context("opening template store")?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(AgentState::new());

    if config.mqtt.tls && config.mqtt.cert_path.is_none() {
        provision_certificate(&config, &store, signer.as_ref()).await?;
    }

    // Data sender
    let (transport, connection, epochs) = MqttTransport::new(&config.mqtt_settings(store.path(StoreKind::Certificate)))
        .context("configuring MQTT")?;
    tasks.push(tokio::spawn(connection.run(shutdown.clone())));

    let outbox = Outbox::open(config.outbox_dir(), config.mqtt.outbox_max_keys)
        .context("opening outbox")?;
    let sender = Arc::new(
        DataSender::new(
            Arc::new(transport),
            signer.clone(),
            clock.clone(),
            EnvelopeBuilder::new(&config.services.event_source, &address),
            config.mqtt.topics.clone(),
        )
        .with_outbox(Arc::new(outbox))
        .with_state(state.clone()),
    );
    tasks.push(tokio::spawn(sender.clone().run_replay_loop(epochs, shutdown.clone())));
    tasks.push(tokio::spawn(log_forwarder.run(sender.clone(), shutdown.clone())));

    // CAN access shared by the passive VIN scan and the passive listener
    let can = if config.agent.passive_can {
        match open_source(&config.can.interface) {
            Ok(source) => Some(source),
            Err(e) => {
                warn!(interface = %config.can.interface, error = %e, "CAN unavailable, passive features disabled");
                None
            }
        }
    } else {
        None
    };

    // Fingerprint
    let mut fingerprint = FingerprintRunner::new(
        device.clone(),
        store.clone(),
        sender.clone(),
        state.clone(),
        clock.clone(),
    )
    .with_config(config.fingerprint())
    .with_software_version(&software_version);
    if let Some(source) = &can {
        fingerprint = fingerprint.with_passive_scan(passive_scan(&config, source.clone())?);
    }
    let plan = BootPlan::from_fingerprint(fingerprint.run().await);

    // Template
    let config_api = ConfigApiClient::new(&config.services.vehicle_host).context("creating config API client")?;
    let resolver = Arc::new(TemplateResolver::new(Arc::new(config_api), store.clone()));
    let template_key = plan.template_key(&address);
    let bundle = match &template_key {
        Some(key) => match resolver.resolve(key).await {
            Ok(resolution) => Some(resolution.bundle),
            Err(e) => {
                error!(forward = true, key = %key, error = %e, "No PID template");
                None
            }
        },
        None => None,
    };

    enrich_vehicle(&config, &sender, &address).await;
    let dtcs = state.refresh_dtcs(device.as_ref()).await;
    info!(dtcs = %dtcs, "DTC report");

    // Queue and periodic publishers
    let queue = Arc::new(SignalQueue::default());
    tasks.push(tokio::spawn(queue.clone().run_flush_loop(
        sender.clone(),
        clock.clone(),
        software_version.clone(),
        Duration::from_secs(config.agent.flush_interval_secs),
        shutdown.clone(),
    )));

    let dump = Arc::new(DumpJob::new(store.clone(), clock.clone()));
    tasks.push(tokio::spawn(dump.clone().run(
        sender.clone(),
        Duration::from_secs(config.agent.dump_check_secs),
        shutdown.clone(),
    )));

    let settings = bundle.as_ref().map(|b| b.settings.clone()).unwrap_or_default();
    let location_interval = config
        .agent
        .location_interval_secs
        .unwrap_or(settings.location_frequency_secs);
    let network_interval = config
        .agent
        .network_interval_secs
        .unwrap_or(settings.network_interval_secs);
    let location = LocationReporter::new(
        device.clone(),
        queue.clone(),
        clock.clone(),
        Duration::from_secs(location_interval.max(1)),
    );
    tasks.push(tokio::spawn(location.run(shutdown.clone())));
    let network = NetworkReporter::new(
        device.clone(),
        sender.clone(),
        clock.clone(),
        Duration::from_secs(network_interval.max(1)),
    );
    tasks.push(tokio::spawn(network.run(shutdown.clone())));

    // Scheduler with template refresh
    if let (Some(bundle), Some(template_key)) = (bundle, template_key) {
        let (template_tx, template_rx) = watch::channel(bundle.pids.clone());
        tasks.push(tokio::spawn(resolver.clone().run_refresh_loop(
            template_key,
            Duration::from_secs(config.agent.template_refresh_secs),
            template_tx,
            shutdown.clone(),
        )));

        let passive = can
            .as_ref()
            .and_then(|source| passive_stage(&config, &bundle, source.clone(), queue.clone(), clock.clone()));
        let mut scheduler = PidScheduler::new(
            device.clone(),
            queue.clone(),
            sender.clone(),
            clock.clone(),
            bundle.pids,
            bundle.settings,
        )
        .with_config(config.scheduler())
        .with_protocol(state.protocol())
        .with_template_updates(template_rx)
        .with_dump(dump)
        .with_software_version(&software_version);
        if let Some(passive) = passive {
            scheduler = scheduler.with_passive(passive);
        }
        tasks.push(tokio::spawn(scheduler.run(shutdown.clone())));
    }

    info!(tasks = tasks.len(), vin = %state.vin_or_sentinel(), polling = plan.runs_scheduler(), "Agent running");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    let joined = tokio::time::timeout(SHUTDOWN_GRACE, join_all(tasks)).await;
    if joined.is_err() {
        warn!("Some tasks did not stop within the grace period");
    }
    info!("edged stopped");
    Ok(())
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }
}

/// The signing address, retried while the dongle RPC comes up
async fn device_address(signer: &dyn Signer) -> anyhow::Result<String> {
    with_backoff(&Backoff::default(), || async {
        signer.ethereum_address().await.map_err(RetryError::Transient)
    })
    .await
    .context("reading device address")
}

async fn provision_certificate(config: &AgentConfig, store: &TemplateStore, signer: &dyn Signer) -> anyhow::Result<()> {
    if store.read_text(StoreKind::Certificate)?.is_some() {
        return Ok(());
    }
    let Some(csr_path) = &config.services.csr_path else {
        warn!("TLS enabled without a stored certificate or CSR");
        return Ok(());
    };
    let csr = std::fs::read_to_string(csr_path).with_context(|| format!("reading {}", csr_path.display()))?;
    let issuer = CertificateIssuer::new(&config.auth_settings()).context("configuring certificate issuer")?;
    ensure_certificate(store, &issuer, signer, &csr, false)
        .await
        .context("issuing client certificate")?;
    Ok(())
}

async fn enrich_vehicle(config: &AgentConfig, sender: &DataSender, address: &str) {
    if config.services.identity_host.is_empty() {
        return;
    }
    let identity = match IdentityClient::new(&config.services.identity_host) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "Identity client unavailable");
            return;
        }
    };
    match identity.vehicle_for_device(address).await {
        Ok(vehicle) => {
            if let Some(v) = &vehicle {
                info!(token_id = v.token_id, make = %v.make, model = %v.model, year = v.year, "Paired vehicle");
            }
            sender.set_vehicle(vehicle);
        }
        Err(e) => warn!(error = %e, "Vehicle lookup failed"),
    }
}

fn passive_scan(config: &AgentConfig, source: SharedFrameSource) -> anyhow::Result<PassiveScan> {
    let layouts = config
        .can
        .passive_vin
        .iter()
        .map(|layout| layout.resolve())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid passive VIN layout")?;
    Ok(PassiveScan {
        source,
        layouts,
        limits: config.can.scan_limits(),
    })
}

fn passive_stage(
    config: &AgentConfig,
    bundle: &TemplateBundle,
    source: SharedFrameSource,
    queue: Arc<SignalQueue>,
    clock: Arc<dyn Clock>,
) -> Option<PassiveStage> {
    let text = bundle.dbc.as_deref()?;
    let database = match SignalDatabase::parse(text) {
        Ok(database) => database,
        Err(e) => {
            error!(forward = true, error = %e, "Signal database rejected");
            return None;
        }
    };
    let listener = PassiveListener::new(database, queue, clock).with_sample_interval(Duration::from_secs(
        bundle.settings.passive_sample_interval_secs,
    ));
    Some(PassiveStage {
        listener,
        source,
        window: config.can.listen_window(),
    })
}
