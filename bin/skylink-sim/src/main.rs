//! ---
//! gcs_section: "03-operator-tools"
//! gcs_subsection: "binary"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Binary entrypoint for the link simulator."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use prometheus::Registry;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use skylink_common::{init_tracing, AppConfig};
use skylink_telemetry::{
    FrameBody, LinkEvent, LinkHandle, LinkMetrics, LinkRuntime, LoopbackCodec, Notification,
    ObjectMetadata, ObjectRef, Telemetry, TransactionKey, UpdateOrigin,
};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "SkyLink telemetry link simulator", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 10, help = "Seconds to run before printing statistics")]
    duration_secs: u64,

    #[arg(long, default_value_t = 8, help = "Number of simulated objects")]
    objects: u32,

    #[arg(
        long,
        default_value_t = 0.1,
        value_parser = parse_probability,
        help = "Probability that the peer ignores a frame"
    )]
    loss: f64,

    #[arg(long, help = "Seed for the simulated peer and local updates")]
    seed: Option<u64>,

    #[arg(long, help = "Print the effective configuration as JSON and exit")]
    print_config: bool,
}

fn parse_probability(value: &str) -> std::result::Result<f64, String> {
    let probability: f64 = value
        .parse()
        .map_err(|err| format!("`{value}` is not a number: {err}"))?;
    if (0.0..=1.0).contains(&probability) {
        Ok(probability)
    } else {
        Err(format!("`{value}` is outside 0.0..=1.0"))
    }
}

const FIRST_OBJECT_ID: u32 = 0x5000_0000;
const PEER_POLL: Duration = Duration::from_millis(20);
const LOCAL_UPDATE_EVERY: Duration = Duration::from_millis(75);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = resolve_config(&cli)?;
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    init_tracing("skylink-sim", &config.logging)?;
    match &source {
        Ok(path) => info!(config_path = %path.display(), "configuration loaded"),
        Err(err) => info!(error = %err, "no configuration file, running with defaults"),
    }

    let registry = Arc::new(Registry::new());
    let metrics = LinkMetrics::new(registry.clone())?;
    let codec = LoopbackCodec::new();
    let telemetry = Arc::new(
        Telemetry::new(
            &config.link,
            Arc::new(codec.clone()),
            tokio::time::Instant::now().into_std(),
        )
        .with_metrics(metrics),
    );
    let handle = LinkRuntime::spawn(telemetry, &config.link);
    let seed = cli.seed.or(config.link.random_seed).unwrap_or(0x5EED);

    let objects = register_objects(&handle, cli.objects).await?;
    let peer = tokio::spawn(run_peer(codec.clone(), handle.sender(), cli.loss, seed));
    let updates = tokio::spawn(run_local_updates(handle.sender(), objects, seed ^ 0xA5A5));
    let watcher = tokio::spawn(watch_notifications(handle.subscribe()));

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.duration_secs)) => {
            info!(duration_secs = cli.duration_secs, "simulation finished");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    peer.abort();
    updates.abort();
    watcher.abort();
    let view = handle.telemetry().stats_view();
    handle.shutdown().await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&view).context("failed to render link statistics")?
    );
    Ok(())
}

/// Load the first candidate config. Without `--config`, a missing file falls back to
/// defaults and the lookup error is handed back so it can be logged once tracing is up.
fn resolve_config(cli: &Cli) -> Result<(AppConfig, Result<PathBuf>)> {
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/skylink.toml"));
    candidates.push(PathBuf::from("configs/skylink.example.toml"));

    match AppConfig::load_with_source(&candidates) {
        Ok(loaded) => Ok((loaded.config, Ok(loaded.source))),
        Err(err) if cli.config.is_none() => Ok((AppConfig::default(), Err(err))),
        Err(err) => Err(err),
    }
}

/// Register a mix of update modes so every dispatch path runs.
async fn register_objects(handle: &LinkHandle, count: u32) -> Result<Vec<ObjectRef>> {
    let sender = handle.sender();
    let mut objects = Vec::new();
    for index in 0..count {
        let object = ObjectRef::single(FIRST_OBJECT_ID + index);
        let metadata = match index % 4 {
            0 => ObjectMetadata::periodic(250),
            1 => ObjectMetadata::periodic(500).with_ack(true),
            2 => ObjectMetadata::on_change().with_ack(true),
            _ => ObjectMetadata::throttled(200),
        };
        sender
            .send(LinkEvent::ObjectRegistered { object, metadata })
            .await
            .context("link task stopped during registration")?;
        objects.push(object);
    }
    Ok(objects)
}

/// Answer frames the way a remote flight controller would, dropping some of them.
async fn run_peer(codec: LoopbackCodec, sender: mpsc::Sender<LinkEvent>, loss: f64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut poll = tokio::time::interval(PEER_POLL);
    loop {
        poll.tick().await;
        for frame in codec.take_frames() {
            if rng.gen_bool(loss) {
                debug!(object = %frame.object, kind = frame.kind(), "peer lost frame");
                continue;
            }
            let reply = match frame.body {
                FrameBody::Object { acked: true } => Some(LinkEvent::TransactionCompleted {
                    key: TransactionKey::for_object(&frame.object, frame.all_instances),
                    success: true,
                }),
                FrameBody::Object { acked: false } => None,
                FrameBody::Request => Some(LinkEvent::Unpacked {
                    object: frame.object,
                    bytes: 43,
                }),
                FrameBody::Stats(report) => Some(LinkEvent::PeerStats(report)),
            };
            if let Some(reply) = reply {
                if sender.send(reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Raise registry-style local changes and the occasional request.
async fn run_local_updates(sender: mpsc::Sender<LinkEvent>, objects: Vec<ObjectRef>, seed: u64) {
    if objects.is_empty() {
        return;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ticker = tokio::time::interval(LOCAL_UPDATE_EVERY);
    loop {
        ticker.tick().await;
        let object = objects[rng.gen_range(0..objects.len())];
        let event = match rng.gen_range(0..10) {
            0 => LinkEvent::UpdateRequested {
                object,
                all_instances: false,
            },
            1 => LinkEvent::LocalUpdate {
                object,
                origin: UpdateOrigin::Manual,
            },
            _ => LinkEvent::LocalUpdate {
                object,
                origin: UpdateOrigin::Auto,
            },
        };
        if sender.send(event).await.is_err() {
            return;
        }
    }
}

async fn watch_notifications(mut notifications: tokio::sync::broadcast::Receiver<Notification>) {
    loop {
        match notifications.recv().await {
            Ok(Notification::Failed { object, reason }) => {
                warn!(object = %object, reason = ?reason, "object could not be synchronized");
            }
            Ok(Notification::StatsPublished(report)) => {
                info!(
                    tx_bytes_per_second = report.tx_bytes_per_second(),
                    tx_retries = report.tx_retries,
                    tx_errors = report.tx_errors,
                    "link statistics"
                );
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "notification watcher lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
