#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Openmesh Core node entrypoint.
//! Starts the overlay, the updater and the BFT application surface, then
//! waits for a termination signal or an update handoff.

use anyhow::Context;
use clap::Parser;
use libp2p::Multiaddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use openmesh_core::bft;
use openmesh_core::bft::app::CoreApp;
use openmesh_core::collector::sources::{LiveJoiner, SOURCES};
use openmesh_core::collector::CollectorInstance;
use openmesh_core::config::{self, Flags, LogConfig};
use openmesh_core::core::keystore::Keystore;
use openmesh_core::core::state::BlockStore;
use openmesh_core::core::types::validator_address;
use openmesh_core::monitoring::{http, metrics::Metrics};
use openmesh_core::networking::p2p::spawn_p2p;
use openmesh_core::updater::{public_key_from_base64, UpdaterInstance, UpdaterOutcome};

/// Public keys trusted to sign new releases.
// XXX: these are not the final keys, change before deploying to production!
const TRUSTED_KEYS_BASE64: &[&str] = &["em9//dXGUM4iQR348WqHmNtvin0HYkLQQCOqbufssbA"];

fn init_logging(cfg: &LogConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&cfg.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match (&cfg.file, cfg.json) {
        (Some(path), json) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {path}"))?;
            let base = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false);
            if json {
                base.json().try_init().ok();
            } else {
                base.compact().try_init().ok();
            }
        }
        (None, true) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .try_init()
                .ok();
        }
        (None, false) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .compact()
                .try_init()
                .ok();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    let cfg = config::load(&flags.config)
        .with_context(|| format!("configuration at {}", flags.config.display()))?;

    init_logging(&cfg.log)?;
    info!(
        name = %cfg.node.name,
        version = env!("CARGO_PKG_VERSION"),
        "openmesh core starting"
    );

    let metrics = Arc::new(Metrics::new().context("metrics init")?);
    let cancel = CancellationToken::new();

    // Validator identity; its address is what the assignment engine matches
    // against the voter set.
    let keystore = Keystore::open(&cfg.node.data_dir).context("keystore")?;
    let our_address = validator_address(&keystore.public_key());
    info!(address = %hex::encode(our_address), "validator identity loaded");

    // Overlay.
    let (p2p, p2p_task) = spawn_p2p(&cfg.p2p, &cfg.node.data_dir, cancel.child_token(), metrics.clone())
        .context("p2p start")?;

    // Updater. A malformed seeder hint is dropped, not fatal.
    let trusted_keys = TRUSTED_KEYS_BASE64
        .iter()
        .map(|s| public_key_from_base64(s))
        .collect::<Result<Vec<_>, _>>()
        .context("trusted key constants")?;
    let seeder = cfg.p2p.update_seeder.as_deref().and_then(|s| match s.parse::<Multiaddr>() {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!(seeder = %s, err = %e, "ignoring bad update_seeder address");
            None
        }
    });
    let updater = UpdaterInstance::new(trusted_keys);
    let mut updater_task = tokio::spawn(updater.run(
        cancel.child_token(),
        p2p.clone(),
        seeder,
        metrics.clone(),
    ));

    // Block store, collector and the application surface for the engine.
    let store = BlockStore::open(&format!("{}/db", cfg.node.data_dir)).context("block store")?;
    let mut collector = CollectorInstance::new(SOURCES, LiveJoiner, cancel.child_token());
    collector.start().context("collector start")?;
    let app = CoreApp::new(store, collector, our_address, SOURCES, metrics.clone());
    let bft = bft::Instance::new(app, cfg.bft.home_dir.clone());
    bft.start();

    let http_task = http::spawn(cfg.http.listen_addr.clone(), metrics, cancel.child_token());

    // Run until a signal arrives or the updater hands off.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("sigterm handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("termination signal received: SIGINT");
        }
        _ = sigterm.recv() => {
            info!("termination signal received: SIGTERM");
        }
        outcome = &mut updater_task => {
            match outcome {
                Ok(Ok(UpdaterOutcome::Handoff)) => {
                    info!("update handoff complete, exiting");
                    std::process::exit(0);
                }
                Ok(Ok(UpdaterOutcome::Cancelled)) => {}
                Ok(Err(e)) => warn!(err = %e, "updater stopped"),
                Err(e) => warn!(err = %e, "updater task failed"),
            }
        }
    }

    cancel.cancel();
    let _ = http_task.await;
    let _ = p2p_task.await;
    updater_task.abort();
    info!("shutdown complete");
    Ok(())
}
