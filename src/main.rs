use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context as _;
use clap::Parser;
use log::info;
use tokio::sync::mpsc;

mod config;
mod messages;
mod monitor;
mod reconciler;
mod tv;

#[derive(Parser, Debug)]
#[command(about = "Switches an LG TV input when a USB keyboard connects or disconnects")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(config::default_config_path);
    let config = config::load(&config_path)?;

    info!(
        "Watching keyboard {} ({}:{})",
        config.keyboard.name.as_deref().unwrap_or("unnamed"),
        config.keyboard.vendor_id,
        config.keyboard.product_id
    );

    let identity = monitor::DeviceIdentity::new(&config.keyboard);

    // Establish ground truth before entering the event loop, so the TV ends
    // up in the right state even if nothing is ever plugged or unplugged.
    let initially_present = monitor::scan_once(&identity)?;
    info!(
        "Initial scan: keyboard is {}",
        if initially_present {
            "connected"
        } else {
            "not connected"
        }
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let (raw_tx, raw_rx) = mpsc::channel(64);
    monitor::spawn_listener(raw_tx, shutdown.clone())?;

    let (presence_tx, presence_rx) = mpsc::channel(16);
    presence_tx
        .send(initially_present)
        .await
        .context("seeding presence channel")?;
    tokio::spawn(monitor::run_filter(
        identity,
        monitor::PresenceTracker::seeded(initially_present),
        raw_rx,
        presence_tx,
    ));

    let client = tv::WebOsClient::new(&config.tv);
    let reconciler = reconciler::Reconciler::new(client, config.switch);

    // Dropping the reconcile loop on a signal cancels any in-flight TV
    // command before its state is advanced, which is exactly the shutdown
    // semantics we want.
    tokio::select! {
        _ = reconciler.run(presence_rx) => {
            info!("Reconciler stopped");
        }
        res = shutdown_signal() => {
            res?;
            info!("Shutdown signal received, exiting");
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("waiting for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}
