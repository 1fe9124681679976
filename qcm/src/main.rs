mod cli;
mod device;
mod network;

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use qcm_core::{
    ApnDatabase, ControlSender, Session, SessionConfig, SessionOutcome, UsbNodeWatch,
};

use crate::cli::Cli;
use crate::device::QmiBackend;
use crate::network::DhcpNotifier;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Set up logging
    setup_logging(&cli)?;

    match run(cli).await? {
        SessionOutcome::Stopped => Ok(()),
        SessionOutcome::DeviceDisconnected => anyhow::bail!("Modem disconnected"),
    }
}

async fn run(cli: Cli) -> Result<SessionOutcome> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(timeout) = cli.request_timeout {
        config.request_timeout = timeout;
    }
    config.validate()?;

    let profile = cli.profile();
    let watch = match cli.usb_id() {
        Some(usb) => UsbNodeWatch::new(usb),
        None => UsbNodeWatch::at(&cli.device),
    };
    let notifier = DhcpNotifier::new(cli.interface.clone(), !cli.no_dhcp, cli.json);

    let mut session = Session::new(
        Arc::new(QmiBackend::new(&cli.device)),
        profile,
        config,
        Box::new(notifier),
        Arc::new(watch),
    );
    if let Some(path) = &cli.apn_db {
        let db = ApnDatabase::load(path)?;
        info!("Loaded {} APN entries from {}", db.len(), path.display());
        session = session.with_apn_resolver(Arc::new(db));
    }

    spawn_signal_handler(session.control());

    info!("Managing {}", cli.device.display());
    session
        .run()
        .await
        .with_context(|| format!("Session on {} failed", cli.device.display()))
}

/// SIGINT and SIGTERM both ask the session to stop.
fn spawn_signal_handler(control: ControlSender) {
    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                    _ = term.recv() => info!("Terminated"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Cannot listen for SIGINT: {}", e);
                    return;
                }
                info!("Interrupted");
            }
        }
        control.stop().await;
    });
}

fn setup_logging(cli: &Cli) -> Result<()> {
    let filter_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_level));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let file_layer = match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .init();
    Ok(())
}
