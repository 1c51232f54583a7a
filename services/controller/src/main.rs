//! hostcycle
//!
//! Drains and reboots every machine carrying a tag:
//!
//! - **Lock**: one run per tag at a time
//! - **Drain phase**: maintenance mode, one user notice, restart drained machines
//! - **Fallback phase**: restart whatever is left once the drain budget is spent
//! - **Release**: take registered machines out of maintenance

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use hostcycle_controller::config::{Cli, Settings};
use hostcycle_controller::error::{exit_code, print_error, RunError};
use hostcycle_controller::lock::FileLockStore;
use hostcycle_controller::timer::Pause;
use hostcycle_controller::{logging, BrokerClient, RunCoordinator, RunSettings};

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            print_error(&e);
            e.downcast_ref::<RunError>()
                .map(RunError::exit_code)
                .unwrap_or(exit_code::FAILURE)
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let settings = Settings::resolve(Cli::parse())?;

    logging::init(settings.log_format, settings.log_file.as_deref())?;

    info!(
        tag = %settings.tag,
        broker_url = %settings.broker_url,
        phase1_minutes = settings.phase1_minutes,
        poll_minutes = settings.poll_minutes,
        grace_minutes = settings.grace_minutes,
        phase2_minutes = settings.phase2_minutes,
        active_only = settings.active_only,
        notify_users = settings.notify_users,
        "Configuration loaded"
    );

    let broker = BrokerClient::new(
        &settings.broker_url,
        settings.broker_token.as_deref(),
        settings.request_timeout,
    )
    .context("Failed to create broker client")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal, stopping at the next pause");
            let _ = shutdown_tx.send(true);
        }
    });

    let coordinator = RunCoordinator::new(
        Arc::new(broker),
        Arc::new(FileLockStore::new(&settings.lock_dir)),
        RunSettings {
            controller: settings.controller_options(),
            active_only: settings.active_only,
            message_file: settings.message_file.clone(),
        },
        Pause::new(shutdown_rx),
    );

    let report = coordinator.run(&settings.tag).await?;

    if let Some(path) = &settings.summary_file {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write summary to {:?}", path))?;
    }

    Ok(report.exit_code())
}
