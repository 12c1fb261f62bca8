// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vrooli Orchestrator - App Supervisor
//!
//! Serves the control API until SIGINT or SIGTERM, then force-stops every
//! app before exiting. SIGINT exits with 130, SIGTERM with 0.

use std::process::ExitCode;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use vrooli_orchestrator::config::Config;
use vrooli_orchestrator::runtime::OrchestratorRuntime;

/// Exit status after an interrupt (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vrooli_orchestrator=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        bind_addr = %config.bind_addr,
        apps_root = %config.apps_root.display(),
        vrooli_home = %config.vrooli_home.display(),
        max_starts = config.max_starts,
        "Starting Vrooli Orchestrator"
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let runtime = OrchestratorRuntime::builder()
        .config(config)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Orchestrator ready");

    let code = tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT received");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received");
            ExitCode::SUCCESS
        }
    };

    let results = runtime.shutdown().await?;
    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        warn!(failed, "Some apps failed to stop cleanly");
    }

    info!("Vrooli Orchestrator shut down");

    Ok(code)
}
