// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control API HTTP server.

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::supervisor::Supervisor;

/// Build the control API router.
pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/apps", get(handlers::list_apps))
        .route("/apps/running", get(handlers::running_apps))
        .route("/apps/start-all", post(handlers::start_all))
        .route("/apps/stop-all", post(handlers::stop_all))
        .route("/apps/rediscover", post(handlers::rediscover))
        .route("/apps/{name}/status", get(handlers::app_status))
        .route("/apps/{name}/logs", get(handlers::app_logs))
        .route("/apps/{name}/start", post(handlers::start_app))
        .route("/apps/{name}/stop", post(handlers::stop_app))
        .route("/apps/{name}/restart", post(handlers::restart_app))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

/// Serve the control API on `listener` until `shutdown_rx` flips to true.
pub async fn run_control_server_with_shutdown(
    listener: TcpListener,
    supervisor: Arc<Supervisor>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Control API listening");

    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(async move {
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            info!("Control API received shutdown signal");
        })
        .await?;

    info!("Control API stopped");
    Ok(())
}
