// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for vrooli-orchestrator.
//!
//! [`OrchestratorRuntime`] wires discovery, adoption, the control API and
//! the health monitor together, and owns the shutdown sequence.
//!
//! ```rust,ignore
//! use vrooli_orchestrator::config::Config;
//! use vrooli_orchestrator::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = OrchestratorRuntime::builder()
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adoption::adopt_running;
use crate::config::Config;
use crate::health_monitor::{HealthMonitor, HealthMonitorConfig};
use crate::ports::PortRegistry;
use crate::registry::AppRegistry;
use crate::server::run_control_server_with_shutdown;
use crate::supervisor::{BulkResult, Supervisor, SupervisorConfig, capture_table};

/// Builder for creating an [`OrchestratorRuntime`].
#[derive(Default)]
pub struct OrchestratorRuntimeBuilder {
    config: Option<Config>,
    bind_addr: Option<SocketAddr>,
    ports: Option<Arc<PortRegistry>>,
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the supervisor configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the control API bind address from the configuration.
    ///
    /// Port 0 picks an ephemeral port; read it back with
    /// [`OrchestratorRuntime::local_addr`].
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Share an existing port registry instead of creating a fresh one.
    pub fn ports(mut self, ports: Arc<PortRegistry>) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;

        Ok(OrchestratorRuntimeConfig {
            bind_addr: self.bind_addr.unwrap_or(config.bind_addr),
            ports: self.ports.unwrap_or_default(),
            config,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    config: Config,
    bind_addr: SocketAddr,
    ports: Arc<PortRegistry>,
}

impl OrchestratorRuntimeConfig {
    /// Discover apps, adopt running ones, then start the control API and the
    /// health monitor.
    ///
    /// Fails when the apps root cannot be read or the control port cannot be
    /// bound.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        let logs_dir = self.config.logs_dir();
        if let Err(e) = tokio::fs::create_dir_all(&logs_dir).await {
            warn!(logs_dir = %logs_dir.display(), error = %e, "Could not create logs directory");
        }

        // One snapshot serves both discovery and adoption so they agree on
        // who holds which port.
        let table = capture_table().await;

        let registry = AppRegistry::discover(
            &self.config.apps_root,
            logs_dir,
            self.ports.clone(),
            &table,
        )
        .with_context(|| {
            format!(
                "cannot read apps root {}",
                self.config.apps_root.display()
            )
        })?;

        let supervisor = Arc::new(Supervisor::new(
            registry,
            SupervisorConfig::from(&self.config),
        ));

        let report = adopt_running(supervisor.registry(), &table);
        info!(
            adopted = report.adopted.len(),
            conflicts = report.conflicts.len(),
            "Adoption scan complete"
        );

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("cannot bind control API on {}", self.bind_addr))?;
        let local_addr = listener.local_addr()?;

        // Health monitor
        let health_monitor = HealthMonitor::new(
            supervisor.clone(),
            HealthMonitorConfig {
                poll_interval: self.config.health_interval,
            },
        );
        let health_shutdown = health_monitor.shutdown_handle();
        let health_handle = tokio::spawn(async move {
            health_monitor.run().await;
        });

        // Control API
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(run_control_server_with_shutdown(
            listener,
            supervisor.clone(),
            server_shutdown_rx,
        ));

        info!(
            bind_addr = %local_addr,
            apps_root = %supervisor.registry().apps_root().display(),
            apps = supervisor.registry().len(),
            "OrchestratorRuntime started"
        );

        Ok(OrchestratorRuntime {
            server_handle,
            health_handle,
            server_shutdown_tx,
            health_shutdown,
            supervisor,
            local_addr,
        })
    }
}

/// A running supervisor.
///
/// The runtime manages:
/// - the control API server
/// - the health monitor reconciling running apps with the OS
///
/// Call [`shutdown`](Self::shutdown) to stop both and force-stop every app.
pub struct OrchestratorRuntime {
    server_handle: JoinHandle<Result<()>>,
    health_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    health_shutdown: Arc<Notify>,
    supervisor: Arc<Supervisor>,
    local_addr: SocketAddr,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// Address the control API is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared supervisor.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Check if the server and monitor tasks are still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.health_handle.is_finished()
    }

    /// Stop the control API and the health monitor, then force-stop every
    /// app that is not `stopped`.
    ///
    /// Returns the per-app stop outcomes.
    pub async fn shutdown(self) -> Result<Vec<BulkResult>> {
        info!("OrchestratorRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.health_shutdown.notify_one();

        if let Err(e) = self.health_handle.await {
            error!("Health monitor task panicked: {}", e);
        }

        let server_result = match self.server_handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("server task panicked: {}", e)),
        };

        let results = self.supervisor.shutdown_all().await;

        match server_result {
            Ok(()) => {
                info!("OrchestratorRuntime shutdown complete");
                Ok(results)
            }
            Err(e) => {
                error!("Control API error during shutdown: {}", e);
                Err(e)
            }
        }
    }
}
