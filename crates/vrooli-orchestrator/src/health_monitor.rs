// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that reconciles running apps with the OS.
//!
//! Apps recorded as `running` whose process has disappeared (crashed, killed
//! externally, or an adopted process that exited) are moved to `stopped`
//! and their `health_check_failures` counter is bumped. Status reads do the
//! same check lazily; this worker catches apps nobody is querying.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::supervisor::Supervisor;

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// How often to probe running apps.
    pub poll_interval: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Periodic liveness reconciler.
pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    config: HealthMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HealthMonitor {
    /// Create a new health monitor.
    pub fn new(supervisor: Arc<Supervisor>, config: HealthMonitorConfig) -> Self {
        Self {
            supervisor,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until the shutdown handle is notified.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Health monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.check_once();
                }
            }
        }

        info!("Health monitor stopped");
    }

    /// Run one reconciliation pass. Returns how many apps were found dead.
    pub fn check_once(&self) -> usize {
        let dead = self.supervisor.reconcile_all();
        if dead > 0 {
            warn!(dead, "Running apps found dead");
        } else {
            debug!("All running apps alive");
        }
        dead
    }
}
