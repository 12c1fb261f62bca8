// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process Supervisor
//!
//! Drives each app through `stopped → starting → running → stopping →
//! stopped` (or `starting → error`). Start and stop for one app are
//! serialised by the app's operation lock; different apps proceed in
//! parallel. Record fields are only touched under the record lock, which is
//! never held across an await, so intermediate states are observable by
//! concurrent status queries.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use nix::sys::signal::Signal;
use serde::Serialize;
use sysinfo::System;
use tracing::{debug, error, info, warn};

use crate::adoption::{AdoptionReport, adopt_running};
use crate::build_cache::BuildCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fork_bomb::{ForkBombDetector, ForkBombSnapshot};
use crate::ports;
use crate::process_table::ProcessTable;
use crate::registry::{
    AppEntry, AppProcess, AppRegistry, AppStatus, AppView, PortStatus, RediscoverReport,
};
use crate::runner::{self, LaunchOptions, send_signal};

/// Number of liveness polls spread across the stop grace period.
const STOP_POLLS: u32 = 5;

/// How long to wait for a SIGKILLed process to disappear.
const KILL_WAIT: Duration = Duration::from_secs(2);
const KILL_POLL: Duration = Duration::from_millis(50);

/// Lines returned by a log tail when none are requested.
pub const DEFAULT_LOG_LINES: usize = 100;
/// Upper bound on a log tail.
pub const MAX_LOG_LINES: usize = 5000;

/// Tunables for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Exported to children as `VROOLI_ROOT`.
    pub vrooli_root: PathBuf,
    /// Fork-bomb ceiling.
    pub max_starts: usize,
    /// Fork-bomb window.
    pub start_window: Duration,
    /// Post-spawn settle wait.
    pub settle_interval: Duration,
    /// SIGTERM grace period.
    pub stop_grace: Duration,
    /// Build cache directory.
    pub build_cache_dir: PathBuf,
    /// Go compiler.
    pub go_binary: String,
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        Self {
            vrooli_root: config.vrooli_root.clone(),
            max_starts: config.max_starts,
            start_window: config.start_window,
            settle_interval: config.settle_interval,
            stop_grace: config.stop_grace,
            build_cache_dir: config.build_cache_dir(),
            go_binary: config.go_binary.clone(),
        }
    }
}

/// Result of a successful start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was spawned and survived the settle wait.
    Started {
        /// Child pid.
        pid: u32,
    },
    /// The app was already running; nothing was spawned.
    AlreadyRunning {
        /// Existing pid.
        pid: u32,
    },
}

impl StartOutcome {
    /// Pid of the running app.
    pub fn pid(&self) -> u32 {
        match self {
            StartOutcome::Started { pid } | StartOutcome::AlreadyRunning { pid } => *pid,
        }
    }
}

/// Result of a successful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A live process was signalled and is gone.
    Stopped {
        /// Pid that was stopped.
        pid: u32,
        /// Whether SIGKILL was needed.
        forced: bool,
    },
    /// Nothing was running.
    AlreadyStopped,
}

/// Per-app outcome of a bulk operation.
#[derive(Debug, Clone, Serialize)]
pub struct BulkResult {
    /// App name.
    pub app: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error message when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BulkResult {
    fn from_result<T>(app: &str, result: Result<T>) -> Self {
        match result {
            Ok(_) => Self {
                app: app.to_string(),
                success: true,
                error: None,
            },
            Err(e) => Self {
                app: app.to_string(),
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Apps per lifecycle state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    /// All apps.
    pub total: usize,
    /// Enabled apps.
    pub enabled: usize,
    /// `stopped`.
    pub stopped: usize,
    /// `starting`.
    pub starting: usize,
    /// `running`.
    pub running: usize,
    /// `stopping`.
    pub stopping: usize,
    /// `error`.
    pub error: usize,
}

/// Host figures reported by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    /// Total memory in bytes.
    pub total_memory: u64,
    /// Used memory in bytes.
    pub used_memory: u64,
    /// 1, 5 and 15 minute load averages.
    pub load_average: [f64; 3],
}

impl HostSnapshot {
    fn capture() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let load = System::load_average();
        Self {
            total_memory: system.total_memory(),
            used_memory: system.used_memory(),
            load_average: [load.one, load.five, load.fifteen],
        }
    }
}

/// Aggregated supervisor and host snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    /// Crate version.
    pub version: &'static str,
    /// Supervisor pid.
    pub pid: u32,
    /// When the supervisor started.
    pub started_at: DateTime<Utc>,
    /// Seconds since start.
    pub uptime_seconds: u64,
    /// Apps per state.
    pub apps: StatusCounts,
    /// Fork-bomb window figures.
    pub fork_bomb: ForkBombSnapshot,
    /// Every reserved port.
    pub allocated_ports: Vec<u16>,
    /// Host memory and load.
    pub host: HostSnapshot,
}

/// Tail of an app's log file.
#[derive(Debug, Clone, Serialize)]
pub struct LogTail {
    /// App name.
    pub app: String,
    /// Log file path.
    pub log_file: PathBuf,
    /// Last lines, oldest first.
    pub lines: Vec<String>,
}

/// The supervisor engine shared by the control API and background workers.
#[derive(Debug)]
pub struct Supervisor {
    registry: AppRegistry,
    fork_bomb: ForkBombDetector,
    build_cache: BuildCache,
    config: SupervisorConfig,
    started_at: DateTime<Utc>,
    start_instant: Instant,
}

impl Supervisor {
    /// Create a supervisor over a discovered registry.
    pub fn new(registry: AppRegistry, config: SupervisorConfig) -> Self {
        Self {
            fork_bomb: ForkBombDetector::new(config.max_starts, config.start_window),
            build_cache: BuildCache::new(&config.build_cache_dir, &config.go_binary),
            registry,
            config,
            started_at: Utc::now(),
            start_instant: Instant::now(),
        }
    }

    /// The app registry.
    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    /// The shared fork-bomb detector.
    pub fn fork_bomb(&self) -> &ForkBombDetector {
        &self.fork_bomb
    }

    /// Time since the supervisor was created.
    pub fn uptime(&self) -> Duration {
        self.start_instant.elapsed()
    }

    fn entry(&self, name: &str) -> Result<Arc<AppEntry>> {
        self.registry
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Start an app.
    ///
    /// Checks, in order: the app exists, it is enabled, it is not already
    /// running, the fork-bomb window has room, and its build is ready. Then
    /// spawns the lifecycle command and waits out the settle interval.
    pub async fn start_app(&self, name: &str) -> Result<StartOutcome> {
        let entry = self.entry(name)?;
        let _ops = entry.lock_ops().await;
        self.start_locked(&entry).await
    }

    async fn start_locked(&self, entry: &AppEntry) -> Result<StartOutcome> {
        let name = entry.name();
        let options = {
            let mut app = entry.record();
            if !app.enabled {
                return Err(Error::Disabled(name.to_string()));
            }
            if app.status == AppStatus::Running {
                if let Some(pid) = app.pid()
                    && app.process_alive()
                {
                    debug!(app = %name, pid, "Already running");
                    return Ok(StartOutcome::AlreadyRunning { pid });
                }
                app.reconcile();
            }
            LaunchOptions {
                app_name: app.name.clone(),
                app_root: app.root.clone(),
                apps_root: self.registry.apps_root().to_path_buf(),
                vrooli_root: self.config.vrooli_root.clone(),
                ports: app.allocated_ports.clone(),
                log_file: app.log_file.clone(),
            }
        };

        if !self.fork_bomb.record_start() {
            let recent = self.fork_bomb.recent_starts();
            warn!(
                app = %name,
                recent,
                max_starts = self.fork_bomb.max_starts(),
                "Refusing start, fork-bomb window is full"
            );
            return Err(Error::RateLimited {
                name: name.to_string(),
                recent,
                window_secs: self.fork_bomb.window().as_secs(),
            });
        }

        if let Err(e) = self.build_cache.prepare(name, &options.app_root).await {
            error!(app = %name, error = %e, "Build failed");
            entry.record().last_error = Some(e.to_string());
            return Err(e);
        }

        // Spawning forks and writes files; keep the record lock out of it.
        let launched = runner::launch(&options);

        let pid = {
            let mut app = entry.record();
            if app.launched_before {
                app.restart_count += 1;
            }
            app.launched_before = true;
            app.started_at = Some(Utc::now());

            match launched {
                Ok((child, pid)) => {
                    app.status = AppStatus::Starting;
                    app.process = Some(AppProcess::Spawned { child, pid });
                    app.last_error = None;
                    pid
                }
                Err(e) => {
                    error!(app = %name, error = %e, "Failed to spawn lifecycle command");
                    app.status = AppStatus::Error;
                    app.process = None;
                    app.last_error = Some(e.to_string());
                    return Err(Error::SpawnFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        };

        tokio::time::sleep(self.config.settle_interval).await;

        let mut app = entry.record();
        let exited = app.process.as_mut().and_then(|p| p.exit_reason());
        if let Some(status) = exited {
            warn!(app = %name, pid, status = %status, "Lifecycle command exited during settle wait");
            app.status = AppStatus::Error;
            app.process = None;
            let reason = format!("exited during settle wait: {}", status);
            app.last_error = Some(reason.clone());
            return Err(Error::SpawnFailed {
                name: name.to_string(),
                reason,
            });
        }

        app.status = AppStatus::Running;
        info!(app = %name, pid, restart_count = app.restart_count, "App running");
        Ok(StartOutcome::Started { pid })
    }

    /// Stop an app.
    ///
    /// Without `force`, sends SIGTERM and polls for exit across the grace
    /// period before escalating to SIGKILL. Stopping an app with no live
    /// process succeeds and leaves it `stopped`.
    pub async fn stop_app(&self, name: &str, force: bool) -> Result<StopOutcome> {
        let entry = self.entry(name)?;
        let _ops = entry.lock_ops().await;
        self.stop_locked(&entry, force).await
    }

    async fn stop_locked(&self, entry: &AppEntry, force: bool) -> Result<StopOutcome> {
        let name = entry.name();
        let (pid, group, previous) = {
            let mut app = entry.record();
            let Some(pid) = app.pid() else {
                app.mark_stopped();
                return Ok(StopOutcome::AlreadyStopped);
            };
            if !app.process_alive() {
                debug!(app = %name, pid, "Process already gone");
                app.mark_stopped();
                return Ok(StopOutcome::AlreadyStopped);
            }
            let group = app.process.as_ref().is_some_and(|p| p.signals_group());
            let previous = app.status;
            app.status = AppStatus::Stopping;
            (pid, group, previous)
        };

        info!(app = %name, pid, force, group, "Stopping app");

        let forced = if force {
            self.signal(entry, pid, group, Signal::SIGKILL, previous)?;
            true
        } else {
            self.signal(entry, pid, group, Signal::SIGTERM, previous)?;
            let interval = self.config.stop_grace / STOP_POLLS;
            if self.wait_for_exit(entry, STOP_POLLS, interval).await {
                false
            } else {
                warn!(app = %name, pid, grace = ?self.config.stop_grace, "Grace period elapsed, sending SIGKILL");
                self.signal(entry, pid, group, Signal::SIGKILL, previous)?;
                true
            }
        };

        if forced {
            let polls = (KILL_WAIT.as_millis() / KILL_POLL.as_millis()) as u32;
            if !self.wait_for_exit(entry, polls, KILL_POLL).await {
                warn!(app = %name, pid, "Process still visible after SIGKILL");
            }
        } else if group {
            // The leader is gone; take down anything it left in its group.
            if let Err(e) = send_signal(pid, Signal::SIGKILL, true) {
                debug!(app = %name, pid, error = %e, "Group sweep after exit failed");
            }
        }

        let mut app = entry.record();
        app.mark_stopped();
        info!(app = %name, pid, forced, "App stopped");
        Ok(StopOutcome::Stopped { pid, forced })
    }

    fn signal(
        &self,
        entry: &AppEntry,
        pid: u32,
        group: bool,
        sig: Signal,
        previous: AppStatus,
    ) -> Result<()> {
        send_signal(pid, sig, group).map_err(|e| {
            error!(app = %entry.name(), pid, signal = %sig, error = %e, "Signal delivery failed");
            let mut app = entry.record();
            app.status = previous;
            app.last_error = Some(e.to_string());
            Error::StopFailed {
                name: entry.name().to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Poll liveness `polls` times, `interval` apart. True once the process
    /// is gone.
    async fn wait_for_exit(&self, entry: &AppEntry, polls: u32, interval: Duration) -> bool {
        for _ in 0..polls {
            tokio::time::sleep(interval).await;
            if !entry.record().process_alive() {
                return true;
            }
        }
        false
    }

    /// Stop then start an app under one hold of its operation lock.
    pub async fn restart_app(&self, name: &str, force: bool) -> Result<StartOutcome> {
        let entry = self.entry(name)?;
        let _ops = entry.lock_ops().await;
        self.stop_locked(&entry, force).await?;
        self.start_locked(&entry).await
    }

    /// Status of one app, reconciled against the OS, with per-port
    /// listening state.
    pub async fn get_app_status(&self, name: &str) -> Result<AppView> {
        let entry = self.entry(name)?;
        let mut view = {
            let mut app = entry.record();
            app.reconcile();
            app.view()
        };

        let mut port_status = BTreeMap::new();
        for (role, port) in &view.allocated_ports {
            port_status.insert(
                role.clone(),
                PortStatus {
                    port: *port,
                    listening: ports::is_listening(*port).await,
                },
            );
        }
        view.port_status = Some(port_status);
        Ok(view)
    }

    /// Every app, reconciled, sorted by name.
    pub fn list_apps(&self) -> Vec<AppView> {
        self.registry
            .entries()
            .iter()
            .map(|entry| {
                let mut app = entry.record();
                app.reconcile();
                app.view()
            })
            .collect()
    }

    /// Apps currently running.
    pub fn running_apps(&self) -> Vec<AppView> {
        self.list_apps()
            .into_iter()
            .filter(|app| app.status == AppStatus::Running)
            .collect()
    }

    /// Start every enabled app concurrently.
    pub async fn start_all(&self) -> Vec<BulkResult> {
        let names: Vec<String> = self
            .registry
            .entries()
            .iter()
            .filter(|entry| entry.record().enabled)
            .map(|entry| entry.name().to_string())
            .collect();

        join_all(names.iter().map(|name| async move {
            BulkResult::from_result(name, self.start_app(name).await)
        }))
        .await
    }

    /// Stop every app that is not `stopped`, concurrently.
    pub async fn stop_all(&self, force: bool) -> Vec<BulkResult> {
        let names: Vec<String> = self
            .registry
            .entries()
            .iter()
            .filter(|entry| {
                let app = entry.record();
                app.status != AppStatus::Stopped || app.pid().is_some()
            })
            .map(|entry| entry.name().to_string())
            .collect();

        join_all(names.iter().map(|name| async move {
            BulkResult::from_result(name, self.stop_app(name, force).await)
        }))
        .await
    }

    /// Force-stop everything; used on supervisor exit.
    pub async fn shutdown_all(&self) -> Vec<BulkResult> {
        let results = self.stop_all(true).await;
        let failed = results.iter().filter(|r| !r.success).count();
        info!(stopped = results.len() - failed, failed, "Stopped all apps for shutdown");
        results
    }

    /// Reconcile every app; returns how many were found dead.
    pub fn reconcile_all(&self) -> usize {
        self.registry
            .entries()
            .iter()
            .filter(|entry| entry.record().reconcile())
            .count()
    }

    /// Attach already-running processes, using a fresh process snapshot.
    pub async fn adopt_running(&self) -> AdoptionReport {
        let table = capture_table().await;
        adopt_running(&self.registry, &table)
    }

    /// Re-read the apps root.
    pub async fn rediscover(&self) -> Result<RediscoverReport> {
        let table = capture_table().await;
        self.registry.rediscover(&table)
    }

    /// Counts of apps per state.
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for view in self.list_apps() {
            counts.total += 1;
            if view.enabled {
                counts.enabled += 1;
            }
            match view.status {
                AppStatus::Stopped => counts.stopped += 1,
                AppStatus::Starting => counts.starting += 1,
                AppStatus::Running => counts.running += 1,
                AppStatus::Stopping => counts.stopping += 1,
                AppStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    /// Aggregated supervisor and host snapshot.
    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            version: env!("CARGO_PKG_VERSION"),
            pid: std::process::id(),
            started_at: self.started_at,
            uptime_seconds: self.uptime().as_secs(),
            apps: self.counts(),
            fork_bomb: self.fork_bomb.snapshot(),
            allocated_ports: self.registry.ports().allocated(),
            host: HostSnapshot::capture(),
        }
    }

    /// Last `lines` lines of an app's log; empty when there is no log yet.
    pub async fn tail_log(&self, name: &str, lines: usize) -> Result<LogTail> {
        let entry = self.entry(name)?;
        let log_file = entry.record().log_file.clone();
        let lines = lines.min(MAX_LOG_LINES);

        let contents = match tokio::fs::read(&log_file).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let all: Vec<&str> = contents.lines().collect();
        let tail = all[all.len().saturating_sub(lines)..]
            .iter()
            .map(|line| line.to_string())
            .collect();

        Ok(LogTail {
            app: name.to_string(),
            log_file,
            lines: tail,
        })
    }
}

/// Capture the process table off the async runtime.
pub async fn capture_table() -> ProcessTable {
    match tokio::task::spawn_blocking(ProcessTable::capture).await {
        Ok(table) => table,
        Err(e) => {
            error!(error = %e, "Process table capture panicked");
            ProcessTable::empty()
        }
    }
}
