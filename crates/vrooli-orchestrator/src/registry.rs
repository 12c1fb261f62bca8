// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App Registry
//!
//! Turns the apps root into one [`App`] record per directory and owns those
//! records for the life of the supervisor. The map itself is read-mostly and
//! only written by (re)discovery; each record sits behind its own mutex, and
//! each app additionally carries an async operation lock that serialises
//! start/stop so its state machine sees strictly ordered transitions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::manifest::{PortSpec, ServiceManifest, manifest_path};
use crate::ports::PortRegistry;
use crate::process_table::{ProcessInfo, ProcessTable};
use crate::runner::{leads_group, pid_alive};

/// Lifecycle state of an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    /// Not running; no pid.
    Stopped,
    /// Lifecycle command spawned, inside the settle wait.
    Starting,
    /// Process alive.
    Running,
    /// Stop signals in flight.
    Stopping,
    /// Last start attempt failed.
    Error,
}

impl AppStatus {
    /// Get the status string
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Stopped => "stopped",
            AppStatus::Starting => "starting",
            AppStatus::Running => "running",
            AppStatus::Stopping => "stopping",
            AppStatus::Error => "error",
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The OS process behind a live app.
#[derive(Debug)]
pub(crate) enum AppProcess {
    /// Spawned by this supervisor in a new session.
    Spawned {
        /// Handle used for reaping.
        child: Child,
        /// Child pid, also its process group id.
        pid: u32,
    },
    /// Found already running at startup.
    Adopted {
        /// Adopted pid.
        pid: u32,
    },
}

impl AppProcess {
    pub(crate) fn pid(&self) -> u32 {
        match self {
            AppProcess::Spawned { pid, .. } | AppProcess::Adopted { pid } => *pid,
        }
    }

    pub(crate) fn is_adopted(&self) -> bool {
        matches!(self, AppProcess::Adopted { .. })
    }

    /// Whether signals should target the whole process group.
    pub(crate) fn signals_group(&self) -> bool {
        match self {
            AppProcess::Spawned { .. } => true,
            AppProcess::Adopted { pid } => leads_group(*pid),
        }
    }

    /// `Some(description)` once the process has exited.
    ///
    /// Spawned children are reaped here, so they never linger as zombies.
    pub(crate) fn exit_reason(&mut self) -> Option<String> {
        match self {
            AppProcess::Spawned { child, pid } => match child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(e) if pid_alive(*pid) => {
                    debug!(pid = *pid, error = %e, "try_wait failed, process still alive");
                    None
                }
                Err(e) => Some(e.to_string()),
            },
            AppProcess::Adopted { pid } => (!pid_alive(*pid)).then(|| "process exited".to_string()),
        }
    }

    pub(crate) fn is_alive(&mut self) -> bool {
        self.exit_reason().is_none()
    }
}

/// One discovered app.
#[derive(Debug)]
pub struct App {
    /// Directory name; unique across the registry.
    pub name: String,
    /// Disabled apps refuse to start.
    pub enabled: bool,
    /// App root directory.
    pub root: PathBuf,
    /// Manifest path.
    pub config_path: PathBuf,
    /// Where the child's stdout and stderr are appended.
    pub log_file: PathBuf,
    /// Port role to port number.
    pub allocated_ports: BTreeMap<String, u16>,
    /// Current lifecycle state.
    pub status: AppStatus,
    /// Last transition into `starting` (or adoption time).
    pub started_at: Option<DateTime<Utc>>,
    /// Last transition into `stopped`.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Launches after the first one.
    pub restart_count: u32,
    /// Liveness probes that found a running app dead.
    pub health_check_failures: u32,
    /// Message of the last failed start or stop.
    pub last_error: Option<String>,
    pub(crate) process: Option<AppProcess>,
    pub(crate) launched_before: bool,
}

impl App {
    fn new(
        name: String,
        root: PathBuf,
        enabled: bool,
        log_file: PathBuf,
        allocated_ports: BTreeMap<String, u16>,
    ) -> Self {
        Self {
            config_path: manifest_path(&root),
            name,
            enabled,
            root,
            log_file,
            allocated_ports,
            status: AppStatus::Stopped,
            started_at: None,
            stopped_at: None,
            restart_count: 0,
            health_check_failures: 0,
            last_error: None,
            process: None,
            launched_before: false,
        }
    }

    /// Current pid, present while starting, running or stopping.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(AppProcess::pid)
    }

    /// Whether the current process was adopted rather than spawned.
    pub fn is_adopted(&self) -> bool {
        self.process.as_ref().is_some_and(AppProcess::is_adopted)
    }

    /// Whether a tracked process exists and is alive.
    pub(crate) fn process_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(AppProcess::is_alive)
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.status = AppStatus::Stopped;
        self.process = None;
        self.stopped_at = Some(Utc::now());
    }

    /// Bring a `running` record in line with the OS.
    ///
    /// Returns true when the process was found dead and the app moved to
    /// `stopped`.
    pub(crate) fn reconcile(&mut self) -> bool {
        if self.status != AppStatus::Running || self.process_alive() {
            return false;
        }
        warn!(
            app = %self.name,
            pid = ?self.pid(),
            "Running app's process is gone, marking stopped"
        );
        self.health_check_failures += 1;
        self.mark_stopped();
        true
    }

    /// Attach an already-running process.
    pub(crate) fn adopt(&mut self, pid: u32, started_at: DateTime<Utc>) {
        self.process = Some(AppProcess::Adopted { pid });
        self.status = AppStatus::Running;
        self.started_at = Some(started_at);
        self.stopped_at = None;
        self.launched_before = true;
    }

    /// Serializable snapshot of this record.
    pub fn view(&self) -> AppView {
        AppView {
            name: self.name.clone(),
            enabled: self.enabled,
            status: self.status,
            pid: self.pid(),
            adopted: self.is_adopted(),
            config_path: self.config_path.clone(),
            log_file: self.log_file.clone(),
            allocated_ports: self.allocated_ports.clone(),
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            restart_count: self.restart_count,
            health_check_failures: self.health_check_failures,
            last_error: self.last_error.clone(),
            port_status: None,
        }
    }
}

/// Listening state of one allocated port.
#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    /// Port number.
    pub port: u16,
    /// Whether something accepts connections on it.
    pub listening: bool,
}

/// Serializable view of an [`App`].
#[derive(Debug, Clone, Serialize)]
pub struct AppView {
    /// App name.
    pub name: String,
    /// Whether the app may be started.
    pub enabled: bool,
    /// Lifecycle state.
    pub status: AppStatus,
    /// Process id while live.
    pub pid: Option<u32>,
    /// Whether the process was adopted.
    pub adopted: bool,
    /// Manifest path.
    pub config_path: PathBuf,
    /// Log file path.
    pub log_file: PathBuf,
    /// Port role to port number.
    pub allocated_ports: BTreeMap<String, u16>,
    /// Last start.
    pub started_at: Option<DateTime<Utc>>,
    /// Last stop.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Launches after the first one.
    pub restart_count: u32,
    /// Failed liveness probes.
    pub health_check_failures: u32,
    /// Last start/stop failure.
    pub last_error: Option<String>,
    /// Per-role listening state; only filled by single-app status queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_status: Option<BTreeMap<String, PortStatus>>,
}

/// Registry slot for one app.
#[derive(Debug)]
pub struct AppEntry {
    name: String,
    ops: tokio::sync::Mutex<()>,
    record: Mutex<App>,
}

impl AppEntry {
    fn new(app: App) -> Self {
        Self {
            name: app.name.clone(),
            ops: tokio::sync::Mutex::new(()),
            record: Mutex::new(app),
        }
    }

    /// App name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the record. Never hold the guard across an await.
    pub fn record(&self) -> MutexGuard<'_, App> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the per-app operation lock serialising start/stop.
    pub async fn lock_ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ops.lock().await
    }
}

/// Outcome of a rediscovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RediscoverReport {
    /// Newly discovered apps.
    pub added: Vec<String>,
    /// Apps whose directory vanished and were dropped.
    pub removed: Vec<String>,
    /// Apps whose `enabled` flag changed.
    pub updated: Vec<String>,
    /// Registry size after the pass.
    pub total: usize,
}

/// The set of discovered apps.
#[derive(Debug)]
pub struct AppRegistry {
    apps_root: PathBuf,
    logs_dir: PathBuf,
    ports: Arc<PortRegistry>,
    apps: RwLock<BTreeMap<String, Arc<AppEntry>>>,
    /// Held for a whole rediscovery pass.
    rediscovering: Mutex<()>,
}

impl AppRegistry {
    /// Discover every app under `apps_root`.
    ///
    /// Fails only when the apps root itself cannot be read. Apps with a
    /// missing or invalid manifest are logged and skipped. Directories are
    /// visited in sorted order so port allocation is reproducible.
    pub fn discover(
        apps_root: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
        ports: Arc<PortRegistry>,
        table: &ProcessTable,
    ) -> Result<Self> {
        let apps_root = std::fs::canonicalize(apps_root.into())?;
        let logs_dir = logs_dir.into();

        let mut apps = BTreeMap::new();
        for (name, root) in scan_app_dirs(&apps_root)? {
            if let Some(app) = load_app(&name, root, &logs_dir, &ports, table) {
                apps.insert(name, Arc::new(AppEntry::new(app)));
            }
        }

        info!(
            apps_root = %apps_root.display(),
            apps = apps.len(),
            ports = ports.allocated().len(),
            "Discovered apps"
        );

        Ok(Self {
            apps_root,
            logs_dir,
            ports,
            apps: RwLock::new(apps),
            rediscovering: Mutex::new(()),
        })
    }

    /// Canonical apps root.
    pub fn apps_root(&self) -> &Path {
        &self.apps_root
    }

    /// Shared port registry.
    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    /// Look up an app.
    pub fn get(&self, name: &str) -> Option<Arc<AppEntry>> {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// All apps, sorted by name.
    pub fn entries(&self) -> Vec<Arc<AppEntry>> {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// All app names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of apps.
    pub fn len(&self) -> usize {
        self.apps.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no app was discovered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the app `process` belongs to, if any.
    pub fn owner_of(&self, process: &ProcessInfo) -> Option<String> {
        self.entries().into_iter().find_map(|entry| {
            let root = entry.record().root.clone();
            process.belongs_to(&root).then(|| entry.name().to_string())
        })
    }

    /// Re-read the apps root.
    ///
    /// New directories become apps, existing apps refresh `enabled`, and apps
    /// whose directory vanished are dropped (releasing their ports) unless
    /// they still have a live process.
    ///
    /// Concurrent passes run one after the other, so a new app is loaded
    /// and its ports reserved exactly once.
    pub fn rediscover(&self, table: &ProcessTable) -> Result<RediscoverReport> {
        let _pass = self
            .rediscovering
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let on_disk = scan_app_dirs(&self.apps_root)?;
        let on_disk_names: BTreeSet<&str> = on_disk.iter().map(|(n, _)| n.as_str()).collect();
        let mut report = RediscoverReport::default();

        for (name, root) in &on_disk {
            if let Some(entry) = self.get(name) {
                match ServiceManifest::load(root) {
                    Ok(manifest) => {
                        let mut app = entry.record();
                        if app.enabled != manifest.enabled {
                            info!(app = %name, enabled = manifest.enabled, "App enablement changed");
                            app.enabled = manifest.enabled;
                            report.updated.push(name.clone());
                        }
                    }
                    Err(e) => warn!(app = %name, error = %e, "Keeping previous manifest state"),
                }
                continue;
            }

            if let Some(app) = load_app(name, root.clone(), &self.logs_dir, &self.ports, table) {
                self.apps
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.clone(), Arc::new(AppEntry::new(app)));
                report.added.push(name.clone());
            }
        }

        for entry in self.entries() {
            if on_disk_names.contains(entry.name()) {
                continue;
            }
            let ports: Vec<u16> = {
                let mut app = entry.record();
                if app.process_alive() {
                    warn!(app = %app.name, "App directory vanished but process is alive, keeping");
                    continue;
                }
                app.allocated_ports.values().copied().collect()
            };
            self.apps
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(entry.name());
            for port in ports {
                self.ports.release(port);
            }
            report.removed.push(entry.name().to_string());
        }

        report.total = self.len();
        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            updated = report.updated.len(),
            total = report.total,
            "Rediscovered apps"
        );
        Ok(report)
    }
}

/// First-level, non-hidden directories of `apps_root`, sorted by name.
fn scan_app_dirs(apps_root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(apps_root)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        dirs.push((name, entry.path()));
    }
    dirs.sort();
    Ok(dirs)
}

fn load_app(
    name: &str,
    root: PathBuf,
    logs_dir: &Path,
    ports: &PortRegistry,
    table: &ProcessTable,
) -> Option<App> {
    let manifest = match ServiceManifest::load(&root) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(app = %name, error = %e, "Skipping app");
            return None;
        }
    };

    let allocated_ports = allocate_ports(name, &root, &manifest, ports, table);
    debug!(app = %name, enabled = manifest.enabled, ports = ?allocated_ports, "Loaded app");

    Some(App::new(
        name.to_string(),
        root,
        manifest.enabled,
        logs_dir.join(format!("{}.log", name)),
        allocated_ports,
    ))
}

/// Resolve every declared port role.
///
/// A port in the role's candidates that is already held by this app's own
/// process is claimed first so adoption can attach it; otherwise fixed roles
/// reserve their port and range roles take the first available one. Roles
/// that cannot be satisfied stay unassigned.
fn allocate_ports(
    name: &str,
    root: &Path,
    manifest: &ServiceManifest,
    ports: &PortRegistry,
    table: &ProcessTable,
) -> BTreeMap<String, u16> {
    let mut allocated = BTreeMap::new();

    for (role, spec) in &manifest.ports {
        let held_by_app = spec.candidates().find(|port| {
            table
                .port_owner(*port)
                .is_some_and(|owner| owner.belongs_to(root))
                && ports.claim(*port).is_ok()
        });
        if let Some(port) = held_by_app {
            allocated.insert(role.clone(), port);
            continue;
        }

        let port = match spec {
            PortSpec::Fixed(port) => match ports.reserve(*port) {
                Ok(()) => Some(*port),
                Err(e) => {
                    warn!(app = %name, role = %role, error = %e, "Leaving port role unassigned");
                    None
                }
            },
            PortSpec::Range { lo, hi } => {
                let port = ports.reserve_first_available(*lo..=*hi);
                if port.is_none() {
                    warn!(app = %name, role = %role, lo, hi, "No available port in range");
                }
                port
            }
        };

        if let Some(port) = port {
            allocated.insert(role.clone(), port);
        }
    }

    allocated
}
