// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adoption Scanner
//!
//! Attaches apps that are already running when the supervisor boots, so they
//! are reported as `running` instead of being spawned a second time.
//!
//! Per app, first match wins:
//! 1. a listener on one of the app's allocated ports whose process belongs
//!    to the app's root;
//! 2. the earliest-started process in the table that belongs to the app's
//!    root.
//!
//! A listener that belongs to a different app is reported as a conflict and
//! left alone; the port stays reserved.

use serde::Serialize;
use tracing::{info, warn};

use crate::process_table::{ProcessInfo, ProcessTable};
use crate::registry::AppRegistry;
use crate::runner::pid_alive;

/// How an app was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdoptedVia {
    /// Listener on an allocated port.
    Port,
    /// Process table scan.
    ProcessScan,
}

/// One attached app.
#[derive(Debug, Clone, Serialize)]
pub struct Adopted {
    /// App name.
    pub app: String,
    /// Attached pid.
    pub pid: u32,
    /// Match strategy.
    pub via: AdoptedVia,
}

/// A port of one app held by a process that does not belong to it.
#[derive(Debug, Clone, Serialize)]
pub struct PortConflict {
    /// App the port is allocated to.
    pub app: String,
    /// Port role.
    pub role: String,
    /// Port number.
    pub port: u16,
    /// Listening pid.
    pub pid: u32,
    /// App the listener belongs to, when it is one of ours.
    pub owner: Option<String>,
}

/// Outcome of an adoption pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdoptionReport {
    /// Apps attached to a running process.
    pub adopted: Vec<Adopted>,
    /// Ports held by foreign processes.
    pub conflicts: Vec<PortConflict>,
}

/// Attach already-running processes to their apps.
///
/// Apps that already track a process are skipped, so running this twice
/// never double-attaches.
pub fn adopt_running(registry: &AppRegistry, table: &ProcessTable) -> AdoptionReport {
    let mut report = AdoptionReport::default();

    for entry in registry.entries() {
        let (root, ports) = {
            let app = entry.record();
            if app.pid().is_some() {
                continue;
            }
            (app.root.clone(), app.allocated_ports.clone())
        };

        let mut matched: Option<(&ProcessInfo, AdoptedVia)> = None;

        for (role, port) in &ports {
            let Some(pid) = table.listener_pid(*port) else {
                continue;
            };
            match table.get(pid) {
                Some(owner) if owner.belongs_to(&root) => {
                    matched = Some((group_leader_within(table, owner, &root), AdoptedVia::Port));
                    break;
                }
                owner => {
                    let owner_app = owner.and_then(|p| registry.owner_of(p));
                    warn!(
                        app = %entry.name(),
                        role = %role,
                        port,
                        pid,
                        owner = ?owner_app,
                        "Port is held by a process outside this app, not adopting it"
                    );
                    report.conflicts.push(PortConflict {
                        app: entry.name().to_string(),
                        role: role.clone(),
                        port: *port,
                        pid,
                        owner: owner_app,
                    });
                }
            }
        }

        if matched.is_none() {
            matched = table
                .find_app_process(&root)
                .map(|process| (process, AdoptedVia::ProcessScan));
        }

        let Some((process, via)) = matched else {
            continue;
        };
        if !pid_alive(process.pid) {
            continue;
        }

        entry.record().adopt(process.pid, process.start_time);
        info!(
            app = %entry.name(),
            pid = process.pid,
            via = ?via,
            started_at = %process.start_time,
            "Adopted running app"
        );
        report.adopted.push(Adopted {
            app: entry.name().to_string(),
            pid: process.pid,
            via,
        });
    }

    report
}

/// Prefer the listener's process-group leader when it belongs to the same
/// app, so stopping the app takes down the whole tree.
fn group_leader_within<'a>(
    table: &'a ProcessTable,
    process: &'a ProcessInfo,
    root: &std::path::Path,
) -> &'a ProcessInfo {
    let Ok(raw) = i32::try_from(process.pid) else {
        return process;
    };
    let Ok(pgid) = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(raw))) else {
        return process;
    };
    let Ok(leader) = u32::try_from(pgid.as_raw()) else {
        return process;
    };
    match table.get(leader) {
        Some(leader) if leader.pid != process.pid && leader.belongs_to(root) => leader,
        _ => process,
    }
}
