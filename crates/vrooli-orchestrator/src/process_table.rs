// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot of the OS process table and TCP listeners.
//!
//! Discovery and adoption both need to answer "who holds this port" and
//! "is this process one of our apps". A snapshot is captured once per pass
//! so every app in the pass sees the same view of the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sysinfo::System;
use tracing::debug;

/// One process from the snapshot.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    /// OS process id.
    pub pid: u32,
    /// Working directory, when readable.
    pub cwd: Option<PathBuf>,
    /// Command line arguments.
    pub cmd: Vec<String>,
    /// When the process started.
    pub start_time: DateTime<Utc>,
}

impl ProcessInfo {
    /// Whether this process runs inside the app rooted at `app_root`.
    ///
    /// The cwd must equal or lie under `app_root` (compared by path
    /// components), or some argument must mention `app_root` as a whole path
    /// segment. Substrings of the app name alone never match.
    pub fn belongs_to(&self, app_root: &Path) -> bool {
        if let Some(cwd) = &self.cwd
            && cwd.starts_with(app_root)
        {
            return true;
        }
        self.cmd
            .iter()
            .any(|arg| mentions_path_segment(arg, app_root))
    }
}

/// Whether `text` contains `root` as a complete path segment sequence.
///
/// The match must be followed by `/` or end of text, and preceded by the
/// start of text or a character that cannot be part of a path component.
pub fn mentions_path_segment(text: &str, root: &Path) -> bool {
    let Some(needle) = root.to_str() else {
        return false;
    };
    let needle = needle.trim_end_matches('/');
    if needle.is_empty() {
        return false;
    }

    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(needle) {
        let start = search_from + offset;
        let end = start + needle.len();

        let before_ok = text[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !is_path_char(c));
        let after_ok = text[end..].chars().next().is_none_or(|c| c == '/');

        if before_ok && after_ok {
            return true;
        }
        search_from = start + 1;
        while !text.is_char_boundary(search_from) {
            search_from += 1;
        }
    }
    false
}

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '~')
}

/// Point-in-time view of processes and TCP listeners.
#[derive(Debug, Default, Clone)]
pub struct ProcessTable {
    processes: HashMap<u32, ProcessInfo>,
    listeners: HashMap<u16, u32>,
}

impl ProcessTable {
    /// An empty table (nothing running, nothing listening).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from explicit parts.
    pub fn from_parts(processes: Vec<ProcessInfo>, listeners: HashMap<u16, u32>) -> Self {
        Self {
            processes: processes.into_iter().map(|p| (p.pid, p)).collect(),
            listeners,
        }
    }

    /// Capture the current host state. Blocking; call from a blocking context.
    ///
    /// The supervisor's own process is left out so it can never adopt itself.
    pub fn capture() -> Self {
        let own_pid = std::process::id();
        let system = System::new_all();

        let processes: HashMap<u32, ProcessInfo> = system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own_pid)
            .map(|(pid, process)| {
                let info = ProcessInfo {
                    pid: pid.as_u32(),
                    cwd: process.cwd().map(Path::to_path_buf),
                    cmd: process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy().into_owned())
                        .collect(),
                    start_time: DateTime::from_timestamp(process.start_time() as i64, 0)
                        .unwrap_or_else(Utc::now),
                };
                (info.pid, info)
            })
            .collect();

        let listeners = match listeners::get_all() {
            Ok(all) => {
                let mut by_port = HashMap::new();
                for listener in all {
                    by_port
                        .entry(listener.socket.port())
                        .or_insert(listener.process.pid);
                }
                by_port
            }
            Err(e) => {
                debug!(error = %e, "Could not enumerate TCP listeners");
                HashMap::new()
            }
        };

        debug!(
            processes = processes.len(),
            listeners = listeners.len(),
            "Captured process table"
        );

        Self {
            processes,
            listeners,
        }
    }

    /// Process by pid.
    pub fn get(&self, pid: u32) -> Option<&ProcessInfo> {
        self.processes.get(&pid)
    }

    /// PID listening on `port`, if any.
    pub fn listener_pid(&self, port: u16) -> Option<u32> {
        self.listeners.get(&port).copied()
    }

    /// Process listening on `port`, if it is in the snapshot.
    pub fn port_owner(&self, port: u16) -> Option<&ProcessInfo> {
        self.listener_pid(port).and_then(|pid| self.get(pid))
    }

    /// Earliest-started process belonging to the app at `app_root`.
    pub fn find_app_process(&self, app_root: &Path) -> Option<&ProcessInfo> {
        self.processes
            .values()
            .filter(|p| p.belongs_to(app_root))
            .min_by_key(|p| (p.start_time, p.pid))
    }
}
