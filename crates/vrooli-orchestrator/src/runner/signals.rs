// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Signal delivery and liveness checks.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::debug;

/// Whether `pid` refers to a live, non-zombie process.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// Zombies still answer signal 0 but will never run again.
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The state field follows the parenthesised command name, which may
    // itself contain spaces or parentheses.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

/// Whether `pid` leads its own process group.
pub fn leads_group(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    nix::unistd::getpgid(Some(Pid::from_raw(raw)))
        .map(|pgid| pgid.as_raw() == raw)
        .unwrap_or(false)
}

/// Send `sig` to `pid`, or to the process group it leads when `group` is set.
///
/// A process that is already gone is not an error.
pub fn send_signal(pid: u32, sig: Signal, group: bool) -> nix::Result<()> {
    let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    let target = Pid::from_raw(raw);
    let result = if group {
        signal::killpg(target, sig)
    } else {
        signal::kill(target, sig)
    };
    match result {
        Ok(()) => {
            debug!(pid, signal = %sig, group, "Sent signal");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!(pid, signal = %sig, "Process already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
