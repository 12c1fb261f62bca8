// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for vrooli-orchestrator.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default control API port.
pub const DEFAULT_PORT: u16 = 9500;

/// Maximum number of apps the supervisor expects to run at once. Also the
/// default fork-bomb ceiling.
pub const MAX_APPS: usize = 20;

/// Supervisor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control API bind address
    pub bind_addr: SocketAddr,
    /// Repository root exported to children as `VROOLI_ROOT`
    pub vrooli_root: PathBuf,
    /// Directory whose first-level entries are the apps
    pub apps_root: PathBuf,
    /// Supervisor home holding `logs/` and `build-cache/`
    pub vrooli_home: PathBuf,
    /// Fork-bomb ceiling: starts allowed per window
    pub max_starts: usize,
    /// Fork-bomb sliding window
    pub start_window: Duration,
    /// How long a freshly spawned child must survive to count as started
    pub settle_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace: Duration,
    /// Period of the background liveness reconciler
    pub health_interval: Duration,
    /// Compiler used by the build cache
    pub go_binary: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `ORCHESTRATOR_PORT`: control API port (default: 9500)
    /// - `VROOLI_ROOT`: repository root (default: current directory)
    /// - `GENERATED_APPS_DIR`: apps root (default: `$VROOLI_ROOT/generated-apps`)
    /// - `VROOLI_HOME`: logs and build cache (default: `$HOME/.vrooli`)
    /// - `ORCHESTRATOR_MAX_STARTS`: fork-bomb ceiling (default: 20)
    /// - `ORCHESTRATOR_START_WINDOW_SECS`: fork-bomb window (default: 60)
    /// - `ORCHESTRATOR_SETTLE_MS`: settle wait after spawn (default: 1000)
    /// - `ORCHESTRATOR_STOP_GRACE_SECS`: SIGTERM grace period (default: 5)
    /// - `ORCHESTRATOR_HEALTH_INTERVAL_SECS`: liveness reconciler period (default: 30)
    /// - `ORCHESTRATOR_GO_BINARY`: Go compiler (default: `go`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = parse_var("ORCHESTRATOR_PORT", DEFAULT_PORT, "must be a valid port number")?;

        let vrooli_root = match std::env::var("VROOLI_ROOT") {
            Ok(root) => PathBuf::from(root),
            Err(_) => std::env::current_dir().map_err(|_| {
                ConfigError::Invalid("VROOLI_ROOT", "unset and current directory is unreadable")
            })?,
        };

        let apps_root = std::env::var("GENERATED_APPS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| vrooli_root.join("generated-apps"));

        let vrooli_home = match std::env::var("VROOLI_HOME") {
            Ok(home) => PathBuf::from(home),
            Err(_) => std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".vrooli"))
                .map_err(|_| ConfigError::Missing("VROOLI_HOME or HOME"))?,
        };

        let max_starts: usize = parse_var(
            "ORCHESTRATOR_MAX_STARTS",
            MAX_APPS,
            "must be a positive integer",
        )?;
        if max_starts == 0 {
            return Err(ConfigError::Invalid(
                "ORCHESTRATOR_MAX_STARTS",
                "must be a positive integer",
            ));
        }

        let start_window_secs: u64 = parse_var(
            "ORCHESTRATOR_START_WINDOW_SECS",
            60,
            "must be a number of seconds",
        )?;
        let settle_ms: u64 = parse_var(
            "ORCHESTRATOR_SETTLE_MS",
            1000,
            "must be a number of milliseconds",
        )?;
        let stop_grace_secs: u64 = parse_var(
            "ORCHESTRATOR_STOP_GRACE_SECS",
            5,
            "must be a number of seconds",
        )?;
        let health_interval_secs: u64 = parse_var(
            "ORCHESTRATOR_HEALTH_INTERVAL_SECS",
            30,
            "must be a number of seconds",
        )?;

        let go_binary = std::env::var("ORCHESTRATOR_GO_BINARY").unwrap_or_else(|_| "go".to_string());

        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            vrooli_root,
            apps_root,
            vrooli_home,
            max_starts,
            start_window: Duration::from_secs(start_window_secs),
            settle_interval: Duration::from_millis(settle_ms),
            stop_grace: Duration::from_secs(stop_grace_secs),
            health_interval: Duration::from_secs(health_interval_secs.max(1)),
            go_binary,
        })
    }

    /// Directory holding per-app log files.
    pub fn logs_dir(&self) -> PathBuf {
        self.vrooli_home.join("logs")
    }

    /// Directory holding cached build artifacts.
    pub fn build_cache_dir(&self) -> PathBuf {
        self.vrooli_home.join("build-cache")
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(var, reason)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
