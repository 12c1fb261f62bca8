// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for vrooli-orchestrator.

use std::path::PathBuf;

use thiserror::Error;

/// Supervisor errors.
///
/// Every per-app failure is isolated: handlers turn these into HTTP responses
/// or inline bulk results, and the supervisor keeps serving.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// No app with this name was discovered.
    #[error("App '{0}' not found")]
    NotFound(String),

    /// Start was requested on an app whose manifest disables it.
    #[error("App '{0}' is disabled")]
    Disabled(String),

    /// The fork-bomb window is full.
    #[error("Rate limited: too many app starts ({recent} in the last {window_secs}s), refusing to start '{name}'")]
    RateLimited {
        /// App whose start was refused.
        name: String,
        /// Starts currently recorded in the window.
        recent: usize,
        /// Window length in seconds.
        window_secs: u64,
    },

    /// A port could not be reserved.
    #[error("Port {0} is already in use")]
    PortInUse(u16),

    /// Preparing the app's artifact failed.
    #[error("Build failed for '{name}': {reason}")]
    BuildFailed {
        /// App name.
        name: String,
        /// Compiler output or I/O error.
        reason: String,
    },

    /// The lifecycle command could not be spawned or exited during the settle wait.
    #[error("Failed to start '{name}': {reason}")]
    SpawnFailed {
        /// App name.
        name: String,
        /// Spawn error or exit status.
        reason: String,
    },

    /// A signal could not be delivered.
    #[error("Failed to stop '{name}': {reason}")]
    StopFailed {
        /// App name.
        name: String,
        /// Signal delivery error.
        reason: String,
    },

    /// A manifest could not be parsed.
    #[error("Invalid manifest {}: {reason}", path.display())]
    ManifestInvalid {
        /// Manifest path.
        path: PathBuf,
        /// Parse or validation error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable name of the error kind, reported to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "Config",
            Self::NotFound(_) => "NotFound",
            Self::Disabled(_) => "Disabled",
            Self::RateLimited { .. } => "RateLimited",
            Self::PortInUse(_) => "PortInUse",
            Self::BuildFailed { .. } => "BuildFailed",
            Self::SpawnFailed { .. } => "SpawnFailed",
            Self::StopFailed { .. } => "StopFailed",
            Self::ManifestInvalid { .. } => "ManifestInvalid",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
        }
    }

    /// HTTP status code the control API answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Disabled(_) => 400,
            Self::RateLimited { .. } => 429,
            _ => 500,
        }
    }
}

/// Result type using the supervisor Error.
pub type Result<T> = std::result::Result<T, Error>;
