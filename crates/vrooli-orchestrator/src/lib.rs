// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vrooli Orchestrator - App Supervisor
//!
//! A long-running control plane that discovers generated apps on disk,
//! pre-allocates their ports, launches and stops them on demand, and keeps
//! an authoritative in-memory view of each app's lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    HTTP clients (CLI, dashboards)                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  vrooli-orchestrator (This Crate)                        │
//! │                         Port 9500                                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │    App      │  │   Process   │  │  Adoption   │  │   Health    │     │
//! │  │  Registry   │  │ Supervisor  │  │   Scanner   │  │   Monitor   │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐                      │
//! │  │    Port     │  │  Fork-Bomb  │  │    Build    │                      │
//! │  │  Registry   │  │  Detector   │  │    Cache    │                      │
//! │  └─────────────┘  └─────────────┘  └─────────────┘                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ bash scripts/manage.sh develop --fast
//!                                    ▼   (new session per app)
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 <apps_root>/<name>  (one process group each)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Control API
//!
//! | Path | Verb | Description |
//! |------|------|-------------|
//! | `/health` | GET | Liveness plus app counts and fork-bomb rate |
//! | `/status` | GET | Supervisor, app and host snapshot |
//! | `/apps` | GET | Every app |
//! | `/apps/running` | GET | Running apps |
//! | `/apps/{name}/status` | GET | One app, with per-port listening state |
//! | `/apps/{name}/logs` | GET | Tail of the app's log (`?lines=`) |
//! | `/apps/{name}/start` | POST | Start an app |
//! | `/apps/{name}/stop` | POST | Stop an app (`?force=`) |
//! | `/apps/{name}/restart` | POST | Stop then start (`?force=`) |
//! | `/apps/start-all` | POST | Start every enabled app |
//! | `/apps/stop-all` | POST | Stop every app not stopped (`?force=`) |
//! | `/apps/rediscover` | POST | Re-read the apps root |
//!
//! # App State Machine
//!
//! ```text
//! stopped ──start──▶ starting ──settled──▶ running ──stop──▶ stopping ──exit──▶ stopped
//!    ▲                   │                    │
//!    │                   └──exited──▶ error   └──process gone──▶ stopped
//!    └────────stop───────────────────────┘
//! ```
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables.

#![deny(missing_docs)]

/// Supervisor configuration loaded from environment variables.
pub mod config;

/// Error types for supervisor operations.
pub mod error;

/// Process-wide reserved port set.
pub mod ports;

/// Start-rate limiting.
pub mod fork_bomb;

/// App manifest parsing.
pub mod manifest;

/// OS process and listener snapshots.
pub mod process_table;

/// App discovery and per-app records.
pub mod registry;

/// Go API build cache.
pub mod build_cache;

/// Attaching already-running apps at startup.
pub mod adoption;

/// Launching and signalling app processes.
pub mod runner;

/// Per-app lifecycle state machine.
pub mod supervisor;

/// Background liveness reconciler.
pub mod health_monitor;

/// Control API request handlers.
pub mod handlers;

/// Control API HTTP server.
pub mod server;

/// Embeddable runtime for vrooli-orchestrator.
pub mod runtime;

pub use config::Config;
pub use error::Error;
pub use supervisor::Supervisor;
