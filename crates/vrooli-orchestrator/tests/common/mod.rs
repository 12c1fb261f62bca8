// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for vrooli-orchestrator integration tests.
//!
//! Provides TestContext for laying out a throwaway apps root with manifests
//! and lifecycle scripts, and helpers for driving the control API router.

#![allow(dead_code)]

use std::future::Future;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use vrooli_orchestrator::config::Config;
use vrooli_orchestrator::ports::PortRegistry;
use vrooli_orchestrator::process_table::ProcessTable;
use vrooli_orchestrator::registry::AppRegistry;
use vrooli_orchestrator::supervisor::{Supervisor, SupervisorConfig};

/// Lifecycle script that stays up until signalled.
pub const SLEEPER: &str = "exec sleep 30\n";

/// Lifecycle script that ignores SIGTERM, along with everything it spawns.
pub const TERM_IGNORER: &str = "trap '' TERM\nwhile true; do sleep 0.1; done\n";

/// Lifecycle script that exits straight away.
pub const CRASHER: &str = "echo crashing\nexit 3\n";

/// Throwaway apps root plus supervisor home.
pub struct TestContext {
    pub apps_root: PathBuf,
    pub home: PathBuf,
    pub config: Config,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create an empty apps root with short timings.
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let root = std::fs::canonicalize(temp_dir.path()).expect("Failed to canonicalize");
        let apps_root = root.join("generated-apps");
        let home = root.join("home");
        std::fs::create_dir_all(&apps_root).expect("Failed to create apps root");

        let config = Config {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            vrooli_root: root.clone(),
            apps_root: apps_root.clone(),
            vrooli_home: home.clone(),
            max_starts: 20,
            start_window: Duration::from_secs(60),
            settle_interval: Duration::from_millis(300),
            stop_grace: Duration::from_secs(1),
            health_interval: Duration::from_secs(1),
            go_binary: "go".to_string(),
        };

        Self {
            apps_root,
            home,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Write `<apps_root>/<name>` with a manifest and `scripts/manage.sh`.
    pub fn add_app(&self, name: &str, manifest: &str, script: &str) -> PathBuf {
        let root = self.apps_root.join(name);
        std::fs::create_dir_all(root.join(".vrooli")).unwrap();
        std::fs::create_dir_all(root.join("scripts")).unwrap();
        std::fs::write(root.join(".vrooli/service.json"), manifest).unwrap();
        std::fs::write(root.join("scripts/manage.sh"), script).unwrap();
        root
    }

    /// Per-app log path.
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.home.join("logs").join(format!("{}.log", name))
    }

    /// Discover the apps root, ignoring whatever is running on the host.
    pub fn supervisor(&self) -> Arc<Supervisor> {
        let registry = AppRegistry::discover(
            &self.config.apps_root,
            self.config.logs_dir(),
            Arc::new(PortRegistry::new()),
            &ProcessTable::empty(),
        )
        .expect("Discovery failed");
        Arc::new(Supervisor::new(
            registry,
            SupervisorConfig::from(&self.config),
        ))
    }
}

/// A port nobody is listening on right now.
pub fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Manifest with a single fixed `api` port.
pub fn fixed_api(port: u16) -> String {
    format!(r#"{{"ports": {{"api": {{"fixed": {}}}}}}}"#, port)
}

/// Poll `check` every 50ms until it returns true or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a request through the router and decode the JSON body.
pub async fn call(router: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

/// Return early from a test when `python3` is missing.
#[allow(unused_macros)]
macro_rules! skip_if_no_python {
    () => {
        if !crate::common::python_available() {
            eprintln!("Skipping test: python3 not available");
            return;
        }
    };
}

/// Whether `python3` is on PATH.
pub fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Lifecycle script serving HTTP on `$SERVICE_PORT`.
pub fn http_server_script() -> &'static str {
    "exec python3 -m http.server \"$SERVICE_PORT\" --bind 127.0.0.1\n"
}

/// Whether the app's root contains `file`.
pub fn app_has_file(root: &Path, file: &str) -> bool {
    root.join(file).exists()
}
