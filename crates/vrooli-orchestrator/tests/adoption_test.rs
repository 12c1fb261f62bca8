// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup adoption of apps that were already running.
//!
//! The app processes here are started by the test itself, outside the
//! supervisor, before the runtime comes up.

#[macro_use]
mod common;

use std::net::{Ipv4Addr, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use axum::http::{Method, StatusCode};

use common::*;
use vrooli_orchestrator::process_table::ProcessTable;
use vrooli_orchestrator::registry::AppStatus;
use vrooli_orchestrator::runner::pid_alive;
use vrooli_orchestrator::runtime::OrchestratorRuntime;
use vrooli_orchestrator::server::router;
use vrooli_orchestrator::supervisor::{StartOutcome, StopOutcome};

/// Kills and reaps the wrapped child on drop, so a failed assertion
/// doesn't leak it.
struct Reaped(Child);

impl Drop for Reaped {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_in(dir: &std::path::Path, program: &str, args: &[&str]) -> Reaped {
    let child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn external app process");
    Reaped(child)
}

#[tokio::test]
async fn test_adopts_app_listening_on_its_port() {
    skip_if_no_python!();

    let ctx = TestContext::new();
    let port = free_port();
    let root = ctx.add_app("a", &fixed_api(port), SLEEPER);

    let port_arg = port.to_string();
    let mut external = spawn_in(
        &root,
        "python3",
        &["-m", "http.server", &port_arg, "--bind", "127.0.0.1"],
    );
    let pid = external.0.id();
    let up = wait_for(Duration::from_secs(10), move || async move {
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_ok()
    })
    .await;
    assert!(up, "external server never listened on {}", port);

    let runtime = OrchestratorRuntime::builder()
        .config(ctx.config.clone())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let supervisor = runtime.supervisor().clone();

    let view = supervisor.get_app_status("a").await.unwrap();
    assert_eq!(view.status, AppStatus::Running);
    assert_eq!(view.pid, Some(pid));
    assert!(view.adopted);
    assert_eq!(view.allocated_ports.get("api"), Some(&port));

    let table = ProcessTable::capture();
    let expected_start = table.get(pid).unwrap().start_time;
    assert_eq!(view.started_at, Some(expected_start));

    // The HTTP view agrees
    let app = router(supervisor.clone());
    let (status, body) = call(&app, Method::GET, "/apps/a/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pid"], pid);
    assert_eq!(body["adopted"], true);
    assert_eq!(body["port_status"]["api"]["listening"], true);

    // Starting an adopted app spawns nothing
    let outcome = supervisor.start_app("a").await.unwrap();
    assert_eq!(outcome, StartOutcome::AlreadyRunning { pid });
    assert!(!ctx.log_file("a").exists());

    let stopped = supervisor.stop_app("a", false).await.unwrap();
    assert!(matches!(stopped, StopOutcome::Stopped { pid: p, .. } if p == pid));

    external.0.wait().unwrap();
    assert!(!pid_alive(pid));

    let results = runtime.shutdown().await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_adopts_app_found_by_process_scan() {
    let ctx = TestContext::new();
    let root = ctx.add_app("b", "{}", SLEEPER);
    ctx.add_app("c", "{}", SLEEPER);

    let external = spawn_in(&root, "sleep", &["30"]);
    let pid = external.0.id();

    let runtime = OrchestratorRuntime::builder()
        .config(ctx.config.clone())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let supervisor = runtime.supervisor().clone();

    let view = supervisor.get_app_status("b").await.unwrap();
    assert_eq!(view.status, AppStatus::Running);
    assert_eq!(view.pid, Some(pid));
    assert!(view.adopted);

    // Nothing runs under c
    let view = supervisor.get_app_status("c").await.unwrap();
    assert_eq!(view.status, AppStatus::Stopped);
    assert!(view.pid.is_none());

    let results = runtime.shutdown().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].app, "b");
    assert!(results[0].success);

    drop(external);
    assert!(!pid_alive(pid));
}

#[tokio::test]
async fn test_runtime_serves_and_shuts_down_cleanly() {
    let ctx = TestContext::new();
    ctx.add_app("a", "{}", SLEEPER);

    let runtime = OrchestratorRuntime::builder()
        .config(ctx.config.clone())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_running());
    assert_ne!(runtime.local_addr().port(), 0);

    let pid = runtime.supervisor().start_app("a").await.unwrap().pid();
    assert!(pid_alive(pid));

    let results = runtime.shutdown().await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert!(!pid_alive(pid));
}

#[tokio::test]
async fn test_runtime_fails_on_missing_apps_root() {
    let mut ctx = TestContext::new();
    ctx.config.apps_root = ctx.apps_root.join("does-not-exist");

    let err = OrchestratorRuntime::builder()
        .config(ctx.config.clone())
        .build()
        .unwrap()
        .start()
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("cannot read apps root"));
}
