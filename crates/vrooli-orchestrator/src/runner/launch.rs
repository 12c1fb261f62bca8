// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launching an app's lifecycle command.
//!
//! The child runs `bash scripts/manage.sh develop --fast` from the app root,
//! in a new session, with stdout and stderr appended to the app's log file.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Lifecycle script, relative to the app root.
pub const LIFECYCLE_SCRIPT: &str = "scripts/manage.sh";

/// Arguments passed to the lifecycle script.
pub const LIFECYCLE_ARGS: &[&str] = &["develop", "--fast"];

/// Setup sentinel, relative to the app root.
pub const SETUP_STATE_PATH: &str = "data/.setup-state";

/// Everything needed to launch one app.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// App name
    pub app_name: String,
    /// App root directory (child cwd)
    pub app_root: PathBuf,
    /// Apps root, exported as `GENERATED_APPS_DIR`
    pub apps_root: PathBuf,
    /// Repository root, exported as `VROOLI_ROOT`
    pub vrooli_root: PathBuf,
    /// Port role to port number
    pub ports: BTreeMap<String, u16>,
    /// Log file receiving stdout and stderr
    pub log_file: PathBuf,
}

/// Environment variable name a port role is exported under.
pub fn port_env_name(role: &str) -> String {
    match role {
        "api" => "SERVICE_PORT".to_string(),
        "ui" => "UI_PORT".to_string(),
        other => format!("{}_PORT", other.to_uppercase().replace('-', "_")),
    }
}

/// Build the child environment from the supervisor's environment.
///
/// Inherited variables ending in `_PORT` are dropped, then the supervisor's
/// own variables and the allocated ports are added on top.
pub fn build_child_env<I>(inherited: I, options: &LaunchOptions) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: BTreeMap<OsString, OsString> = inherited
        .into_iter()
        .filter(|(key, _)| !key.to_string_lossy().ends_with("_PORT"))
        .collect();

    let mut set = |key: &str, value: OsString| {
        env.insert(OsString::from(key), value);
    };

    set("VROOLI_ORCHESTRATOR_RUNNING", "1".into());
    set("VROOLI_ROOT", options.vrooli_root.clone().into_os_string());
    set("GENERATED_APPS_DIR", options.apps_root.clone().into_os_string());
    set("APP_ROOT", options.app_root.clone().into_os_string());
    set("VROOLI_APP_NAME", options.app_name.clone().into());
    set("FAST_MODE", "true".into());
    set("PORTS_PREALLOCATED", "1".into());
    set("VROOLI_TRACKED", "1".into());
    set("VROOLI_SAFE", "1".into());

    for (role, port) in &options.ports {
        set(&port_env_name(role), port.to_string().into());
    }

    env.into_iter().collect()
}

#[derive(Serialize)]
struct SetupState {
    git_commit: &'static str,
    timestamp: i64,
    setup_complete: bool,
}

/// Write the setup-complete sentinel so the lifecycle script skips its
/// one-time setup.
pub fn write_setup_sentinel(app_root: &Path) -> std::io::Result<PathBuf> {
    let path = app_root.join(SETUP_STATE_PATH);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let state = SetupState {
        git_commit: "bypass",
        timestamp: chrono::Utc::now().timestamp(),
        setup_complete: true,
    };
    std::fs::write(&path, serde_json::to_vec(&state)?)?;
    Ok(path)
}

/// Spawn the lifecycle command for an app.
///
/// Returns the child handle and its PID. The child leads a new session, so
/// its PID is also its process group id.
pub fn launch(options: &LaunchOptions) -> std::io::Result<(Child, u32)> {
    if let Some(parent) = options.log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&options.log_file)?;
    let log_err = log.try_clone()?;

    let sentinel = write_setup_sentinel(&options.app_root)?;
    debug!(app = %options.app_name, sentinel = %sentinel.display(), "Wrote setup sentinel");

    let mut command = Command::new("bash");
    command
        .arg(LIFECYCLE_SCRIPT)
        .args(LIFECYCLE_ARGS)
        .current_dir(&options.app_root)
        .env_clear()
        .envs(build_child_env(std::env::vars_os(), options))
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    // Put the child in its own session so stop can signal the whole tree.
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(std::io::Error::from)
        });
    }

    let child = command.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| std::io::Error::other("child exited before its pid could be read"))?;

    info!(
        app = %options.app_name,
        pid,
        log_file = %options.log_file.display(),
        "Spawned lifecycle command"
    );

    Ok((child, pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> LaunchOptions {
        LaunchOptions {
            app_name: "a".to_string(),
            app_root: PathBuf::from("/srv/generated-apps/a"),
            apps_root: PathBuf::from("/srv/generated-apps"),
            vrooli_root: PathBuf::from("/srv"),
            ports: BTreeMap::from([
                ("api".to_string(), 18101),
                ("ui".to_string(), 18110),
                ("metrics-exporter".to_string(), 18120),
            ]),
            log_file: PathBuf::from("/tmp/a.log"),
        }
    }

    fn lookup<'a>(env: &'a [(OsString, OsString)], key: &str) -> Option<&'a str> {
        env.iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.to_str())
    }

    #[test]
    fn test_port_env_name() {
        assert_eq!(port_env_name("api"), "SERVICE_PORT");
        assert_eq!(port_env_name("ui"), "UI_PORT");
        assert_eq!(port_env_name("websocket"), "WEBSOCKET_PORT");
        assert_eq!(port_env_name("metrics-exporter"), "METRICS_EXPORTER_PORT");
    }

    #[test]
    fn test_child_env_strips_inherited_ports() {
        let inherited: Vec<(OsString, OsString)> = vec![
            ("PATH".into(), "/usr/bin".into()),
            ("API_PORT".into(), "3000".into()),
            ("SERVICE_PORT".into(), "1".into()),
            ("POSTGRES_PORT".into(), "5432".into()),
            ("PORTAL".into(), "kept".into()),
        ];
        let env = build_child_env(inherited, &options());

        assert_eq!(lookup(&env, "PATH"), Some("/usr/bin"));
        assert_eq!(lookup(&env, "PORTAL"), Some("kept"));
        assert_eq!(lookup(&env, "API_PORT"), None);
        assert_eq!(lookup(&env, "POSTGRES_PORT"), None);

        assert_eq!(lookup(&env, "SERVICE_PORT"), Some("18101"));
        assert_eq!(lookup(&env, "UI_PORT"), Some("18110"));
        assert_eq!(lookup(&env, "METRICS_EXPORTER_PORT"), Some("18120"));
    }

    #[test]
    fn test_child_env_supervisor_markers() {
        let env = build_child_env(Vec::<(OsString, OsString)>::new(), &options());

        assert_eq!(lookup(&env, "VROOLI_ORCHESTRATOR_RUNNING"), Some("1"));
        assert_eq!(lookup(&env, "VROOLI_APP_NAME"), Some("a"));
        assert_eq!(lookup(&env, "APP_ROOT"), Some("/srv/generated-apps/a"));
        assert_eq!(lookup(&env, "GENERATED_APPS_DIR"), Some("/srv/generated-apps"));
        assert_eq!(lookup(&env, "VROOLI_ROOT"), Some("/srv"));
        assert_eq!(lookup(&env, "FAST_MODE"), Some("true"));
        assert_eq!(lookup(&env, "PORTS_PREALLOCATED"), Some("1"));
        assert_eq!(lookup(&env, "VROOLI_TRACKED"), Some("1"));
        assert_eq!(lookup(&env, "VROOLI_SAFE"), Some("1"));
    }

    #[test]
    fn test_setup_sentinel_contents() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_setup_sentinel(dir.path()).unwrap();

        assert_eq!(path, dir.path().join("data/.setup-state"));
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["git_commit"], "bypass");
        assert_eq!(value["setup_complete"], true);
        assert!(value["timestamp"].as_i64().unwrap() > 1_600_000_000);
    }
}
