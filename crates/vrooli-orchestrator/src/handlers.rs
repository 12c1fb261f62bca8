// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control API handlers.
//!
//! Every handler takes the shared [`Supervisor`] as axum state and answers
//! JSON. Start and stop work is detached onto its own task so a client that
//! disconnects mid-request never leaves an app half-way through a
//! transition.

use std::future::Future;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Error;
use crate::registry::{AppStatus, AppView};
use crate::supervisor::{
    BulkResult, DEFAULT_LOG_LINES, LogTail, StartOutcome, StopOutcome, Supervisor,
    SupervisorStatus,
};

/// Shared handler state.
pub type AppState = Arc<Supervisor>;

// ============================================================================
// Errors
// ============================================================================

/// Error body: `{"error": <message>, "kind": <taxonomy name>}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human readable message.
    pub error: String,
    /// Stable error kind, e.g. `NotFound`.
    pub kind: &'static str,
}

/// An [`Error`] on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorResponse {
                error: message.into(),
                kind: "Internal",
            },
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: ErrorResponse {
                error: err.to_string(),
                kind: err.kind(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Run a supervisor operation on its own task and wait for it.
async fn detached<T, F>(operation: F) -> Result<T, ApiError>
where
    F: Future<Output = crate::error::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(operation).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            error!(error = %e, "Supervisor task panicked");
            Err(ApiError::internal(format!("supervisor task failed: {}", e)))
        }
    }
}

// ============================================================================
// Query parameters
// ============================================================================

/// `?force=<bool>` on stop, restart and stop-all.
#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    /// Skip the SIGTERM grace period.
    #[serde(default)]
    pub force: bool,
}

/// `?lines=<n>` on the log tail.
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Number of trailing lines (default 100, capped at 5000).
    pub lines: Option<usize>,
}

// ============================================================================
// Health and status
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `healthy` while the supervisor answers.
    pub status: &'static str,
    /// Time of the check.
    pub timestamp: DateTime<Utc>,
    /// Discovered apps.
    pub apps_total: usize,
    /// Running apps.
    pub apps_running: usize,
    /// Starts per second over the fork-bomb window.
    pub fork_bomb_rate: f64,
}

/// `GET /health`
pub async fn health(State(supervisor): State<AppState>) -> Json<HealthResponse> {
    let counts = supervisor.counts();
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        apps_total: counts.total,
        apps_running: counts.running,
        fork_bomb_rate: supervisor.fork_bomb().get_rate(),
    })
}

/// `GET /status`
pub async fn status(State(supervisor): State<AppState>) -> Json<SupervisorStatus> {
    Json(supervisor.status())
}

// ============================================================================
// App queries
// ============================================================================

/// `GET /apps` response.
#[derive(Debug, Serialize)]
pub struct AppListResponse {
    /// Every app, sorted by name.
    pub apps: Vec<AppView>,
    /// Number of apps.
    pub total: usize,
    /// Number of running apps.
    pub running: usize,
}

/// `GET /apps`
pub async fn list_apps(State(supervisor): State<AppState>) -> Json<AppListResponse> {
    let apps = supervisor.list_apps();
    let running = apps
        .iter()
        .filter(|a| a.status == AppStatus::Running)
        .count();
    Json(AppListResponse {
        total: apps.len(),
        running,
        apps,
    })
}

/// `GET /apps/running` response.
#[derive(Debug, Serialize)]
pub struct RunningAppsResponse {
    /// Running apps.
    pub apps: Vec<AppView>,
    /// Number of running apps.
    pub count: usize,
}

/// `GET /apps/running`
pub async fn running_apps(State(supervisor): State<AppState>) -> Json<RunningAppsResponse> {
    let apps = supervisor.running_apps();
    Json(RunningAppsResponse {
        count: apps.len(),
        apps,
    })
}

/// `GET /apps/{name}/status`
pub async fn app_status(
    State(supervisor): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<AppView>, ApiError> {
    Ok(Json(supervisor.get_app_status(&name).await?))
}

/// `GET /apps/{name}/logs`
pub async fn app_logs(
    State(supervisor): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogTail>, ApiError> {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    Ok(Json(supervisor.tail_log(&name, lines).await?))
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Body of single-app lifecycle responses.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// What happened.
    pub message: String,
    /// Pid of the app afterwards, when running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

fn started_message(name: &str, outcome: StartOutcome) -> MessageResponse {
    let message = match outcome {
        StartOutcome::Started { pid } => format!("App '{}' started (pid {})", name, pid),
        StartOutcome::AlreadyRunning { pid } => {
            format!("App '{}' is already running (pid {})", name, pid)
        }
    };
    MessageResponse {
        message,
        pid: Some(outcome.pid()),
    }
}

/// `POST /apps/{name}/start`
pub async fn start_app(
    State(supervisor): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let app = name.clone();
    let outcome = detached(async move { supervisor.start_app(&app).await }).await?;
    Ok(Json(started_message(&name, outcome)))
}

/// `POST /apps/{name}/stop`
pub async fn stop_app(
    State(supervisor): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    let app = name.clone();
    let outcome = detached(async move { supervisor.stop_app(&app, query.force).await }).await?;
    let message = match outcome {
        StopOutcome::Stopped { pid, forced: true } => {
            format!("App '{}' killed (pid {})", name, pid)
        }
        StopOutcome::Stopped { pid, forced: false } => {
            format!("App '{}' stopped (pid {})", name, pid)
        }
        StopOutcome::AlreadyStopped => format!("App '{}' is not running", name),
    };
    Ok(Json(MessageResponse { message, pid: None }))
}

/// `POST /apps/{name}/restart`
pub async fn restart_app(
    State(supervisor): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    let app = name.clone();
    let outcome =
        detached(async move { supervisor.restart_app(&app, query.force).await }).await?;
    Ok(Json(started_message(&name, outcome)))
}

/// Body of bulk responses.
#[derive(Debug, Serialize)]
pub struct BulkResponse {
    /// Summary line.
    pub message: String,
    /// Per-app outcomes, sorted by app name.
    pub results: Vec<BulkResult>,
}

fn bulk_response(verb: &str, results: Vec<BulkResult>) -> BulkResponse {
    let ok = results.iter().filter(|r| r.success).count();
    BulkResponse {
        message: format!("{} {} of {} apps", verb, ok, results.len()),
        results,
    }
}

/// `POST /apps/start-all`
pub async fn start_all(State(supervisor): State<AppState>) -> Result<Json<BulkResponse>, ApiError> {
    let results = detached(async move { Ok(supervisor.start_all().await) }).await?;
    Ok(Json(bulk_response("Started", results)))
}

/// `POST /apps/stop-all`
pub async fn stop_all(
    State(supervisor): State<AppState>,
    Query(query): Query<ForceQuery>,
) -> Result<Json<BulkResponse>, ApiError> {
    let results = detached(async move { Ok(supervisor.stop_all(query.force).await) }).await?;
    Ok(Json(bulk_response("Stopped", results)))
}

/// `POST /apps/rediscover` response.
#[derive(Debug, Serialize)]
pub struct RediscoverResponse {
    /// Summary line.
    pub message: String,
    /// New apps.
    pub added: Vec<String>,
    /// Dropped apps.
    pub removed: Vec<String>,
    /// Apps whose `enabled` flag changed.
    pub updated: Vec<String>,
    /// Registry size afterwards.
    pub total: usize,
}

/// `POST /apps/rediscover`
pub async fn rediscover(
    State(supervisor): State<AppState>,
) -> Result<Json<RediscoverResponse>, ApiError> {
    let report = supervisor.rediscover().await?;
    Ok(Json(RediscoverResponse {
        message: format!(
            "Rediscovered {} apps ({} added, {} removed)",
            report.total,
            report.added.len(),
            report.removed.len()
        ),
        added: report.added,
        removed: report.removed,
        updated: report.updated,
        total: report.total,
    }))
}
