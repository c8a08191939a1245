//! Management HTTP interface
//!
//! JSON endpoints under `/sync/api` for status and manual triggers. Every
//! handler resolves a fresh [`Settings`] snapshot, so edits to the override
//! file apply without a restart. Git operations go through the shared
//! [`SyncDaemon`] and therefore through its repository lock.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::config::{mask_credentials, EnvConfig, FileOverrides, Settings, Target};
use crate::daemon::{best_effort, StatusReport, SyncDaemon, PERIODIC_COMMIT_MESSAGE};
use crate::exclude::sync_private_exclude;

pub const API_PREFIX: &str = "/sync/api";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    daemon: Arc<SyncDaemon>,
    env: Arc<EnvConfig>,
}

impl AppState {
    pub fn new(daemon: Arc<SyncDaemon>, env: Arc<EnvConfig>) -> Self {
        Self { daemon, env }
    }

    fn settings(&self) -> Settings {
        Settings::resolve(&self.env)
    }
}

/// Handler failure rendered as `500 {"ok": false, "error": ...}`
pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = mask_credentials(&format!("{:#}", self.0));
        error!("Request failed: {}", message);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": message })),
        )
            .into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct TargetsPayload {
    pub targets: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ExcludesPayload {
    pub excludes: Option<Vec<String>>,
}

/// Build the router
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(status))
        .route("/init", post(init))
        .route("/sync-now", post(sync_now))
        .route("/pull", post(pull))
        .route("/push", post(push))
        .route("/relink", post(relink))
        .route("/track-empty", post(track_empty))
        .route("/targets", get(get_targets).post(set_targets))
        .route("/excludes", get(get_excludes).post(set_excludes));

    Router::new().nest(API_PREFIX, api).with_state(state)
}

/// Serve until `shutdown` resolves; a bind failure is returned immediately
pub async fn serve<F>(state: AppState, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind management server to {}", addr))?;

    info!("Management server listening on http://{}{}", addr, API_PREFIX);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Management server failed")?;

    info!("Management server stopped");
    Ok(())
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    let settings = state.settings();
    Json(state.daemon.report(&settings).await)
}

async fn init(State(state): State<AppState>) -> ApiResult {
    let settings = state.settings();
    let report = state.daemon.init_once(&settings).await?;
    Ok(Json(json!({
        "ok": true,
        "branch": report.branch,
        "aligned": report.aligned,
        "linked": report.linked,
        "committed": report.committed,
    })))
}

async fn sync_now(State(state): State<AppState>) -> ApiResult {
    let settings = state.settings();
    let outcome = state
        .daemon
        .pull_commit_push(&settings, PERIODIC_COMMIT_MESSAGE)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "committed": outcome.committed,
        "pushed": outcome.pushed,
    })))
}

async fn pull(State(state): State<AppState>) -> ApiResult {
    state.daemon.pull(&state.settings()).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn push(State(state): State<AppState>) -> ApiResult {
    state.daemon.push(&state.settings()).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn relink(State(state): State<AppState>) -> ApiResult {
    let report = state.daemon.link_and_track(&state.settings()).await?;
    Ok(Json(json!({
        "ok": true,
        "linked": report.outcomes.len(),
        "written": report.sentinels,
    })))
}

async fn track_empty(State(state): State<AppState>) -> ApiResult {
    let written = state.daemon.track(&state.settings()).await?;
    Ok(Json(json!({ "ok": true, "written": written })))
}

async fn get_targets(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "targets": state.settings().target_strings() }))
}

async fn set_targets(
    State(state): State<AppState>,
    Json(payload): Json<TargetsPayload>,
) -> ApiResult {
    let settings = state.settings();
    if let Some(targets) = &payload.targets {
        for raw in targets {
            Target::try_parse(raw)?;
        }
    }

    let overrides = FileOverrides {
        targets: payload.targets.unwrap_or_else(|| settings.target_strings()),
        excludes: settings.excludes.clone(),
    };
    overrides.save(&settings.hist_dir)?;
    info!("Saved {} target(s) to {}", overrides.targets.len(), settings.override_path().display());
    Ok(Json(json!({ "ok": true })))
}

async fn get_excludes(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "excludes": state.settings().excludes }))
}

async fn set_excludes(
    State(state): State<AppState>,
    Json(payload): Json<ExcludesPayload>,
) -> ApiResult {
    let settings = state.settings();
    let overrides = FileOverrides {
        targets: settings.target_strings(),
        excludes: payload.excludes.unwrap_or_else(|| settings.excludes.clone()),
    };
    overrides.save(&settings.hist_dir)?;

    // Re-resolve so the private exclude file gets normalized entries
    let updated = state.settings();
    best_effort(
        "Updating private exclude file",
        sync_private_exclude(&updated.hist_dir, &updated.private_excludes()),
    );

    info!("Saved {} exclusion(s)", updated.excludes.len());
    Ok(Json(json!({ "ok": true })))
}
