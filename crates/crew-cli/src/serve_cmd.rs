//! Replay HTTP API: read-only listing and retrieval of recorded sessions.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crew_core::replay::{self, ListQuery, ReplayError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl From<ReplayError> for AppError {
    fn from(err: ReplayError) -> Self {
        let status = match err {
            ReplayError::NotFound(_) => StatusCode::NOT_FOUND,
            ReplayError::Corrupted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ReplayError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    sessions_dir: PathBuf,
}

pub fn build_router(sessions_dir: PathBuf) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{session_id}", get(get_session))
        .layer(CorsLayer::permissive())
        .with_state(AppState { sessions_dir })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve the replay API for a project's sessions directory until `shutdown`
/// resolves.
pub async fn run_serve(
    project_dir: &FsPath,
    bind: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let sessions_dir = project_dir.join(".agent").join("sessions");
    let app = build_router(sessions_dir);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("replay API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("replay API shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> Html<&'static str> {
    Html(
        "<!DOCTYPE html>\
<html><head><title>crew replay</title></head><body>\
<h1>crew replay</h1>\
<p><a href=\"/api/sessions\">/api/sessions</a></p>\
</body></html>",
    )
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
    offset: Option<usize>,
    status: Option<String>,
    issue_id: Option<String>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<axum::response::Response, AppError> {
    let query = ListQuery {
        limit: params.limit,
        offset: params.offset,
        status: params.status,
        issue_id: params.issue_id,
    };
    let page = replay::list_sessions(&state.sessions_dir, &query)?;
    Ok(Json(page).into_response())
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<u64>,
) -> Result<axum::response::Response, AppError> {
    let session = replay::load_session(&state.sessions_dir, session_id)?;
    Ok(Json(session).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
