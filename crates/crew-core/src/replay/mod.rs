//! Read-only listing and retrieval of recorded sessions.
//!
//! Operates on the `session-{N}.json` files produced by the recorder.
//! Listing sorts newest-first, skips corrupt files with a warning, applies
//! optional equality filters, and paginates.

use std::path::{Path, PathBuf};

use chrono::DateTime;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::recorder::session_file_id;

/// Inclusive upper bound for the `limit` query parameter.
pub const MAX_LIMIT: usize = 500;
/// Default page size when the caller does not specify one.
pub const DEFAULT_LIMIT: usize = 50;

/// Errors surfaced to replay callers.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("session {0} not found")]
    NotFound(u64),

    #[error("session {0} file is corrupted")]
    Corrupted(u64),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// Summary metadata for one session, used in list responses.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: u64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub events_count: usize,
    pub status: String,
    pub issue_id: String,
}

/// Query parameters for [`list_sessions`].
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub status: Option<String>,
    pub issue_id: Option<String>,
}

/// A page of session summaries. `total` counts matches before pagination.
#[derive(Debug, Serialize)]
pub struct SessionPage {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Duration between two ISO-8601 timestamps, rounded to one decimal.
/// `None` when either endpoint is missing or unparseable.
pub fn duration_seconds(started_at: &str, ended_at: Option<&str>) -> Option<f64> {
    let ended_at = ended_at?;
    if started_at.is_empty() || ended_at.is_empty() {
        return None;
    }
    let start = DateTime::parse_from_rfc3339(started_at).ok()?;
    let end = DateTime::parse_from_rfc3339(ended_at).ok()?;
    let seconds = (end - start).num_milliseconds() as f64 / 1000.0;
    Some((seconds * 10.0).round() / 10.0)
}

fn summary_from_data(id: u64, data: &Value) -> SessionSummary {
    let started_at = data
        .get("started_at")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let ended_at = data
        .get("ended_at")
        .and_then(Value::as_str)
        .map(str::to_string);

    SessionSummary {
        id: data.get("session_id").and_then(Value::as_u64).unwrap_or(id),
        duration_seconds: duration_seconds(&started_at, ended_at.as_deref()),
        started_at,
        ended_at,
        events_count: data
            .get("events")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0),
        status: data
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        issue_id: data
            .get("issue_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    }
}

/// Scan for session files, newest (highest N) first.
fn session_files(sessions_dir: &Path) -> Vec<(u64, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(sessions_dir) else {
        return Vec::new();
    };

    let mut files: Vec<(u64, PathBuf)> = entries
        .flatten()
        .filter(|e| e.path().is_file())
        .filter_map(|e| {
            session_file_id(&e.file_name().to_string_lossy()).map(|id| (id, e.path()))
        })
        .collect();

    files.sort_by(|a, b| b.0.cmp(&a.0));
    files
}

fn load_file(id: u64, path: &Path) -> Option<Value> {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(e) => {
            warn!(session_id = id, error = %e, "failed to read session file");
            return None;
        }
    };
    match serde_json::from_str(&body) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(session_id = id, error = %e, "skipping corrupt session file");
            None
        }
    }
}

/// List recorded sessions with metadata, newest first.
pub fn list_sessions(sessions_dir: &Path, query: &ListQuery) -> Result<SessionPage, ReplayError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit < 1 || limit > MAX_LIMIT {
        return Err(ReplayError::InvalidQuery(format!(
            "limit must be between 1 and {MAX_LIMIT}, got {limit}"
        )));
    }
    let offset = query.offset.unwrap_or(0);

    let mut summaries = Vec::new();
    for (id, path) in session_files(sessions_dir) {
        let Some(data) = load_file(id, &path) else {
            continue;
        };
        let summary = summary_from_data(id, &data);

        if let Some(status) = &query.status {
            if &summary.status != status {
                continue;
            }
        }
        if let Some(issue_id) = &query.issue_id {
            if &summary.issue_id != issue_id {
                continue;
            }
        }
        summaries.push(summary);
    }

    let total = summaries.len();
    let sessions: Vec<SessionSummary> = summaries.into_iter().skip(offset).take(limit).collect();

    Ok(SessionPage {
        sessions,
        total,
        limit,
        offset,
    })
}

/// Load the full JSON for one session.
pub fn load_session(sessions_dir: &Path, session_id: u64) -> Result<Value, ReplayError> {
    let path = sessions_dir.join(format!("session-{session_id}.json"));
    if !path.exists() {
        return Err(ReplayError::NotFound(session_id));
    }
    load_file(session_id, &path).ok_or(ReplayError::Corrupted(session_id))
}
