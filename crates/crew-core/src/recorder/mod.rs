//! Session recording to JSON.
//!
//! Each agent session is captured as an ordered timeline of events and
//! persisted to `{project_dir}/.agent/sessions/session-{N}.json` with an
//! atomic temp-file-then-rename write. Old sessions are rotated once the
//! file count exceeds [`MAX_SESSIONS`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

/// Maximum number of session files kept before rotating the oldest.
pub const MAX_SESSIONS: usize = 100;
/// Maximum length for preview strings (`result_preview`, `output_preview`).
pub const MAX_PREVIEW_LENGTH: usize = 500;
/// Subdirectory under `.agent/` where session JSON files live.
const SESSIONS_DIR_NAME: &str = "sessions";

/// A single recorded event within an agent session.
///
/// `t` is seconds elapsed since the session started, rounded to three
/// decimals. Recognised types: `tool_call`, `file_write`, `bash`,
/// `agent_call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub t: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Full session record: metadata plus the ordered event list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: u64,
    pub started_at: String,
    pub ended_at: Option<String>,
    #[serde(default)]
    pub issue_id: String,
    pub status: String,
    #[serde(default)]
    pub events: Vec<SessionEvent>,
}

/// Errors raised by the recorder. Persist and rotation failures are logged,
/// not raised.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("a recording session is already in progress")]
    AlreadyInProgress,

    #[error("no active recording session")]
    NoActiveSession,
}

struct ActiveSession {
    session: Session,
    start: Instant,
}

/// Records agent session events and persists them to JSON files.
///
/// Thread-safe: the active session is guarded by a mutex so concurrent
/// callers can record events safely.
pub struct SessionRecorder {
    sessions_dir: PathBuf,
    default_issue_id: String,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionRecorder {
    pub fn new(project_dir: &Path, issue_id: impl Into<String>) -> Self {
        Self {
            sessions_dir: project_dir.join(".agent").join(SESSIONS_DIR_NAME),
            default_issue_id: issue_id.into(),
            active: Mutex::new(None),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Begin a new recording session.
    ///
    /// Creates the sessions directory if needed, scans for the highest
    /// existing `session-{N}.json` and picks N+1.
    pub fn start(&self, issue_id: Option<&str>) -> Result<Session, RecorderError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.is_some() {
            return Err(RecorderError::AlreadyInProgress);
        }

        if let Err(e) = std::fs::create_dir_all(&self.sessions_dir) {
            error!(dir = %self.sessions_dir.display(), error = %e, "failed to create sessions directory");
        }

        let session = Session {
            session_id: next_session_id(&self.sessions_dir),
            started_at: Utc::now().to_rfc3339(),
            ended_at: None,
            issue_id: issue_id.unwrap_or(&self.default_issue_id).to_string(),
            status: "running".to_string(),
            events: Vec::new(),
        };

        info!(
            session_id = session.session_id,
            issue_id = %session.issue_id,
            "recording session started"
        );

        *active = Some(ActiveSession {
            session: session.clone(),
            start: Instant::now(),
        });
        Ok(session)
    }

    /// Record a single event in the current session.
    ///
    /// Preview fields (`result_preview`, `output_preview`) are truncated to
    /// [`MAX_PREVIEW_LENGTH`]. A no-op with a warning when no session is
    /// active.
    pub fn record_event(&self, event_type: &str, data: Map<String, Value>) -> Option<SessionEvent> {
        let mut safe_data = data;
        for key in ["result_preview", "output_preview"] {
            let truncated = match safe_data.get(key) {
                Some(Value::String(s)) => Some(truncate_preview(s)),
                _ => None,
            };
            if let Some(truncated) = truncated {
                safe_data.insert(key.to_string(), Value::String(truncated));
            }
        }

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let Some(active) = active.as_mut() else {
            warn!("no active session to record event");
            return None;
        };

        let elapsed = active.start.elapsed().as_secs_f64();
        let event = SessionEvent {
            t: (elapsed * 1000.0).round() / 1000.0,
            event_type: event_type.to_string(),
            data: safe_data,
        };
        active.session.events.push(event.clone());
        Some(event)
    }

    /// Finalise the current session, write it to disk, and rotate.
    pub fn end(&self, status: &str) -> Result<Session, RecorderError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut finished) = active.take() else {
            return Err(RecorderError::NoActiveSession);
        };
        drop(active);

        finished.session.ended_at = Some(Utc::now().to_rfc3339());
        finished.session.status = status.to_string();

        self.save_session(&finished.session);
        rotate_sessions(&self.sessions_dir, MAX_SESSIONS);

        info!(
            session_id = finished.session.session_id,
            status,
            events = finished.session.events.len(),
            "recording session ended"
        );

        Ok(finished.session)
    }

    /// Persist a session atomically: serialize to a temp file in the same
    /// directory, then rename onto the target. A failed write never leaves a
    /// partially-written target behind.
    fn save_session(&self, session: &Session) {
        if let Err(e) = std::fs::create_dir_all(&self.sessions_dir) {
            error!(error = %e, "failed to create sessions directory");
            return;
        }
        let target = self.sessions_dir.join(format!("session-{}.json", session.session_id));

        let result: anyhow::Result<()> = (|| {
            let body = serde_json::to_string_pretty(session)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&self.sessions_dir)?;
            tmp.write_all(body.as_bytes())?;
            tmp.persist(&target)?;
            Ok(())
        })();

        if let Err(e) = result {
            error!(
                session_id = session.session_id,
                error = %e,
                "failed to save session"
            );
        }
    }
}

fn truncate_preview(text: &str) -> String {
    if text.chars().count() <= MAX_PREVIEW_LENGTH {
        return text.to_string();
    }
    let truncated: String = text.chars().take(MAX_PREVIEW_LENGTH).collect();
    format!("{truncated}...")
}

/// Parse the numeric id out of a `session-{N}.json` file name.
pub fn session_file_id(name: &str) -> Option<u64> {
    name.strip_prefix("session-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Next session id: highest existing N plus one, or 1 for an empty dir.
pub fn next_session_id(sessions_dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(sessions_dir) else {
        return 1;
    };

    let max_id = entries
        .flatten()
        .filter(|e| e.path().is_file())
        .filter_map(|e| session_file_id(&e.file_name().to_string_lossy()))
        .max()
        .unwrap_or(0);

    max_id + 1
}

/// Delete the oldest session files until at most `max_sessions` remain.
///
/// Returns the number of files deleted. Failures are logged and skipped;
/// rotation never raises.
pub fn rotate_sessions(sessions_dir: &Path, max_sessions: usize) -> usize {
    let Ok(entries) = std::fs::read_dir(sessions_dir) else {
        return 0;
    };

    let mut files: Vec<(u64, PathBuf)> = entries
        .flatten()
        .filter(|e| e.path().is_file())
        .filter_map(|e| {
            session_file_id(&e.file_name().to_string_lossy()).map(|id| (id, e.path()))
        })
        .collect();

    if files.len() <= max_sessions {
        return 0;
    }

    files.sort_by_key(|(id, _)| *id);
    let to_remove = files.len() - max_sessions;
    let mut deleted = 0;

    for (id, path) in files.into_iter().take(to_remove) {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                deleted += 1;
                info!(session_id = id, "rotated old session file");
            }
            Err(e) => warn!(session_id = id, error = %e, "failed to delete session file"),
        }
    }

    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn start_assigns_incrementing_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(tmp.path(), "ENG-74");

        let first = recorder.start(None).unwrap();
        assert_eq!(first.session_id, 1);
        recorder.end("completed").unwrap();

        let second = recorder.start(None).unwrap();
        assert_eq!(second.session_id, 2);
    }

    #[test]
    fn start_twice_without_end_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(tmp.path(), "");

        recorder.start(Some("ENG-1")).unwrap();
        let err = recorder.start(Some("ENG-2")).unwrap_err();
        assert!(matches!(err, RecorderError::AlreadyInProgress));
    }

    #[test]
    fn start_issue_id_falls_back_to_constructor_value() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(tmp.path(), "ENG-74");

        let session = recorder.start(None).unwrap();
        assert_eq!(session.issue_id, "ENG-74");
        recorder.end("completed").unwrap();

        let session = recorder.start(Some("ENG-99")).unwrap();
        assert_eq!(session.issue_id, "ENG-99");
    }

    #[test]
    fn record_event_without_session_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(tmp.path(), "");
        assert!(recorder.record_event("bash", Map::new()).is_none());
    }

    #[test]
    fn record_event_truncates_previews() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(tmp.path(), "");
        recorder.start(Some("ENG-1")).unwrap();

        let long = "y".repeat(2_000);
        let event = recorder
            .record_event(
                "tool_call",
                data(&[
                    ("tool", json!("Bash")),
                    ("result_preview", json!(long)),
                    ("output_preview", json!("short")),
                ]),
            )
            .unwrap();

        let preview = event.data["result_preview"].as_str().unwrap();
        assert_eq!(preview.chars().count(), MAX_PREVIEW_LENGTH + 3);
        assert!(preview.ends_with("..."));
        assert_eq!(event.data["output_preview"], "short");
    }

    #[test]
    fn event_timestamps_are_non_decreasing() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(tmp.path(), "");
        recorder.start(Some("ENG-1")).unwrap();

        let a = recorder.record_event("bash", Map::new()).unwrap();
        let b = recorder.record_event("bash", Map::new()).unwrap();
        assert!(b.t >= a.t);

        let session = recorder.end("completed").unwrap();
        assert_eq!(session.events.len(), 2);
    }

    #[test]
    fn end_persists_a_loadable_session() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(tmp.path(), "");
        recorder.start(Some("ENG-5")).unwrap();
        recorder.record_event("file_write", data(&[("path", json!("src/lib.rs"))]));

        let session = recorder.end("completed").unwrap();
        assert_eq!(session.status, "completed");
        assert!(session.ended_at.is_some());

        let path = recorder.sessions_dir().join("session-1.json");
        let body = std::fs::read_to_string(&path).unwrap();
        let loaded: Session = serde_json::from_str(&body).unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn end_without_session_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(tmp.path(), "");
        let err = recorder.end("completed").unwrap_err();
        assert!(matches!(err, RecorderError::NoActiveSession));
    }

    #[test]
    fn serialization_is_a_fixed_point() {
        let session = Session {
            session_id: 9,
            started_at: "2026-01-01T00:00:00+00:00".to_string(),
            ended_at: Some("2026-01-01T00:05:00+00:00".to_string()),
            issue_id: "ENG-9".to_string(),
            status: "failed".to_string(),
            events: vec![SessionEvent {
                t: 1.234,
                event_type: "bash".to_string(),
                data: data(&[("command", json!("ls"))]),
            }],
        };

        let once = serde_json::to_string_pretty(&session).unwrap();
        let back: Session = serde_json::from_str(&once).unwrap();
        let twice = serde_json::to_string_pretty(&back).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn next_id_ignores_foreign_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("session-7.json"), "{}").unwrap();
        std::fs::write(tmp.path().join("session-abc.json"), "{}").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "").unwrap();
        assert_eq!(next_session_id(tmp.path()), 8);
    }

    #[test]
    fn next_id_for_missing_dir_is_one() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(next_session_id(&tmp.path().join("missing")), 1);
    }

    #[test]
    fn rotation_deletes_lowest_ids_first() {
        let tmp = tempfile::tempdir().unwrap();
        for id in 1..=5 {
            std::fs::write(tmp.path().join(format!("session-{id}.json")), "{}").unwrap();
        }

        let deleted = rotate_sessions(tmp.path(), 3);
        assert_eq!(deleted, 2);
        assert!(!tmp.path().join("session-1.json").exists());
        assert!(!tmp.path().join("session-2.json").exists());
        assert!(tmp.path().join("session-3.json").exists());
        assert!(tmp.path().join("session-5.json").exists());
    }

    #[test]
    fn rotation_below_limit_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("session-1.json"), "{}").unwrap();
        assert_eq!(rotate_sessions(tmp.path(), 100), 0);
        assert!(tmp.path().join("session-1.json").exists());
    }

    #[test]
    fn rotation_keeps_at_most_max_sessions_after_many_ends() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(tmp.path(), "");

        for _ in 0..7 {
            recorder.start(Some("ENG-1")).unwrap();
            recorder.end("completed").unwrap();
        }
        // Rotate down to 5 by hand to keep the test fast; end() rotates with
        // MAX_SESSIONS which is far above 7.
        rotate_sessions(recorder.sessions_dir(), 5);

        let remaining: Vec<u64> = std::fs::read_dir(recorder.sessions_dir())
            .unwrap()
            .flatten()
            .filter_map(|e| session_file_id(&e.file_name().to_string_lossy()))
            .collect();
        assert_eq!(remaining.len(), 5);
        assert!(!remaining.contains(&1));
        assert!(!remaining.contains(&2));
    }

    #[test]
    fn rotation_enforces_the_hundred_file_bound() {
        let tmp = tempfile::tempdir().unwrap();
        for id in 1..=102 {
            std::fs::write(tmp.path().join(format!("session-{id}.json")), "{}").unwrap();
        }

        let deleted = rotate_sessions(tmp.path(), MAX_SESSIONS);
        assert_eq!(deleted, 2);

        let mut remaining: Vec<u64> = std::fs::read_dir(tmp.path())
            .unwrap()
            .flatten()
            .filter_map(|e| session_file_id(&e.file_name().to_string_lossy()))
            .collect();
        remaining.sort_unstable();
        assert_eq!(remaining, (3..=102).collect::<Vec<u64>>());
    }

    #[test]
    fn no_partial_target_after_save() {
        // The atomic write goes through a temp sibling; once end() returns
        // the target parses as a complete session.
        let tmp = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(tmp.path(), "");
        recorder.start(Some("ENG-1")).unwrap();
        recorder.end("completed").unwrap();

        for entry in std::fs::read_dir(recorder.sessions_dir()).unwrap().flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if session_file_id(&name).is_some() {
                let body = std::fs::read_to_string(entry.path()).unwrap();
                serde_json::from_str::<Session>(&body).unwrap();
            }
        }
    }
}
