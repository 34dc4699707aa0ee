//! Shared coordination protocol types.
//!
//! Defines the worker lifecycle states, the mutable per-worker status record
//! kept by the coordinator, the immutable team run configuration, and the
//! JSON-line wire format workers emit on stdout.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Claiming,
    Working,
    Completed,
    Failed,
    Stopped,
}

impl WorkerState {
    /// Single-character glyph used in the coordinator's status line.
    pub fn glyph(&self) -> char {
        match self {
            WorkerState::Idle => '.',
            WorkerState::Claiming => '?',
            WorkerState::Working => '*',
            WorkerState::Completed => '\u{2713}',
            WorkerState::Failed => '!',
            WorkerState::Stopped => '\u{25a0}',
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Claiming => "claiming",
            WorkerState::Working => "working",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerState {
    type Err = UnknownWorkerState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerState::Idle),
            "claiming" => Ok(WorkerState::Claiming),
            "working" => Ok(WorkerState::Working),
            "completed" => Ok(WorkerState::Completed),
            "failed" => Ok(WorkerState::Failed),
            "stopped" => Ok(WorkerState::Stopped),
            other => Err(UnknownWorkerState(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognised worker state string.
#[derive(Debug, thiserror::Error)]
#[error("unknown worker state: {0}")]
pub struct UnknownWorkerState(pub String);

/// Task priority as reported by the tracker.
///
/// Ordering is claim order: urgent sorts first. An unrecognised priority
/// string is treated as the lowest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn parse(s: &str) -> Self {
        match s {
            "urgent" => Priority::Urgent,
            "high" => Priority::High,
            "medium" => Priority::Medium,
            "low" => Priority::Low,
            _ => Priority::Low,
        }
    }
}

/// Immutable configuration for one team run.
#[derive(Debug, Clone)]
pub struct TeamConfig {
    /// Team key in the tracker (e.g. "ENG").
    pub team: String,
    /// Project working directory handed to agent sessions.
    pub project_dir: PathBuf,
    /// Model identifier passed to the execution engine.
    pub model: String,
    /// Number of worker subprocesses to run.
    pub num_workers: usize,
    /// Per-worker completed-task cap; `None` means unbounded.
    pub max_tasks: Option<u32>,
    /// Delay between queue polls.
    pub poll_interval: Duration,
    /// Port the replay dashboard binds to during a run.
    pub dashboard_port: u16,
    /// Suppress the embedded replay dashboard.
    pub no_dashboard: bool,
}

impl TeamConfig {
    pub fn new(team: impl Into<String>, project_dir: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            project_dir: project_dir.into(),
            model: model.into(),
            num_workers: 3,
            max_tasks: None,
            poll_interval: Duration::from_secs(10),
            dashboard_port: 8003,
            no_dashboard: false,
        }
    }
}

/// Mutable status of a single worker, owned by the coordinator.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub worker_id: u32,
    pub state: WorkerState,
    pub current_task: Option<String>,
    pub message: String,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl WorkerStatus {
    pub fn new(worker_id: u32) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            state: WorkerState::Idle,
            current_task: None,
            message: String::new(),
            tasks_completed: 0,
            tasks_failed: 0,
            started_at: now,
            last_update: now,
        }
    }

    /// Apply a lifecycle transition, stamping `last_update`.
    pub fn update(&mut self, state: WorkerState, task: Option<String>, message: impl Into<String>) {
        self.state = state;
        self.current_task = task;
        self.message = message.into();
        self.last_update = Utc::now();
    }
}

/// Summary of a finished team run.
#[derive(Debug, Clone, Default)]
pub struct TeamResult {
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration_seconds: f64,
    pub worker_results: Vec<WorkerStatus>,
}

impl TeamResult {
    pub fn total(&self) -> u32 {
        self.completed + self.failed + self.skipped
    }
}

/// One JSON line on a worker subprocess's stdout.
///
/// `state` events describe lifecycle transitions; `result` events report the
/// terminal outcome of one task. Logs never travel on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    State {
        ts: f64,
        worker_id: u32,
        state: WorkerState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        #[serde(default)]
        message: String,
    },
    Result {
        ts: f64,
        worker_id: u32,
        task: String,
        success: bool,
        #[serde(default)]
        message: String,
    },
}

impl WorkerEvent {
    /// Current unix time in seconds, the `ts` field of every event.
    pub fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_state_round_trips_through_str() {
        for state in [
            WorkerState::Idle,
            WorkerState::Claiming,
            WorkerState::Working,
            WorkerState::Completed,
            WorkerState::Failed,
            WorkerState::Stopped,
        ] {
            let parsed: WorkerState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn unknown_worker_state_is_an_error() {
        let err = "bogus".parse::<WorkerState>().unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn priority_orders_urgent_first() {
        let mut priorities = vec![
            Priority::parse("low"),
            Priority::parse("urgent"),
            Priority::parse("medium"),
            Priority::parse("high"),
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Urgent, Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn unknown_priority_is_lowest() {
        assert_eq!(Priority::parse("blocker"), Priority::Low);
        assert_eq!(Priority::parse(""), Priority::Low);
    }

    #[test]
    fn status_update_advances_last_update() {
        let mut status = WorkerStatus::new(0);
        let before = status.last_update;
        status.update(WorkerState::Working, Some("ENG-1".to_string()), "Executing");
        assert_eq!(status.state, WorkerState::Working);
        assert_eq!(status.current_task.as_deref(), Some("ENG-1"));
        assert!(status.last_update >= before);
    }

    #[test]
    fn team_result_total_sums_all_outcomes() {
        let result = TeamResult {
            completed: 3,
            failed: 1,
            skipped: 2,
            ..Default::default()
        };
        assert_eq!(result.total(), 6);
    }

    #[test]
    fn state_event_serializes_to_wire_format() {
        let event = WorkerEvent::State {
            ts: 1700000000.5,
            worker_id: 1,
            state: WorkerState::Working,
            task: Some("ENG-7".to_string()),
            message: "Executing: fix the bug".to_string(),
        };
        let line = serde_json::to_string(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "state");
        assert_eq!(value["state"], "working");
        assert_eq!(value["task"], "ENG-7");
        assert_eq!(value["worker_id"], 1);
    }

    #[test]
    fn result_event_round_trips() {
        let event = WorkerEvent::Result {
            ts: 1700000001.0,
            worker_id: 2,
            task: "ENG-9".to_string(),
            success: false,
            message: "Worker-2 failed to execute".to_string(),
        };
        let line = serde_json::to_string(&event).unwrap();
        let back: WorkerEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn state_event_task_is_optional_on_the_wire() {
        let line = r#"{"event":"state","ts":1.0,"worker_id":0,"state":"idle"}"#;
        let event: WorkerEvent = serde_json::from_str(line).unwrap();
        match event {
            WorkerEvent::State { task, message, .. } => {
                assert!(task.is_none());
                assert!(message.is_empty());
            }
            other => panic!("expected state event, got {other:?}"),
        }
    }

    #[test]
    fn glyphs_match_status_line_legend() {
        assert_eq!(WorkerState::Working.glyph(), '*');
        assert_eq!(WorkerState::Idle.glyph(), '.');
        assert_eq!(WorkerState::Claiming.glyph(), '?');
        assert_eq!(WorkerState::Stopped.glyph(), '■');
    }
}
