//! Task queue client over the tracker's remote tool protocol.
//!
//! The tracker is the sole source of truth for task ownership. This client
//! offers the narrow surface the workers need: enumerate Todo tasks, claim
//! one with a check-then-transition sequence, and transition it to Done (or
//! back to Todo on failure). The wire transport is abstracted behind
//! [`ToolTransport`] so the worker loop can be exercised against an
//! in-memory tracker.

mod http;

pub use http::{DEFAULT_TRACKER_URL, HttpTransport, TRACKER_API_KEY_ENV, TRACKER_URL_ENV};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::protocol::Priority;

/// Exact comment body appended when a worker claims a task.
pub fn claim_marker(worker_id: u32) -> String {
    format!("__CLAIM__worker-{worker_id}__")
}

/// Errors surfaced by the queue client.
///
/// Anything else (a failed claim race, a tracker-side rejection) is reported
/// through operation-level booleans or empty results.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("tracker connection error: {0}")]
    Connection(String),

    #[error("tracker protocol error: {0}")]
    Protocol(String),

    #[error("not connected to the tracker")]
    NotConnected,
}

/// Transport seam for invoking remote tools on the tracker.
///
/// Object-safe so tests can substitute an in-memory tracker for the HTTP
/// transport.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Open the channel. Idempotent within the transport's lifetime.
    async fn connect(&self) -> Result<(), QueueError>;

    /// Close the channel. Safe to call multiple times.
    async fn disconnect(&self);

    /// Invoke a named tool and return its parsed JSON result.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, QueueError>;
}

/// A minimal view of a tracker issue, validated at the point of use.
///
/// Unknown fields in the tracker's response are ignored; only `identifier`
/// is required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub identifier: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub state: String,
}

impl Issue {
    /// Build an issue view from an untyped tracker object. Returns `None`
    /// when the required `identifier` field is missing.
    fn from_value(value: &Value) -> Option<Self> {
        let identifier = value.get("identifier").and_then(Value::as_str)?.to_string();
        Some(Self {
            identifier,
            title: value
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("Untitled")
                .to_string(),
            description: value
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            priority: Priority::parse(value.get("priority").and_then(Value::as_str).unwrap_or("")),
            state: value
                .get("state")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        })
    }
}

/// Stateful queue client bound to one team.
pub struct TaskQueue {
    team: String,
    transport: Box<dyn ToolTransport>,
}

impl TaskQueue {
    pub fn new(team: impl Into<String>, transport: Box<dyn ToolTransport>) -> Self {
        Self {
            team: team.into(),
            transport,
        }
    }

    /// Open the channel to the tracker. Failure here is a terminal setup
    /// error for the caller.
    pub async fn connect(&self) -> Result<(), QueueError> {
        self.transport.connect().await
    }

    /// Close the channel. Safe to call multiple times.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// List Todo tasks for the team, highest priority first.
    ///
    /// Ties keep the tracker's natural order (stable sort). Elements without
    /// an `identifier` are skipped with a warning.
    pub async fn get_todo(&self, project: Option<&str>) -> Result<Vec<Issue>, QueueError> {
        let mut arguments = json!({"team": self.team, "state": "Todo"});
        if let Some(project) = project {
            arguments["project"] = json!(project);
        }

        let result = self.transport.call_tool("Task_ListIssues", arguments).await?;
        let items = result
            .as_array()
            .ok_or_else(|| QueueError::Protocol("Task_ListIssues did not return an array".to_string()))?;

        let mut issues = Vec::with_capacity(items.len());
        for item in items {
            match Issue::from_value(item) {
                Some(issue) => issues.push(issue),
                None => warn!("skipping tracker issue without an identifier"),
            }
        }
        issues.sort_by_key(|issue| issue.priority);
        Ok(issues)
    }

    /// Claim a task for a worker: verify it is still Todo, append the claim
    /// marker comment, and transition it to In Progress.
    ///
    /// Two workers may race here; the tracker's transition is the
    /// linearization point. Any error during the sequence is treated as a
    /// failed claim -- the transition may or may not have been applied, and
    /// this client never assumes it was not.
    pub async fn claim(&self, issue_id: &str, worker_id: u32) -> bool {
        let outcome: Result<bool, QueueError> = async {
            let issue = self
                .transport
                .call_tool("Task_GetIssue", json!({"issue_id": issue_id}))
                .await?;
            if issue.get("state").and_then(Value::as_str) != Some("Todo") {
                return Ok(false);
            }

            self.transport
                .call_tool(
                    "Task_AddComment",
                    json!({"issue": issue_id, "body": claim_marker(worker_id)}),
                )
                .await?;

            self.transport
                .call_tool(
                    "Task_TransitionIssueState",
                    json!({"issue_id": issue_id, "target_state": "In Progress"}),
                )
                .await?;

            Ok(true)
        }
        .await;

        match outcome {
            Ok(true) => {
                info!(worker_id, issue_id, "claimed task");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(worker_id, issue_id, error = %e, "failed to claim task");
                false
            }
        }
    }

    /// Mark a task Done with a completion comment.
    pub async fn complete(&self, issue_id: &str, worker_id: u32) -> bool {
        let outcome: Result<(), QueueError> = async {
            self.transport
                .call_tool(
                    "Task_AddComment",
                    json!({"issue": issue_id, "body": format!("Completed by worker-{worker_id}")}),
                )
                .await?;
            self.transport
                .call_tool(
                    "Task_TransitionIssueState",
                    json!({"issue_id": issue_id, "target_state": "Done"}),
                )
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            warn!(worker_id, issue_id, error = %e, "failed to complete task");
            return false;
        }
        true
    }

    /// Record a failure and release the task back to Todo for another worker.
    pub async fn fail(&self, issue_id: &str, worker_id: u32, reason: &str) -> bool {
        let outcome: Result<(), QueueError> = async {
            self.transport
                .call_tool(
                    "Task_AddComment",
                    json!({"issue": issue_id, "body": format!("Failed by worker-{worker_id}: {reason}")}),
                )
                .await?;
            self.transport
                .call_tool(
                    "Task_TransitionIssueState",
                    json!({"issue_id": issue_id, "target_state": "Todo"}),
                )
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            warn!(worker_id, issue_id, error = %e, "failed to release task");
            return false;
        }
        true
    }

    /// Append a free-form comment to a task.
    pub async fn comment(&self, issue_id: &str, body: &str) -> Result<(), QueueError> {
        self.transport
            .call_tool("Task_AddComment", json!({"issue": issue_id, "body": body}))
            .await?;
        Ok(())
    }
}
