//! Execution engine adapter: runs one task through an external LLM agent
//! session and reports a terminal status.
//!
//! The [`Engine`] trait is the seam between the worker loop and the agent
//! runtime. The concrete [`ClaudeCodeEngine`] spawns the agent CLI as a
//! subprocess and parses its stream-json output.

mod claude;

pub use claude::ClaudeCodeEngine;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::queue::Issue;

/// Sentinel an agent emits when every task in its prompt is finished.
pub const COMPLETION_SIGNAL: &str = "ALL_TASKS_DONE:";
/// Sentinel prefixed to a response when the context budget forces shutdown.
pub const CONTEXT_LIMIT_SIGNAL: &str = "CONTEXT_LIMIT_REACHED:";

/// Terminal status of one agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Stream ended normally without a completion signal; the agent could
    /// continue in a fresh session.
    Continue,
    /// The session failed; the response carries the error message.
    Error,
    /// The agent emitted the completion signal.
    Complete,
    /// The context budget forced a graceful shutdown.
    ContextLimit,
}

/// Result of one agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    pub status: SessionStatus,
    pub response: String,
}

impl SessionResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Error,
            response: message.into(),
        }
    }
}

/// One task execution request handed to an engine.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub prompt: String,
    pub project_dir: PathBuf,
    pub model: String,
    /// Issue the session is working on; threaded into the session recording.
    pub issue_id: String,
}

/// Adapter interface for agent runtimes.
///
/// Implementations never fail at the signature level: any failure during
/// the session becomes [`SessionStatus::Error`] with the message in the
/// response, so the worker loop has a single decision point.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn run_session(&self, request: &SessionRequest) -> SessionResult;
}

/// Build the deterministic task prompt for an issue.
pub fn task_prompt(team: &str, project_dir: &std::path::Path, issue: &Issue) -> String {
    format!(
        "Execute the following task for team {team}:\n\
         Working directory: {dir}\n\n\
         ## Task\n\
         - ID: {id}\n\
         - Title: {title}\n\
         - Description: {description}\n\n\
         ## Instructions\n\
         1. Create branch agent/{branch}\n\
         2. Implement the task\n\
         3. Verify with browser_snapshot or tests\n\
         4. Commit with the task ID in the message\n\
         5. Report DONE when finished\n\n\
         When complete, output: {signal}\n",
        dir = project_dir.display(),
        id = issue.identifier,
        title = issue.title,
        description = issue.description,
        branch = issue.identifier.to_lowercase(),
        signal = COMPLETION_SIGNAL,
    )
}

/// Advisory classification of a session error for operator-visible log
/// hints. Never used for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHint {
    Auth,
    RateLimit,
    OversizedMessage,
    Tracker,
    Unknown,
}

impl ErrorHint {
    pub fn advice(&self) -> &'static str {
        match self {
            ErrorHint::Auth => "looks like an authentication error; check the agent CLI credentials",
            ErrorHint::RateLimit => "looks like a rate limit; the worker retries with a fresh session",
            ErrorHint::OversizedMessage => {
                "a message exceeded the stream buffer; avoid full-page screenshots and oversized tool output"
            }
            ErrorHint::Tracker => "looks like a tracker error; check TASK_MCP_URL and that the server is up",
            ErrorHint::Unknown => "unexpected error; the worker retries with a fresh session",
        }
    }
}

/// Substring-based error classification, advisory only.
pub fn classify_error(message: &str) -> ErrorHint {
    let lower = message.to_lowercase();
    if lower.contains("auth") || lower.contains("token") {
        ErrorHint::Auth
    } else if lower.contains("rate") || lower.contains("limit") {
        ErrorHint::RateLimit
    } else if lower.contains("buffer size") || lower.contains("1048576") {
        ErrorHint::OversizedMessage
    } else if lower.contains("task") || lower.contains("mcp") {
        ErrorHint::Tracker
    } else {
        ErrorHint::Unknown
    }
}
