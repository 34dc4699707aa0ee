//! Claude Code engine adapter.
//!
//! Spawns `claude -p --output-format stream-json` as a subprocess, feeds it
//! the task prompt on stdin, and parses its JSONL output. Every session
//! owns a fresh context budget and a fresh recording session; the budget is
//! checked after each message so an over-budget session shuts down
//! gracefully instead of exhausting its window.

use std::pin::Pin;

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tracing::{debug, warn};

use super::{
    COMPLETION_SIGNAL, CONTEXT_LIMIT_SIGNAL, Engine, SessionRequest, SessionResult, SessionStatus,
    classify_error,
};
use crate::context::{Bucket, ContextBudget, DEFAULT_MAX_TOKENS, estimate_tokens};
use crate::recorder::SessionRecorder;

/// Cap for tool input previews stored in session recordings.
const INPUT_PREVIEW_LENGTH: usize = 200;

/// One parsed event from the agent's stream-json output.
#[derive(Debug, Clone, PartialEq)]
enum StreamEvent {
    Text(String),
    ToolUse { tool: String, input: Value },
    ToolResult { tool: String, output: String },
    Error(String),
}

/// Engine adapter for the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodeEngine {
    /// Path to the agent binary. Defaults to `"claude"` (found via `$PATH`).
    binary_path: String,
    /// Per-session token budget ceiling.
    max_tokens: u64,
}

impl ClaudeCodeEngine {
    pub fn new() -> Self {
        Self {
            binary_path: "claude".to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Use a custom binary path. Useful for tests and non-standard installs.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    async fn drive_session(
        &self,
        request: &SessionRequest,
        budget: &mut ContextBudget,
        recorder: &SessionRecorder,
    ) -> Result<SessionResult> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&request.model)
            .current_dir(&request.project_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn agent binary at '{}' -- is it installed and on PATH?",
                self.binary_path
            )
        })?;

        // The agent reads the user prompt from stdin in -p mode; close stdin
        // so it starts processing.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .context("failed to write prompt to agent stdin")?;
            drop(stdin);
        }

        let stdout = child.stdout.take().context("agent child has no stdout")?;
        let mut events = stream_events(stdout);
        let mut response = String::new();

        while let Some(event) = events.next().await {
            self.apply_event(event, budget, recorder, &mut response);

            if budget.should_trigger_shutdown() {
                let _ = child.kill().await;
                let memory_path = request.project_dir.join(".agent").join("MEMORY.md");
                let summary = match budget.prepare_graceful_shutdown(&memory_path) {
                    Ok(summary) => summary,
                    Err(e) => {
                        warn!(error = %e, "failed to write context checkpoint");
                        format!("checkpoint write failed: {e:#}")
                    }
                };
                return Ok(SessionResult {
                    status: SessionStatus::ContextLimit,
                    response: format!("{CONTEXT_LIMIT_SIGNAL} {summary}"),
                });
            }
        }

        // Reap the child so it does not linger as a zombie.
        let _ = child.wait().await;

        let status = if response.contains(COMPLETION_SIGNAL) {
            SessionStatus::Complete
        } else if response.contains(CONTEXT_LIMIT_SIGNAL) {
            SessionStatus::ContextLimit
        } else {
            SessionStatus::Continue
        };

        Ok(SessionResult { status, response })
    }

    fn apply_event(
        &self,
        event: StreamEvent,
        budget: &mut ContextBudget,
        recorder: &SessionRecorder,
        response: &mut String,
    ) {
        match event {
            StreamEvent::Text(text) => {
                budget.add(Bucket::History, estimate_tokens(&text));
                response.push_str(&text);
            }
            StreamEvent::ToolUse { tool, input } => {
                let (event_type, data) = tool_use_record(&tool, &input);
                recorder.record_event(event_type, data);
            }
            StreamEvent::ToolResult { tool, output } => {
                let shown = budget.track_tool_output(&tool, &output);
                let mut data = Map::new();
                data.insert("tool".to_string(), json!(tool));
                data.insert("output_preview".to_string(), json!(shown));
                recorder.record_event("tool_call", data);
            }
            StreamEvent::Error(message) => {
                let hint = classify_error(&message);
                warn!(error = %message, hint = hint.advice(), "agent reported an error event");
            }
        }
    }
}

impl Default for ClaudeCodeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Engine for ClaudeCodeEngine {
    async fn run_session(&self, request: &SessionRequest) -> SessionResult {
        let recorder = SessionRecorder::new(&request.project_dir, &request.issue_id);
        if let Err(e) = recorder.start(None) {
            warn!(error = %e, "failed to start session recording");
        }

        let mut budget = ContextBudget::new(self.max_tokens);
        let result = match self.drive_session(request, &mut budget, &recorder).await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("{e:#}");
                let hint = classify_error(&message);
                warn!(error = %message, hint = hint.advice(), "agent session failed");
                SessionResult::error(message)
            }
        };

        let session_status = match result.status {
            SessionStatus::Complete | SessionStatus::Continue => "completed",
            SessionStatus::Error => "failed",
            SessionStatus::ContextLimit => "context_limit",
        };
        if let Err(e) = recorder.end(session_status) {
            warn!(error = %e, "failed to end session recording");
        }

        result
    }
}

/// Map a tool invocation into a recorder event.
fn tool_use_record(tool: &str, input: &Value) -> (&'static str, Map<String, Value>) {
    let mut data = Map::new();
    match tool {
        "Bash" => {
            let command = input.get("command").and_then(Value::as_str).unwrap_or("");
            data.insert("command".to_string(), json!(truncate(command, INPUT_PREVIEW_LENGTH)));
            ("bash", data)
        }
        "Write" | "Edit" => {
            let path = input.get("file_path").or_else(|| input.get("path"));
            data.insert(
                "path".to_string(),
                json!(path.and_then(Value::as_str).unwrap_or("")),
            );
            ("file_write", data)
        }
        "Task" => {
            data.insert("tool".to_string(), json!(tool));
            data.insert(
                "input_preview".to_string(),
                json!(truncate(&input.to_string(), INPUT_PREVIEW_LENGTH)),
            );
            ("agent_call", data)
        }
        other => {
            data.insert("tool".to_string(), json!(other));
            data.insert(
                "input_preview".to_string(),
                json!(truncate(&input.to_string(), INPUT_PREVIEW_LENGTH)),
            );
            ("tool_call", data)
        }
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let head: String = text.chars().take(limit).collect();
    format!("{head}...")
}

/// Turn the agent's stdout into a stream of parsed events.
///
/// Malformed lines are skipped with a warning; a read error yields a final
/// error event before the stream ends.
fn stream_events(stdout: ChildStdout) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send>> {
    Box::pin(async_stream::stream! {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_stream_line(trimmed) {
                        Ok(events) => {
                            for event in events {
                                yield event;
                            }
                        }
                        Err(e) => {
                            warn!(line = trimmed, error = %e, "skipping malformed stream line");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    yield StreamEvent::Error(format!("stdout read error: {e}"));
                    break;
                }
            }
        }
    })
}

/// Parse one JSONL line from the agent's stream-json output into zero or
/// more stream events. `Err` means the line is not valid JSON; callers log
/// and continue.
fn parse_stream_line(line: &str) -> Result<Vec<StreamEvent>> {
    let v: Value = serde_json::from_str(line).context("malformed JSON in stream output")?;
    let mut events = Vec::new();

    match v.get("type").and_then(Value::as_str).unwrap_or("") {
        "assistant" => {
            if let Some(blocks) = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array)
            {
                for block in blocks {
                    match block.get("type").and_then(Value::as_str).unwrap_or("") {
                        "text" => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                events.push(StreamEvent::Text(text.to_string()));
                            }
                        }
                        "tool_use" => {
                            events.push(StreamEvent::ToolUse {
                                tool: block
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown")
                                    .to_string(),
                                input: block.get("input").cloned().unwrap_or(Value::Null),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }
        "tool_use" => {
            events.push(StreamEvent::ToolUse {
                tool: v
                    .get("name")
                    .or_else(|| v.get("tool"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                input: v.get("input").cloned().unwrap_or(Value::Null),
            });
        }
        "tool_result" => {
            let output = v
                .get("output")
                .or_else(|| v.get("content"))
                .cloned()
                .unwrap_or(Value::Null);
            let output = match output {
                Value::String(s) => s,
                other => other.to_string(),
            };
            events.push(StreamEvent::ToolResult {
                tool: v
                    .get("name")
                    .or_else(|| v.get("tool"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                output,
            });
        }
        "result" => {
            if let Some(text) = v.get("result").and_then(Value::as_str) {
                events.push(StreamEvent::Text(text.to_string()));
            }
        }
        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message").and_then(Value::as_str))
                .or_else(|| v.get("message").and_then(Value::as_str))
                .unwrap_or("unknown error")
                .to_string();
            events.push(StreamEvent::Error(message));
        }
        other => {
            debug!(event_type = other, "ignoring unrecognised stream event type");
        }
    }

    Ok(events)
}
