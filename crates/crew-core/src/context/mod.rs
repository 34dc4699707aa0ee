//! Context budget monitor for one agent session.
//!
//! Tracks cumulative token estimates across four buckets and signals a
//! graceful shutdown when the configured ceiling is near. Each engine
//! session owns its own `ContextBudget`; there is no process-wide state.

use std::fmt;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::warn;

/// Fraction of `max_tokens` at which a graceful shutdown is triggered.
const SHUTDOWN_THRESHOLD: f64 = 0.85;
/// Fraction of `max_tokens` at which the monitor enters compact mode.
const COMPACT_THRESHOLD: f64 = 0.70;
/// Default session budget.
pub const DEFAULT_MAX_TOKENS: u64 = 160_000;
/// Tool output cap (chars) in normal mode.
const TOOL_OUTPUT_LIMIT: usize = 10_000;
/// Tool output cap (chars) in compact mode.
const TOOL_OUTPUT_COMPACT_LIMIT: usize = 2_000;

/// Token accounting buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    System,
    History,
    Tools,
    Scratch,
}

/// Budget pressure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    Normal,
    Compact,
}

impl fmt::Display for ContextMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextMode::Normal => f.write_str("normal"),
            ContextMode::Compact => f.write_str("compact"),
        }
    }
}

/// Snapshot of current usage.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextStats {
    pub mode: ContextMode,
    pub total_used: u64,
    pub max_tokens: u64,
    pub usage_percent: f64,
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Per-session token budget monitor.
#[derive(Debug)]
pub struct ContextBudget {
    max_tokens: u64,
    system: u64,
    history: u64,
    tools: u64,
    scratch: u64,
}

impl ContextBudget {
    pub fn new(max_tokens: u64) -> Self {
        Self {
            max_tokens,
            system: 0,
            history: 0,
            tools: 0,
            scratch: 0,
        }
    }

    pub fn add(&mut self, bucket: Bucket, tokens: u64) {
        match bucket {
            Bucket::System => self.system += tokens,
            Bucket::History => self.history += tokens,
            Bucket::Tools => self.tools += tokens,
            Bucket::Scratch => self.scratch += tokens,
        }
    }

    pub fn total_used(&self) -> u64 {
        self.system + self.history + self.tools + self.scratch
    }

    pub fn mode(&self) -> ContextMode {
        if (self.total_used() as f64) >= COMPACT_THRESHOLD * self.max_tokens as f64 {
            ContextMode::Compact
        } else {
            ContextMode::Normal
        }
    }

    /// Account for a tool's output, truncating it under the mode's cap.
    ///
    /// Returns the (possibly truncated) text to feed back to the session.
    pub fn track_tool_output(&mut self, name: &str, output: &str) -> String {
        let limit = match self.mode() {
            ContextMode::Normal => TOOL_OUTPUT_LIMIT,
            ContextMode::Compact => TOOL_OUTPUT_COMPACT_LIMIT,
        };

        let text = if output.chars().count() > limit {
            warn!(tool = name, limit, "truncating oversized tool output");
            let truncated: String = output.chars().take(limit).collect();
            format!("{truncated}\n[output truncated]")
        } else {
            output.to_string()
        };

        self.add(Bucket::Tools, estimate_tokens(&text));
        text
    }

    /// True once total usage crosses the shutdown threshold.
    pub fn should_trigger_shutdown(&self) -> bool {
        (self.total_used() as f64) >= SHUTDOWN_THRESHOLD * self.max_tokens as f64
    }

    pub fn stats(&self) -> ContextStats {
        let total_used = self.total_used();
        ContextStats {
            mode: self.mode(),
            total_used,
            max_tokens: self.max_tokens,
            usage_percent: if self.max_tokens == 0 {
                100.0
            } else {
                total_used as f64 / self.max_tokens as f64 * 100.0
            },
        }
    }

    /// Atomically write a human-readable checkpoint to `memory_path` and
    /// return a one-line summary for the session's final response.
    pub fn prepare_graceful_shutdown(&self, memory_path: &Path) -> Result<String> {
        let stats = self.stats();
        let body = format!(
            "# Context checkpoint\n\n\
             Written: {timestamp}\n\
             Usage: {used} / {max} tokens ({percent:.1}%)\n\n\
             ## Buckets\n\
             - system: {system}\n\
             - history: {history}\n\
             - tools: {tools}\n\
             - scratch: {scratch}\n\n\
             The session was stopped before exhausting its context window.\n\
             Resume from the task tracker; this task was released back to Todo.\n",
            timestamp = Utc::now().to_rfc3339(),
            used = stats.total_used,
            max = stats.max_tokens,
            percent = stats.usage_percent,
            system = self.system,
            history = self.history,
            tools = self.tools,
            scratch = self.scratch,
        );

        let dir = memory_path
            .parent()
            .context("memory path has no parent directory")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .context("failed to create temporary checkpoint file")?;
        tmp.write_all(body.as_bytes())
            .context("failed to write checkpoint")?;
        tmp.persist(memory_path)
            .with_context(|| format!("failed to persist checkpoint to {}", memory_path.display()))?;

        Ok(format!(
            "context checkpoint written to {} ({:.1}% used)",
            memory_path.display(),
            stats.usage_percent
        ))
    }
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS)
    }
}
