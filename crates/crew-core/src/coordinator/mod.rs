//! Coordinator: spawns N worker subprocesses, multiplexes their event
//! streams, restarts crashed workers under a bounded budget, and aggregates
//! the final result.
//!
//! Workers re-execute this binary in `worker` mode. Each child's stdout is
//! consumed line-by-line by a dedicated reader task; stderr is inherited so
//! worker logs interleave with the coordinator's. The tracker, not the
//! coordinator, owns task state -- events are purely observational.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::notify::TelegramNotifier;
use crate::protocol::{TeamConfig, TeamResult, WorkerState, WorkerStatus};

/// Maximum times a crashed worker is respawned before being abandoned.
pub const MAX_WORKER_RESTARTS: u32 = 3;
/// Fixed backoff before respawning a crashed worker.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(5);
/// Cadence of the one-line status print.
const STATUS_INTERVAL: Duration = Duration::from_secs(2);
/// Grace period between SIGTERM and SIGKILL when stopping a child.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// One supervised worker subprocess.
pub struct WorkerProcess {
    pub worker_id: u32,
    config: TeamConfig,
    program: PathBuf,
    pub status: Arc<Mutex<WorkerStatus>>,
    pub restart_count: u32,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    pub fn new(worker_id: u32, config: TeamConfig, program: PathBuf) -> Self {
        Self {
            worker_id,
            config,
            program,
            status: Arc::new(Mutex::new(WorkerStatus::new(worker_id))),
            restart_count: 0,
            child: None,
            reader: None,
        }
    }

    /// CLI arguments for the worker subprocess.
    fn worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "worker".to_string(),
            "--worker-id".to_string(),
            self.worker_id.to_string(),
            "--team".to_string(),
            self.config.team.clone(),
            "--model".to_string(),
            self.config.model.clone(),
            "--project-dir".to_string(),
            self.config.project_dir.display().to_string(),
            "--num-workers".to_string(),
            self.config.num_workers.to_string(),
            "--poll-interval".to_string(),
            self.config.poll_interval.as_secs_f64().to_string(),
        ];
        if let Some(max_tasks) = self.config.max_tasks {
            args.push("--max-tasks".to_string());
            args.push(max_tasks.to_string());
        }
        args
    }

    /// Spawn the subprocess and its stdout reader.
    pub async fn start(&mut self) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(self.worker_args())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn worker {}", self.worker_id))?;

        let stdout = child.stdout.take().context("worker child has no stdout")?;
        let status = Arc::clone(&self.status);
        let worker_id = self.worker_id;

        self.reader = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(trimmed) {
                            Ok(event) => {
                                let mut status = status.lock().await;
                                apply_event(&mut status, &event);
                            }
                            Err(e) => {
                                warn!(worker_id, line = trimmed, error = %e, "discarding malformed event line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(worker_id, error = %e, "error reading worker stdout");
                        break;
                    }
                }
            }
        }));

        self.child = Some(child);
        info!(worker_id = self.worker_id, "worker spawned");
        Ok(())
    }

    /// Wait for the subprocess to exit and return its exit code (-1 when no
    /// process is running or the code is unavailable).
    pub async fn wait(&mut self) -> i32 {
        let Some(child) = self.child.as_mut() else {
            return -1;
        };
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!(worker_id = self.worker_id, error = %e, "failed waiting for worker");
                -1
            }
        };
        self.child = None;
        if let Some(reader) = self.reader.take() {
            // Let the reader drain the pipe; it ends on EOF.
            let _ = reader.await;
        }
        code
    }

    /// Terminate the subprocess: SIGTERM, a grace period, then SIGKILL.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                // SAFETY: pid belongs to a child we spawned.
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    warn!(worker_id = self.worker_id, "SIGTERM failed, will SIGKILL");
                }
            }

            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(_) => info!(worker_id = self.worker_id, "worker exited after terminate"),
                Err(_) => {
                    warn!(worker_id = self.worker_id, "worker did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        let mut status = self.status.lock().await;
        status.update(WorkerState::Stopped, None, "Stopped by coordinator");
    }
}

/// Apply one stdout event to a worker's status record.
///
/// Events are untyped maps: `state` events update the lifecycle fields
/// (an unrecognised state falls back to idle), `result` events bump the
/// outcome counters. Anything else is logged and ignored.
pub fn apply_event(status: &mut WorkerStatus, event: &Value) {
    match event.get("event").and_then(Value::as_str) {
        Some("state") => {
            let state = event
                .get("state")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(WorkerState::Idle);
            let task = event
                .get("task")
                .and_then(Value::as_str)
                .map(str::to_string);
            let message = event
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            status.update(state, task, message);
        }
        Some("result") => {
            if event.get("success").and_then(Value::as_bool) == Some(true) {
                status.tasks_completed += 1;
            } else {
                status.tasks_failed += 1;
            }
            status.last_update = chrono::Utc::now();
        }
        other => {
            warn!(event = ?other, "ignoring unknown worker event");
        }
    }
}

/// Render the compact one-line status summary, e.g.
/// `W0[*:ENG-1] W1[.] [2 done, 0 fail]`.
pub fn render_status(statuses: &[WorkerStatus]) -> String {
    let mut parts = Vec::with_capacity(statuses.len() + 1);
    let mut done = 0;
    let mut failed = 0;

    for status in statuses {
        let cell = match (&status.state, &status.current_task) {
            (WorkerState::Working | WorkerState::Claiming, Some(task)) => {
                format!("W{}[{}:{}]", status.worker_id, status.state.glyph(), task)
            }
            _ => format!("W{}[{}]", status.worker_id, status.state.glyph()),
        };
        parts.push(cell);
        done += status.tasks_completed;
        failed += status.tasks_failed;
    }

    parts.push(format!("[{done} done, {failed} fail]"));
    parts.join(" ")
}

/// Print the end-of-run summary.
pub fn print_summary(result: &TeamResult) {
    println!();
    println!("{}", "=".repeat(60));
    println!("TEAM RUN COMPLETE");
    println!("{}", "=".repeat(60));
    println!("Completed:  {}", result.completed);
    println!("Failed:     {}", result.failed);
    println!("Duration:   {:.1} min", result.duration_seconds / 60.0);
    for worker in &result.worker_results {
        println!(
            "  Worker {}: {} done, {} failed ({})",
            worker.worker_id, worker.tasks_completed, worker.tasks_failed, worker.state
        );
    }
    println!("{}", "=".repeat(60));
}

/// Supervise one worker: spawn, wait, and respawn crashed children while
/// the restart budget lasts. Normal exits (code 0) are never restarted.
async fn supervise(mut wp: WorkerProcess, backoff: Duration, cancel: CancellationToken) {
    loop {
        if let Err(e) = wp.start().await {
            warn!(worker_id = wp.worker_id, error = %e, "failed to spawn worker");
            let mut status = wp.status.lock().await;
            status.update(WorkerState::Failed, None, format!("Spawn failed: {e:#}"));
            return;
        }

        let code = tokio::select! {
            code = wp.wait() => Some(code),
            _ = cancel.cancelled() => None,
        };
        let Some(code) = code else {
            wp.stop().await;
            return;
        };

        if code == 0 {
            info!(worker_id = wp.worker_id, "worker finished normally");
            return;
        }

        if wp.restart_count >= MAX_WORKER_RESTARTS {
            warn!(
                worker_id = wp.worker_id,
                restarts = wp.restart_count,
                "restart budget exhausted, abandoning worker"
            );
            let mut status = wp.status.lock().await;
            status.update(
                WorkerState::Failed,
                None,
                format!("Crashed (code={code}), restart budget exhausted"),
            );
            return;
        }

        wp.restart_count += 1;
        {
            let mut status = wp.status.lock().await;
            status.update(
                WorkerState::Failed,
                None,
                format!("Crashed (code={code}), restarting in {}s", backoff.as_secs()),
            );
        }
        warn!(
            worker_id = wp.worker_id,
            code,
            attempt = wp.restart_count,
            "worker crashed, restarting"
        );

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

/// Run a full team: spawn `num_workers` workers and supervise them until
/// every worker has permanently stopped or `cancel` fires. The summary
/// notification is best-effort and never affects the result.
pub async fn run_team(
    config: &TeamConfig,
    notifier: Option<TelegramNotifier>,
    cancel: CancellationToken,
) -> Result<TeamResult> {
    let program = std::env::current_exe().context("cannot locate own executable")?;
    let result = run_team_with_program(config, program, RESTART_BACKOFF, cancel).await?;
    if let Some(notifier) = notifier {
        notifier.send_run_summary(&config.team, &result).await;
    }
    Ok(result)
}

/// Inner team runner with the worker program and backoff injected, so tests
/// can substitute a script and a short backoff.
pub async fn run_team_with_program(
    config: &TeamConfig,
    program: PathBuf,
    backoff: Duration,
    cancel: CancellationToken,
) -> Result<TeamResult> {
    let started = Instant::now();
    info!(
        team = %config.team,
        workers = config.num_workers,
        model = %config.model,
        "starting team run"
    );

    let mut supervisors = Vec::with_capacity(config.num_workers);
    let mut statuses = Vec::with_capacity(config.num_workers);

    for worker_id in 0..config.num_workers as u32 {
        let wp = WorkerProcess::new(worker_id, config.clone(), program.clone());
        statuses.push(Arc::clone(&wp.status));
        supervisors.push(tokio::spawn(supervise(wp, backoff, cancel.clone())));
    }

    // Periodic status line until all supervisors finish.
    let printer_statuses = statuses.clone();
    let printer_stop = CancellationToken::new();
    let printer = {
        let stop = printer_stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut snapshot = Vec::with_capacity(printer_statuses.len());
                        for status in &printer_statuses {
                            snapshot.push(status.lock().await.clone());
                        }
                        println!("{}", render_status(&snapshot));
                    }
                    _ = stop.cancelled() => break,
                }
            }
        })
    };

    for supervisor in supervisors {
        if let Err(e) = supervisor.await {
            warn!(error = %e, "worker supervisor panicked");
        }
    }
    printer_stop.cancel();
    let _ = printer.await;

    let mut worker_results = Vec::with_capacity(statuses.len());
    for status in &statuses {
        worker_results.push(status.lock().await.clone());
    }

    let result = TeamResult {
        completed: worker_results.iter().map(|w| w.tasks_completed).sum(),
        failed: worker_results.iter().map(|w| w.tasks_failed).sum(),
        skipped: 0,
        duration_seconds: started.elapsed().as_secs_f64(),
        worker_results,
    };

    print_summary(&result);

    Ok(result)
}
