//! Worker loop: poll the queue, claim one task, execute it, report.
//!
//! Each worker runs in its own subprocess. Structured events go to stdout
//! as one JSON object per line for the coordinator; logs go to stderr. A
//! fresh engine session is created for every task so one task's context
//! growth or failure never leaks into the next.

use std::io::Write;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::{Engine, SessionRequest, SessionStatus, task_prompt};
use crate::protocol::{TeamConfig, WorkerEvent, WorkerState, WorkerStatus};
use crate::queue::{Issue, TaskQueue};

/// Consecutive empty polls before a worker exits cleanly.
const MAX_CONSECUTIVE_EMPTY: u32 = 3;
/// Pause between tasks, to avoid hot-looping on the tracker.
const INTER_TASK_PAUSE: Duration = Duration::from_secs(2);

/// Sink for worker events. Production workers write to stdout; tests
/// capture events in memory.
pub trait EventSink: Send {
    fn emit(&mut self, event: &WorkerEvent);
}

/// Writes one JSON line per event to stdout and flushes immediately so the
/// coordinator sees transitions as they happen.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&mut self, event: &WorkerEvent) {
        match serde_json::to_string(event) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{line}");
                let _ = stdout.flush();
            }
            Err(e) => error!(error = %e, "failed to serialize worker event"),
        }
    }
}

fn emit_state(
    sink: &mut dyn EventSink,
    worker_id: u32,
    state: WorkerState,
    task: Option<&str>,
    message: &str,
) {
    sink.emit(&WorkerEvent::State {
        ts: WorkerEvent::now_ts(),
        worker_id,
        state,
        task: task.map(str::to_string),
        message: message.to_string(),
    });
}

fn emit_result(sink: &mut dyn EventSink, worker_id: u32, task: &str, success: bool, message: &str) {
    sink.emit(&WorkerEvent::Result {
        ts: WorkerEvent::now_ts(),
        worker_id,
        task: task.to_string(),
        success,
        message: message.to_string(),
    });
}

/// Execute one claimed task through a fresh engine session.
///
/// Returns true only when the session reports completion.
async fn execute_task(
    issue: &Issue,
    config: &TeamConfig,
    worker_id: u32,
    engine: &dyn Engine,
    sink: &mut dyn EventSink,
) -> bool {
    emit_state(
        sink,
        worker_id,
        WorkerState::Working,
        Some(&issue.identifier),
        &format!("Executing: {}", issue.title),
    );

    let request = SessionRequest {
        prompt: task_prompt(&config.team, &config.project_dir, issue),
        project_dir: config.project_dir.clone(),
        model: config.model.clone(),
        issue_id: issue.identifier.clone(),
    };

    let result = engine.run_session(&request).await;
    match result.status {
        SessionStatus::Complete => true,
        SessionStatus::Error => {
            error!(
                worker_id,
                issue = %issue.identifier,
                error = %result.response,
                "engine session failed"
            );
            false
        }
        SessionStatus::ContextLimit => {
            warn!(
                worker_id,
                issue = %issue.identifier,
                info = %result.response,
                "session hit its context budget; releasing task"
            );
            false
        }
        SessionStatus::Continue => false,
    }
}

/// Main worker loop: claim tasks, execute, report, repeat.
///
/// Exits cleanly after [`MAX_CONSECUTIVE_EMPTY`] empty polls, when
/// `max_tasks` is reached, or when `cancel` fires. Returns the final status
/// summarizing the work done.
pub async fn run_worker(
    config: &TeamConfig,
    worker_id: u32,
    queue: &TaskQueue,
    engine: &dyn Engine,
    sink: &mut dyn EventSink,
    cancel: &CancellationToken,
) -> WorkerStatus {
    let mut status = WorkerStatus::new(worker_id);
    emit_state(sink, worker_id, WorkerState::Idle, None, "Starting");

    if let Err(e) = queue.connect().await {
        let message = format!("Failed to connect to tracker: {e}");
        error!(worker_id, "{message}");
        emit_state(sink, worker_id, WorkerState::Failed, None, &message);
        status.update(WorkerState::Failed, None, message);
        return status;
    }

    let mut consecutive_empty = 0u32;

    loop {
        if cancel.is_cancelled() {
            info!(worker_id, "worker cancelled");
            break;
        }

        // Completed-task cap.
        if let Some(max_tasks) = config.max_tasks {
            if status.tasks_completed >= max_tasks {
                info!(worker_id, max_tasks, "reached max tasks");
                break;
            }
        }

        // Poll for available tasks.
        emit_state(sink, worker_id, WorkerState::Idle, None, "Polling for tasks");
        let tasks = match queue.get_todo(None).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(worker_id, error = %e, "poll error");
                if sleep_or_cancel(config.poll_interval, cancel).await {
                    break;
                }
                continue;
            }
        };

        if tasks.is_empty() {
            consecutive_empty += 1;
            if consecutive_empty >= MAX_CONSECUTIVE_EMPTY {
                info!(worker_id, polls = consecutive_empty, "no tasks left, exiting");
                break;
            }
            emit_state(
                sink,
                worker_id,
                WorkerState::Idle,
                None,
                &format!("No tasks (poll {consecutive_empty}/{MAX_CONSECUTIVE_EMPTY})"),
            );
            if sleep_or_cancel(config.poll_interval, cancel).await {
                break;
            }
            continue;
        }

        consecutive_empty = 0;

        // Try to claim the highest-priority task; break on first success.
        let mut claimed: Option<Issue> = None;
        for issue in &tasks {
            emit_state(
                sink,
                worker_id,
                WorkerState::Claiming,
                Some(&issue.identifier),
                &format!("Claiming {}", issue.identifier),
            );
            if queue.claim(&issue.identifier, worker_id).await {
                claimed = Some(issue.clone());
                break;
            }
        }

        let Some(issue) = claimed else {
            emit_state(
                sink,
                worker_id,
                WorkerState::Idle,
                None,
                "All tasks claimed by others, waiting",
            );
            if sleep_or_cancel(config.poll_interval, cancel).await {
                break;
            }
            continue;
        };

        info!(worker_id, issue = %issue.identifier, title = %issue.title, "executing task");
        let success = execute_task(&issue, config, worker_id, engine, sink).await;

        if success {
            status.tasks_completed += 1;
            queue.complete(&issue.identifier, worker_id).await;
            let message = format!("Done: {}", issue.title);
            emit_result(sink, worker_id, &issue.identifier, true, &message);
            status.update(WorkerState::Completed, Some(issue.identifier.clone()), message);
        } else {
            status.tasks_failed += 1;
            let message = format!("Worker-{worker_id} failed to execute");
            queue.fail(&issue.identifier, worker_id, &message).await;
            emit_result(sink, worker_id, &issue.identifier, false, &message);
            status.update(WorkerState::Failed, Some(issue.identifier.clone()), message);
        }

        if sleep_or_cancel(INTER_TASK_PAUSE, cancel).await {
            break;
        }
    }

    queue.disconnect().await;
    status.update(WorkerState::Stopped, None, "Worker finished");
    emit_state(sink, worker_id, WorkerState::Stopped, None, "Worker finished");
    status
}

/// Sleep for `duration` unless cancelled first. Returns true on cancel.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.cancelled() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::engine::SessionResult;
    use crate::queue::testing::{FakeIssue, FakeTracker};

    struct VecSink(Vec<WorkerEvent>);

    impl EventSink for VecSink {
        fn emit(&mut self, event: &WorkerEvent) {
            self.0.push(event.clone());
        }
    }

    /// Engine whose outcomes are scripted per invocation.
    struct ScriptedEngine {
        outcomes: Vec<SessionStatus>,
        calls: AtomicU32,
    }

    impl ScriptedEngine {
        fn always(status: SessionStatus) -> Self {
            Self {
                outcomes: vec![status],
                calls: AtomicU32::new(0),
            }
        }

        fn sequence(outcomes: Vec<SessionStatus>) -> Self {
            Self {
                outcomes,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        async fn run_session(&self, _request: &SessionRequest) -> SessionResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let status = *self
                .outcomes
                .get(call)
                .or_else(|| self.outcomes.last())
                .unwrap_or(&SessionStatus::Complete);
            SessionResult {
                status,
                response: match status {
                    SessionStatus::Complete => "ALL_TASKS_DONE: done".to_string(),
                    SessionStatus::Error => "engine exploded".to_string(),
                    SessionStatus::ContextLimit => "CONTEXT_LIMIT_REACHED: out of room".to_string(),
                    SessionStatus::Continue => "partial".to_string(),
                },
            }
        }
    }

    fn fast_config(tmp: &std::path::Path) -> TeamConfig {
        let mut config = TeamConfig::new("ENG", tmp, "claude-test");
        config.poll_interval = Duration::from_millis(10);
        config
    }

    fn states(events: &[WorkerEvent]) -> Vec<WorkerState> {
        events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::State { state, .. } => Some(*state),
                WorkerEvent::Result { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn completes_a_single_task() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = FakeTracker::with_issues(vec![FakeIssue::todo("ENG-1", "high")]);
        let queue = TaskQueue::new("ENG", tracker.transport());
        let engine = ScriptedEngine::always(SessionStatus::Complete);
        let mut sink = VecSink(Vec::new());

        let status = run_worker(
            &fast_config(tmp.path()),
            0,
            &queue,
            &engine,
            &mut sink,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(status.tasks_completed, 1);
        assert_eq!(status.tasks_failed, 0);
        assert_eq!(status.state, WorkerState::Stopped);
        assert_eq!(tracker.state_of("ENG-1").as_deref(), Some("Done"));

        let results: Vec<_> = sink
            .0
            .iter()
            .filter(|e| matches!(e, WorkerEvent::Result { .. }))
            .collect();
        assert_eq!(results.len(), 1);
        match results[0] {
            WorkerEvent::Result { task, success, .. } => {
                assert_eq!(task, "ENG-1");
                assert!(success);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn exits_after_three_empty_polls() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = FakeTracker::with_issues(vec![]);
        let queue = TaskQueue::new("ENG", tracker.transport());
        let engine = ScriptedEngine::always(SessionStatus::Complete);
        let mut sink = VecSink(Vec::new());

        let status = run_worker(
            &fast_config(tmp.path()),
            0,
            &queue,
            &engine,
            &mut sink,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(status.tasks_completed, 0);
        assert_eq!(status.state, WorkerState::Stopped);
        // Never claimed or worked.
        let seen = states(&sink.0);
        assert!(!seen.contains(&WorkerState::Claiming));
        assert!(!seen.contains(&WorkerState::Working));
        assert_eq!(*seen.last().unwrap(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn failed_task_is_released_back_to_todo() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = FakeTracker::with_issues(vec![FakeIssue::todo("ENG-1", "high")]);
        let queue = TaskQueue::new("ENG", tracker.transport());
        // First attempt fails, second succeeds (re-claimed after release).
        let engine = ScriptedEngine::sequence(vec![SessionStatus::Error, SessionStatus::Complete]);
        let mut sink = VecSink(Vec::new());

        let status = run_worker(
            &fast_config(tmp.path()),
            0,
            &queue,
            &engine,
            &mut sink,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(status.tasks_failed, 1);
        assert_eq!(status.tasks_completed, 1);

        let transitions = tracker.transitions.lock().unwrap().clone();
        let seq: Vec<&str> = transitions.iter().map(|(_, s)| s.as_str()).collect();
        assert_eq!(seq, vec!["In Progress", "Todo", "In Progress", "Done"]);
    }

    #[tokio::test]
    async fn context_limit_counts_as_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = FakeTracker::with_issues(vec![FakeIssue::todo("ENG-1", "high")]);
        let queue = TaskQueue::new("ENG", tracker.transport());
        let engine =
            ScriptedEngine::sequence(vec![SessionStatus::ContextLimit, SessionStatus::Complete]);
        let mut sink = VecSink(Vec::new());

        let status = run_worker(
            &fast_config(tmp.path()),
            0,
            &queue,
            &engine,
            &mut sink,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(status.tasks_failed, 1);
        // Released to Todo after the context-limit attempt.
        let transitions = tracker.transitions.lock().unwrap().clone();
        assert_eq!(transitions[1].1, "Todo");
        assert_eq!(status.tasks_completed, 1);
    }

    #[tokio::test]
    async fn max_tasks_bounds_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = FakeTracker::with_issues(vec![
            FakeIssue::todo("ENG-1", "high"),
            FakeIssue::todo("ENG-2", "high"),
            FakeIssue::todo("ENG-3", "high"),
        ]);
        let queue = TaskQueue::new("ENG", tracker.transport());
        let engine = ScriptedEngine::always(SessionStatus::Complete);
        let mut sink = VecSink(Vec::new());

        let mut config = fast_config(tmp.path());
        config.max_tasks = Some(1);

        let status = run_worker(&config, 0, &queue, &engine, &mut sink, &CancellationToken::new()).await;

        assert_eq!(status.tasks_completed, 1);
        // Two tasks remain Todo.
        let todo = [
            tracker.state_of("ENG-1"),
            tracker.state_of("ENG-2"),
            tracker.state_of("ENG-3"),
        ]
        .into_iter()
        .filter(|s| s.as_deref() == Some("Todo"))
        .count();
        assert_eq!(todo, 2);
    }

    #[tokio::test]
    async fn claims_highest_priority_first() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = FakeTracker::with_issues(vec![
            FakeIssue::todo("ENG-LOW", "low"),
            FakeIssue::todo("ENG-URGENT", "urgent"),
        ]);
        let queue = TaskQueue::new("ENG", tracker.transport());
        let engine = ScriptedEngine::always(SessionStatus::Complete);
        let mut sink = VecSink(Vec::new());

        let mut config = fast_config(tmp.path());
        config.max_tasks = Some(1);

        run_worker(&config, 0, &queue, &engine, &mut sink, &CancellationToken::new()).await;

        assert_eq!(tracker.state_of("ENG-URGENT").as_deref(), Some("Done"));
        assert_eq!(tracker.state_of("ENG-LOW").as_deref(), Some("Todo"));
    }

    #[tokio::test]
    async fn two_workers_one_task_yields_one_winner() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = FakeTracker::with_issues(vec![FakeIssue::todo("ENG-1", "high")]);

        let queue_a = TaskQueue::new("ENG", tracker.transport());
        let queue_b = TaskQueue::new("ENG", tracker.transport());
        let engine_a = ScriptedEngine::always(SessionStatus::Complete);
        let engine_b = ScriptedEngine::always(SessionStatus::Complete);
        let mut sink_a = VecSink(Vec::new());
        let mut sink_b = VecSink(Vec::new());

        let config = fast_config(tmp.path());
        let cancel = CancellationToken::new();

        let (status_a, status_b) = tokio::join!(
            run_worker(&config, 0, &queue_a, &engine_a, &mut sink_a, &cancel),
            run_worker(&config, 1, &queue_b, &engine_b, &mut sink_b, &cancel),
        );

        assert_eq!(status_a.tasks_completed + status_b.tasks_completed, 1);
        assert_eq!(status_a.tasks_failed + status_b.tasks_failed, 0);
        assert_eq!(tracker.state_of("ENG-1").as_deref(), Some("Done"));

        // Exactly one claim marker ever lands on the issue.
        let markers = tracker
            .comments_of("ENG-1")
            .into_iter()
            .filter(|c| c.starts_with("__CLAIM__"))
            .count();
        assert_eq!(markers, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = FakeTracker::with_issues(vec![]);
        let queue = TaskQueue::new("ENG", tracker.transport());
        let engine = ScriptedEngine::always(SessionStatus::Complete);
        let mut sink = VecSink(Vec::new());

        let mut config = fast_config(tmp.path());
        config.poll_interval = Duration::from_secs(60);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let status = run_worker(&config, 0, &queue, &engine, &mut sink, &cancel).await;
        assert_eq!(status.state, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn poll_errors_are_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = FakeTracker::with_issues(vec![]);
        tracker
            .fail_calls
            .lock()
            .unwrap()
            .push("Task_ListIssues".to_string());
        let queue = TaskQueue::new("ENG", tracker.transport());
        let engine = ScriptedEngine::always(SessionStatus::Complete);
        let mut sink = VecSink(Vec::new());

        let config = fast_config(tmp.path());
        let cancel = CancellationToken::new();

        // Heal the tracker shortly after the worker starts retrying.
        let tracker_heal = Arc::clone(&tracker);
        let healer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tracker_heal.fail_calls.lock().unwrap().clear();
        });

        let status = run_worker(&config, 0, &queue, &engine, &mut sink, &cancel).await;
        healer.await.unwrap();

        // Worker survived the errors and exited through the empty-poll path.
        assert_eq!(status.state, WorkerState::Stopped);
        assert_eq!(status.tasks_failed, 0);
    }
}
