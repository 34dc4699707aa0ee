//! `crew worker`: subprocess entry point, invoked by the coordinator.
//!
//! Emits JSON-line events on stdout; all logging goes to stderr. Exit
//! codes: 0 normal, 1 fatal error or all tasks failed, 130 interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crew_core::engine::ClaudeCodeEngine;
use crew_core::protocol::{TeamConfig, WorkerState};
use crew_core::queue::{HttpTransport, TaskQueue};
use crew_core::worker::{StdoutSink, run_worker};

use crate::config::CrewConfig;

pub async fn run_worker_cmd(config: TeamConfig, worker_id: u32, resolved: &CrewConfig) -> i32 {
    info!(
        worker_id,
        team = %config.team,
        model = %config.model,
        "worker starting"
    );

    let transport = match HttpTransport::new(
        resolved.tracker_url.clone(),
        resolved.tracker_api_key.clone(),
    ) {
        Ok(transport) => transport,
        Err(e) => {
            error!(worker_id, error = %e, "failed to build tracker transport");
            return 1;
        }
    };
    let queue = TaskQueue::new(config.team.clone(), Box::new(transport));
    let engine = ClaudeCodeEngine::new();

    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
                cancel.cancel();
            }
        });
    }

    let mut sink = StdoutSink;
    let status = run_worker(&config, worker_id, &queue, &engine, &mut sink, &cancel).await;

    info!(
        worker_id,
        completed = status.tasks_completed,
        failed = status.tasks_failed,
        "worker finished"
    );

    if interrupted.load(Ordering::SeqCst) {
        return 130;
    }
    if status.state == WorkerState::Failed {
        return 1;
    }
    if status.tasks_failed > 0 && status.tasks_completed == 0 {
        return 1;
    }
    0
}
