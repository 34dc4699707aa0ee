//! `crew run`: spawn and supervise a team of workers.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crew_core::coordinator::run_team;
use crew_core::protocol::TeamConfig;

use crate::config::CrewConfig;
use crate::serve_cmd;

pub async fn run_run(config: TeamConfig, resolved: &CrewConfig) -> Result<()> {
    let cancel = CancellationToken::new();

    // First Ctrl+C cancels the run; workers are terminated with a grace
    // period by the coordinator.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received, stopping workers...");
                cancel.cancel();
            }
        });
    }

    // Embedded replay dashboard for the duration of the run.
    let dashboard = if config.no_dashboard {
        None
    } else {
        let project_dir = config.project_dir.clone();
        let port = config.dashboard_port;
        let shutdown = cancel.clone().cancelled_owned();
        Some(tokio::spawn(async move {
            if let Err(e) = serve_cmd::run_serve(&project_dir, "127.0.0.1", port, shutdown).await {
                warn!(error = %e, "replay dashboard failed");
            }
        }))
    };

    let result = run_team(&config, resolved.notifier(), cancel.clone()).await?;

    cancel.cancel();
    if let Some(dashboard) = dashboard {
        let _ = dashboard.await;
    }

    if result.failed > 0 && result.completed == 0 {
        anyhow::bail!("all {} attempted tasks failed", result.failed);
    }
    Ok(())
}
