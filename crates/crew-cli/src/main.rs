mod config;
mod run_cmd;
mod serve_cmd;
mod worker_cmd;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crew_core::protocol::TeamConfig;

use config::CrewConfig;

#[derive(Parser)]
#[command(name = "crew", about = "Parallel work-stealing coordinator for LLM task workers")]
struct Cli {
    /// Tracker endpoint URL (overrides TASK_MCP_URL env var)
    #[arg(long, global = true)]
    tracker_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a team of parallel workers until the tracker runs dry
    Run {
        /// Team key in the tracker (e.g. ENG)
        #[arg(long)]
        team: String,
        /// Project directory agent sessions work in
        #[arg(long)]
        project_dir: PathBuf,
        /// Model identifier passed to the execution engine
        #[arg(long)]
        model: String,
        /// Number of worker subprocesses
        #[arg(long, default_value_t = 3)]
        workers: usize,
        /// Per-worker completed-task cap
        #[arg(long)]
        max_tasks: Option<u32>,
        /// Seconds between queue polls
        #[arg(long, default_value_t = 10.0)]
        poll_interval: f64,
        /// Port for the embedded replay dashboard
        #[arg(long, default_value_t = 8003)]
        dashboard_port: u16,
        /// Disable the embedded replay dashboard
        #[arg(long)]
        no_dashboard: bool,
    },
    /// Worker subprocess entry point (invoked by the coordinator)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        worker_id: u32,
        #[arg(long)]
        team: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        project_dir: PathBuf,
        #[arg(long, default_value_t = 3)]
        num_workers: usize,
        #[arg(long)]
        max_tasks: Option<u32>,
        #[arg(long, default_value_t = 10.0)]
        poll_interval: f64,
    },
    /// Serve the replay API over recorded sessions
    Serve {
        /// Project directory containing `.agent/sessions/`
        #[arg(long)]
        project_dir: PathBuf,
        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8003)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; worker stdout is reserved for the event wire.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let resolved = CrewConfig::resolve(cli.tracker_url.as_deref());

    match cli.command {
        Commands::Run {
            team,
            project_dir,
            model,
            workers,
            max_tasks,
            poll_interval,
            dashboard_port,
            no_dashboard,
        } => {
            let mut config = TeamConfig::new(team, project_dir, model);
            config.num_workers = workers;
            config.max_tasks = max_tasks;
            config.poll_interval = Duration::from_secs_f64(poll_interval);
            config.dashboard_port = dashboard_port;
            config.no_dashboard = no_dashboard;
            run_cmd::run_run(config, &resolved).await?;
        }
        Commands::Worker {
            worker_id,
            team,
            model,
            project_dir,
            num_workers,
            max_tasks,
            poll_interval,
        } => {
            let mut config = TeamConfig::new(team, project_dir, model);
            config.num_workers = num_workers;
            config.max_tasks = max_tasks;
            config.poll_interval = Duration::from_secs_f64(poll_interval);
            let code = worker_cmd::run_worker_cmd(config, worker_id, &resolved).await;
            std::process::exit(code);
        }
        Commands::Serve {
            project_dir,
            bind,
            port,
        } => {
            serve_cmd::run_serve(&project_dir, &bind, port, shutdown_signal()).await?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install Ctrl+C handler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn worker_args_parse_as_the_coordinator_emits_them() {
        let cli = Cli::parse_from([
            "crew",
            "worker",
            "--worker-id",
            "2",
            "--team",
            "ENG",
            "--model",
            "claude-haiku",
            "--project-dir",
            "/tmp/project",
            "--num-workers",
            "4",
            "--poll-interval",
            "2.5",
            "--max-tasks",
            "7",
        ]);

        match cli.command {
            Commands::Worker {
                worker_id,
                team,
                num_workers,
                max_tasks,
                poll_interval,
                ..
            } => {
                assert_eq!(worker_id, 2);
                assert_eq!(team, "ENG");
                assert_eq!(num_workers, 4);
                assert_eq!(max_tasks, Some(7));
                assert!((poll_interval - 2.5).abs() < f64::EPSILON);
            }
            _ => panic!("expected worker subcommand"),
        }
    }

    #[test]
    fn run_defaults_match_documentation() {
        let cli = Cli::parse_from([
            "crew",
            "run",
            "--team",
            "ENG",
            "--project-dir",
            "/tmp/project",
            "--model",
            "claude-haiku",
        ]);

        match cli.command {
            Commands::Run {
                workers,
                max_tasks,
                poll_interval,
                dashboard_port,
                no_dashboard,
                ..
            } => {
                assert_eq!(workers, 3);
                assert_eq!(max_tasks, None);
                assert!((poll_interval - 10.0).abs() < f64::EPSILON);
                assert_eq!(dashboard_port, 8003);
                assert!(!no_dashboard);
            }
            _ => panic!("expected run subcommand"),
        }
    }
}
