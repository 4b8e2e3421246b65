mod cancel_cmd;
mod config;
mod delegate_cmd;
mod log_cmd;
mod pipeline_cmd;
mod resume_cmd;
mod retry_cmd;
mod schedule_cmds;
mod serve_cmd;
mod status_cmd;
#[cfg(test)]
mod test_util;
mod tui;

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use dispatchd_core::resource::ResourceLimits;
use dispatchd_core::scheduler::SchedulerConfig;
use dispatchd_core::supervisor::{Supervisor, SupervisorConfig};
use dispatchd_db::models::{MergeStrategy, MissedRunPolicy, Priority, WorktreeCleanupPolicy};
use dispatchd_db::pool;

use config::DispatchdConfig;

#[derive(Parser)]
#[command(name = "dispatchd", about = "Background orchestrator for coding-agent tasks")]
struct Cli {
    /// Database path (overrides DISPATCHD_DATABASE_PATH env var)
    #[arg(long, global = true)]
    database_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a dispatchd config file (no database required)
    Init {
        /// Path to the SQLite database file
        #[arg(long)]
        db_path: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Delegate a new task
    Delegate {
        /// Prompt to run
        prompt: String,
        /// Priority: p0, p1, p2
        #[arg(long, default_value = "p1")]
        priority: Priority,
        /// Working directory for the agent (must be an absolute path)
        #[arg(long)]
        working_directory: Option<String>,
        /// Run the task in an isolated git worktree
        #[arg(long)]
        use_worktree: bool,
        /// Worktree cleanup policy: auto, keep, delete
        #[arg(long, default_value = "auto")]
        worktree_cleanup: WorktreeCleanupPolicy,
        /// Merge strategy once the task completes: pr, auto, manual, patch
        #[arg(long)]
        merge_strategy: Option<MergeStrategy>,
        /// Branch name to use (sanitized if needed)
        #[arg(long)]
        branch_name: Option<String>,
        /// Base branch to diff/merge against
        #[arg(long)]
        base_branch: Option<String>,
        /// Skip auto-committing changes on completion
        #[arg(long)]
        no_auto_commit: bool,
        /// Skip pushing the branch to the remote
        #[arg(long)]
        no_push: bool,
        /// Pull request title, if merge-strategy is `pr`
        #[arg(long)]
        pr_title: Option<String>,
        /// Pull request body, if merge-strategy is `pr`
        #[arg(long)]
        pr_body: Option<String>,
        /// Timeout for the agent process, in milliseconds
        #[arg(long)]
        timeout_ms: Option<i64>,
        /// Maximum captured stdout/stderr buffer, in bytes
        #[arg(long, default_value_t = 1_048_576)]
        max_output_buffer: i64,
        /// Task IDs this task depends on
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        /// Task ID whose checkpoint this task continues from
        #[arg(long)]
        continue_from: Option<String>,
    },
    /// Show task status (omit task_id to list recent tasks)
    Status {
        /// Task ID to show status for
        task_id: Option<String>,
    },
    /// Show a task's checkpoint history
    Logs {
        /// Task ID to show checkpoints for
        task_id: String,
        /// Only show the last N lines of captured output/error text
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Cancel a queued task
    Cancel {
        /// Task ID to cancel
        task_id: String,
        /// Reason for cancellation
        reason: Option<String>,
    },
    /// Re-run a terminal task's original prompt
    Retry {
        /// Task ID to retry
        task_id: String,
    },
    /// Re-run a terminal task with its last checkpoint folded into the prompt
    Resume {
        /// Task ID to resume
        task_id: String,
        /// Additional context to append to the resumed prompt
        #[arg(long)]
        context: Option<String>,
    },
    /// Cron and one-shot schedule management
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Create a chain of one-shot schedules, each waiting on the previous
    Pipeline {
        /// Alternating prompt/delay pairs, e.g. "setup" 5m "migrate" 10m "seed"
        #[arg(required = true, num_args = 1..)]
        stages: Vec<String>,
    },
    /// Run the supervisor: drains the queue, drives the scheduler, and
    /// serves a read-only HTTP status endpoint
    Serve {
        /// Path to the agent repo root (for worktree isolation)
        #[arg(long, default_value = ".")]
        repo_root: String,
        /// Address:port to bind the HTTP status endpoint to
        #[arg(long, default_value = "127.0.0.1:7620")]
        http_addr: String,
    },
    /// Launch the interactive TUI dashboard
    Dashboard,
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Create a new schedule
    Create {
        /// Prompt to run when the schedule fires
        prompt: String,
        /// Schedule type: cron, one_time
        #[arg(long = "type")]
        kind: dispatchd_db::models::ScheduleKind,
        /// Priority: p0, p1, p2
        #[arg(long, default_value = "p1")]
        priority: Priority,
        /// Working directory for the agent
        #[arg(long)]
        working_directory: Option<String>,
        /// Run the task in an isolated git worktree
        #[arg(long)]
        use_worktree: bool,
        /// Worktree cleanup policy: auto, keep, delete
        #[arg(long, default_value = "auto")]
        worktree_cleanup: WorktreeCleanupPolicy,
        /// 5-field cron expression (required for --type cron)
        #[arg(long, conflicts_with = "at")]
        cron: Option<String>,
        /// One-shot fire time, as an RFC 3339 timestamp (required for --type one_time)
        #[arg(long, conflicts_with = "cron")]
        at: Option<String>,
        /// IANA timezone name
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// Missed-run policy: skip, catchup, fail
        #[arg(long, default_value = "skip")]
        missed_run_policy: MissedRunPolicy,
        /// Maximum number of times this schedule may fire
        #[arg(long)]
        max_runs: Option<i32>,
        /// Expiration time, as an RFC 3339 timestamp
        #[arg(long)]
        expires_at: Option<String>,
        /// Schedule ID that must fire before this one is eligible
        #[arg(long)]
        after_schedule_id: Option<String>,
    },
    /// List all schedules
    List,
    /// Show schedule details and fire history
    Get {
        /// Schedule ID
        schedule_id: String,
    },
    /// Cancel a schedule
    Cancel {
        /// Schedule ID
        schedule_id: String,
        /// Reason for cancellation
        reason: Option<String>,
    },
    /// Pause a schedule
    Pause {
        /// Schedule ID
        schedule_id: String,
    },
    /// Resume a paused schedule
    Resume {
        /// Schedule ID
        schedule_id: String,
    },
}

/// Execute the `dispatchd init` command: write config file.
fn cmd_init(db_path: Option<&str>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let database_path = db_path
        .map(String::from)
        .unwrap_or_else(|| dispatchd_db::config::DbConfig::default_path().display().to_string());

    let cfg = config::ConfigFile {
        database: config::DatabaseSection { path: database_path.clone() },
        supervisor: config::SupervisorSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.path = {database_path}");
    println!();
    println!("Next: run `dispatchd serve` to start the supervisor.");

    Ok(())
}

fn parse_pipeline_stages(raw: &[String]) -> anyhow::Result<Vec<pipeline_cmd::PipelineStage>> {
    anyhow::ensure!(
        raw.len() % 2 == 0,
        "pipeline expects alternating prompt/delay pairs, got an odd number of arguments"
    );

    raw.chunks(2)
        .map(|pair| {
            let prompt = pair[0].clone();
            let delay = humantime::parse_duration(&pair[1])
                .with_context(|| format!("invalid delay {:?}", pair[1]))?;
            Ok(pipeline_cmd::PipelineStage {
                prompt,
                delay: chrono::Duration::from_std(delay)?,
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Init { db_path, force } = &cli.command {
        cmd_init(db_path.as_deref(), *force)?;
        return Ok(());
    }

    let resolved = DispatchdConfig::resolve(cli.database_path.as_deref())?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let result = run_command(cli.command, db_pool.clone(), &resolved).await;
    db_pool.close().await;
    result
}

async fn run_command(
    command: Commands,
    db_pool: sqlx::SqlitePool,
    resolved: &DispatchdConfig,
) -> anyhow::Result<()> {
    match command {
        Commands::Init { .. } => unreachable!("handled before pool creation"),
        Commands::Delegate {
            prompt,
            priority,
            working_directory,
            use_worktree,
            worktree_cleanup,
            merge_strategy,
            branch_name,
            base_branch,
            no_auto_commit,
            no_push,
            pr_title,
            pr_body,
            timeout_ms,
            max_output_buffer,
            depends_on,
            continue_from,
        } => {
            let args = delegate_cmd::DelegateArgs {
                prompt,
                priority,
                working_directory,
                use_worktree,
                worktree_cleanup,
                merge_strategy,
                branch_name,
                base_branch,
                no_auto_commit,
                no_push,
                pr_title,
                pr_body,
                timeout_ms,
                max_output_buffer,
                depends_on,
                continue_from,
            };
            delegate_cmd::run_delegate(&db_pool, args).await?;
        }
        Commands::Status { task_id } => {
            status_cmd::run_status(&db_pool, task_id.as_deref()).await?;
        }
        Commands::Logs { task_id, tail } => {
            log_cmd::run_log(&db_pool, &task_id, tail).await?;
        }
        Commands::Cancel { task_id, reason } => {
            cancel_cmd::run_cancel(&db_pool, &task_id, reason.as_deref()).await?;
        }
        Commands::Retry { task_id } => {
            retry_cmd::run_retry(&db_pool, &task_id).await?;
        }
        Commands::Resume { task_id, context } => {
            resume_cmd::run_resume(&db_pool, &task_id, context.as_deref()).await?;
        }
        Commands::Schedule { command } => {
            run_schedule_command(command, &db_pool).await?;
        }
        Commands::Pipeline { stages } => {
            let stages = parse_pipeline_stages(&stages)?;
            pipeline_cmd::run_pipeline(&db_pool, stages).await?;
        }
        Commands::Serve { repo_root, http_addr } => {
            run_serve(db_pool, resolved, repo_root, http_addr).await?;
        }
        Commands::Dashboard => {
            tui::run_dashboard(db_pool).await?;
        }
    }

    Ok(())
}

async fn run_schedule_command(command: ScheduleCommands, db_pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
    match command {
        ScheduleCommands::Create {
            prompt,
            kind,
            priority,
            working_directory,
            use_worktree,
            worktree_cleanup,
            cron,
            at,
            timezone,
            missed_run_policy,
            max_runs,
            expires_at,
            after_schedule_id,
        } => {
            let args = schedule_cmds::ScheduleCreateArgs {
                prompt,
                kind,
                priority,
                working_directory,
                use_worktree,
                worktree_cleanup,
                cron_expr: cron,
                run_at: at,
                timezone,
                missed_run_policy,
                max_runs,
                expires_at,
                after_schedule_id,
            };
            schedule_cmds::run_create(db_pool, args).await
        }
        ScheduleCommands::List => schedule_cmds::run_list(db_pool).await,
        ScheduleCommands::Get { schedule_id } => schedule_cmds::run_get(db_pool, &schedule_id).await,
        ScheduleCommands::Cancel { schedule_id, reason } => {
            schedule_cmds::run_cancel(db_pool, &schedule_id, reason.as_deref()).await
        }
        ScheduleCommands::Pause { schedule_id } => schedule_cmds::run_pause(db_pool, &schedule_id).await,
        ScheduleCommands::Resume { schedule_id } => schedule_cmds::run_resume(db_pool, &schedule_id).await,
    }
}

/// Run the full supervisor: crash recovery, queue drain, scheduler tick
/// loop, and store reconciliation, alongside the read-only HTTP status
/// endpoint. Shuts the supervisor down cleanly on Ctrl+C.
async fn run_serve(
    db_pool: sqlx::SqlitePool,
    resolved: &DispatchdConfig,
    repo_root: String,
    http_addr: String,
) -> anyhow::Result<()> {
    let config = SupervisorConfig {
        agent_binary: resolved.agent_binary.clone(),
        repo_root: repo_root.into(),
        isolation_mode: resolved.isolation_mode.clone(),
        resource_limits: ResourceLimits::default(),
        resource_poll_interval: Duration::from_secs(1),
        scheduler: SchedulerConfig::default(),
        event_history_cap: 1000,
    };

    let supervisor = Supervisor::start(db_pool.clone(), config)
        .await
        .context("failed to start supervisor")?;

    let (bind, port_str) = http_addr
        .rsplit_once(':')
        .with_context(|| format!("invalid --http-addr {http_addr:?}, expected HOST:PORT"))?;
    let port: u16 = port_str.parse().with_context(|| format!("invalid port in --http-addr {http_addr:?}"))?;
    let bind = bind.to_string();

    let http = tokio::spawn(async move { serve_cmd::run_serve(db_pool, &bind, port).await });

    tokio::signal::ctrl_c().await.context("failed to install Ctrl+C handler")?;
    tracing::info!("shutdown signal received");

    http.abort();
    supervisor.shutdown().await?;

    Ok(())
}
