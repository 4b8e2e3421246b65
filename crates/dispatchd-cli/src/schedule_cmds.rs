//! `dispatchd schedule` subcommands: create/list/get/cancel/pause/resume
//! over cron and one-shot task schedules.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use dispatchd_core::scheduler::CronSchedule;
use dispatchd_db::models::{MissedRunPolicy, Priority, ScheduleKind, ScheduleStatus, WorktreeCleanupPolicy};
use dispatchd_db::queries::schedules;

pub struct ScheduleCreateArgs {
    pub prompt: String,
    pub kind: ScheduleKind,
    pub priority: Priority,
    pub working_directory: Option<String>,
    pub use_worktree: bool,
    pub worktree_cleanup: WorktreeCleanupPolicy,
    pub cron_expr: Option<String>,
    pub run_at: Option<String>,
    pub timezone: String,
    pub missed_run_policy: MissedRunPolicy,
    pub max_runs: Option<i32>,
    pub expires_at: Option<String>,
    pub after_schedule_id: Option<String>,
}

fn parse_rfc3339(label: &str, raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid {label} timestamp: {raw}"))?
        .with_timezone(&Utc))
}

pub async fn run_create(pool: &SqlitePool, args: ScheduleCreateArgs) -> Result<()> {
    let tz: chrono_tz::Tz = args
        .timezone
        .parse()
        .map_err(|_| anyhow::anyhow!("unrecognized timezone: {}", args.timezone))?;

    let next_run_at = match args.kind {
        ScheduleKind::Cron => {
            let expr = args
                .cron_expr
                .as_deref()
                .context("schedule create --type cron requires --cron EXPR")?;
            let cron = CronSchedule::parse(expr).with_context(|| format!("invalid cron expression: {expr}"))?;
            cron.next_after(Utc::now(), tz).context("cron expression has no future slot")?
        }
        ScheduleKind::OneTime => {
            let raw = args.run_at.as_deref().context("schedule create --type one_time requires --at TIMESTAMP")?;
            parse_rfc3339("--at", raw)?
        }
    };

    let after_schedule_id = args
        .after_schedule_id
        .as_deref()
        .map(|s| Uuid::parse_str(s).with_context(|| format!("invalid after-schedule ID: {s}")))
        .transpose()?;

    if let Some(after_id) = after_schedule_id {
        schedules::get_schedule(pool, after_id)
            .await?
            .with_context(|| format!("after-schedule {after_id} not found"))?;
    }

    let expires_at = args.expires_at.as_deref().map(|raw| parse_rfc3339("--expires-at", raw)).transpose()?;

    let task_template = serde_json::json!({
        "prompt": args.prompt,
        "priority": args.priority,
        "working_directory": args.working_directory,
        "use_worktree": args.use_worktree,
        "worktree_cleanup": args.worktree_cleanup,
    });

    let new = schedules::NewSchedule {
        id: Uuid::new_v4(),
        kind: args.kind,
        cron_expr: args.cron_expr,
        run_at_ms: args.run_at.as_deref().and_then(|raw| parse_rfc3339("--at", raw).ok()).map(|dt| dt.timestamp_millis()),
        timezone: args.timezone,
        missed_run_policy: args.missed_run_policy,
        max_runs: args.max_runs,
        expires_at,
        after_schedule_id,
        task_template,
        next_run_at: Some(next_run_at),
    };

    let schedule = schedules::insert_schedule(pool, &new).await?;
    println!("Created schedule {} ({})", schedule.id, schedule.kind);
    if let Some(next) = schedule.next_run_at {
        println!("Next run at: {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    Ok(())
}

pub async fn run_list(pool: &SqlitePool) -> Result<()> {
    let schedules = schedules::list_schedules(pool).await?;
    if schedules.is_empty() {
        println!("No schedules.");
        return Ok(());
    }

    for schedule in schedules {
        let next = schedule
            .next_run_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<9} {:<9} runs={:<4} next={}",
            schedule.id, schedule.kind, schedule.status, schedule.run_count, next
        );
    }

    Ok(())
}

pub async fn run_get(pool: &SqlitePool, schedule_id_str: &str) -> Result<()> {
    let schedule_id =
        Uuid::parse_str(schedule_id_str).with_context(|| format!("invalid schedule ID: {schedule_id_str}"))?;

    let schedule = schedules::get_schedule(pool, schedule_id)
        .await?
        .with_context(|| format!("schedule {schedule_id} not found"))?;

    println!("Schedule: {}", schedule.id);
    println!("Kind: {}", schedule.kind);
    println!("Status: {}", schedule.status);
    if let Some(expr) = &schedule.cron_expr {
        println!("Cron: {expr} ({})", schedule.timezone);
    }
    println!("Runs: {}", schedule.run_count);
    if let Some(last) = schedule.last_run_at {
        println!("Last run: {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(next) = schedule.next_run_at {
        println!("Next run: {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("Task template: {}", schedule.task_template);

    let executions = schedules::list_executions(pool, schedule_id).await?;
    if !executions.is_empty() {
        println!("Executions:");
        for execution in executions {
            let task = execution.task_id.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());
            println!(
                "  {} task={} missed={}",
                execution.fired_at.format("%Y-%m-%d %H:%M:%S UTC"),
                task,
                execution.was_missed_run,
            );
        }
    }

    Ok(())
}

async fn set_status(pool: &SqlitePool, schedule_id_str: &str, to: ScheduleStatus) -> Result<()> {
    let schedule_id =
        Uuid::parse_str(schedule_id_str).with_context(|| format!("invalid schedule ID: {schedule_id_str}"))?;

    let schedule = schedules::get_schedule(pool, schedule_id)
        .await?
        .with_context(|| format!("schedule {schedule_id} not found"))?;

    let terminal = matches!(
        schedule.status,
        ScheduleStatus::Completed | ScheduleStatus::Cancelled | ScheduleStatus::Expired | ScheduleStatus::Failed
    );
    if terminal {
        bail!("schedule {schedule_id} is already in a terminal state ({})", schedule.status);
    }

    schedules::set_status(pool, schedule_id, to).await?;
    println!("Schedule {schedule_id} set to {to}");

    Ok(())
}

pub async fn run_cancel(pool: &SqlitePool, schedule_id_str: &str, reason: Option<&str>) -> Result<()> {
    set_status(pool, schedule_id_str, ScheduleStatus::Cancelled).await?;
    if let Some(reason) = reason {
        println!("Reason: {reason}");
    }
    Ok(())
}

pub async fn run_pause(pool: &SqlitePool, schedule_id_str: &str) -> Result<()> {
    set_status(pool, schedule_id_str, ScheduleStatus::Paused).await
}

pub async fn run_resume(pool: &SqlitePool, schedule_id_str: &str) -> Result<()> {
    set_status(pool, schedule_id_str, ScheduleStatus::Active).await
}
