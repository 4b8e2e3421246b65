//! Database query functions for the `schedules` and `schedule_executions` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{MissedRunPolicy, Schedule, ScheduleExecution, ScheduleKind, ScheduleStatus};

/// Fields needed to insert a new schedule row.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub id: Uuid,
    pub kind: ScheduleKind,
    pub cron_expr: Option<String>,
    pub run_at_ms: Option<i64>,
    pub timezone: String,
    pub missed_run_policy: MissedRunPolicy,
    pub max_runs: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub after_schedule_id: Option<Uuid>,
    pub task_template: serde_json::Value,
    pub next_run_at: Option<DateTime<Utc>>,
}

pub async fn insert_schedule(pool: &SqlitePool, new: &NewSchedule) -> Result<Schedule> {
    let now = Utc::now();
    let schedule = sqlx::query_as::<_, Schedule>(
        "INSERT INTO schedules (
            id, kind, cron_expr, run_at_ms, timezone, missed_run_policy, status,
            max_runs, expires_at, after_schedule_id, task_template, next_run_at,
            created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, 'active', ?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.kind)
    .bind(&new.cron_expr)
    .bind(new.run_at_ms)
    .bind(&new.timezone)
    .bind(new.missed_run_policy)
    .bind(new.max_runs)
    .bind(new.expires_at)
    .bind(new.after_schedule_id)
    .bind(&new.task_template)
    .bind(new.next_run_at)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert schedule")?;

    Ok(schedule)
}

pub async fn get_schedule(pool: &SqlitePool, id: Uuid) -> Result<Option<Schedule>> {
    let schedule = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch schedule")?;

    Ok(schedule)
}

pub async fn list_schedules(pool: &SqlitePool) -> Result<Vec<Schedule>> {
    let schedules = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list schedules")?;

    Ok(schedules)
}

/// List every schedule due to fire at or before `now`, used by the
/// scheduler's polling loop.
pub async fn list_due_schedules(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
    let schedules = sqlx::query_as::<_, Schedule>(
        "SELECT * FROM schedules \
         WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ? \
         ORDER BY next_run_at ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to list due schedules")?;

    Ok(schedules)
}

pub async fn set_status(pool: &SqlitePool, id: Uuid, status: ScheduleStatus) -> Result<()> {
    sqlx::query("UPDATE schedules SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update schedule status")?;

    Ok(())
}

/// Record that a schedule fired, advancing its run counters and next
/// firing time.
pub async fn record_fire(
    pool: &SqlitePool,
    id: Uuid,
    fired_at: DateTime<Utc>,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "UPDATE schedules \
         SET run_count = run_count + 1, last_run_at = ?, next_run_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(fired_at)
    .bind(next_run_at)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record schedule fire")?;

    Ok(())
}

pub async fn insert_execution(
    pool: &SqlitePool,
    schedule_id: Uuid,
    task_id: Option<Uuid>,
    fired_at: DateTime<Utc>,
    was_missed_run: bool,
) -> Result<ScheduleExecution> {
    let execution = sqlx::query_as::<_, ScheduleExecution>(
        "INSERT INTO schedule_executions (schedule_id, task_id, fired_at, was_missed_run) \
         VALUES (?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(schedule_id)
    .bind(task_id)
    .bind(fired_at)
    .bind(was_missed_run)
    .fetch_one(pool)
    .await
    .context("failed to insert schedule execution")?;

    Ok(execution)
}

pub async fn list_executions(pool: &SqlitePool, schedule_id: Uuid) -> Result<Vec<ScheduleExecution>> {
    let executions = sqlx::query_as::<_, ScheduleExecution>(
        "SELECT * FROM schedule_executions WHERE schedule_id = ? ORDER BY fired_at ASC",
    )
    .bind(schedule_id)
    .fetch_all(pool)
    .await
    .context("failed to list schedule executions")?;

    Ok(executions)
}
