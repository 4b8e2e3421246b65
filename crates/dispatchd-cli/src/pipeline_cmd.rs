//! `dispatchd pipeline` command: materialize a chain of one-shot schedules,
//! each waiting on the previous one before it fires.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use dispatchd_db::models::{MissedRunPolicy, Priority, ScheduleKind, WorktreeCleanupPolicy};
use dispatchd_db::queries::schedules;

/// One stage of a pipeline: a prompt and the delay (from the previous
/// stage's fire time) before it should run.
pub struct PipelineStage {
    pub prompt: String,
    pub delay: chrono::Duration,
}

pub async fn run_pipeline(pool: &SqlitePool, stages: Vec<PipelineStage>) -> Result<()> {
    anyhow::ensure!(!stages.is_empty(), "pipeline requires at least one stage");

    let mut cursor = Utc::now();
    let mut after_schedule_id: Option<Uuid> = None;
    let mut created = Vec::with_capacity(stages.len());

    for stage in stages {
        cursor += stage.delay;

        let task_template = serde_json::json!({
            "prompt": stage.prompt,
            "priority": Priority::P1,
            "working_directory": serde_json::Value::Null,
            "use_worktree": false,
            "worktree_cleanup": WorktreeCleanupPolicy::Auto,
        });

        let new = schedules::NewSchedule {
            id: Uuid::new_v4(),
            kind: ScheduleKind::OneTime,
            cron_expr: None,
            run_at_ms: Some(cursor.timestamp_millis()),
            timezone: "UTC".to_string(),
            missed_run_policy: MissedRunPolicy::Skip,
            max_runs: None,
            expires_at: None,
            after_schedule_id,
            task_template,
            next_run_at: Some(cursor),
        };

        let schedule = schedules::insert_schedule(pool, &new)
            .await
            .with_context(|| "failed to insert pipeline stage")?;

        after_schedule_id = Some(schedule.id);
        created.push(schedule);
    }

    for (i, schedule) in created.iter().enumerate() {
        println!(
            "Stage {}: schedule {} at {}",
            i + 1,
            schedule.id,
            schedule.next_run_at.unwrap().format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }

    Ok(())
}
