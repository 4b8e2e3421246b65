//! `dispatchd cancel` command.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use dispatchd_db::models::TaskStatus;
use dispatchd_db::queries::tasks as task_db;

pub async fn run_cancel(pool: &SqlitePool, task_id_str: &str, reason: Option<&str>) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    match task.status {
        TaskStatus::Queued => {
            let affected =
                task_db::transition_task_status(pool, task_id, TaskStatus::Queued, TaskStatus::Cancelled)
                    .await?;
            if affected == 0 {
                bail!("task {task_id} changed status before it could be cancelled, try again");
            }
        }
        TaskStatus::Running => {
            bail!(
                "task {task_id} is running; cancellation of a live process must go through \
                 the `serve` instance driving it, not a direct store write"
            );
        }
        _ => bail!("task {task_id} is already in a terminal state ({})", task.status),
    }

    match reason {
        Some(reason) => println!("Task {task_id} cancelled: {reason}"),
        None => println!("Task {task_id} cancelled."),
    }

    Ok(())
}
