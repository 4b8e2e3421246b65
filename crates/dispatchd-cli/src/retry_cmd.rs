//! `dispatchd retry` command: blind re-execution of a terminal task's
//! original prompt, linked to the root of its retry chain.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use dispatchd_db::queries::tasks as task_db;

pub async fn run_retry(pool: &SqlitePool, task_id_str: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let original = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    if !original.status.is_terminal() {
        bail!("task {task_id} is {} -- only terminal tasks may be retried", original.status);
    }

    let new_id = Uuid::new_v4();
    let retry = task_db::insert_retry(pool, &original, new_id).await?;

    println!(
        "Retried {} as {} (retry_of={}, parent={}, retry_count={})",
        original.display_id(),
        retry.display_id(),
        task_id,
        retry.parent_task_id.unwrap_or(task_id),
        retry.retry_count,
    );

    Ok(())
}
