//! `dispatchd resume` command: retry a terminal task with its last
//! checkpoint folded into the prompt so the agent picks up where it left
//! off instead of starting blind.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use dispatchd_core::handlers::build_resume_prompt;
use dispatchd_db::queries::{checkpoints, tasks as task_db};

pub async fn run_resume(pool: &SqlitePool, task_id_str: &str, context: Option<&str>) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let original = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    if !original.status.is_terminal() {
        bail!("task {task_id} is {} -- only terminal tasks may be resumed", original.status);
    }

    let checkpoint = checkpoints::latest_checkpoint(pool, task_id).await?;
    let prompt = build_resume_prompt(&original, checkpoint.as_ref(), context);

    let mut resume_source = original.clone();
    resume_source.prompt = prompt;

    let new_id = Uuid::new_v4();
    let resumed = task_db::insert_retry(pool, &resume_source, new_id).await?;

    println!(
        "Resumed {} as {} (retry_of={}, parent={}, retry_count={})",
        original.display_id(),
        resumed.display_id(),
        task_id,
        resumed.parent_task_id.unwrap_or(task_id),
        resumed.retry_count,
    );

    Ok(())
}
