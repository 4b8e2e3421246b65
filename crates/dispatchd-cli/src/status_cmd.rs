//! `dispatchd status` command: show task status, one task or all of them.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use dispatchd_db::queries::dependencies;
use dispatchd_db::queries::tasks as task_db;

/// Run the status command.
///
/// When `task_id_str` is `Some`, shows detailed status for that task.
/// When `None`, lists recent tasks with a one-line summary each.
pub async fn run_status(pool: &SqlitePool, task_id_str: Option<&str>) -> Result<()> {
    match task_id_str {
        Some(id_str) => run_task_status(pool, id_str).await,
        None => run_fleet_status(pool).await,
    }
}

/// Show detailed status for a single task.
async fn run_task_status(pool: &SqlitePool, task_id_str: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {}", task.id);
    println!("Status: {} (priority {})", task.status, task.priority);
    println!("Prompt: {}", task.prompt);
    if let Some(worker_id) = &task.worker_id {
        println!("Worker: {worker_id}");
    }
    if let Some(exit_code) = task.exit_code {
        println!("Exit code: {exit_code}");
    }
    if let Some(kind) = &task.error_kind {
        println!("Error: [{kind}] {}", task.error_message.as_deref().unwrap_or(""));
    }
    println!("Created: {}", task.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(started_at) = task.started_at {
        println!("Started: {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(completed_at) = task.completed_at {
        println!("Completed: {}", completed_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(retry_of) = task.retry_of {
        println!("Retry of: {retry_of} (attempt {})", task.retry_count);
    }

    let depends_on = dependencies::get_dependencies(pool, task_id).await?;
    if !depends_on.is_empty() {
        println!();
        println!("Depends on:");
        for dep in &depends_on {
            let resolved = dependencies::all_dependencies_satisfied(pool, task_id).await?;
            println!("  {dep} (all satisfied: {resolved})");
        }
    }

    Ok(())
}

/// List recent tasks with a progress summary.
async fn run_fleet_status(pool: &SqlitePool) -> Result<()> {
    let tasks = task_db::list_tasks(pool, 50).await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<4} {:<30}", "ID", "STATUS", "PRI", "PROMPT");
    println!("{}", "-".repeat(92));

    for task in &tasks {
        let prompt_display = if task.prompt.len() > 28 {
            format!("{}...", &task.prompt[..25])
        } else {
            task.prompt.clone()
        };
        println!(
            "{:<38} {:<10} {:<4} {:<30}",
            task.id, task.status, task.priority, prompt_display
        );
    }

    Ok(())
}
