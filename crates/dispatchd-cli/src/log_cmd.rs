//! `dispatchd logs` command: show a task's checkpoint history (captured
//! stdout/stderr tails, git state) rather than a live stream -- clients
//! poll, they don't attach to the running process.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use dispatchd_db::queries::{checkpoints, tasks as task_db};

/// Run the logs command.
pub async fn run_log(pool: &SqlitePool, task_id_str: &str, tail: Option<usize>) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {} ({})", task.id, task.status);
    println!();

    let records = checkpoints::list_checkpoints_for_task(pool, task_id).await?;
    if records.is_empty() {
        println!("No checkpoints recorded.");
        return Ok(());
    }

    for checkpoint in &records {
        println!(
            "[{}] checkpoint #{} kind={}",
            checkpoint.created_at.format("%Y-%m-%d %H:%M:%S%.3f UTC"),
            checkpoint.id,
            checkpoint.kind,
        );
        if let Some(branch) = &checkpoint.git_branch {
            let sha = checkpoint.commit_sha.as_deref().unwrap_or("?");
            println!("  git: branch={branch} commit={sha}");
        }
        if let Some(dirty) = checkpoint.dirty_files_vec() {
            if !dirty.is_empty() {
                println!("  dirty files: {}", dirty.join(", "));
            }
        }
        if let Some(output) = &checkpoint.output_summary {
            println!("  output:");
            print_tail(output, tail);
        }
        if let Some(error) = &checkpoint.error_summary {
            println!("  error:");
            print_tail(error, tail);
        }
        println!();
    }

    Ok(())
}

/// Print the last `tail` lines of `text` (or all of it if `tail` is `None`),
/// indented to match the surrounding section.
fn print_tail(text: &str, tail: Option<usize>) {
    let lines: Vec<&str> = text.lines().collect();
    let start = match tail {
        Some(n) if n < lines.len() => lines.len() - n,
        _ => 0,
    };
    for line in &lines[start..] {
        println!("    {line}");
    }
}
