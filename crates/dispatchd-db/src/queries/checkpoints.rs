//! Database query functions for the `task_checkpoints` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Checkpoint, CheckpointKind};

/// Fields needed to insert a new checkpoint row.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub task_id: Uuid,
    pub kind: CheckpointKind,
    pub output_summary: Option<String>,
    pub error_summary: Option<String>,
    pub git_branch: Option<String>,
    pub commit_sha: Option<String>,
    pub dirty_files: Option<Vec<String>>,
    pub note: Option<String>,
}

/// Persist a terminal-state checkpoint for a task.
pub async fn insert_checkpoint(pool: &SqlitePool, new: &NewCheckpoint) -> Result<Checkpoint> {
    let dirty_files_json = new
        .dirty_files
        .as_ref()
        .map(|files| serde_json::to_value(files))
        .transpose()
        .context("failed to serialize dirty files")?;

    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "INSERT INTO task_checkpoints (
            task_id, kind, output_summary, error_summary,
            git_branch, commit_sha, dirty_files, note, created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.kind)
    .bind(&new.output_summary)
    .bind(&new.error_summary)
    .bind(&new.git_branch)
    .bind(&new.commit_sha)
    .bind(dirty_files_json)
    .bind(&new.note)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert checkpoint")?;

    Ok(checkpoint)
}

/// List checkpoints for a task, oldest first.
pub async fn list_checkpoints_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM task_checkpoints WHERE task_id = ? ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list checkpoints for task")?;

    Ok(checkpoints)
}

/// Fetch the most recent checkpoint for a task, used as the resume anchor
/// when a `--continue-from` task is dispatched.
pub async fn latest_checkpoint(pool: &SqlitePool, task_id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM task_checkpoints WHERE task_id = ? ORDER BY created_at DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest checkpoint")?;

    Ok(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, WorktreeCleanupPolicy};
    use crate::queries::tasks::{insert_task, NewTask};
    use dispatchd_test_utils::test_pool;

    #[tokio::test]
    async fn insert_and_list_checkpoints() {
        let (pool, _guard) = test_pool().await;
        let task_id = Uuid::new_v4();
        insert_task(
            &pool,
            &NewTask {
                id: task_id,
                prompt: "task".to_string(),
                priority: Priority::P2,
                working_directory: None,
                use_worktree: false,
                worktree_cleanup: WorktreeCleanupPolicy::Auto,
                merge_strategy: None,
                branch_name: None,
                base_branch: None,
                auto_commit: false,
                push_to_remote: false,
                pr_title: None,
                pr_body: None,
                timeout_ms: None,
                max_output_buffer: 1_048_576,
                parent_task_id: None,
                continue_from: None,
            },
        )
        .await
        .unwrap();

        let checkpoint = insert_checkpoint(
            &pool,
            &NewCheckpoint {
                task_id,
                kind: CheckpointKind::Completed,
                output_summary: Some("done".to_string()),
                error_summary: None,
                git_branch: Some("dispatchd/task".to_string()),
                commit_sha: Some("abc123".to_string()),
                dirty_files: Some(vec!["src/lib.rs".to_string()]),
                note: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(checkpoint.dirty_files_vec(), Some(vec!["src/lib.rs".to_string()]));

        let latest = latest_checkpoint(&pool, task_id).await.unwrap().unwrap();
        assert_eq!(latest.id, checkpoint.id);

        let all = list_checkpoints_for_task(&pool, task_id).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
