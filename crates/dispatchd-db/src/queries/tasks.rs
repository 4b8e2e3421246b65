//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{MergeStrategy, Priority, Task, TaskStatus, WorktreeCleanupPolicy};

/// Fields needed to insert a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Uuid,
    pub prompt: String,
    pub priority: Priority,
    pub working_directory: Option<String>,
    pub use_worktree: bool,
    pub worktree_cleanup: WorktreeCleanupPolicy,
    pub merge_strategy: Option<MergeStrategy>,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub auto_commit: bool,
    pub push_to_remote: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub timeout_ms: Option<i64>,
    pub max_output_buffer: i64,
    pub parent_task_id: Option<Uuid>,
    pub continue_from: Option<Uuid>,
}

/// Insert a new task row in `queued` status.
pub async fn insert_task(pool: &SqlitePool, new: &NewTask) -> Result<Task> {
    let now = Utc::now();
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (
            id, prompt, priority, status, working_directory,
            use_worktree, worktree_cleanup, merge_strategy, branch_name, base_branch,
            auto_commit, push_to_remote, pr_title, pr_body, timeout_ms, max_output_buffer,
            parent_task_id, continue_from, created_at, updated_at
         ) VALUES (?, ?, ?, 'queued', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(new.id)
    .bind(&new.prompt)
    .bind(new.priority)
    .bind(&new.working_directory)
    .bind(new.use_worktree)
    .bind(new.worktree_cleanup)
    .bind(new.merge_strategy)
    .bind(&new.branch_name)
    .bind(&new.base_branch)
    .bind(new.auto_commit)
    .bind(new.push_to_remote)
    .bind(&new.pr_title)
    .bind(&new.pr_body)
    .bind(new.timeout_ms)
    .bind(new.max_output_buffer)
    .bind(new.parent_task_id)
    .bind(new.continue_from)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks, newest first, optionally capped.
pub async fn list_tasks(pool: &SqlitePool, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks ORDER BY created_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// List every task currently sitting in `queued`, ordered by priority band
/// then FIFO arrival, mirroring the in-memory queue's eviction order. Used
/// to repopulate the priority queue on startup recovery.
pub async fn list_queued_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'queued' ORDER BY priority ASC, created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list queued tasks")?;

    Ok(tasks)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = ?from`, so the row is only updated if the current status
/// matches the expected `from` value. Returns the number of rows affected
/// (0 means the status did not match, a likely race with another handler).
pub async fn transition_task_status(
    pool: &SqlitePool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let now = Utc::now();
    let started_at = matches!(to, TaskStatus::Running).then_some(now);
    let completed_at = to.is_terminal().then_some(now);

    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, updated_at = ?, \
             started_at = COALESCE(?, started_at), \
             completed_at = COALESCE(?, completed_at) \
         WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(now)
    .bind(started_at)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Record the worker that picked up a task.
pub async fn assign_worker(pool: &SqlitePool, task_id: Uuid, worker_id: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET worker_id = ?, updated_at = ? WHERE id = ?")
        .bind(worker_id)
        .bind(Utc::now())
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to assign worker to task")?;

    Ok(())
}

/// Record the terminal outcome of a task's process.
pub async fn record_outcome(
    pool: &SqlitePool,
    task_id: Uuid,
    exit_code: Option<i32>,
    error_kind: Option<&str>,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks \
         SET exit_code = ?, error_kind = ?, error_message = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(exit_code)
    .bind(error_kind)
    .bind(error_message)
    .bind(Utc::now())
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to record task outcome")?;

    Ok(())
}

/// Insert a retry of an existing task, copying its delegation parameters and
/// linking back via `retry_of`. `parent_task_id` always points at the root
/// of the chain (the original's own parent, or the original itself if it
/// has none), so every retry in a chain shares the same parent.
pub async fn insert_retry(pool: &SqlitePool, original: &Task, new_id: Uuid) -> Result<Task> {
    let now = Utc::now();
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (
            id, prompt, priority, status, working_directory,
            use_worktree, worktree_cleanup, merge_strategy, branch_name, base_branch,
            auto_commit, push_to_remote, pr_title, pr_body, timeout_ms, max_output_buffer,
            parent_task_id, retry_of, retry_count, created_at, updated_at
         ) VALUES (?, ?, ?, 'queued', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(new_id)
    .bind(&original.prompt)
    .bind(original.priority)
    .bind(&original.working_directory)
    .bind(original.use_worktree)
    .bind(original.worktree_cleanup)
    .bind(original.merge_strategy)
    .bind(&original.branch_name)
    .bind(&original.base_branch)
    .bind(original.auto_commit)
    .bind(original.push_to_remote)
    .bind(&original.pr_title)
    .bind(&original.pr_body)
    .bind(original.timeout_ms)
    .bind(original.max_output_buffer)
    .bind(original.parent_task_id.unwrap_or(original.id))
    .bind(original.id)
    .bind(original.retry_count + 1)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert retry task")?;

    Ok(task)
}

/// Fail tasks stuck in `running` with a crash-recovery error.
///
/// Used for restart recovery: if the supervisor crashes mid-run, tasks that
/// were in flight are left in limbo with no worker process actually alive
/// to finish them. There is no way to know how far the agent got, so they
/// are marked failed rather than silently re-queued; an operator can retry
/// them explicitly. Returns the tasks that were reset.
pub async fn reset_orphaned_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let now = Utc::now();
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'failed', worker_id = NULL, completed_at = ?, \
             error_kind = 'system_error', error_message = 'supervisor crashed while task was running', \
             updated_at = ? \
         WHERE status = 'running' \
         RETURNING *",
    )
    .bind(now)
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned tasks")?;

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatchd_test_utils::test_pool;

    fn sample_new_task() -> NewTask {
        NewTask {
            id: Uuid::new_v4(),
            prompt: "summarize the changelog".to_string(),
            priority: Priority::P1,
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
            timeout_ms: Some(60_000),
            max_output_buffer: 1_048_576,
            parent_task_id: None,
            continue_from: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trips() {
        let (pool, _guard) = test_pool().await;
        let new = sample_new_task();
        let inserted = insert_task(&pool, &new).await.unwrap();
        assert_eq!(inserted.status, TaskStatus::Queued);

        let fetched = get_task(&pool, new.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, new.id);
        assert_eq!(fetched.prompt, new.prompt);
    }

    #[tokio::test]
    async fn transition_respects_optimistic_lock() {
        let (pool, _guard) = test_pool().await;
        let new = sample_new_task();
        insert_task(&pool, &new).await.unwrap();

        let affected = transition_task_status(&pool, new.id, TaskStatus::Queued, TaskStatus::Running)
            .await
            .unwrap();
        assert_eq!(affected, 1);

        // Stale "from" no longer matches; should not apply.
        let affected = transition_task_status(&pool, new.id, TaskStatus::Queued, TaskStatus::Completed)
            .await
            .unwrap();
        assert_eq!(affected, 0);

        let task = get_task(&pool, new.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn reset_orphaned_tasks_requeues_running() {
        let (pool, _guard) = test_pool().await;
        let new = sample_new_task();
        insert_task(&pool, &new).await.unwrap();
        transition_task_status(&pool, new.id, TaskStatus::Queued, TaskStatus::Running)
            .await
            .unwrap();
        assign_worker(&pool, new.id, "worker-1").await.unwrap();

        let reset = reset_orphaned_tasks(&pool).await.unwrap();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].status, TaskStatus::Failed);
        assert!(reset[0].worker_id.is_none());
        assert_eq!(reset[0].error_kind.as_deref(), Some("system_error"));
    }

    #[tokio::test]
    async fn insert_retry_links_to_original() {
        let (pool, _guard) = test_pool().await;
        let new = sample_new_task();
        let original = insert_task(&pool, &new).await.unwrap();

        let retry_id = Uuid::new_v4();
        let retry = insert_retry(&pool, &original, retry_id).await.unwrap();
        assert_eq!(retry.retry_of, Some(original.id));
        assert_eq!(retry.retry_count, 1);
    }
}
