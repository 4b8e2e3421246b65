//! Database query functions for the `task_dependencies` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::DependencyResolution;

/// Insert a dependency edge: `task_id` depends on `depends_on`.
///
/// Idempotent via `INSERT OR IGNORE` on the composite primary key.
pub async fn insert_dependency(pool: &SqlitePool, task_id: Uuid, depends_on: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on, resolution, created_at) \
         VALUES (?, ?, 'pending', ?)",
    )
    .bind(task_id)
    .bind(depends_on)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// Get the IDs of all tasks that a given task depends on.
pub async fn get_dependencies(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to get task dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Get the IDs of all tasks that depend on a given task (its dependents).
pub async fn get_dependents(pool: &SqlitePool, depends_on: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT task_id FROM task_dependencies WHERE depends_on = ?")
            .bind(depends_on)
            .fetch_all(pool)
            .await
            .context("failed to get task dependents")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Mark a single dependency edge with its resolution outcome.
pub async fn resolve_dependency(
    pool: &SqlitePool,
    task_id: Uuid,
    depends_on: Uuid,
    resolution: DependencyResolution,
) -> Result<()> {
    sqlx::query(
        "UPDATE task_dependencies SET resolution = ? WHERE task_id = ? AND depends_on = ?",
    )
    .bind(resolution)
    .bind(task_id)
    .bind(depends_on)
    .execute(pool)
    .await
    .context("failed to resolve task dependency")?;

    Ok(())
}

/// Check whether every dependency of `task_id` has resolved `satisfied`.
pub async fn all_dependencies_satisfied(pool: &SqlitePool, task_id: Uuid) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_dependencies \
         WHERE task_id = ? AND resolution != 'satisfied'",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to check dependency satisfaction")?;

    Ok(row.0 == 0)
}

/// Check whether any dependency of `task_id` has resolved `failed` or `cancelled`.
pub async fn any_dependency_blocked(pool: &SqlitePool, task_id: Uuid) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_dependencies \
         WHERE task_id = ? AND resolution IN ('failed', 'cancelled')",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to check dependency blocking")?;

    Ok(row.0 > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, WorktreeCleanupPolicy};
    use crate::queries::tasks::{insert_task, NewTask};
    use dispatchd_test_utils::test_pool;

    fn sample_task(id: Uuid) -> NewTask {
        NewTask {
            id,
            prompt: "build it".to_string(),
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
            timeout_ms: None,
            max_output_buffer: 1_048_576,
            parent_task_id: None,
            continue_from: None,
        }
    }

    #[tokio::test]
    async fn dependency_satisfaction_tracks_resolution() {
        let (pool, _guard) = test_pool().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        insert_task(&pool, &sample_task(a)).await.unwrap();
        insert_task(&pool, &sample_task(b)).await.unwrap();

        insert_dependency(&pool, b, a).await.unwrap();
        assert!(!all_dependencies_satisfied(&pool, b).await.unwrap());

        resolve_dependency(&pool, b, a, DependencyResolution::Satisfied)
            .await
            .unwrap();
        assert!(all_dependencies_satisfied(&pool, b).await.unwrap());
    }

    #[tokio::test]
    async fn failed_dependency_blocks() {
        let (pool, _guard) = test_pool().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        insert_task(&pool, &sample_task(a)).await.unwrap();
        insert_task(&pool, &sample_task(b)).await.unwrap();

        insert_dependency(&pool, b, a).await.unwrap();
        resolve_dependency(&pool, b, a, DependencyResolution::Failed)
            .await
            .unwrap();

        assert!(any_dependency_blocked(&pool, b).await.unwrap());
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let (pool, _guard) = test_pool().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        insert_task(&pool, &sample_task(a)).await.unwrap();
        insert_task(&pool, &sample_task(b)).await.unwrap();

        insert_dependency(&pool, b, a).await.unwrap();
        insert_dependency(&pool, b, a).await.unwrap();

        let deps = get_dependencies(&pool, b).await.unwrap();
        assert_eq!(deps.len(), 1);
    }
}
