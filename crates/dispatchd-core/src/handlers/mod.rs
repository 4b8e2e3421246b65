//! Event handlers: the glue between the store, the graph, the queue, and
//! the worker pool.
//!
//! Each handler corresponds to one reaction named in the supervisor's
//! event taxonomy (delegation, queue dispatch, completion, dependency
//! resolution, checkpoint capture, resume, cancellation). They share a
//! `Handlers` struct so a single delegation call can chain straight into
//! a queue dispatch without a round trip through the bus -- matching
//! the "store write happens-before the event that announces it"
//! ordering guarantee by doing the write first and publishing after.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use dispatchd_db::models::{
    Checkpoint, CheckpointKind, DependencyResolution, Task, TaskStatus,
};
use dispatchd_db::queries::{checkpoints, dependencies, tasks};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::SupervisorError;
use crate::events::{BusEvent, EventBus};
use crate::graph::DependencyGraph;
use crate::pool::{TaskOutcome, WorkerPool, WorktreeContext};
use crate::queue::TaskQueue;

pub struct Handlers {
    pub db: SqlitePool,
    pub graph: Mutex<DependencyGraph>,
    pub queue: Mutex<TaskQueue>,
    pub pool: Arc<WorkerPool>,
    pub events: EventBus,
    pub repo_root: std::path::PathBuf,
    pub worktree: Option<WorktreeContext>,
}

impl Handlers {
    /// Persist a newly delegated task and its dependency edges, then
    /// either enqueue it immediately or leave it blocked.
    pub async fn handle_delegated(
        self: &Arc<Self>,
        new: &tasks::NewTask,
        depends_on: &[Uuid],
    ) -> Result<Task> {
        let task = tasks::insert_task(&self.db, new).await?;

        {
            let mut graph = self.graph.lock().await;
            for &dep in depends_on {
                if let Err(e) = graph.add_edge(task.id, dep) {
                    graph.remove_node(task.id);
                    return Err(SupervisorError::InvalidInput(e.to_string()).into());
                }
            }
        }

        for &dep in depends_on {
            dependencies::insert_dependency(&self.db, task.id, dep).await?;
        }

        self.events.publish(BusEvent::TaskQueued { task_id: task.id });

        if depends_on.is_empty() || dependencies::all_dependencies_satisfied(&self.db, task.id).await? {
            self.enqueue_ready(task.id).await?;
        }

        self.run_queue().await?;
        Ok(task)
    }

    async fn enqueue_ready(&self, task_id: Uuid) -> Result<()> {
        let task = tasks::get_task(&self.db, task_id)
            .await?
            .ok_or_else(|| SupervisorError::InvalidInput(format!("task {task_id} not found")))?;
        let mut queue = self.queue.lock().await;
        queue
            .push(task_id, task.priority)
            .map_err(|e| SupervisorError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Pick up tasks that landed in `queued` without going through
    /// [`Handlers::handle_delegated`] -- e.g. a CLI command writing
    /// directly to the same database file while a supervisor is
    /// already running against it. Safe to call repeatedly: queue
    /// membership is de-duplicated by task ID.
    pub async fn reconcile_from_store(&self) -> Result<()> {
        for task in tasks::list_queued_tasks(&self.db).await? {
            if self.queue.lock().await.contains(task.id) {
                continue;
            }

            let depends_on = dependencies::get_dependencies(&self.db, task.id).await?;
            for &dep in &depends_on {
                let _ = self.graph.lock().await.add_edge(task.id, dep);
            }

            if depends_on.is_empty() || dependencies::all_dependencies_satisfied(&self.db, task.id).await? {
                self.enqueue_ready(task.id).await?;
            }
        }
        Ok(())
    }

    /// Drain as much of the queue as admission allows, spawning a
    /// worker per task that fits. Called after delegation, after a
    /// worker frees up, and on resource-monitor ticks.
    pub async fn run_queue(self: &Arc<Self>) -> Result<()> {
        loop {
            if !self.pool.can_spawn() {
                break;
            }
            let task_id = {
                let mut queue = self.queue.lock().await;
                match queue.pop() {
                    Some(id) => id,
                    None => break,
                }
            };

            let Some(task) = tasks::get_task(&self.db, task_id).await? else {
                warn!(task_id = %task_id, "queued task vanished from store before dispatch");
                continue;
            };

            let affected =
                tasks::transition_task_status(&self.db, task_id, TaskStatus::Queued, TaskStatus::Running)
                    .await?;
            if affected == 0 {
                continue;
            }

            match self
                .pool
                .spawn_task(&task, &self.repo_root, self.worktree.as_ref())
                .await
            {
                Ok(handle) => {
                    let handlers = Arc::clone(self);
                    tokio::spawn(async move {
                        match handle.await {
                            Ok(outcome) => {
                                if let Err(e) = handlers.handle_completion(task_id, &outcome).await {
                                    warn!(task_id = %task_id, error = %e, "completion handling failed");
                                }
                            }
                            Err(e) => warn!(task_id = %task_id, error = %e, "worker task panicked"),
                        }
                    });
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "spawn failed, re-queuing");
                    tasks::transition_task_status(&self.db, task_id, TaskStatus::Running, TaskStatus::Queued)
                        .await?;
                    self.enqueue_ready(task_id).await?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Persist a task's terminal outcome, capture a checkpoint, resolve
    /// its outgoing dependency edges, and wake any dependents whose
    /// last pending edge just cleared.
    pub async fn handle_completion(self: &Arc<Self>, task_id: Uuid, outcome: &TaskOutcome) -> Result<()> {
        let succeeded = outcome.succeeded();
        let to_status = if succeeded { TaskStatus::Completed } else { TaskStatus::Failed };
        let from_status = TaskStatus::Running;

        tasks::record_outcome(
            &self.db,
            task_id,
            outcome.exit_code,
            (!succeeded).then_some(if outcome.timed_out { "timeout" } else { "non_zero_exit" }),
            outcome.spawn_error.as_deref(),
        )
        .await?;
        tasks::transition_task_status(&self.db, task_id, from_status, to_status).await?;

        self.capture_checkpoint(task_id, outcome).await?;

        let resolution = if succeeded {
            DependencyResolution::Satisfied
        } else {
            DependencyResolution::Failed
        };

        let dependents = dependencies::get_dependents(&self.db, task_id).await?;
        for dependent in &dependents {
            dependencies::resolve_dependency(&self.db, *dependent, task_id, resolution).await?;
            self.events.publish(if succeeded {
                BusEvent::DependencyResolved { task_id: *dependent, depends_on: task_id }
            } else {
                BusEvent::DependencyBlocked { task_id: *dependent, depends_on: task_id }
            });
            self.on_dependency_settled(*dependent).await?;
        }

        self.graph.lock().await.remove_node(task_id);
        self.run_queue().await?;
        Ok(())
    }

    async fn on_dependency_settled(self: &Arc<Self>, dependent_id: Uuid) -> Result<()> {
        if dependencies::any_dependency_blocked(&self.db, dependent_id).await? {
            self.fail_dependent(dependent_id).await?;
            return Ok(());
        }
        if dependencies::all_dependencies_satisfied(&self.db, dependent_id).await? {
            self.enqueue_ready(dependent_id).await?;
        }
        Ok(())
    }

    /// Mark a task failed because one of its dependencies failed or was
    /// cancelled, and cascade the same outcome to its own dependents so a
    /// failure propagates through the whole downstream chain rather than
    /// stopping one edge away from where it originated.
    async fn fail_dependent(self: &Arc<Self>, task_id: Uuid) -> Result<()> {
        let blocking = dependencies::get_dependencies(&self.db, task_id).await?;
        let mut origin = None;
        for &dep in &blocking {
            if let Some(dep_task) = tasks::get_task(&self.db, dep).await? {
                if dep_task.status == TaskStatus::Failed {
                    origin = Some(dep);
                    break;
                }
            }
        }
        let origin = origin.or_else(|| blocking.first().copied());

        let affected =
            tasks::transition_task_status(&self.db, task_id, TaskStatus::Queued, TaskStatus::Failed).await?;
        if affected == 0 {
            return Ok(());
        }

        let message = match origin {
            Some(dep) => format!("upstream dependency {dep} failed"),
            None => "an upstream dependency failed".to_string(),
        };
        tasks::record_outcome(&self.db, task_id, None, Some("dependency_failed"), Some(&message)).await?;
        self.events.publish(BusEvent::TaskFailed {
            task_id,
            error_kind: "dependency_failed".to_string(),
            message,
        });

        self.queue.lock().await.remove(task_id);
        self.graph.lock().await.remove_node(task_id);

        let dependents = dependencies::get_dependents(&self.db, task_id).await?;
        for dependent in &dependents {
            dependencies::resolve_dependency(&self.db, *dependent, task_id, DependencyResolution::Failed).await?;
            self.events.publish(BusEvent::DependencyBlocked { task_id: *dependent, depends_on: task_id });
            Box::pin(self.on_dependency_settled(*dependent)).await?;
        }

        Ok(())
    }

    async fn capture_checkpoint(&self, task_id: Uuid, outcome: &TaskOutcome) -> Result<Checkpoint> {
        let kind = if outcome.succeeded() {
            CheckpointKind::Completed
        } else if outcome.killed || outcome.timed_out {
            CheckpointKind::Cancelled
        } else {
            CheckpointKind::Failed
        };

        let snapshot = outcome
            .workspace
            .as_ref()
            .map(|ws| git_snapshot(&ws.path))
            .unwrap_or_default();

        let new = checkpoints::NewCheckpoint {
            task_id,
            kind,
            output_summary: Some(outcome.stdout_tail.clone()),
            error_summary: Some(outcome.stderr_tail.clone()),
            git_branch: snapshot.branch,
            commit_sha: snapshot.commit_sha,
            dirty_files: snapshot.dirty_files,
            note: outcome.merge_outcome.as_ref().map(|m| format!("{m:?}")),
        };

        checkpoints::insert_checkpoint(&self.db, &new)
            .await
            .context("failed to persist checkpoint")
    }

    /// Build the enriched resume prompt and delegate a new task linked
    /// to the original by `retry_of`/`parent_task_id`.
    pub async fn handle_resume(
        self: &Arc<Self>,
        task_id: Uuid,
        additional_context: Option<&str>,
    ) -> Result<Task> {
        let original = tasks::get_task(&self.db, task_id)
            .await?
            .ok_or_else(|| SupervisorError::InvalidInput(format!("task {task_id} not found")))?;
        let checkpoint = checkpoints::latest_checkpoint(&self.db, task_id).await?;

        let prompt = build_resume_prompt(&original, checkpoint.as_ref(), additional_context);
        let mut retry_source = original.clone();
        retry_source.prompt = prompt;

        let new_id = Uuid::new_v4();
        let task = tasks::insert_retry(&self.db, &retry_source, new_id).await?;
        self.events.publish(BusEvent::TaskQueued { task_id: task.id });
        self.enqueue_ready(task.id).await?;
        self.run_queue().await?;
        Ok(task)
    }

    /// Cancel a task: drop it from the queue if it hasn't started, ask
    /// the pool to kill it if running, reject if already terminal.
    pub async fn handle_cancellation(&self, task_id: Uuid) -> Result<(), SupervisorError> {
        let task = tasks::get_task(&self.db, task_id)
            .await
            .map_err(SupervisorError::StoreFailed)?
            .ok_or_else(|| SupervisorError::InvalidInput(format!("task {task_id} not found")))?;

        match task.status {
            TaskStatus::Queued => {
                self.queue.lock().await.remove(task_id);
                tasks::transition_task_status(&self.db, task_id, TaskStatus::Queued, TaskStatus::Cancelled)
                    .await
                    .map_err(SupervisorError::StoreFailed)?;
                self.events.publish(BusEvent::TaskCancelled { task_id });
                Ok(())
            }
            TaskStatus::Running => {
                if !self.pool.kill(task_id).await {
                    return Err(SupervisorError::Internal(format!(
                        "task {task_id} marked running but has no active worker"
                    )));
                }
                Ok(())
            }
            _ => Err(SupervisorError::InvalidInput(format!(
                "task {task_id} is already in a terminal state ({})",
                task.status
            ))),
        }
    }
}

/// Build the enriched prompt for a `resume` command: the previous
/// attempt's checkpoint fields laid out as `label: value` clauses in a
/// fixed order, so a resumed agent gets the same context regardless of
/// which fields happened to be present.
pub fn build_resume_prompt(
    original: &Task,
    checkpoint: Option<&Checkpoint>,
    additional_context: Option<&str>,
) -> String {
    let status = original.status.to_string();
    let output_summary = checkpoint.and_then(|c| c.output_summary.clone()).unwrap_or_default();
    let error_summary = checkpoint.and_then(|c| c.error_summary.clone()).unwrap_or_default();
    let branch = checkpoint.and_then(|c| c.git_branch.clone()).unwrap_or_default();
    let commit = checkpoint.and_then(|c| c.commit_sha.clone()).unwrap_or_default();
    let dirty_files = checkpoint
        .and_then(|c| c.dirty_files_vec())
        .map(|files| files.join(", "))
        .unwrap_or_default();

    format!(
        "PREVIOUS TASK CONTEXT: task {task_id}, status: {status}, \
         Original prompt: {prompt}, Last output: {output}, Error: {error}, \
         Git state: branch={branch}, commit={commit}, Modified files: {dirty}, \
         Additional context: {extra}",
        task_id = original.id,
        prompt = original.prompt,
        output = output_summary,
        error = error_summary,
        dirty = dirty_files,
        extra = additional_context.unwrap_or(""),
    )
}

#[derive(Default)]
struct GitSnapshot {
    branch: Option<String>,
    commit_sha: Option<String>,
    dirty_files: Option<Vec<String>>,
}

/// Snapshot the branch, HEAD commit, and dirty-file list of a (possibly
/// worktree-scoped) working directory for a terminal-state checkpoint.
/// Best-effort: a non-git directory or a `git` invocation failure just
/// yields an empty snapshot rather than failing the checkpoint.
fn git_snapshot(dir: &Path) -> GitSnapshot {
    let run = |args: &[&str]| -> Option<String> {
        let output = Command::new("git").args(args).current_dir(dir).output().ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    };

    let branch = run(&["rev-parse", "--abbrev-ref", "HEAD"]).filter(|s| s != "HEAD");
    let commit_sha = run(&["rev-parse", "HEAD"]);
    let dirty_files = run(&["status", "--porcelain"]).map(|s| {
        s.lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.trim_start_matches(|c: char| c == 'M' || c == 'A' || c == 'D' || c == '?' || c == ' ').to_string())
            .collect()
    });

    GitSnapshot { branch, commit_sha, dirty_files }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatchd_db::models::{Priority, TaskStatus, WorktreeCleanupPolicy};
    use chrono::Utc;

    fn task(status: TaskStatus) -> Task {
        Task {
            id: Uuid::new_v4(),
            prompt: "summarize the repo".to_string(),
            priority: Priority::P1,
            status,
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
            max_output_buffer: 0,
            parent_task_id: None,
            retry_of: None,
            retry_count: 0,
            continue_from: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            exit_code: None,
            error_kind: None,
            error_message: None,
        }
    }

    #[test]
    fn resume_prompt_carries_previous_context() {
        let original = task(TaskStatus::Failed);
        let prompt = build_resume_prompt(&original, None, Some("focus on the auth module"));
        assert!(prompt.contains("summarize the repo"));
        assert!(prompt.contains("focus on the auth module"));
        assert!(prompt.contains(&original.id.to_string()));
    }

    #[test]
    fn resume_prompt_includes_checkpoint_fields() {
        let original = task(TaskStatus::Failed);
        let checkpoint = Checkpoint {
            id: 1,
            task_id: original.id,
            kind: CheckpointKind::Failed,
            output_summary: Some("partial output".to_string()),
            error_summary: Some("connection refused".to_string()),
            git_branch: Some("dispatchd/task".to_string()),
            commit_sha: Some("abc123".to_string()),
            dirty_files: Some(serde_json::json!(["src/lib.rs"])),
            note: None,
            created_at: Utc::now(),
        };
        let prompt = build_resume_prompt(&original, Some(&checkpoint), None);
        assert!(prompt.contains("partial output"));
        assert!(prompt.contains("connection refused"));
        assert!(prompt.contains("dispatchd/task"));
        assert!(prompt.contains("src/lib.rs"));
    }

    #[test]
    fn git_snapshot_on_non_repo_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = git_snapshot(tmp.path());
        assert!(snapshot.branch.is_none());
        assert!(snapshot.commit_sha.is_none());
    }
}
