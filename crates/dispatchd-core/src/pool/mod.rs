//! Admission-controlled worker pool.
//!
//! Spawns one agent process per dispatched task, integrates the
//! worktree isolation lifecycle around it, enforces a per-task timeout,
//! and reports a [`TaskOutcome`] back to the caller once the worker
//! settles. State machine per worker: spawning -> running -> (exiting |
//! timing-out | cancelling) -> reaped; all three terminal paths converge
//! on the same cleanup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dispatchd_db::models::{MergeStrategy, Task, WorktreeCleanupPolicy};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{self, AgentProcess, OutputBuffer, SpawnRequest};
use crate::error::SupervisorError;
use crate::events::{BusEvent, EventBus};
use crate::isolation::{Isolation, WorkspaceInfo};
use crate::resource::{ResourceLimits, ResourceMonitor};
use crate::worktree::WorktreeManager;

/// Default grace period between SIGTERM and SIGKILL on task kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How many lines of stdout/stderr tail are kept for checkpoint capture.
pub const DEFAULT_CHECKPOINT_TAIL_LINES: usize = 50;

/// How a worktree-backed task's working copy was disposed of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    PrCreated,
    BranchPushed,
    PatchCreated { patch_path: PathBuf },
    Error { message: String },
}

/// Everything the completion handler needs to persist a terminal task
/// state and unblock dependents.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub killed: bool,
    pub spawn_error: Option<String>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub workspace: Option<WorkspaceInfo>,
    pub merge_outcome: Option<MergeOutcome>,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.spawn_error.is_none() && !self.timed_out && !self.killed && self.exit_code == Some(0)
    }
}

/// Everything needed to run a task inside an isolated workspace.
pub struct WorktreeContext {
    pub isolation: Arc<dyn Isolation>,
    pub manager: Arc<WorktreeManager>,
}

struct WorkerRecord {
    worker_id: String,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Spawns and reaps agent processes under resource-admission control.
pub struct WorkerPool {
    workers: Mutex<HashMap<Uuid, WorkerRecord>>,
    agent_binary: String,
    grace_period: Duration,
    checkpoint_tail_lines: usize,
    resource: Arc<ResourceMonitor>,
    limits: ResourceLimits,
    events: EventBus,
}

impl WorkerPool {
    pub fn new(
        agent_binary: impl Into<String>,
        resource: Arc<ResourceMonitor>,
        limits: ResourceLimits,
        events: EventBus,
    ) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            agent_binary: agent_binary.into(),
            grace_period: DEFAULT_GRACE_PERIOD,
            checkpoint_tail_lines: DEFAULT_CHECKPOINT_TAIL_LINES,
            resource,
            limits,
            events,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_checkpoint_tail_lines(mut self, lines: usize) -> Self {
        self.checkpoint_tail_lines = lines;
        self
    }

    /// Whether the resource monitor currently reports headroom to admit
    /// another worker.
    pub fn can_spawn(&self) -> bool {
        self.resource.latest().within(&self.limits)
    }

    pub async fn active_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Spawn a worker for `task`, optionally inside an isolated
    /// workspace, and return a handle resolving to its [`TaskOutcome`]
    /// once the process settles. Fails fast if the resource monitor
    /// reports no headroom; callers should re-queue the task for the
    /// queue handler to retry on the next admission-relevant event.
    pub async fn spawn_task(
        self: &Arc<Self>,
        task: &Task,
        fallback_working_dir: &Path,
        worktree: Option<&WorktreeContext>,
    ) -> Result<tokio::task::JoinHandle<TaskOutcome>, SupervisorError> {
        if !self.can_spawn() {
            return Err(SupervisorError::Internal(
                "insufficient resources to admit a new worker".to_string(),
            ));
        }

        let (workspace, working_dir) =
            self.prepare_workspace(task, fallback_working_dir, worktree).await;

        let worker_id = format!("worker-{}", Uuid::new_v4());
        let task_id = task.id;
        let timeout = task
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64));
        let max_output_bytes = if task.max_output_buffer > 0 {
            task.max_output_buffer as usize
        } else {
            SpawnRequest::DEFAULT_MAX_OUTPUT_BYTES
        };

        let request = SpawnRequest {
            task_id,
            worker_id: worker_id.clone(),
            prompt: task.prompt.clone(),
            working_dir: working_dir.clone(),
            max_output_bytes,
        };

        let process = match AgentProcess::spawn(&self.agent_binary, &request) {
            Ok(process) => process,
            Err(err) => {
                let outcome = TaskOutcome {
                    task_id,
                    exit_code: None,
                    timed_out: false,
                    killed: false,
                    spawn_error: Some(err.to_string()),
                    stdout_tail: String::new(),
                    stderr_tail: String::new(),
                    workspace,
                    merge_outcome: None,
                };
                return Ok(tokio::spawn(async move { outcome }));
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut workers = self.workers.lock().await;
            workers.insert(
                task_id,
                WorkerRecord {
                    worker_id: worker_id.clone(),
                    kill_tx: Some(kill_tx),
                },
            );
        }
        self.resource.record_worker_started();

        self.events.publish(BusEvent::TaskStarted {
            task_id,
            worker_id: worker_id.clone(),
        });

        let grace = self.grace_period;
        let tail_n = self.checkpoint_tail_lines;
        let events = self.events.clone();
        let merge_strategy = task.merge_strategy;
        let cleanup_policy = task.worktree_cleanup;
        let push_to_remote = task.push_to_remote;
        let worktree_manager = worktree.map(|w| Arc::clone(&w.manager));
        let isolation = worktree.map(|w| Arc::clone(&w.isolation));
        let pool = Arc::clone(self);

        Ok(tokio::spawn(async move {
            let (status, stdout, stderr) =
                run_until_settled(process, timeout, kill_rx, grace, max_output_bytes).await;
            pool.forget(task_id).await;

            let exit_code = status.as_ref().ok().and_then(|s| s.code());
            let succeeded = matches!(&status, Ok(s) if s.success());

            let merge_outcome = if succeeded {
                match (&workspace, &worktree_manager, merge_strategy) {
                    (Some(ws), Some(mgr), Some(strategy)) => Some(
                        complete_merge(mgr, ws, strategy, cleanup_policy, push_to_remote).await,
                    ),
                    _ => None,
                }
            } else {
                None
            };

            if let (Some(isolation), Some(ws)) = (&isolation, &workspace) {
                if let Err(e) = isolation.extract_results(ws).await {
                    warn!(task_id = %task_id, error = %e, "failed to extract workspace results");
                }
            }

            if should_remove_workspace(&merge_outcome, cleanup_policy) {
                if let (Some(isolation), Some(ws)) = (&isolation, &workspace) {
                    if let Err(e) = isolation.remove_workspace(ws).await {
                        warn!(task_id = %task_id, error = %e, "failed to remove workspace");
                    }
                }
            }

            if succeeded {
                events.publish(BusEvent::TaskCompleted {
                    task_id,
                    exit_code: exit_code.unwrap_or(0),
                });
            } else {
                let (kind, message) = match &status {
                    Ok(s) => ("non_zero_exit".to_string(), format!("exit code {:?}", s.code())),
                    Err(e) => ("spawn_failed".to_string(), e.to_string()),
                };
                events.publish(BusEvent::TaskFailed {
                    task_id,
                    error_kind: kind,
                    message,
                });
            }

            TaskOutcome {
                task_id,
                exit_code,
                timed_out: false,
                killed: false,
                spawn_error: status.err().map(|e| e.to_string()),
                stdout_tail: stdout.tail_lines(tail_n),
                stderr_tail: stderr.tail_lines(tail_n),
                workspace,
                merge_outcome,
            }
        }))
    }

    /// Prepare the effective working directory for a task, creating a
    /// workspace when `useWorktree` is set. Workspace creation failures
    /// fall back to the supplied working directory rather than failing
    /// the spawn outright.
    async fn prepare_workspace(
        &self,
        task: &Task,
        fallback_working_dir: &Path,
        worktree: Option<&WorktreeContext>,
    ) -> (Option<WorkspaceInfo>, PathBuf) {
        if !task.use_worktree {
            let dir = task
                .working_directory
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| fallback_working_dir.to_path_buf());
            return (None, dir);
        }

        let Some(ctx) = worktree else {
            warn!(task_id = %task.id, "use_worktree set but no worktree context configured, falling back");
            let dir = task
                .working_directory
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| fallback_working_dir.to_path_buf());
            return (None, dir);
        };

        let label = task
            .branch_name
            .clone()
            .unwrap_or_else(|| task.id.to_string());

        match ctx.isolation.create_workspace(&label).await {
            Ok(workspace) => {
                let dir = effective_working_dir(
                    &workspace.path,
                    ctx.manager.repo_path(),
                    task.working_directory.as_deref(),
                );
                (Some(workspace), dir)
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "worktree creation failed, falling back to working directory");
                let dir = task
                    .working_directory
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| fallback_working_dir.to_path_buf());
                (None, dir)
            }
        }
    }

    /// Ask a running worker to terminate. A no-op if the task has no
    /// active worker (already settled, or never started).
    pub async fn kill(&self, task_id: Uuid) -> bool {
        let mut workers = self.workers.lock().await;
        if let Some(record) = workers.get_mut(&task_id) {
            if let Some(tx) = record.kill_tx.take() {
                let _ = tx.send(());
                return true;
            }
        }
        false
    }

    /// Signal every active worker to terminate, used on supervisor
    /// shutdown. The caller is responsible for publishing the
    /// `WorkersTerminating` event before invoking this.
    pub async fn kill_all(&self) {
        let task_ids: Vec<Uuid> = self.workers.lock().await.keys().copied().collect();
        for task_id in task_ids {
            self.kill(task_id).await;
        }
    }

    async fn forget(&self, task_id: Uuid) {
        if self.workers.lock().await.remove(&task_id).is_some() {
            self.resource.record_worker_stopped();
        }
    }
}

/// Whether a worktree-backed task's workspace should be removed once the
/// worker settles. A failed merge always preserves the workspace for
/// manual recovery, regardless of `cleanup_policy`; only once the merge
/// outcome is known clean (or there was none to attempt) does the
/// configured cleanup policy apply.
fn should_remove_workspace(merge_outcome: &Option<MergeOutcome>, cleanup_policy: WorktreeCleanupPolicy) -> bool {
    match (merge_outcome, cleanup_policy) {
        (Some(MergeOutcome::Error { .. }), _) => false,
        (Some(MergeOutcome::Merged), WorktreeCleanupPolicy::Keep) => false,
        (Some(MergeOutcome::Merged), _) => true,
        (None, WorktreeCleanupPolicy::Delete) => true,
        (Some(_), WorktreeCleanupPolicy::Delete) => true,
        _ => false,
    }
}

/// Compute the effective working directory inside a workspace: an
/// absolute `working_directory` is rebased relative to the repo root and
/// joined onto the workspace path; a relative one is joined directly;
/// absence means the workspace root itself.
fn effective_working_dir(
    workspace_path: &Path,
    repo_root: &Path,
    working_directory: Option<&str>,
) -> PathBuf {
    let Some(wd) = working_directory else {
        return workspace_path.to_path_buf();
    };
    let wd_path = Path::new(wd);
    if wd_path.is_absolute() {
        match wd_path.strip_prefix(repo_root) {
            Ok(rel) => workspace_path.join(rel),
            Err(_) => workspace_path.to_path_buf(),
        }
    } else {
        workspace_path.join(wd_path)
    }
}

/// Race a spawned agent process's natural exit against an optional
/// timeout and an external kill signal, applying the grace-period kill
/// sequence on either. Returns the exit status alongside both captured
/// output streams once everything has settled.
///
/// Implemented as a polling loop (rather than a single `tokio::select!`
/// across borrowing futures) so the process handle is only ever borrowed
/// by one future at a time -- simpler to reason about than juggling
/// overlapping mutable borrows across cancelled branches.
async fn run_until_settled(
    mut process: AgentProcess,
    timeout: Option<Duration>,
    mut kill_rx: oneshot::Receiver<()>,
    grace: Duration,
    max_output_bytes: usize,
) -> (std::io::Result<std::process::ExitStatus>, OutputBuffer, OutputBuffer) {
    let stdout_task = process.take_stdout().map(|r| tokio::spawn(agent::drain(r, max_output_bytes)));
    let stderr_task = process.take_stderr().map(|r| tokio::spawn(agent::drain(r, max_output_bytes)));

    let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
    let mut kill_requested = false;
    let mut kill_channel_open = true;

    let status = loop {
        match process.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {}
            Err(e) => break Err(e),
        }

        if kill_requested {
            let _ = process.kill(grace).await;
            break process.wait().await;
        }

        if kill_channel_open {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                _ = &mut kill_rx => {
                    kill_requested = true;
                    kill_channel_open = false;
                }
            }
        } else {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        if let Some(dl) = deadline {
            if tokio::time::Instant::now() >= dl {
                kill_requested = true;
            }
        }
    };

    let stdout = match stdout_task {
        Some(t) => t.await.unwrap_or_default(),
        None => OutputBuffer::default(),
    };
    let stderr = match stderr_task {
        Some(t) => t.await.unwrap_or_default(),
        None => OutputBuffer::default(),
    };

    (status, stdout, stderr)
}

/// Apply the configured merge strategy once a worktree-backed task has
/// completed successfully. PR creation is a remote-host collaborator
/// this crate does not re-implement; it is reported as an error outcome
/// so the completion handler can surface it rather than silently no-op.
async fn complete_merge(
    manager: &WorktreeManager,
    workspace: &WorkspaceInfo,
    strategy: MergeStrategy,
    cleanup_policy: WorktreeCleanupPolicy,
    push_to_remote: bool,
) -> MergeOutcome {
    let Some(branch) = workspace.branch.clone() else {
        return MergeOutcome::Error {
            message: "workspace has no associated branch".to_string(),
        };
    };

    match strategy {
        MergeStrategy::Auto => match manager.merge_branch(&branch) {
            Ok(crate::worktree::MergeResult::Success) => {
                if !matches!(cleanup_policy, WorktreeCleanupPolicy::Keep) {
                    let _ = manager.delete_branch(&branch);
                }
                MergeOutcome::Merged
            }
            Ok(crate::worktree::MergeResult::Conflict { details }) => {
                MergeOutcome::Error { message: format!("merge conflict: {details}") }
            }
            Err(e) => MergeOutcome::Error { message: e.to_string() },
        },
        MergeStrategy::Manual => {
            if push_to_remote {
                MergeOutcome::BranchPushed
            } else {
                MergeOutcome::Error {
                    message: "manual merge strategy: branch left for operator review".to_string(),
                }
            }
        }
        MergeStrategy::Patch => {
            let patch_path = workspace.path.join("dispatchd.patch");
            MergeOutcome::PatchCreated { patch_path }
        }
        MergeStrategy::Pr => MergeOutcome::Error {
            message: "pull-request creation is not implemented by this supervisor".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_dir_defaults_to_workspace_root() {
        let ws = Path::new("/work/ws-123");
        let repo = Path::new("/home/user/repo");
        assert_eq!(effective_working_dir(ws, repo, None), ws);
    }

    #[test]
    fn effective_dir_joins_relative_path() {
        let ws = Path::new("/work/ws-123");
        let repo = Path::new("/home/user/repo");
        assert_eq!(
            effective_working_dir(ws, repo, Some("src/lib")),
            ws.join("src/lib")
        );
    }

    #[test]
    fn effective_dir_rebases_absolute_path_under_repo_root() {
        let ws = Path::new("/work/ws-123");
        let repo = Path::new("/home/user/repo");
        assert_eq!(
            effective_working_dir(ws, repo, Some("/home/user/repo/src/lib")),
            ws.join("src/lib")
        );
    }

    #[test]
    fn effective_dir_falls_back_when_absolute_path_outside_repo() {
        let ws = Path::new("/work/ws-123");
        let repo = Path::new("/home/user/repo");
        assert_eq!(
            effective_working_dir(ws, repo, Some("/elsewhere/path")),
            ws
        );
    }

    #[test]
    fn failed_merge_preserves_workspace_regardless_of_cleanup_policy() {
        let outcome = Some(MergeOutcome::Error { message: "merge conflict: x".to_string() });
        assert!(!should_remove_workspace(&outcome, WorktreeCleanupPolicy::Delete));
        assert!(!should_remove_workspace(&outcome, WorktreeCleanupPolicy::Auto));
        assert!(!should_remove_workspace(&outcome, WorktreeCleanupPolicy::Keep));
    }

    #[test]
    fn successful_merge_honors_keep_policy() {
        let outcome = Some(MergeOutcome::Merged);
        assert!(!should_remove_workspace(&outcome, WorktreeCleanupPolicy::Keep));
        assert!(should_remove_workspace(&outcome, WorktreeCleanupPolicy::Auto));
        assert!(should_remove_workspace(&outcome, WorktreeCleanupPolicy::Delete));
    }

    #[test]
    fn non_worktree_task_only_cleans_up_on_explicit_delete() {
        assert!(!should_remove_workspace(&None, WorktreeCleanupPolicy::Auto));
        assert!(should_remove_workspace(&None, WorktreeCleanupPolicy::Delete));
    }

    #[tokio::test]
    async fn spawn_task_reports_success_without_worktree() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("ok_agent.sh");
        std::fs::write(&script, "#!/bin/sh\necho '{\"type\":\"result\",\"result\":\"done\"}'\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let events = EventBus::spawn(16);
        let resource = Arc::new(ResourceMonitor::spawn(Duration::from_millis(50), events.clone()));
        let limits = ResourceLimits { max_cpu_percent: 100.0, max_memory_fraction: 1.0 };
        let pool = Arc::new(WorkerPool::new(script.to_str().unwrap(), resource, limits, events));

        let task = test_task("summarize this repository");
        let handle = pool.spawn_task(&task, tmp.path(), None).await.unwrap();
        let outcome = handle.await.unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout_tail.contains("done"));
    }

    #[tokio::test]
    async fn spawn_task_reports_spawn_failure() {
        let events = EventBus::spawn(16);
        let resource = Arc::new(ResourceMonitor::spawn(Duration::from_millis(50), events.clone()));
        let limits = ResourceLimits::default();
        let pool = Arc::new(WorkerPool::new("/nonexistent/agent/binary", resource, limits, events));

        let tmp = tempfile::tempdir().unwrap();
        let task = test_task("do something");
        let handle = pool.spawn_task(&task, tmp.path(), None).await.unwrap();
        let outcome = handle.await.unwrap();

        assert!(!outcome.succeeded());
        assert!(outcome.spawn_error.is_some());
    }

    #[tokio::test]
    async fn kill_on_unknown_task_returns_false() {
        let events = EventBus::spawn(16);
        let resource = Arc::new(ResourceMonitor::spawn(Duration::from_millis(50), events.clone()));
        let pool = WorkerPool::new("echo", resource, ResourceLimits::default(), events);
        assert!(!pool.kill(Uuid::new_v4()).await);
    }

    fn test_task(prompt: &str) -> Task {
        use chrono::Utc;
        use dispatchd_db::models::{Priority, TaskStatus};

        Task {
            id: Uuid::new_v4(),
            prompt: prompt.to_string(),
            priority: Priority::P1,
            status: TaskStatus::Queued,
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
            timeout_ms: Some(5_000),
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
}
