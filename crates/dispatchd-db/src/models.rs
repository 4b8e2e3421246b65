//! Row types and enums persisted by the durable store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    P0,
    P1,
    P2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityParseError(String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}
impl std::error::Error for PriorityParseError {}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::P0 => "p0",
            Priority::P1 => "p1",
            Priority::P2 => "p2",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p0" => Ok(Priority::P0),
            "p1" => Ok(Priority::P1),
            "p2" => Ok(Priority::P2),
            other => Err(PriorityParseError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatusParseError(String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}
impl std::error::Error for TaskStatusParseError {}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(TaskStatusParseError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Worktree cleanup policy / merge strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorktreeCleanupPolicy {
    Auto,
    Keep,
    Delete,
}

impl fmt::Display for WorktreeCleanupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorktreeCleanupPolicy::Auto => "auto",
            WorktreeCleanupPolicy::Keep => "keep",
            WorktreeCleanupPolicy::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeCleanupPolicyParseError(String);
impl fmt::Display for WorktreeCleanupPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worktree cleanup policy: {:?}", self.0)
    }
}
impl std::error::Error for WorktreeCleanupPolicyParseError {}

impl FromStr for WorktreeCleanupPolicy {
    type Err = WorktreeCleanupPolicyParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(WorktreeCleanupPolicy::Auto),
            "keep" => Ok(WorktreeCleanupPolicy::Keep),
            "delete" => Ok(WorktreeCleanupPolicy::Delete),
            other => Err(WorktreeCleanupPolicyParseError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Pr,
    Auto,
    Manual,
    Patch,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeStrategy::Pr => "pr",
            MergeStrategy::Auto => "auto",
            MergeStrategy::Manual => "manual",
            MergeStrategy::Patch => "patch",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStrategyParseError(String);
impl fmt::Display for MergeStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid merge strategy: {:?}", self.0)
    }
}
impl std::error::Error for MergeStrategyParseError {}

impl FromStr for MergeStrategy {
    type Err = MergeStrategyParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pr" => Ok(MergeStrategy::Pr),
            "auto" => Ok(MergeStrategy::Auto),
            "manual" => Ok(MergeStrategy::Manual),
            "patch" => Ok(MergeStrategy::Patch),
            other => Err(MergeStrategyParseError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Dependency resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DependencyResolution {
    Pending,
    Satisfied,
    Failed,
    Cancelled,
}

impl fmt::Display for DependencyResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependencyResolution::Pending => "pending",
            DependencyResolution::Satisfied => "satisfied",
            DependencyResolution::Failed => "failed",
            DependencyResolution::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Checkpoint kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckpointKind::Completed => "completed",
            CheckpointKind::Failed => "failed",
            CheckpointKind::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Schedule kind / status / missed-run policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    OneTime,
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleKind::Cron => "cron",
            ScheduleKind::OneTime => "one_time",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleKindParseError(String);
impl fmt::Display for ScheduleKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid schedule kind: {:?}", self.0)
    }
}
impl std::error::Error for ScheduleKindParseError {}

impl FromStr for ScheduleKind {
    type Err = ScheduleKindParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(ScheduleKind::Cron),
            "one_time" => Ok(ScheduleKind::OneTime),
            other => Err(ScheduleKindParseError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
    Expired,
    Failed,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Cancelled => "cancelled",
            ScheduleStatus::Expired => "expired",
            ScheduleStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MissedRunPolicy {
    Skip,
    Catchup,
    Fail,
}

impl fmt::Display for MissedRunPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissedRunPolicy::Skip => "skip",
            MissedRunPolicy::Catchup => "catchup",
            MissedRunPolicy::Fail => "fail",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissedRunPolicyParseError(String);
impl fmt::Display for MissedRunPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid missed-run policy: {:?}", self.0)
    }
}
impl std::error::Error for MissedRunPolicyParseError {}

impl FromStr for MissedRunPolicy {
    type Err = MissedRunPolicyParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(MissedRunPolicy::Skip),
            "catchup" => Ok(MissedRunPolicy::Catchup),
            "fail" => Ok(MissedRunPolicy::Fail),
            other => Err(MissedRunPolicyParseError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A delegated unit of work, as persisted in the `tasks` table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub prompt: String,
    pub priority: Priority,
    pub status: TaskStatus,
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
    pub retry_of: Option<Uuid>,
    pub retry_count: i32,
    pub continue_from: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub worker_id: Option<String>,
    pub exit_code: Option<i32>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl Task {
    pub fn display_id(&self) -> String {
        format!("task-{}", self.id)
    }
}

/// A directed dependency edge: `task_id` depends on `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub task_id: Uuid,
    pub depends_on: Uuid,
    pub resolution: DependencyResolution,
    pub created_at: DateTime<Utc>,
}

/// A persisted snapshot of a task's terminal state.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: i64,
    pub task_id: Uuid,
    pub kind: CheckpointKind,
    pub output_summary: Option<String>,
    pub error_summary: Option<String>,
    pub git_branch: Option<String>,
    pub commit_sha: Option<String>,
    /// Stored as a JSON array of strings.
    pub dirty_files: Option<serde_json::Value>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn dirty_files_vec(&self) -> Option<Vec<String>> {
        self.dirty_files
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// A recurring (cron) or one-shot schedule that materializes tasks.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub kind: ScheduleKind,
    pub cron_expr: Option<String>,
    pub run_at_ms: Option<i64>,
    pub timezone: String,
    pub missed_run_policy: MissedRunPolicy,
    pub status: ScheduleStatus,

    pub run_count: i32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub max_runs: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub after_schedule_id: Option<Uuid>,

    /// JSON-encoded `DelegateRequest` template used to materialize tasks.
    pub task_template: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row recording a single firing of a [`Schedule`].
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub id: i64,
    pub schedule_id: Uuid,
    pub task_id: Option<Uuid>,
    pub fired_at: DateTime<Utc>,
    pub was_missed_run: bool,
}
