//! `dispatchd delegate` command: validate a new task's parameters and
//! persist it to the store in `queued` status.
//!
//! This writes directly to the database rather than going through
//! [`dispatchd_core::handlers::Handlers`] -- a running `serve` process
//! observes the new row on its next store-reconciliation tick.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use dispatchd_core::validation;
use dispatchd_db::models::{MergeStrategy, Priority, WorktreeCleanupPolicy};
use dispatchd_db::queries::{dependencies, tasks as task_db};

pub struct DelegateArgs {
    pub prompt: String,
    pub priority: Priority,
    pub working_directory: Option<String>,
    pub use_worktree: bool,
    pub worktree_cleanup: WorktreeCleanupPolicy,
    pub merge_strategy: Option<MergeStrategy>,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub no_auto_commit: bool,
    pub no_push: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub timeout_ms: Option<i64>,
    pub max_output_buffer: i64,
    pub depends_on: Vec<String>,
    pub continue_from: Option<String>,
}

pub async fn run_delegate(pool: &SqlitePool, args: DelegateArgs) -> Result<()> {
    if let Some(dir) = &args.working_directory {
        validation::validate_working_directory(dir)?;
    }
    validation::validate_buffer_size(args.max_output_buffer)?;
    if let Some(ms) = args.timeout_ms {
        validation::validate_timeout_ms(ms)?;
    }

    let branch_name = args.branch_name.map(|raw| validation::sanitize_branch_name(&raw));

    let mut depends_on: Vec<Uuid> = args
        .depends_on
        .iter()
        .map(|s| Uuid::parse_str(s).with_context(|| format!("invalid dependency task ID: {s}")))
        .collect::<Result<_>>()?;

    let continue_from = args
        .continue_from
        .as_deref()
        .map(|s| Uuid::parse_str(s).with_context(|| format!("invalid continue-from task ID: {s}")))
        .transpose()?;

    if let Some(parent) = continue_from {
        if !depends_on.contains(&parent) {
            depends_on.push(parent);
        }
    }

    for dep in &depends_on {
        task_db::get_task(pool, *dep)
            .await?
            .with_context(|| format!("dependency task {dep} not found"))?;
    }

    let new = task_db::NewTask {
        id: Uuid::new_v4(),
        prompt: args.prompt,
        priority: args.priority,
        working_directory: args.working_directory,
        use_worktree: args.use_worktree,
        worktree_cleanup: args.worktree_cleanup,
        merge_strategy: args.merge_strategy,
        branch_name,
        base_branch: args.base_branch,
        auto_commit: !args.no_auto_commit,
        push_to_remote: !args.no_push,
        pr_title: args.pr_title,
        pr_body: args.pr_body,
        timeout_ms: args.timeout_ms,
        max_output_buffer: args.max_output_buffer,
        parent_task_id: None,
        continue_from,
    };

    let task = task_db::insert_task(pool, &new).await?;

    for dep in &depends_on {
        dependencies::insert_dependency(pool, task.id, *dep).await?;
    }

    println!("Delegated {} ({})", task.display_id(), task.priority);
    if !depends_on.is_empty() {
        println!("Depends on: {}", depends_on.iter().map(Uuid::to_string).collect::<Vec<_>>().join(", "));
    }

    Ok(())
}
