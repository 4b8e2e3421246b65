//! Top-level wiring: assembles every subsystem, runs crash recovery on
//! start, and tears everything down in a fixed order on stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dispatchd_db::models::{Priority, ScheduleStatus, WorktreeCleanupPolicy};
use dispatchd_db::queries::{dependencies, schedules, tasks};
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{BusEvent, EventBus};
use crate::graph::DependencyGraph;
use crate::handlers::Handlers;
use crate::isolation::{create_isolation, Isolation};
use crate::pool::{WorkerPool, WorktreeContext, DEFAULT_CHECKPOINT_TAIL_LINES, DEFAULT_GRACE_PERIOD};
use crate::queue::TaskQueue;
use crate::resource::{ResourceLimits, ResourceMonitor};
use crate::scheduler::{FireDecision, Scheduler, SchedulerConfig, ScheduleState};
use crate::worktree::WorktreeManager;

/// Deserialized shape of a schedule's `task_template` column: the subset
/// of delegation parameters a cron/one-shot trigger can carry.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskTemplate {
    pub prompt: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub use_worktree: bool,
    #[serde(default = "default_worktree_cleanup")]
    pub worktree_cleanup: WorktreeCleanupPolicy,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub auto_commit: bool,
    #[serde(default)]
    pub push_to_remote: bool,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    #[serde(default = "default_max_output_buffer")]
    pub max_output_buffer: i64,
}

fn default_priority() -> Priority {
    Priority::P1
}

fn default_max_output_buffer() -> i64 {
    crate::agent::DEFAULT_MAX_OUTPUT_BYTES as i64
}

fn default_worktree_cleanup() -> WorktreeCleanupPolicy {
    WorktreeCleanupPolicy::Auto
}

pub struct SupervisorConfig {
    pub agent_binary: String,
    pub repo_root: PathBuf,
    pub isolation_mode: Option<String>,
    pub resource_limits: ResourceLimits,
    pub resource_poll_interval: Duration,
    pub scheduler: SchedulerConfig,
    pub event_history_cap: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_binary: "claude".to_string(),
            repo_root: PathBuf::from("."),
            isolation_mode: None,
            resource_limits: ResourceLimits::default(),
            resource_poll_interval: Duration::from_secs(1),
            scheduler: SchedulerConfig::default(),
            event_history_cap: 1000,
        }
    }
}

/// Owns every long-lived subsystem and drives startup recovery and
/// ordered shutdown.
pub struct Supervisor {
    pub handlers: Arc<Handlers>,
    pub events: EventBus,
    resource: Arc<ResourceMonitor>,
    scheduler: Scheduler,
    db: SqlitePool,
    store_poll: tokio::task::JoinHandle<()>,
}

impl Supervisor {
    /// Wire up every subsystem, rehydrate in-memory state from the
    /// store, and start the background loops. Does not dispatch
    /// anything yet -- call [`Supervisor::run_queue`] or delegate a
    /// task to kick off dispatch.
    pub async fn start(db: SqlitePool, config: SupervisorConfig) -> Result<Self> {
        let events = EventBus::spawn(config.event_history_cap);
        let resource = Arc::new(ResourceMonitor::spawn(config.resource_poll_interval, events.clone()));

        let worktree = match config.isolation_mode.as_deref() {
            Some(mode) => {
                let isolation: Arc<dyn Isolation> = create_isolation(mode, &config.repo_root)
                    .context("failed to construct isolation backend")?;
                let manager = Arc::new(
                    WorktreeManager::new(&config.repo_root, None)
                        .map_err(|e| anyhow::anyhow!("{e}"))
                        .context("failed to construct worktree manager")?,
                );
                Some(WorktreeContext { isolation, manager })
            }
            None => None,
        };

        let pool = Arc::new(
            WorkerPool::new(
                config.agent_binary.clone(),
                Arc::clone(&resource),
                config.resource_limits,
                events.clone(),
            )
            .with_grace_period(DEFAULT_GRACE_PERIOD)
            .with_checkpoint_tail_lines(DEFAULT_CHECKPOINT_TAIL_LINES),
        );

        let recovered = tasks::reset_orphaned_tasks(&db)
            .await
            .context("failed to recover orphaned tasks on startup")?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "marked in-flight tasks failed after restart");
        }

        let graph = Mutex::new(rehydrate_graph(&db).await?);
        let queue = Mutex::new(rehydrate_queue(&db).await?);

        let handlers = Arc::new(Handlers {
            db: db.clone(),
            graph,
            queue,
            pool,
            events: events.clone(),
            repo_root: config.repo_root.clone(),
            worktree,
        });

        let db_for_fire = db.clone();
        let handlers_for_fire = Arc::clone(&handlers);
        let on_fire: Arc<dyn Fn(FireDecision) + Send + Sync> = Arc::new(move |decision| {
            let db = db_for_fire.clone();
            let handlers = Arc::clone(&handlers_for_fire);
            tokio::spawn(async move {
                if let Err(e) = apply_fire_decision(&db, &handlers, decision).await {
                    warn!(error = %e, "failed to apply schedule fire decision");
                }
            });
        });

        let db_for_deps = db.clone();
        let dependency_ready: Arc<dyn Fn(Uuid) -> bool + Send + Sync> = Arc::new(move |schedule_id| {
            let db = db_for_deps.clone();
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(upstream_schedule_ready(&db, schedule_id))
            })
        });

        let schedule_states = rehydrate_schedules(&db).await?;
        let scheduler = Scheduler::spawn(config.scheduler, events.clone(), dependency_ready, on_fire);
        for state in schedule_states {
            scheduler.register(state).await;
        }

        handlers.run_queue().await.context("initial queue drain failed")?;

        let store_poll = {
            let handlers = Arc::clone(&handlers);
            let mut ticker = tokio::time::interval(config.resource_poll_interval);
            tokio::spawn(async move {
                loop {
                    ticker.tick().await;
                    if let Err(e) = handlers.reconcile_from_store().await {
                        warn!(error = %e, "store reconciliation failed");
                        continue;
                    }
                    if let Err(e) = handlers.run_queue().await {
                        warn!(error = %e, "queue drain after reconciliation failed");
                    }
                }
            })
        };

        Ok(Self { handlers, events, resource, scheduler, db, store_poll })
    }

    /// Run the 8-step shutdown sequence from the external-interface spec:
    /// stop the resource monitor and scheduler (so no new work gets
    /// admitted), terminate running workers, close the store, then
    /// dispose the event bus and clear the service registry.
    pub async fn shutdown(mut self) -> Result<()> {
        self.events.publish(BusEvent::ShutdownInitiated);

        self.store_poll.abort();
        drop(self.resource);
        info!("resource monitor stopped");

        self.scheduler.stop().await;
        info!("scheduler stopped");

        self.events.publish(BusEvent::WorkersTerminating);
        self.handlers.pool.kill_all().await;

        self.events.publish(BusEvent::DatabaseClosing);
        self.db.close().await;

        self.events.publish(BusEvent::ShutdownComplete);
        info!("shutdown complete");
        Ok(())
    }
}

/// Whether the schedule named by `after_schedule_id` has cleared its
/// latest run: that schedule must have fired at least once, and the task
/// it fired must have reached a terminal status. Any lookup failure
/// (unknown schedule, no executions yet) defers rather than firing the
/// dependent schedule early.
async fn upstream_schedule_ready(db: &SqlitePool, schedule_id: Uuid) -> bool {
    let executions = match schedules::list_executions(db, schedule_id).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(schedule_id = %schedule_id, error = %e, "failed to look up upstream schedule executions");
            return false;
        }
    };
    let Some(latest) = executions.last() else {
        return false;
    };
    let Some(task_id) = latest.task_id else {
        return false;
    };
    match tasks::get_task(db, task_id).await {
        Ok(Some(task)) => task.status.is_terminal(),
        Ok(None) => false,
        Err(e) => {
            warn!(schedule_id = %schedule_id, task_id = %task_id, error = %e, "failed to look up upstream schedule's task");
            false
        }
    }
}

async fn rehydrate_graph(db: &SqlitePool) -> Result<DependencyGraph> {
    let mut graph = DependencyGraph::new();
    let pending = tasks::list_queued_tasks(db).await?;
    for task in pending {
        for dep in dependencies::get_dependencies(db, task.id).await? {
            let _ = graph.add_edge(task.id, dep);
        }
    }
    Ok(graph)
}

async fn rehydrate_queue(db: &SqlitePool) -> Result<TaskQueue> {
    let mut queue = TaskQueue::new(TaskQueue::DEFAULT_CAPACITY);
    for task in tasks::list_queued_tasks(db).await? {
        if dependencies::all_dependencies_satisfied(db, task.id).await? {
            let _ = queue.push(task.id, task.priority);
        }
    }
    Ok(queue)
}

async fn rehydrate_schedules(db: &SqlitePool) -> Result<Vec<ScheduleState>> {
    let rows = schedules::list_schedules(db).await?;
    let mut states = Vec::with_capacity(rows.len());
    for row in rows {
        if row.status != ScheduleStatus::Active {
            continue;
        }
        let Ok(tz) = row.timezone.parse::<chrono_tz::Tz>() else {
            warn!(schedule_id = %row.id, timezone = %row.timezone, "unparseable schedule timezone, skipping");
            continue;
        };
        states.push(ScheduleState {
            id: row.id,
            kind: row.kind,
            cron_expr: row.cron_expr,
            run_at: row.run_at_ms.and_then(|ms| chrono::DateTime::from_timestamp_millis(ms)),
            timezone: tz,
            missed_run_policy: row.missed_run_policy,
            status: row.status,
            run_count: row.run_count as i64,
            max_runs: row.max_runs.map(|n| n as i64),
            expires_at: row.expires_at,
            after_schedule_id: row.after_schedule_id,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
        });
    }
    Ok(states)
}

async fn apply_fire_decision(db: &SqlitePool, handlers: &Arc<Handlers>, decision: FireDecision) -> Result<()> {
    match decision {
        FireDecision::Enqueue { schedule_id, slot } => {
            let Some(row) = schedules::get_schedule(db, schedule_id).await? else {
                return Ok(());
            };
            let template: TaskTemplate = serde_json::from_value(row.task_template.clone())
                .context("malformed task_template on schedule")?;
            let new = tasks::NewTask {
                id: Uuid::new_v4(),
                prompt: template.prompt,
                priority: template.priority,
                working_directory: template.working_directory,
                use_worktree: template.use_worktree,
                worktree_cleanup: template.worktree_cleanup,
                merge_strategy: None,
                branch_name: template.branch_name,
                base_branch: template.base_branch,
                auto_commit: template.auto_commit,
                push_to_remote: template.push_to_remote,
                pr_title: None,
                pr_body: None,
                timeout_ms: template.timeout_ms,
                max_output_buffer: template.max_output_buffer,
                parent_task_id: None,
                continue_from: None,
            };
            let task = handlers.handle_delegated(&new, &[]).await?;
            schedules::insert_execution(db, schedule_id, Some(task.id), slot, false).await?;

            let next_run_at = match row.kind {
                dispatchd_db::models::ScheduleKind::OneTime => None,
                dispatchd_db::models::ScheduleKind::Cron => row
                    .cron_expr
                    .as_deref()
                    .and_then(|expr| crate::scheduler::CronSchedule::parse(expr).ok())
                    .zip(row.timezone.parse::<chrono_tz::Tz>().ok())
                    .and_then(|(cron, tz)| cron.next_after(slot, tz)),
            };
            schedules::record_fire(db, schedule_id, slot, next_run_at).await?;
            handlers.events.publish(BusEvent::ScheduleFired { schedule_id, task_id: task.id });
        }
        FireDecision::Completed { schedule_id } => {
            schedules::set_status(db, schedule_id, ScheduleStatus::Completed).await?;
        }
        FireDecision::Failed { schedule_id } => {
            schedules::set_status(db, schedule_id, ScheduleStatus::Failed).await?;
        }
        FireDecision::Deferred { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_template_defaults_fill_in() {
        let json = serde_json::json!({"prompt": "nightly build"});
        let template: TaskTemplate = serde_json::from_value(json).unwrap();
        assert_eq!(template.priority, Priority::P1);
        assert!(!template.use_worktree);
        assert_eq!(template.max_output_buffer, crate::agent::DEFAULT_MAX_OUTPUT_BYTES as i64);
    }
}
