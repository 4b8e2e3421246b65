//! Exercises dependency-failure propagation through `Handlers`: a failed
//! task must fail every transitive dependent, not just the one directly
//! blocked on it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use dispatchd_core::events::EventBus;
use dispatchd_core::graph::DependencyGraph;
use dispatchd_core::handlers::Handlers;
use dispatchd_core::pool::WorkerPool;
use dispatchd_core::queue::TaskQueue;
use dispatchd_core::resource::{ResourceLimits, ResourceMonitor};
use dispatchd_db::models::{Priority, TaskStatus, WorktreeCleanupPolicy};
use dispatchd_db::queries::{dependencies, tasks};
use dispatchd_test_utils::test_pool;

fn sample_task(prompt: &str) -> tasks::NewTask {
    tasks::NewTask {
        id: Uuid::new_v4(),
        prompt: prompt.to_string(),
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

async fn build_handlers(db: sqlx::SqlitePool) -> Arc<Handlers> {
    let events = EventBus::spawn(64);
    let resource = Arc::new(ResourceMonitor::spawn(Duration::from_secs(60), events.clone()));
    let pool = Arc::new(WorkerPool::new("echo", resource, ResourceLimits::default(), events.clone()));
    Arc::new(Handlers {
        db,
        graph: Mutex::new(DependencyGraph::new()),
        queue: Mutex::new(TaskQueue::default()),
        pool,
        events,
        repo_root: std::env::temp_dir(),
        worktree: None,
    })
}

#[tokio::test]
async fn failure_cascades_through_every_transitive_dependent() {
    let (db, _guard) = test_pool().await;

    let root = tasks::insert_task(&db, &sample_task("build")).await.unwrap();
    let child = tasks::insert_task(&db, &sample_task("test")).await.unwrap();
    let grandchild = tasks::insert_task(&db, &sample_task("deploy")).await.unwrap();

    dependencies::insert_dependency(&db, child.id, root.id).await.unwrap();
    dependencies::insert_dependency(&db, grandchild.id, child.id).await.unwrap();

    let handlers = build_handlers(db.clone()).await;

    tasks::transition_task_status(&db, root.id, TaskStatus::Queued, TaskStatus::Running).await.unwrap();
    let outcome = dispatchd_core::pool::TaskOutcome {
        task_id: root.id,
        exit_code: Some(1),
        timed_out: false,
        killed: false,
        spawn_error: None,
        stdout_tail: String::new(),
        stderr_tail: String::new(),
        workspace: None,
        merge_outcome: None,
    };
    handlers.handle_completion(root.id, &outcome).await.unwrap();

    let child_row = tasks::get_task(&db, child.id).await.unwrap().unwrap();
    assert_eq!(child_row.status, TaskStatus::Failed);
    assert_eq!(child_row.error_kind.as_deref(), Some("dependency_failed"));
    assert!(child_row.error_message.unwrap().contains(&root.id.to_string()));

    let grandchild_row = tasks::get_task(&db, grandchild.id).await.unwrap().unwrap();
    assert_eq!(grandchild_row.status, TaskStatus::Failed);
    assert_eq!(grandchild_row.error_kind.as_deref(), Some("dependency_failed"));
}
