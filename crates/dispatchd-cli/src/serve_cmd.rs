use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use axum::response::Html;
use dispatchd_db::models::{Checkpoint, Schedule, ScheduleExecution, Task};
use dispatchd_db::queries::{checkpoints, dependencies, schedules, tasks as task_db};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: Task,
    pub depends_on: Vec<Uuid>,
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Serialize)]
pub struct ScheduleDetailResponse {
    #[serde(flatten)]
    pub schedule: Schedule,
    pub executions: Vec<ScheduleExecution>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(pool: SqlitePool) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task_detail))
        .route("/api/schedules", get(list_schedules_handler))
        .route("/api/schedules/{id}", get(get_schedule_detail))
        .layer(CorsLayer::permissive())
        .with_state(pool)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve the minimal local status endpoint: a read-only view over the
/// store, used by the TUI's remote-refresh path and by `status`/`logs`
/// when pointed at a running `serve` process instead of the database file
/// directly. Does not itself drive dispatch -- that's the supervisor loop
/// in [`crate::main`]'s `serve` arm.
pub async fn run_serve(pool: SqlitePool, bind: &str, port: u16) -> Result<()> {
    let app = build_router(pool);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("dispatchd http status endpoint listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("dispatchd http status endpoint shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(pool): State<SqlitePool>) -> Result<axum::response::Response, AppError> {
    let recent = task_db::list_tasks(&pool, 20).await.map_err(AppError::internal)?;

    let rows = if recent.is_empty() {
        "<tr><td colspan=\"3\">No tasks found.</td></tr>".to_string()
    } else {
        recent
            .iter()
            .map(|t| {
                format!(
                    "<tr><td><a href=\"/api/tasks/{id}\">{id}</a></td><td>{status}</td><td>{priority}</td></tr>",
                    id = t.id,
                    status = t.status,
                    priority = t.priority,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>dispatchd</title></head><body>\
<h1>dispatchd</h1>\
<p><a href=\"/api/tasks\">/api/tasks</a> | <a href=\"/api/schedules\">/api/schedules</a></p>\
<table><tr><th>Task</th><th>Status</th><th>Priority</th></tr>{rows}</table>\
</body></html>"
    );

    Ok(Html(html).into_response())
}

async fn list_tasks(
    State(pool): State<SqlitePool>,
    Query(q): Query<ListQuery>,
) -> Result<axum::response::Response, AppError> {
    let tasks = task_db::list_tasks(&pool, q.limit).await.map_err(AppError::internal)?;
    Ok(Json(tasks).into_response())
}

async fn get_task_detail(
    State(pool): State<SqlitePool>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = task_db::get_task(&pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    let depends_on = dependencies::get_dependencies(&pool, id)
        .await
        .map_err(AppError::internal)?;

    let checkpoint = checkpoints::latest_checkpoint(&pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(TaskDetailResponse { task, depends_on, checkpoint }).into_response())
}

async fn list_schedules_handler(
    State(pool): State<SqlitePool>,
) -> Result<axum::response::Response, AppError> {
    let schedules = schedules::list_schedules(&pool).await.map_err(AppError::internal)?;
    Ok(Json(schedules).into_response())
}

async fn get_schedule_detail(
    State(pool): State<SqlitePool>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let schedule = schedules::get_schedule(&pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("schedule {id} not found")))?;

    let executions = schedules::list_executions(&pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(ScheduleDetailResponse { schedule, executions }).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
