// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! HTTP task-submission API.
//!
//! Endpoints:
//! - `POST /tasks` — submit a task, returns 202 with the task id
//! - `GET /tasks/{id}` — full task snapshot
//! - `GET /stats` — scheduler statistics
//! - `GET /` — service banner
//!
//! Clients poll `GET /tasks/{id}` for the outcome; the root task's status
//! and result are the only externally observed output of a pipeline.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use norn_core::{Scheduler, SchedulerStats, Task, TaskPayload, TaskSnapshot, TaskType};

pub fn router(scheduler: Scheduler) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/tasks", post(submit_task))
        .route("/tasks/:id", get(get_task))
        .route("/stats", get(get_stats))
        .layer(CorsLayer::permissive())
        .with_state(scheduler)
}

/// Bind and serve until SIGINT, then drain the scheduler.
pub async fn serve(bind: &str, scheduler: Scheduler) -> anyhow::Result<()> {
    let app = router(scheduler.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

// ─── Request / response bodies ────────────────────────────────────────────────

fn default_priority() -> i32 {
    1
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    /// A descriptive name for the task.
    name: String,
    /// Task input: `{messages}`, `{prompt}`, or `{tool_name, parameters}`.
    payload: Value,
    task_type: String,
    /// Advisory; accepted and surfaced but never affects admission order.
    #[serde(default = "default_priority")]
    priority: i32,
    /// Convenience flag: submit as a planning task regardless of task_type.
    #[serde(default)]
    is_decomposable: bool,
}

#[derive(Debug, Serialize)]
struct TaskResponse {
    task_id: Uuid,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

fn error(status: StatusCode, detail: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody { detail: detail.into() }))
}

const VALID_TASK_TYPES: &str = "planning, tool_call, final_summary, reasoning";

fn parse_task_type(raw: &str) -> Option<TaskType> {
    match raw.to_lowercase().as_str() {
        "planning" => Some(TaskType::Planning),
        "tool_call" => Some(TaskType::ToolCall),
        "final_summary" => Some(TaskType::FinalSummary),
        "reasoning" => Some(TaskType::Reasoning),
        _ => None,
    }
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

async fn root() -> Json<Value> {
    Json(json!({
        "message": "norn scheduler is running.",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn submit_task(
    State(scheduler): State<Scheduler>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), (StatusCode, Json<ErrorBody>)> {
    let mut task_type = parse_task_type(&req.task_type).ok_or_else(|| {
        error(
            StatusCode::BAD_REQUEST,
            format!(
                "invalid task type {:?}; valid types are: {VALID_TASK_TYPES}",
                req.task_type
            ),
        )
    })?;
    if req.is_decomposable {
        task_type = TaskType::Planning;
    }

    // The untagged payload enum cannot fail to decode (unrecognised shapes
    // land in the catch-all and fail the task at admission), but keep the
    // error path for future payload constraints.
    let payload: TaskPayload = serde_json::from_value(req.payload)
        .map_err(|e| error(StatusCode::BAD_REQUEST, format!("invalid payload: {e}")))?;

    let mut task = Task::new(req.name, payload, task_type);
    task.priority = req.priority;

    match scheduler.submit(task) {
        Ok(task_id) => {
            info!(task = %task_id, "task submitted via gateway");
            Ok((
                StatusCode::ACCEPTED,
                Json(TaskResponse {
                    task_id,
                    message: "Task successfully submitted and queued.".into(),
                }),
            ))
        }
        Err(e) => Err(error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

async fn get_task(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskSnapshot>, (StatusCode, Json<ErrorBody>)> {
    scheduler
        .get_task(id)
        .map(Json)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("Task with ID '{id}' not found.")))
}

async fn get_stats(State(scheduler): State<Scheduler>) -> Json<SchedulerStats> {
    Json(scheduler.stats())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
