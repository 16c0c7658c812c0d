use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::{
    ChunkDescriptor, DispatchRequest, DispatchResponse, NotificationResponse, Outcome, TaskInfo,
    TaskRequest, TaskResults, TerminalNotification, WorkerHeartbeatRequest,
    WorkerHeartbeatResponse, WorkerId, WorkerMetrics, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::builder::TaskDefinitionBuilder;
use crate::error::{ErrorKind, TaskError};
use crate::state::{AppState, NotifyOutcome, WorkerMeta};
use crate::task::TranscodingTask;

type ApiError = (StatusCode, String);

fn api_error(e: TaskError) -> ApiError {
    let status = match e.kind() {
        ErrorKind::Configuration => StatusCode::BAD_REQUEST,
        ErrorKind::Input => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Bookkeeping => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Delivery | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn not_found(what: &str, id: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("{} {} no encontrado", what, id))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks", post(create_task))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/tasks/:id/chunks", get(get_task_chunks))
        .route("/api/v1/tasks/:id/results", get(get_task_results))
        .route("/api/v1/tasks/:id/cancel", post(cancel_task))
        .route("/api/v1/tasks/:id/chunks/:index/restart", post(restart_chunk))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/subtasks/next", post(assign_subtask))
        .route("/api/v1/subtasks/complete", post(complete_subtask))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Valida la definición, divide la entrada en chunks y registra la tarea
async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<TaskRequest>,
) -> Result<Json<TaskInfo>, ApiError> {
    let definition = TaskDefinitionBuilder::new(&state.config)
        .build(&req)
        .map_err(|e| {
            warn!("definición de tarea rechazada: {}", e);
            api_error(e)
        })?;

    let work_dir = state.config.task_dir(&definition.task_id).join("work");
    let media = state.media.clone();
    let max_retries = state.config.max_subtask_retries;

    // el split hace IO pesado
    let task = tokio::task::spawn_blocking(move || {
        TranscodingTask::initialize(definition, &work_dir, &media, max_retries)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| {
        warn!("no se pudo inicializar la tarea: {}", e);
        api_error(e)
    })?;

    let task = Arc::new(task);
    state.insert_task(task.clone());
    state.checkpoint(&task).await;

    info!(
        "tarea {} creada ({} chunks)",
        task.id(),
        task.info().total_chunks
    );
    Ok(Json(task.info()))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskInfo>, ApiError> {
    let task = state.task(&id).ok_or_else(|| not_found("tarea", &id))?;
    Ok(Json(task.info()))
}

async fn get_task_chunks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChunkDescriptor>>, ApiError> {
    let task = state.task(&id).ok_or_else(|| not_found("tarea", &id))?;
    Ok(Json(task.chunks()))
}

async fn get_task_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResults>, ApiError> {
    let task = state.task(&id).ok_or_else(|| not_found("tarea", &id))?;
    Ok(Json(task.results()))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskInfo>, ApiError> {
    let task = state.task(&id).ok_or_else(|| not_found("tarea", &id))?;
    state.cancel(task.clone()).await.map_err(api_error)?;
    Ok(Json(task.info()))
}

async fn restart_chunk(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, usize)>,
) -> Result<Json<Vec<ChunkDescriptor>>, ApiError> {
    let task = state.task(&id).ok_or_else(|| not_found("tarea", &id))?;
    task.restart_chunk(index).map_err(api_error)?;
    state.checkpoint(&task).await;
    Ok(Json(task.chunks()))
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    state.workers().insert(
        worker_id.clone(),
        WorkerMeta::new(req.hostname, req.max_concurrency.max(1)),
    );

    info!(
        "worker registrado: {} (max_concurrency={})",
        worker_id, req.max_concurrency
    );
    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let mut workers = state.workers();
    if let Some(meta) = workers.get_mut(&req.worker_id) {
        meta.last_heartbeat = SystemTime::now();
        meta.last_cpu_percent = Some(req.cpu_percent);
        meta.last_mem_bytes = Some(req.mem_bytes);
        Ok(Json(WorkerHeartbeatResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

fn active_dispatches(state: &AppState, worker_id: &str) -> usize {
    state
        .tasks_in_order()
        .iter()
        .map(|t| t.outstanding_for_worker(worker_id).len())
        .sum()
}

// Entrega el próximo chunk de la primera tarea (por orden de envío) que tenga trabajo
async fn assign_subtask(
    State(state): State<AppState>,
    Json(req): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>, ApiError> {
    // 1) Capacidad del worker
    let max_for_worker: u32 = {
        let workers = state.workers();
        match workers.get(&req.worker_id) {
            Some(meta) if meta.dead => {
                return Err((
                    StatusCode::CONFLICT,
                    format!("worker {} marcado como muerto", req.worker_id),
                ))
            }
            Some(meta) => meta.max_concurrency,
            None => return Err(not_found("worker", &req.worker_id)),
        }
    };

    let active = active_dispatches(&state, &req.worker_id);
    if active as u32 >= max_for_worker {
        info!(
            "worker {} pidió trabajo pero ya tiene {}/{} en vuelo",
            req.worker_id, active, max_for_worker
        );
        return Ok(Json(DispatchResponse { dispatch: None }));
    }

    // 2) Primera tarea que necesite trabajo
    for task in state.tasks_in_order() {
        if !task.needs_more_work() {
            continue;
        }

        let dispatch = task
            .select_next(req.performance, &req.worker_id)
            .map_err(api_error)?;

        if let Some(d) = dispatch {
            state.checkpoint(&task).await;
            if let Some(meta) = state.workers().get_mut(&req.worker_id) {
                meta.dispatches_started += 1;
            }
            return Ok(Json(DispatchResponse { dispatch: Some(d) }));
        }
    }

    info!("worker {} pidió trabajo pero no hay chunks pendientes", req.worker_id);
    Ok(Json(DispatchResponse { dispatch: None }))
}

// Worker reporta el resultado terminal de un dispatch
async fn complete_subtask(
    State(state): State<AppState>,
    Json(req): Json<TerminalNotification>,
) -> Result<Json<NotificationResponse>, ApiError> {
    let owner = state
        .task(&req.task_id)
        .and_then(|t| t.dispatch_owner(&req.dispatch_id));

    let outcome = state.notify(&req).await.map_err(api_error)?;

    if let (NotifyOutcome::Applied, Some((worker_id, dispatched_at))) = (outcome, owner) {
        record_worker_outcome(&state, &worker_id, dispatched_at, req.outcome);
    }

    Ok(Json(NotificationResponse {
        ok: true,
        ignored: outcome == NotifyOutcome::Ignored,
    }))
}

fn record_worker_outcome(
    state: &AppState,
    worker_id: &WorkerId,
    dispatched_at: chrono::DateTime<Utc>,
    outcome: Outcome,
) {
    let duration_ms = (Utc::now() - dispatched_at).num_milliseconds().max(0) as u64;

    let mut workers = state.workers();
    if let Some(meta) = workers.get_mut(worker_id) {
        meta.total_dispatch_time_ms += duration_ms;
        if outcome == Outcome::Succeeded {
            meta.dispatches_succeeded += 1;
        } else {
            meta.dispatches_failed += 1;
        }
    }
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();

    // Contar dispatches en vuelo por worker
    let ids: Vec<WorkerId> = state.workers().keys().cloned().collect();
    let active_by_worker: HashMap<WorkerId, u32> = ids
        .into_iter()
        .map(|wid| {
            let n = active_dispatches(&state, &wid) as u32;
            (wid, n)
        })
        .collect();

    let workers = state.workers();
    let mut out = Vec::new();

    for (wid, meta) in workers.iter() {
        let age_secs = now
            .duration_since(meta.last_heartbeat)
            .unwrap_or_default()
            .as_secs();

        let avg_ms = if meta.dispatches_succeeded > 0 {
            Some(meta.total_dispatch_time_ms as f64 / meta.dispatches_succeeded as f64)
        } else {
            None
        };

        out.push(WorkerMetrics {
            worker_id: wid.clone(),
            hostname: meta.hostname.clone(),
            dead: meta.dead,
            max_concurrency: meta.max_concurrency,
            last_heartbeat_secs_ago: age_secs,
            active_dispatches: active_by_worker.get(wid).copied().unwrap_or(0),
            dispatches_started: meta.dispatches_started,
            dispatches_succeeded: meta.dispatches_succeeded,
            dispatches_failed: meta.dispatches_failed,
            avg_dispatch_ms: avg_ms,
            cpu_percent: meta.last_cpu_percent,
            mem_bytes: meta.last_mem_bytes,
        });
    }

    Json(out)
}
