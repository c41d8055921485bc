use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::{
    ErrorResponse, FailureKind, HistoryEntry, Interval, RunRecord, RunResults,
    RunStatusResponse, RunnerError, TaskRecord, Trigger, TriggerRequest,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/runs", get(list_runs).post(trigger_run))
        .route("/api/v1/runs/:interval", get(get_run))
        .route("/api/v1/runs/:interval/tasks", get(get_tasks))
        .route("/api/v1/runs/:interval/history", get(get_history))
        .route("/api/v1/runs/:interval/tasks/:task/retry", post(retry_task))
        .route("/api/v1/runs/:interval/cancel", post(cancel_run))
        .route("/api/v1/runs/:interval/results", get(get_results))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

fn api_error(status: StatusCode, msg: impl Into<String>, kind: Option<FailureKind>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: msg.into(),
            kind,
        }),
    )
}

fn runner_error(err: RunnerError) -> ApiError {
    let status = match &err {
        RunnerError::RunInProgress(_)
        | RunnerError::NotRunning(_)
        | RunnerError::NotRetryable { .. } => StatusCode::CONFLICT,
        RunnerError::UnknownRun(_) | RunnerError::UnknownTask(_) => StatusCode::NOT_FOUND,
        RunnerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("error del runner: {}", err);
    }
    api_error(status, err.to_string(), None)
}

fn parse_interval(raw: &str) -> ApiResult<Interval> {
    raw.parse().map_err(|e| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("invalid interval '{raw}': {e}"),
            None,
        )
    })
}

fn run_status(state: &AppState, interval: &Interval) -> ApiResult<RunStatusResponse> {
    let run = state
        .runner
        .status(interval)
        .map_err(runner_error)?
        .ok_or_else(|| runner_error(RunnerError::UnknownRun(interval.to_string())))?;
    let tasks = state.runner.tasks(interval).map_err(runner_error)?;
    Ok(RunStatusResponse { run, tasks })
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn list_runs(State(state): State<AppState>) -> ApiResult<Json<Vec<RunRecord>>> {
    let runs = state.runner.list_runs().map_err(runner_error)?;
    Ok(Json(runs))
}

// Disparo manual: el run sigue en segundo plano, se responde enseguida
async fn trigger_run(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> ApiResult<(StatusCode, Json<RunStatusResponse>)> {
    state
        .runner
        .spawn_run(req.interval, Trigger::Manual, req.force)
        .map_err(runner_error)?;
    info!(
        "run manual disparado para {} (force={})",
        req.interval, req.force
    );

    let status = run_status(&state, &req.interval)?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn get_run(
    State(state): State<AppState>,
    Path(interval): Path<String>,
) -> ApiResult<Json<RunStatusResponse>> {
    let interval = parse_interval(&interval)?;
    Ok(Json(run_status(&state, &interval)?))
}

async fn get_tasks(
    State(state): State<AppState>,
    Path(interval): Path<String>,
) -> ApiResult<Json<Vec<TaskRecord>>> {
    let interval = parse_interval(&interval)?;
    Ok(Json(run_status(&state, &interval)?.tasks))
}

async fn get_history(
    State(state): State<AppState>,
    Path(interval): Path<String>,
) -> ApiResult<Json<Vec<HistoryEntry>>> {
    let interval = parse_interval(&interval)?;
    let history = state.runner.history(&interval).map_err(runner_error)?;
    if history.is_empty() {
        return Err(runner_error(RunnerError::UnknownRun(interval.to_string())));
    }
    Ok(Json(history))
}

async fn retry_task(
    State(state): State<AppState>,
    Path((interval, task)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<RunStatusResponse>)> {
    let interval = parse_interval(&interval)?;
    state
        .runner
        .spawn_retry(interval, &task)
        .map_err(runner_error)?;
    info!("reintento manual de {} en {}", task, interval);

    let status = run_status(&state, &interval)?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(interval): Path<String>,
) -> ApiResult<(StatusCode, Json<RunStatusResponse>)> {
    let interval = parse_interval(&interval)?;
    state.runner.cancel(&interval).map_err(runner_error)?;

    let status = run_status(&state, &interval)?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

// Lista las particiones visibles del intervalo
async fn get_results(
    State(state): State<AppState>,
    Path(interval): Path<String>,
) -> ApiResult<Json<RunResults>> {
    let interval = parse_interval(&interval)?;
    if state.runner.status(&interval).map_err(runner_error)?.is_none() {
        return Err(runner_error(RunnerError::UnknownRun(interval.to_string())));
    }

    let files = state.sink.finals_for(&interval).map_err(|e| {
        warn!("no se pudieron listar las particiones de {}: {}", interval, e);
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
            Some(FailureKind::WriteError),
        )
    })?;

    Ok(Json(RunResults {
        pipeline_id: state.runner.pipeline_id().to_string(),
        interval,
        root: state.sink_root.to_string_lossy().to_string(),
        files,
    }))
}
