use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};

use crate::auth::UserId;
use crate::dto::{ExecRequest, ProcessResponse};
use crate::error::ApiError;
use crate::routes::machines::owned_machine;
use crate::state::AppState;

/// POST /machines/{id}/processes
pub async fn exec(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(machine_id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<(StatusCode, Json<ProcessResponse>), ApiError> {
    owned_machine(&state, &user_id, &machine_id)?;
    let process = state
        .manager
        .exec(&machine_id, req.command, req.output_channel)
        .await?;
    Ok((StatusCode::CREATED, Json(ProcessResponse::from(&process))))
}

/// GET /machines/{id}/processes
pub async fn list_processes(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(machine_id): Path<String>,
) -> Result<Json<Vec<ProcessResponse>>, ApiError> {
    owned_machine(&state, &user_id, &machine_id)?;
    let processes = state.manager.get_processes(&machine_id)?;
    Ok(Json(processes.iter().map(ProcessResponse::from).collect()))
}

/// DELETE /machines/{id}/processes/{pid}
pub async fn stop_process(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path((machine_id, pid)): Path<(String, u32)>,
) -> Result<StatusCode, ApiError> {
    owned_machine(&state, &user_id, &machine_id)?;
    state.manager.stop_process(&machine_id, pid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /machines/{id}/processes/{pid}/logs
pub async fn process_logs(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path((machine_id, pid)): Path<(String, u32)>,
) -> Result<String, ApiError> {
    owned_machine(&state, &user_id, &machine_id)?;
    // 404 for an unknown process even if stale log files exist
    state.manager.get_process(&machine_id, pid)?;
    Ok(state.manager.process_logs(&machine_id, pid).await?)
}
