use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use wm_infra::types::{Machine, MachineState};

use crate::auth::UserId;
use crate::dto::{CreateMachineRequest, DestroyQuery, RecoverMachineRequest, WorkspaceQuery};
use crate::error::ApiError;
use crate::state::AppState;

/// The caller's registered machine. Someone else's machine is reported as
/// missing, like the snapshot routes do.
pub(crate) fn owned_machine(
    state: &AppState,
    user_id: &UserId,
    machine_id: &str,
) -> Result<MachineState, ApiError> {
    let machine = state.manager.get_machine_state(machine_id)?;
    if machine.owner != user_id.0 {
        return Err(ApiError::NotFound(format!("Machine {machine_id} not found")));
    }
    Ok(machine)
}

/// POST /machines
pub async fn create_machine(
    State(state): State<AppState>,
    Json(req): Json<CreateMachineRequest>,
) -> Result<Response, ApiError> {
    if req.run_async {
        let created = state
            .manager
            .create_machine_async(req.config, &req.workspace_id, &req.env_name)
            .await?;
        return Ok((StatusCode::ACCEPTED, Json(created)).into_response());
    }

    let machine = state
        .manager
        .create_machine_sync(req.config, &req.workspace_id, &req.env_name)
        .await?;
    Ok((StatusCode::CREATED, Json(machine)).into_response())
}

/// POST /machines/recover
pub async fn recover_machine(
    State(state): State<AppState>,
    Json(req): Json<RecoverMachineRequest>,
) -> Result<(StatusCode, Json<Machine>), ApiError> {
    let machine = state
        .manager
        .recover_machine(req.config, &req.workspace_id, &req.env_name)
        .await?;
    Ok((StatusCode::CREATED, Json(machine)))
}

/// GET /machines
///
/// Includes machines that are still being created.
pub async fn list_machines(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Json<Vec<MachineState>>, ApiError> {
    let states = state
        .manager
        .get_machines_states(&user_id.0, query.workspace.as_deref())?;
    Ok(Json(states))
}

/// GET /machines/{id}
pub async fn get_machine(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(machine_id): Path<String>,
) -> Result<Json<Machine>, ApiError> {
    owned_machine(&state, &user_id, &machine_id)?;
    Ok(Json(state.manager.get_machine(&machine_id)?))
}

/// DELETE /machines/{id}
pub async fn destroy_machine(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(machine_id): Path<String>,
    Query(query): Query<DestroyQuery>,
) -> Result<StatusCode, ApiError> {
    owned_machine(&state, &user_id, &machine_id)?;
    state.manager.destroy(&machine_id, query.run_async).await?;
    Ok(if query.run_async {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NO_CONTENT
    })
}

/// GET /machines/{id}/logs
///
/// Logs outlive the machine until shutdown, so a machine that is no longer
/// registered (destroyed, or failed to build) is served by id.
pub async fn machine_logs(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(machine_id): Path<String>,
) -> Result<String, ApiError> {
    match owned_machine(&state, &user_id, &machine_id) {
        Ok(_) => {}
        Err(ApiError::NotFound(_)) if state.manager.get_machine_state(&machine_id).is_err() => {}
        Err(e) => return Err(e),
    }
    Ok(state.manager.machine_logs(&machine_id).await?)
}

/// GET /workspaces/{ws}/dev-machine
pub async fn dev_machine(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(workspace_id): Path<String>,
) -> Result<Json<Machine>, ApiError> {
    let machine = state.manager.get_dev_machine(&workspace_id)?;
    if machine.state.owner != user_id.0 {
        return Err(ApiError::NotFound(format!(
            "Dev machine of workspace {workspace_id} not found"
        )));
    }
    Ok(Json(machine))
}
