use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use wm_db::models::Snapshot;

use crate::auth::UserId;
use crate::dto::{SaveSnapshotRequest, WorkspaceQuery};
use crate::error::ApiError;
use crate::routes::machines::owned_machine;
use crate::state::AppState;

fn require_workspace(query: WorkspaceQuery) -> Result<String, ApiError> {
    query
        .workspace
        .filter(|ws| !ws.is_empty())
        .ok_or_else(|| ApiError::BadRequest("workspace query parameter is required".into()))
}

/// POST /machines/{id}/snapshots
///
/// With `sync` the response carries the provider's instance key; otherwise
/// the snapshot is stored in the background.
pub async fn save_snapshot(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(machine_id): Path<String>,
    req: Option<Json<SaveSnapshotRequest>>,
) -> Result<(StatusCode, Json<Snapshot>), ApiError> {
    let req = req.map(|Json(req)| req).unwrap_or_default();
    owned_machine(&state, &user_id, &machine_id)?;

    if req.sync {
        let snapshot = state
            .manager
            .save_sync(&machine_id, &user_id.0, req.description)
            .await?;
        return Ok((StatusCode::CREATED, Json(snapshot)));
    }

    let snapshot = state
        .manager
        .save(&machine_id, &user_id.0, req.description)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

/// GET /snapshots?workspace=
pub async fn list_snapshots(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Json<Vec<Snapshot>>, ApiError> {
    let workspace_id = require_workspace(query)?;
    Ok(Json(state.manager.get_snapshots(&user_id.0, &workspace_id).await?))
}

/// GET /snapshots/{id}
pub async fn get_snapshot(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(snapshot_id): Path<String>,
) -> Result<Json<Snapshot>, ApiError> {
    let snapshot = state.manager.get_snapshot(&snapshot_id).await?;
    if snapshot.owner != user_id.0 {
        return Err(ApiError::NotFound(format!("Snapshot with id '{snapshot_id}' not found")));
    }
    Ok(Json(snapshot))
}

/// DELETE /snapshots/{id}
pub async fn remove_snapshot(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(snapshot_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let snapshot = state.manager.get_snapshot(&snapshot_id).await?;
    if snapshot.owner != user_id.0 {
        return Err(ApiError::NotFound(format!("Snapshot with id '{snapshot_id}' not found")));
    }

    state.manager.remove_snapshot(&snapshot_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /snapshots?workspace=
pub async fn remove_snapshots(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<StatusCode, ApiError> {
    let workspace_id = require_workspace(query)?;
    state.manager.remove_snapshots(&user_id.0, &workspace_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
