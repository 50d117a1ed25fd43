use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use wm_core::context::{self, Subject};

use crate::error::ApiError;
use crate::state::AppState;

/// Caller id from the `X-User-Id` header, injected into extensions.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

/// Middleware that validates `Authorization: Bearer <key>` against the
/// configured `API_KEY`, extracts `X-User-Id` and runs the rest of the
/// request as that subject.
pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    match validate_request(&state, &req) {
        Ok(subject) => {
            req.extensions_mut().insert(UserId(subject.id.clone()));
            context::scope(subject, next.run(req)).await
        }
        Err(e) => e.into_response(),
    }
}

fn validate_request(state: &AppState, req: &Request) -> Result<Subject, ApiError> {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if token != state.config.api_key {
        return Err(ApiError::Unauthorized);
    }

    let user_id = req
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing or invalid X-User-Id header".into()))?;

    Ok(Subject::new(user_id, Some(token.to_string())))
}
