//! REST endpoints through which the platform adapter forwards events.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::warn;

use super::manager::Onboarding;
use super::model::{Control, MemberRecord, SessionId, UserId};
use crate::error::OnboardingError;

/// Shared state for onboarding routes.
#[derive(Clone)]
pub struct OnboardingRouteState {
    pub onboarding: Arc<Onboarding>,
}

#[derive(Debug, Deserialize)]
struct MemberUpdate {
    before: MemberRecord,
    after: MemberRecord,
}

/// JSON error response.
struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, message.into())
    }
}

impl From<OnboardingError> for ApiError {
    fn from(err: OnboardingError) -> Self {
        let status = match &err {
            OnboardingError::UnknownSession(_) | OnboardingError::UserNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            OnboardingError::ExpiredSession(_) => StatusCode::GONE,
            OnboardingError::UnknownOption { .. } => StatusCode::BAD_REQUEST,
            OnboardingError::InvalidTransition { .. } => StatusCode::CONFLICT,
            OnboardingError::Apply { .. }
            | OnboardingError::Delivery { .. }
            | OnboardingError::Timeout { .. }
            | OnboardingError::Platform(_) => {
                warn!(error = %err, "Onboarding operation failed");
                StatusCode::BAD_GATEWAY
            }
        };
        Self(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

fn parse_session(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("'{raw}' is not a session id")))
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /api/members/{user_id}/gate-cleared
async fn gate_cleared(
    State(state): State<OnboardingRouteState>,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = state.onboarding.on_gate_cleared(&UserId::from(user_id)).await?;
    Ok(Json(outcome).into_response())
}

/// POST /api/members/{user_id}/entry-point
async fn entry_point(
    State(state): State<OnboardingRouteState>,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    let reply = state.onboarding.on_entry_point(&UserId::from(user_id)).await?;
    Ok(Json(reply).into_response())
}

/// POST /api/members/update
///
/// Body: `{ "before": MemberRecord, "after": MemberRecord }`. Responds with
/// the gate outcome, or `null` when the update was not a gate transition.
async fn member_update(
    State(state): State<OnboardingRouteState>,
    Json(update): Json<MemberUpdate>,
) -> Result<Response, ApiError> {
    let outcome = state
        .onboarding
        .on_member_update(&update.before, &update.after)
        .await?;
    Ok(Json(outcome).into_response())
}

/// GET /api/sessions/{session_id}
///
/// Returns the rendered surface of a live session; 410 once it has expired.
async fn get_session(
    State(state): State<OnboardingRouteState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let session_id = parse_session(&session_id)?;
    let session = state.onboarding.session(session_id).await?;
    let surface = session.surface(&state.onboarding.config().commit_label);
    Ok(Json(serde_json::json!({
        "user_id": session.user_id,
        "expires_at": session.expires_at,
        "surface": surface,
    }))
    .into_response())
}

/// POST /api/sessions/{session_id}/controls/{control}
///
/// `control` is `select:<group_id>` or `commit`.
async fn interact(
    State(state): State<OnboardingRouteState>,
    Path((session_id, control)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let session_id = parse_session(&session_id)?;
    let control: Control = control.parse().map_err(|e| ApiError::bad_request(format!("{e}")))?;
    let outcome = state.onboarding.on_interaction(session_id, &control).await?;
    Ok(Json(outcome).into_response())
}

/// POST /api/sweep
async fn sweep(State(state): State<OnboardingRouteState>) -> impl IntoResponse {
    Json(state.onboarding.run_sweep().await)
}

/// Build the onboarding REST routes.
pub fn onboarding_routes(state: OnboardingRouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/members/update", post(member_update))
        .route("/api/members/{user_id}/gate-cleared", post(gate_cleared))
        .route("/api/members/{user_id}/entry-point", post(entry_point))
        .route("/api/sessions/{session_id}", get(get_session))
        .route(
            "/api/sessions/{session_id}/controls/{control}",
            post(interact),
        )
        .route("/api/sweep", post(sweep))
        .with_state(state)
}
