//! Targeted notification endpoint for platform collaborators.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use relay_common::UserId;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::ServiceCaller;
use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/notifications", post(send_notification))
}

// ---------------------------------------------------------------------------
// POST /api/v1/notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    #[schema(value_type = String)]
    pub user_id: UserId,
    /// Opaque notification body, forwarded unchanged.
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NotifyResponse {
    /// Number of open connections the notification was queued on.
    pub delivered: usize,
}

#[utoipa::path(
    post,
    path = "/api/v1/notifications",
    tag = "Notifications",
    security(("service_key" = [])),
    request_body = NotifyRequest,
    responses(
        (status = 202, description = "Notification dispatched", body = NotifyResponse),
        (status = 400, description = "Bad request", body = ApiErrorBody),
        (status = 401, description = "Missing or invalid service key", body = ApiErrorBody),
    ),
)]
pub async fn send_notification(
    _caller: ServiceCaller,
    State(state): State<AppState>,
    Json(body): Json<NotifyRequest>,
) -> Result<(axum::http::StatusCode, Json<NotifyResponse>), ApiError> {
    if body.user_id.as_str().is_empty() {
        return Err(ApiError::bad_request("userId must not be empty"));
    }

    let delivered = state.notifier.notify(&body.user_id, body.payload);
    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(NotifyResponse { delivered }),
    ))
}
