use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use relay_common::UserId;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/presence/{user_id}", get(get_presence))
}

// ---------------------------------------------------------------------------
// GET /api/v1/presence/:user_id
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    #[schema(value_type = String)]
    pub user_id: UserId,
    pub online: bool,
    /// Number of open connections held by the user.
    pub connections: usize,
}

#[utoipa::path(
    get,
    path = "/api/v1/presence/{user_id}",
    tag = "Presence",
    params(
        ("user_id" = String, Path, description = "User identity"),
    ),
    responses(
        (status = 200, description = "Current presence", body = PresenceResponse),
    ),
)]
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<PresenceResponse> {
    let user_id = UserId::from(user_id);
    let connections = state.relay.presence().connection_count(&user_id);
    Json(PresenceResponse {
        online: connections > 0,
        connections,
        user_id,
    })
}
