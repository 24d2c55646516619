use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_common::protocol::{ErrorCode, ErrorPayload};
use relay_common::RoomId;
use serde::Serialize;
use utoipa::ToSchema;

/// Structured API error returned to HTTP clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
        }
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: "CAPACITY".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Failures of relay operations. Reported to the originating connection only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// The caller acted on a room it has not joined.
    #[error("Not a member of room {0}")]
    NotMember(RoomId),
    /// A room or connection limit was exceeded.
    #[error("Capacity exceeded: {0}")]
    Capacity(&'static str),
    /// The connection is no longer open.
    #[error("Connection is closed")]
    ConnectionClosed,
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotMember(_) => ErrorCode::NotMember,
            Self::Capacity(_) => ErrorCode::Capacity,
            Self::ConnectionClosed => ErrorCode::BadRequest,
        }
    }

    /// Wire payload for the `error` event sent back to the caller.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
            room_id: match self {
                Self::NotMember(room_id) => Some(room_id.clone()),
                _ => None,
            },
        }
    }
}
