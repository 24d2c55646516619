//! Request extractors for the relay handshake and collaborator routes.

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_common::UserId;
use serde::Deserialize;

use crate::AppState;

/// Header carrying the shared key on collaborator routes.
pub const SERVICE_KEY_HEADER: &str = "x-relay-key";

/// Authenticated user extracted from the upgrade request.
///
/// The bearer token is read from `Authorization: Bearer <token>`, falling back
/// to a `?token=` query parameter for browser WebSocket clients that cannot set
/// headers.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
}

/// Rejection returned when the bearer token is missing or invalid.
#[derive(Debug)]
pub struct AuthError {
    message: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": "UNAUTHORIZED",
                "message": self.message
            }
        });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Result<String, AuthError> {
    if let Some(header) = parts.headers.get(AUTHORIZATION) {
        let header = header.to_str().map_err(|_| AuthError {
            message: "Invalid Authorization header",
        })?;
        let token = header.strip_prefix("Bearer ").ok_or(AuthError {
            message: "Invalid Authorization header format",
        })?;
        return Ok(token.to_string());
    }

    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError {
            message: "Missing bearer token",
        })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;

        let user_id = state
            .verifier
            .verify(&token)
            .await
            .map_err(|rejection| AuthError {
                message: rejection.message(),
            })?;

        Ok(AuthUser { user_id })
    }
}

/// Marker extractor for routes reserved to trusted collaborators.
///
/// When `NOTIFY_API_KEY` is configured, the request must carry it in the
/// `X-Relay-Key` header.
pub struct ServiceCaller;

impl FromRequestParts<AppState> for ServiceCaller {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.notify_api_key.as_deref() else {
            return Ok(ServiceCaller);
        };

        let presented = parts
            .headers
            .get(SERVICE_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError {
                message: "Missing service key",
            })?;

        if !keys_match(presented.as_bytes(), expected.as_bytes()) {
            return Err(AuthError {
                message: "Invalid service key",
            });
        }
        Ok(ServiceCaller)
    }
}

/// Compare two keys without short-circuiting on the first differing byte.
fn keys_match(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}
