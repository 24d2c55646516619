pub mod health;
pub mod notifications;
pub mod presence;

use axum::Router;
use utoipa::openapi::security::{ApiKey, ApiKeyValue, Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::auth::middleware::SERVICE_KEY_HEADER;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest(
            "/api/v1",
            notifications::router().merge(presence::router()),
        )
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
            components.add_security_scheme(
                "service_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(SERVICE_KEY_HEADER))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Notifications
        notifications::send_notification,
        // Presence
        presence::get_presence,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            // Route request/response types
            health::HealthResponse,
            notifications::NotifyRequest,
            notifications::NotifyResponse,
            presence::PresenceResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Notifications", description = "Targeted user notifications"),
        (name = "Presence", description = "User presence"),
    )
)]
pub struct ApiDoc;
