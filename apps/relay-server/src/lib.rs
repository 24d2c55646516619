pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use auth::tokens::{JwtVerifier, TokenVerifier};
use config::Config;
use gateway::notify::NotificationDispatcher;
use gateway::relay::{RelayEngine, RelayLimits};

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub relay: Arc<RelayEngine>,
    pub notifier: NotificationDispatcher,
}

impl AppState {
    /// Build the state with an HS256 verifier keyed by `config.jwt_secret`.
    pub fn new(config: Config) -> Self {
        let verifier: Arc<dyn TokenVerifier> = Arc::new(JwtVerifier::new(&config.jwt_secret));
        Self::with_verifier(config, verifier)
    }

    /// Build the state around a caller-supplied identity verifier.
    pub fn with_verifier(config: Config, verifier: Arc<dyn TokenVerifier>) -> Self {
        let relay = Arc::new(RelayEngine::new(RelayLimits::from(&config)));
        let notifier = NotificationDispatcher::new(relay.clone());
        Self {
            config: Arc::new(config),
            verifier,
            relay,
            notifier,
        }
    }
}
