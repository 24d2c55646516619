/// Relay configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HS256 secret shared with the auth subsystem that issues bearer tokens.
    pub jwt_secret: String,
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Capacity of each connection's outbound event queue.
    pub outbound_queue_capacity: usize,
    /// Maximum number of rooms a single connection may join.
    pub max_rooms_per_connection: usize,
    /// Maximum number of simultaneously open connections per user.
    pub max_connections_per_user: usize,
    /// Shared key required on the notification route. Unset disables the check.
    pub notify_api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            jwt_secret: required_var("JWT_SECRET"),
            port: parsed_var("PORT", 3001),
            outbound_queue_capacity: parsed_var("OUTBOUND_QUEUE_CAPACITY", 256).max(1),
            max_rooms_per_connection: parsed_var("MAX_ROOMS_PER_CONNECTION", 64),
            max_connections_per_user: parsed_var("MAX_CONNECTIONS_PER_USER", 16),
            notify_api_key: std::env::var("NOTIFY_API_KEY").ok().filter(|s| !s.is_empty()),
        }
    }

    /// Defaults suitable for tests and local tooling.
    pub fn with_secret(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            port: 3001,
            outbound_queue_capacity: 256,
            max_rooms_per_connection: 64,
            max_connections_per_user: 16,
            notify_api_key: None,
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
