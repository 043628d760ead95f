use thiserror::Error;

/// Main error type for the signing agent
#[derive(Error, Debug)]
pub enum AgentError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Key-value store error: {0}")]
    Kv(#[from] redis::RedisError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Caller-side errors, surfaced as 400-class
    #[error("Validation failed: {0}")]
    Validation(String),

    // Unknown resource, surfaced as 404-class
    #[error("Not found: {0}")]
    NotFound(String),

    // Non-2xx from the authority, returned verbatim to the caller
    #[error("Upstream error: {0}")]
    Upstream(String),

    // Crypto/signing errors
    #[error("Signature error: {0}")]
    Signature(String),

    // Lock acquisition failed, another agent likely holds the action
    #[error("Lock not acquired: {0}")]
    LockNotAcquired(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for AgentError
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// HTTP status code this error maps to on the local API surface.
    pub fn status_code(&self) -> u16 {
        match self {
            AgentError::Validation(_) => 400,
            AgentError::NotFound(_) => 404,
            AgentError::Upstream(_) => 502,
            _ => 500,
        }
    }
}
