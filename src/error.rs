use thiserror::Error;

/// Main error type for the data aggregation service
#[derive(Error, Debug)]
pub enum FeedError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response from an upstream source
    #[error("Upstream {source_name} returned {status}: {message}")]
    Upstream {
        source_name: String,
        status: u16,
        message: String,
    },

    /// Local rate limiter rejected the request before any network call
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Circuit breaker rejected the request before any network call
    #[error("Circuit breaker is open for {0}")]
    CircuitOpen(String),

    /// Per-attempt timeout elapsed
    #[error("Request timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Source does not implement the requested operation
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid payload from {source_name}: {message}")]
    InvalidPayload {
        source_name: String,
        message: String,
    },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Every fallback tier was exhausted or skipped. The only error that
    /// should reach an external caller as fatal. `failures` holds one
    /// "provider: reason" entry per tier/provider that was tried.
    #[error("All fallback tiers exhausted for \"{operation}\" ({providers_attempted} providers attempted): [{}]", .failures.join("; "))]
    TotalFailure {
        operation: String,
        providers_attempted: usize,
        failures: Vec<String>,
    },

    #[error("Provider registry error: {0}")]
    ProviderRegistry(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for FeedError
pub type Result<T> = std::result::Result<T, FeedError>;

impl FeedError {
    /// Whether a retry at the same source could plausibly succeed.
    ///
    /// Auth/forbidden/not-found responses are final: retrying cannot fix a bad
    /// key or a missing resource. Everything transport-shaped is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Upstream { status, .. } => !matches!(status, 400 | 401 | 403 | 404),
            FeedError::CircuitOpen(_) => false,
            FeedError::RateLimited(_) => false,
            FeedError::Unsupported(_) => false,
            FeedError::Http(_) | FeedError::Timeout { .. } => true,
            FeedError::InvalidPayload { .. } | FeedError::Validation(_) => true,
            _ => false,
        }
    }

    /// Short classification label used in logs and events.
    pub fn class(&self) -> &'static str {
        match self {
            FeedError::CircuitOpen(_) => "circuit_open",
            FeedError::RateLimited(_) => "rate_limited",
            FeedError::Timeout { .. } => "timeout",
            FeedError::Upstream { .. } => "upstream",
            FeedError::Validation(_) => "validation",
            FeedError::TotalFailure { .. } => "total_failure",
            _ => "other",
        }
    }
}
