//! Error types for the claim intake router.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration store unavailable: {0}")]
    Store(#[from] DatabaseError),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Wrap a libsql error, classifying unique-constraint violations.
    pub fn from_libsql(context: &str, err: libsql::Error) -> Self {
        let text = err.to_string();
        if text.contains("UNIQUE constraint failed") {
            Self::Constraint(format!("{context}: {text}"))
        } else {
            Self::Query(format!("{context}: {text}"))
        }
    }

    /// True for a unique/primary-key violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

/// Mail transport errors (fetch and send).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Fetch from {host} failed: {reason}")]
    FetchFailed { host: String, reason: String },

    #[error("Send to {to} failed: {reason}")]
    SendFailed { to: String, reason: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Transport operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed for {host}")]
    AuthFailed { host: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classification stage errors. Every variant is recoverable by the next stage.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("No cached classification")]
    CacheMiss,

    #[error("Classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed classifier response: {0}")]
    Malformed(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Cache error: {0}")]
    Cache(#[from] DatabaseError),
}

/// Template rendering errors. Sends built from a failed render are skipped.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template {0} not found")]
    NotFound(String),

    #[error("Template {template} has unresolved placeholders: {placeholders:?}")]
    Unresolved {
        template: String,
        placeholders: Vec<String>,
    },

    #[error("Template store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Ledger write failed: {0}")]
    Ledger(DatabaseError),

    #[error("Mail fetch failed: {0}")]
    Fetch(#[from] TransportError),

    #[error("Configuration unavailable: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
