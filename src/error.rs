// Error types shared by every service in the crate

use thiserror::Error;

/// Result alias used by the services
pub type Result<T> = std::result::Result<T, AdminError>;

#[derive(Error, Debug)]
pub enum AdminError {
    /// SQLite failure (wraps rusqlite::Error)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Requested row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// One or more input fields failed validation
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Operation would break a uniqueness or reference rule
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Webhook signature header missing, malformed, stale or wrong
    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    /// Payment provider sent a subscription status we do not know
    #[error("Unknown subscription status: {0}")]
    UnknownStatus(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Server-side failure outside the database (e.g. a poisoned connection lock)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AdminError {
    pub fn not_found(what: &str, id: &str) -> Self {
        AdminError::NotFound(format!("{} {}", what, id))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AdminError::Validation(vec![message.into()])
    }

    /// True when the wrapped SQLite error is a constraint violation
    /// (unique key, foreign key, check)
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            AdminError::Database(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

impl From<config::ConfigError> for AdminError {
    fn from(err: config::ConfigError) -> Self {
        AdminError::Config(err.to_string())
    }
}
