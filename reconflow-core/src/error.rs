use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Deadlock or serialization failure; the transaction can be retried.
    #[error("Transient database conflict: {0}")]
    Conflict(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Rejected caller input (empty strategy, unknown step, bad filter).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ReconError>;

/// SQLSTATE codes for `deadlock_detected` and `serialization_failure`.
const RETRYABLE_SQLSTATES: [&str; 2] = ["40P01", "40001"];

pub fn is_retryable_sqlstate(code: &str) -> bool {
    RETRYABLE_SQLSTATES.contains(&code)
}

impl From<sqlx::Error> for ReconError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err
            && db.code().is_some_and(|code| is_retryable_sqlstate(&code))
        {
            return ReconError::Conflict(err.to_string());
        }
        ReconError::Database(err)
    }
}

impl ReconError {
    /// Whether retrying the whole transaction may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconError::Conflict(_))
    }
}
