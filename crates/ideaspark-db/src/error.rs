use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("resource not found")]
    NotFound,
    #[error("resource belongs to another user")]
    Forbidden,
    #[error("daily idea quota exhausted")]
    QuotaExceeded,
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("blocking task failed: {0}")]
    Task(String),
    #[error("database lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, DbError>;
