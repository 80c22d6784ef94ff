//! User directory error types.

use thiserror::Error;

/// Result type for user directory operations.
pub type UserResult<T> = Result<T, UserError>;

/// Errors that can occur in the user directory.
///
/// A missing record is never an error: lookups return `Option` and deletes
/// return `bool`.
#[derive(Debug, Error)]
pub enum UserError {
    /// Input is missing or malformed.
    #[error("{0}")]
    Validation(String),

    /// A uniqueness rule would be broken (e.g. email already registered).
    #[error("{0}")]
    Conflict(String),

    /// The backing store did not answer in time.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Backing store failure.
    #[error("storage error: {0}")]
    Storage(sqlx::Error),

    /// Anything else (hashing failures, exhausted id generation).
    #[error("internal error: {0}")]
    Internal(String),
}

impl UserError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<sqlx::Error> for UserError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => Self::Unavailable("timed out acquiring connection".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict("Email is already registered.".into())
            }
            _ => Self::Storage(err),
        }
    }
}

impl From<bcrypt::BcryptError> for UserError {
    fn from(err: bcrypt::BcryptError) -> Self {
        Self::Internal(format!("password hashing failed: {err}"))
    }
}

impl From<tokio::task::JoinError> for UserError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {err}"))
    }
}
