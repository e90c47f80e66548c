use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Distinguishes between retryable and permanent errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Permanent,
}

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(String),

    #[error("send timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal server error")]
    Internal,
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Database(e.to_string())
    }
}

impl AppError {
    /// Returns whether the whole operation is safe to retry.
    ///
    /// Validation failures (`BadRequest`) are permanent and must never be
    /// retried automatically; transport-level failures are transient and a
    /// caller may resubmit the same operation as a fresh attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::Timeout { .. }
                | AppError::ServiceUnavailable(_)
                | AppError::Internal
        )
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_retryable() {
            ErrorKind::Retryable
        } else {
            ErrorKind::Permanent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_permanent() {
        let err = AppError::BadRequest("empty content".into());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn transport_errors_are_retryable() {
        assert!(AppError::Database("connection reset".into()).is_retryable());
        assert!(AppError::Timeout { timeout_ms: 5000 }.is_retryable());
        assert_eq!(
            AppError::ServiceUnavailable("store down".into()).kind(),
            ErrorKind::Retryable
        );
    }
}
