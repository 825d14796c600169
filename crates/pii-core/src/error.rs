use thiserror::Error;

/// Error kinds shared across every service in the pipeline.
///
/// Mirrors the classification in the error handling design: shape errors are
/// never retried, transient-transport errors are retried by
/// [`crate::retry::with_backoff`], and the rest are terminal for the call
/// that raised them.
#[derive(Debug, Error)]
pub enum PiiError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("transient transport error: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PiiError {
    /// Short SCREAMING_SNAKE_CASE tag, used as the `event` field on the
    /// structured log record every handler emits for its outcome.
    pub fn code(&self) -> &'static str {
        match self {
            PiiError::Config(_) => "CONFIG_ERROR",
            PiiError::Shape(_) => "SHAPE_ERROR",
            PiiError::Transient(_) => "TRANSIENT_ERROR",
            PiiError::NotFound(_) => "NOT_FOUND",
            PiiError::PermissionDenied(_) => "PERMISSION_DENIED",
            PiiError::Unauthorized => "UNAUTHORIZED",
            PiiError::Serialization(_) => "SERIALIZATION_ERROR",
            PiiError::Io(_) => "IO_ERROR",
            PiiError::Database(_) => "DATABASE_ERROR",
            PiiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// True for the error kinds the retry helper is allowed to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PiiError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, PiiError>;
