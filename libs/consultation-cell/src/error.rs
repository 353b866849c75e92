use shared_models::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsultationError {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Access denied: {0}")]
    AuthorizationDenied(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("{resource} is full ({current}/{max})")]
    CapacityExceeded {
        resource: String,
        current: u64,
        max: u64,
    },

    #[error("Rate limit exceeded. Maximum {limit} acceptances per {window_seconds} seconds")]
    RateLimited { limit: u64, window_seconds: u64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Scheduler error: {0}")]
    SchedulerError(String),

    #[error("Dispatch error: {0}")]
    DispatchError(String),

    #[error("Redis connection error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Fieldless classification of [`ConsultationError`], used as a log label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthenticationRequired,
    AuthorizationDenied,
    PreconditionFailed,
    CapacityExceeded,
    RateLimited,
    NotFound,
    IntegrityViolation,
    Validation,
    PaymentFailed,
    Infrastructure,
}

impl ConsultationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsultationError::AuthenticationRequired => ErrorKind::AuthenticationRequired,
            ConsultationError::AuthorizationDenied(_) => ErrorKind::AuthorizationDenied,
            ConsultationError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            ConsultationError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            ConsultationError::RateLimited { .. } => ErrorKind::RateLimited,
            ConsultationError::NotFound(_) => ErrorKind::NotFound,
            ConsultationError::IntegrityViolation(_) => ErrorKind::IntegrityViolation,
            ConsultationError::ValidationError(_) => ErrorKind::Validation,
            ConsultationError::PaymentFailed(_) => ErrorKind::PaymentFailed,
            ConsultationError::StorageError(_)
            | ConsultationError::SchedulerError(_)
            | ConsultationError::DispatchError(_)
            | ConsultationError::RedisError(_)
            | ConsultationError::SerializationError(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        ConsultationError::AuthorizationDenied(reason.into())
    }

    pub fn precondition(reason: impl Into<String>) -> Self {
        ConsultationError::PreconditionFailed(reason.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        ConsultationError::StorageError(err.to_string())
    }
}

impl From<ConsultationError> for AppError {
    fn from(err: ConsultationError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::AuthenticationRequired => AppError::Auth(message),
            ErrorKind::AuthorizationDenied => AppError::Forbidden(message),
            ErrorKind::PreconditionFailed => AppError::Conflict(message),
            ErrorKind::CapacityExceeded => AppError::ServiceUnavailable(message),
            ErrorKind::RateLimited => AppError::TooManyRequests(message),
            ErrorKind::NotFound => AppError::NotFound(message),
            ErrorKind::IntegrityViolation => AppError::Unprocessable(message),
            ErrorKind::Validation => AppError::ValidationError(message),
            ErrorKind::PaymentFailed => AppError::PaymentRequired(message),
            ErrorKind::Infrastructure => {
                tracing::error!("Consultation infrastructure failure: {}", message);
                AppError::Internal("Operation failed".to_string())
            }
        }
    }
}
