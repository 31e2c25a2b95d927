use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    /// Device or caller authentication failed. The payload is the internal
    /// reason and is only ever logged, never returned to the caller.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid or expired token: {0}")]
    InvalidToken(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Origin not allowed: {0}")]
    OriginNotAllowed(String),

    #[error("Payload too large: {actual} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { limit: usize, actual: usize },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Backup is required but no archive destination is configured")]
    BackupDestinationMissing,

    #[error("Archive write failed: {0}")]
    ArchiveError(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
