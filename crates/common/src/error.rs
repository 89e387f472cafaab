use thiserror::Error;

use crate::types::ErrorKind;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error ({kind}): {message}")]
    Transport { kind: ErrorKind, message: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Failure classification for errors that cross the delivery boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Transport { kind, .. } => *kind,
            AppError::Redis(e) if e.is_timeout() => ErrorKind::Timeout,
            AppError::Redis(e) if e.is_io_error() || e.is_connection_dropped() => {
                ErrorKind::AdapterUnavailable
            }
            AppError::Redis(_) => ErrorKind::Transient,
            AppError::Config(_) | AppError::Validation(_) => ErrorKind::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = AppError::Transport {
            kind: ErrorKind::Timeout,
            message: "smtp".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(AppError::Validation("x".into()).kind(), ErrorKind::Permanent);
        assert_eq!(AppError::Config("x".into()).kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_display() {
        let err = AppError::Transport {
            kind: ErrorKind::Permanent,
            message: "chat not found".into(),
        };
        assert_eq!(err.to_string(), "Transport error (permanent): chat not found");
    }
}
