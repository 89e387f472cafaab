//! Channel transports.
//!
//! Each transport wraps one external protocol behind [`ChannelTransport`]:
//! - Telegram Bot API (HTTP + long-poll session)
//! - Email (SMTP)
//! - SMS (SMPP 3.4 session)

pub mod email;
pub mod smpp;
pub mod telegram;

pub use email::EmailTransport;
pub use smpp::SmsTransport;
pub use telegram::TelegramTransport;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use herald_common::error::AppError;
use herald_common::types::{Channel, ErrorKind, NotificationPayload};

/// Failure of a single send, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited, retry after {retry_after:?}: {message}")]
    RateLimited {
        message: String,
        retry_after: Duration,
    },

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Transient(_) | TransportError::RateLimited { .. } => {
                ErrorKind::Transient
            }
            TransportError::Permanent(_) => ErrorKind::Permanent,
            TransportError::Timeout(_) => ErrorKind::Timeout,
            TransportError::Unavailable(_) => ErrorKind::AdapterUnavailable,
        }
    }

    /// Minimum delay the remote side asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        AppError::Transport {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outbound capability for one channel.
///
/// Implementations own their connection state. `open` and `close` are driven
/// by the channel's supervisor; `send` is called concurrently by the
/// channel's workers.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn channel(&self) -> Channel;

    /// Establish (or re-establish) the underlying session.
    async fn open(&self) -> Result<(), TransportError>;

    /// Release the session. Must be safe to call when already closed.
    async fn close(&self);

    /// Whether the session is currently usable.
    fn is_open(&self) -> bool;

    /// Keep-alive probe; an error marks the session down.
    async fn heartbeat(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Deliver one message to one recipient.
    async fn send(
        &self,
        recipient: &str,
        payload: &NotificationPayload,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(TransportError::Transient("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(TransportError::Permanent("x".into()).kind(), ErrorKind::Permanent);
        assert_eq!(TransportError::Timeout("x".into()).kind(), ErrorKind::Timeout);
        assert_eq!(
            TransportError::Unavailable("x".into()).kind(),
            ErrorKind::AdapterUnavailable
        );
        let limited = TransportError::RateLimited {
            message: "429".into(),
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(limited.kind(), ErrorKind::Transient);
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_into_app_error() {
        let err: AppError = TransportError::Permanent("chat not found".into()).into();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
