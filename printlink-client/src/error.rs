//! Client error types.

use crate::bridge::Cancelled;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] printlink_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("reconnect failed after {attempts} attempts: {source}")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("request timeout")]
    Timeout,
}

impl From<Cancelled> for ClientError {
    fn from(_: Cancelled) -> Self {
        ClientError::Cancelled
    }
}

impl ClientError {
    /// Returns whether retrying the operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::ReconnectExhausted { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(ClientError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_retryable());
        assert!(!ClientError::Cancelled.is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());
    }

    #[test]
    fn test_cancelled_conversion() {
        let err: ClientError = Cancelled.into();
        assert!(matches!(err, ClientError::Cancelled));
    }

    #[test]
    fn test_reconnect_exhausted_display() {
        let err = ClientError::ReconnectExhausted {
            attempts: 3,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("3 attempts"));
    }
}
