//! Transport error types.

use tether_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by connections and listeners.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

impl TransportError {
    /// Returns whether a fresh connection attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Timeout | TransportError::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::ConnectionClosed.is_retryable());
        assert!(!TransportError::NotConnected.is_retryable());
        assert!(!TransportError::HandshakeFailed("version".into()).is_retryable());
        assert!(!TransportError::Protocol(ProtocolError::InvalidLength(-1)).is_retryable());
    }
}
