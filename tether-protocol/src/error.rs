//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing packets or reassembling them off the wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid declared packet length: {0}")]
    InvalidLength(i32),

    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: i32, theirs: i32 },

    #[error("unexpected opcode: {0}")]
    UnexpectedOpcode(u8),

    #[error("HTTP client rejected (HTTP support disabled)")]
    HttpRejected,

    #[error("HTTP request line too long: {0} bytes")]
    HttpLineTooLong(usize),

    #[error("read past end of buffer: need {needed} bytes, {available} available")]
    ReadPastEnd { needed: usize, available: usize },

    #[error("buffer is in the wrong mode for this operation")]
    WrongMode,

    #[error("string too long for wire encoding: {0} bytes")]
    StringTooLong(usize),

    #[error("invalid UTF-8 in string payload")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Returns whether this error indicates a violation by the remote peer.
    ///
    /// Violations are always fatal to the connection. The remaining variants
    /// indicate local caller bugs (wrong buffer mode, oversized string) and
    /// never originate from the wire.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidLength(_)
                | ProtocolError::PacketTooLarge { .. }
                | ProtocolError::VersionMismatch { .. }
                | ProtocolError::UnexpectedOpcode(_)
                | ProtocolError::HttpRejected
                | ProtocolError::HttpLineTooLong(_)
                | ProtocolError::ReadPastEnd { .. }
                | ProtocolError::InvalidUtf8
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_classification() {
        assert!(ProtocolError::InvalidLength(-1).is_violation());
        assert!(ProtocolError::PacketTooLarge { size: 1, max: 0 }.is_violation());
        assert!(ProtocolError::HttpRejected.is_violation());
        assert!(ProtocolError::HttpLineTooLong(9000).is_violation());
        assert!(ProtocolError::InvalidUtf8.is_violation());

        assert!(!ProtocolError::WrongMode.is_violation());
        assert!(!ProtocolError::StringTooLong(70_000).is_violation());
    }

    #[test]
    fn test_display() {
        let err = ProtocolError::PacketTooLarge {
            size: 20_000_000,
            max: 16_777_216,
        };
        assert!(err.to_string().contains("20000000"));

        let err = ProtocolError::VersionMismatch { ours: 5, theirs: 4 };
        let msg = err.to_string();
        assert!(msg.contains('5') && msg.contains('4'));
    }
}
