//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering every way an envelope can fail to decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message had no tag byte at all.
    #[error("empty message: missing type tag")]
    EmptyMessage,

    /// The tag byte does not name a known message kind.
    #[error("unknown message tag: {0:#04x}")]
    UnknownTag(u8),

    /// A resize payload was not exactly four bytes.
    #[error("malformed resize payload: expected {expected} bytes, got {got}")]
    MalformedResize {
        /// Required payload length.
        expected: usize,
        /// Actual payload length received.
        got: usize,
    },

    /// A toast payload was not valid UTF-8.
    #[error("toast payload is not valid UTF-8")]
    InvalidToastText,
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnknownTag(0x7f);
        assert_eq!(err.to_string(), "unknown message tag: 0x7f");

        let err = ProtocolError::MalformedResize {
            expected: 4,
            got: 3,
        };
        assert_eq!(
            err.to_string(),
            "malformed resize payload: expected 4 bytes, got 3"
        );
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
