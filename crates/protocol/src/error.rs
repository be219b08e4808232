//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Framing errors
    /// A single NDJSON line exceeds the decoder's limit.
    #[error("line too long: {size} bytes exceeds maximum of {max} bytes")]
    LineTooLong {
        /// Bytes buffered for the pending line.
        size: usize,
        /// Maximum allowed line size.
        max: usize,
    },

    /// A line was not valid UTF-8.
    #[error("invalid utf-8 in line: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_maps_to_deserialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ProtocolError = err.into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_line_too_long_display() {
        let err = ProtocolError::LineTooLong { size: 10, max: 4 };
        assert_eq!(
            err.to_string(),
            "line too long: 10 bytes exceeds maximum of 4 bytes"
        );
    }
}
