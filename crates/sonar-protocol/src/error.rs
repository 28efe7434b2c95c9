//! Error types for Ping protocol parsing

use thiserror::Error;

/// Errors that can occur while parsing protocol data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Declared payload length exceeds the protocol bound
    #[error("invalid payload length {declared} (max {max})")]
    InvalidLength { declared: usize, max: usize },

    /// Checksum trailer does not match the frame contents
    #[error("checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// Payload is shorter than the field layout of its message id
    #[error("payload too short for message {id}: need {expected} bytes, got {actual}")]
    PayloadTooShort {
        id: u16,
        expected: usize,
        actual: usize,
    },

    /// Discovery reply could not be understood
    #[error("invalid discovery response: {0}")]
    InvalidDiscovery(String),
}
