//! Error types for device detection

use thiserror::Error;

/// Errors that can occur during detection
#[derive(Debug, Error)]
pub enum DetectError {
    /// Failed to enumerate serial ports
    #[error("failed to enumerate ports: {0}")]
    EnumerationFailed(String),

    /// Failed to open a candidate transport
    #[error("failed to open {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    /// No valid reply before the probe deadline
    #[error("timeout probing {port}")]
    Timeout { port: String },

    /// I/O error during probe
    #[error("I/O error on {port}: {reason}")]
    IoError { port: String, reason: String },

    /// Candidate type cannot be probed
    #[error("cannot probe {0} links")]
    Unsupported(String),

    /// Serial port error
    #[error("serial port error: {0}")]
    SerialPort(#[from] serialport::Error),
}
