//! Error types for transport links

use thiserror::Error;

use crate::config::ConfigurationError;

/// Errors that can occur opening or driving a link
#[derive(Debug, Error)]
pub enum LinkError {
    /// Configuration failed validation, nothing was opened
    #[error("invalid link configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    /// The OS resource could not be opened
    #[error("failed to open {target}: {reason}")]
    OpenFailed { target: String, reason: String },

    /// Writes are not accepted by this link type or mode
    #[error("link {0} is not writable")]
    NotWritable(String),

    /// The link has already been closed
    #[error("link {0} is closed")]
    Closed(String),

    /// Pending writes did not reach the wire in time
    #[error("timed out draining {0}")]
    DrainTimeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
