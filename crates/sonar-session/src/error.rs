//! Error types for the device session

use std::time::Duration;

use thiserror::Error;

use sonar_link::{ConfigurationError, LinkError};

/// Errors that can occur in the device session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Rejected link configuration; nothing was opened
    #[error("invalid link configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Transport failure
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// No device link is open
    #[error("not connected")]
    NotConnected,

    /// The link cannot carry commands (replay or simulation)
    #[error("link {0} is not writable")]
    NotWritable(String),

    /// A firmware update owns the link
    #[error("firmware update in progress")]
    Busy,

    /// Settings could not be read or written
    #[error("settings error: {0}")]
    Settings(String),

    /// Firmware update failure
    #[error("firmware update failed: {0}")]
    Firmware(#[from] FirmwareError),
}

/// Errors that can occur during a firmware update
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FirmwareError {
    /// Only serial links can be flashed
    #[error("firmware can only be flashed over a serial link, not {0}")]
    NotSerial(String),

    /// No open link to flash through
    #[error("no open link to flash")]
    NotConnected,

    /// Flashing tool could not be started
    #[error("failed to start {tool}: {reason}")]
    Spawn { tool: String, reason: String },

    /// Flashing tool exited with a failure status
    #[error("flashing tool exited with {0}")]
    ExitStatus(String),

    /// Flashing tool never printed any progress
    #[error("no progress reported by the flashing tool")]
    NoProgress,

    /// Flashing tool finished before reaching 100%
    #[error("flashing stopped at {0:.2}%")]
    Incomplete(f32),

    /// Flashing took longer than the configured limit
    #[error("flashing timed out after {0:?}")]
    Timeout(Duration),

    /// Reading the tool output failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Progress pattern failed to compile
    #[error("invalid progress pattern: {0}")]
    Pattern(String),
}
