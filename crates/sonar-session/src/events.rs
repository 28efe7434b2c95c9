//! Unified event stream for the device session
//!
//! Everything a front end needs to observe (connection changes, decoded
//! telemetry, configuration progress, firmware updates) is emitted through a
//! single event channel, in the order it happened.

use sonar_link::LinkConfiguration;
use sonar_protocol::{Distance, FirmwareVersion};

use crate::state::{ConfigKey, ConnectionState, DeviceIdentity};

/// Events emitted by the session actor
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------
    ConnectionStateChanged(ConnectionState),

    AutoDetectChanged(bool),

    /// The device link changed
    LinkChanged(LinkConfiguration),

    /// A recording sink was attached
    LogLinkChanged(LinkConfiguration),

    /// The detector or UDP finder found a device
    DeviceDiscovered(LinkConfiguration),

    // -------------------------------------------------------------------------
    // Device identity and telemetry
    // -------------------------------------------------------------------------
    IdentityChanged(DeviceIdentity),

    FirmwareVersion(FirmwareVersion),

    Distance(Distance),

    Profile {
        distance: Distance,
        /// Intensities normalized to `[0.0, 1.0]`
        points: Vec<f32>,
    },

    /// Degrees Celsius
    ProcessorTemperature(f32),

    /// Degrees Celsius
    PcbTemperature(f32),

    Voltage { millivolts: u16 },

    ModeAuto(bool),

    PingInterval(u16),

    GainSetting(u32),

    SpeedOfSound(u32),

    Range { scan_start: u32, scan_length: u32 },

    AsciiText(String),

    Nack { nacked_id: u16, message: String },

    // -------------------------------------------------------------------------
    // Protocol diagnostics
    // -------------------------------------------------------------------------
    /// A frame was dropped
    ParseError {
        error: String,
        /// Frames dropped since connecting
        total: u64,
    },

    /// A valid frame with an id outside the catalog
    UnknownMessage { id: u16 },

    // -------------------------------------------------------------------------
    // Configuration and streaming
    // -------------------------------------------------------------------------
    ParameterChanged { key: ConfigKey, value: u32 },

    ConvergenceDone,

    /// The device never matched the desired values; streaming starts anyway
    ConvergenceGaveUp { attempts: u32 },

    StreamingChanged(bool),

    // -------------------------------------------------------------------------
    // Firmware update
    // -------------------------------------------------------------------------
    /// Percent complete
    FlashProgress(f32),

    FlashComplete,

    FlashFailed(String),

    /// Recoverable error worth showing to the user
    Error(String),
}
