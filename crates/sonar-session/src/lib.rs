//! Ping Sonar Session Library
//!
//! This crate owns the conversation with one sonar device: it connects
//! links, decodes telemetry, keeps the device configured the way the user
//! wants and flashes firmware.
//!
//! # Architecture
//!
//! A single actor task ([`run_session_actor`]) holds all session state. It
//! receives [`SessionCommand`]s and reports everything through a unified
//! [`SessionEvent`] stream:
//!
//! - **Connection**: opens the requested link (or one found by the protocol
//!   detector while autodetect is on) and tees inbound bytes to a log file
//! - **Convergence**: once the device identifies itself, its stored
//!   configuration is pushed until the device reports matching values, then
//!   profile streaming starts
//! - **Housekeeping**: temperatures, voltage and mode are polled while the
//!   link is writable
//! - **Firmware**: the link is released and an external flashing tool is run,
//!   with its progress parsed from the tool's output
//!
//! Persistent settings go through a [`SettingsStore`]; [`JsonFileStore`]
//! keeps them in a JSON file.
//!
//! # Example
//!
//! ```rust,no_run
//! use sonar_link::LinkConfiguration;
//! use sonar_session::{run_session_actor, MemoryStore, SessionCommand, SessionEvent, SessionOptions};
//! use tokio::sync::mpsc;
//!
//! # async fn example() {
//! let (cmd_tx, cmd_rx) = mpsc::channel(64);
//! let (event_tx, mut event_rx) = mpsc::channel(256);
//! tokio::spawn(run_session_actor(cmd_rx, event_tx, MemoryStore::new(), SessionOptions::default()));
//!
//! let config = LinkConfiguration::udp("192.168.2.2", 9090);
//! cmd_tx.send(SessionCommand::ConnectLink { config, log: None }).await.unwrap();
//!
//! while let Some(event) = event_rx.recv().await {
//!     if let SessionEvent::Distance(distance) = event {
//!         println!("{} mm ({}%)", distance.distance, distance.confidence);
//!     }
//! }
//! # }
//! ```

pub mod actor;
pub mod control;
pub mod error;
pub mod events;
pub mod firmware;
pub mod settings;
pub mod state;

pub use actor::{run_session_actor, SessionCommand, SessionOptions};
pub use control::{convergence_step, rate_action, rate_messages, ConvergenceStep, RateAction};
pub use error::{FirmwareError, SessionError};
pub use events::SessionEvent;
pub use firmware::{
    default_tool_path, flash_arguments, run_flash_tool, serial_flash_target, FirmwareRequest,
    FlashTargetFn, FlasherConfig, ProgressParser,
};
pub use settings::{JsonFileStore, MemoryStore, SettingsStore, StoredSettings};
pub use state::{
    ConfigKey, ConfigParameter, ConnectionState, DeviceConfiguration, DeviceIdentity, DeviceState,
    SessionSnapshot,
};
