//! Ping Protocol Library
//!
//! This crate provides framing, parsing and encoding for the binary Ping
//! protocol spoken by Blue Robotics sonar devices, plus the UDP discovery
//! sub-protocol used to find Ping360 units on a network.
//!
//! # Architecture
//!
//! - [`frame`]: the wire frame, its checksum, and a streaming parser that
//!   resynchronizes after corrupt input
//! - [`message`]: the message catalog, mapping each id to typed fields
//! - [`discovery`]: broadcast discovery request and reply parsing
//! - [`device`]: device families
//!
//! # Example
//!
//! ```rust
//! use sonar_protocol::{Message, MessageId, PingCodec};
//!
//! let bytes = Message::Request { id: MessageId::FirmwareVersion }.encode(0, 1);
//!
//! let mut codec = PingCodec::new();
//! codec.push_bytes(&bytes);
//!
//! let frame = codec.next_frame().unwrap().unwrap();
//! let message = Message::decode(&frame).unwrap();
//! assert_eq!(message, Message::Request { id: MessageId::FirmwareVersion });
//! ```

pub mod device;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod message;

pub use device::DeviceType;
pub use discovery::{DiscoveryResponse, COMMAND_PORT, DISCOVERY_PORT};
pub use error::ParseError;
pub use frame::{checksum, Frame, PingCodec, MAX_PAYLOAD_LEN};
pub use message::{Distance, FirmwareVersion, GeneralInfo, Message, MessageId, Profile};

/// Highest telemetry rate a device accepts, in Hz
pub const MAX_PING_FREQUENCY_HZ: f32 = 50.0;
