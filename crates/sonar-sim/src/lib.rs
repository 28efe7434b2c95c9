//! Ping Sonar Simulation Library
//!
//! This crate provides virtual sonar devices for exercising links, the
//! detector and device sessions without physical hardware:
//!
//! - **VirtualSonar**: device state and protocol-accurate replies
//! - **run_virtual_sonar_task**: drives a virtual sonar over any byte stream
//!   (e.g. one half of `tokio::io::duplex`)
//! - **run_virtual_sonar_udp** / **run_discovery_responder**: a networked
//!   sonar and its discovery endpoint on loopback sockets
//!
//! # Example
//!
//! ```rust
//! use sonar_protocol::{Message, MessageId};
//! use sonar_sim::VirtualSonar;
//!
//! let mut sonar = VirtualSonar::default();
//! let replies = sonar.process(&Message::Request { id: MessageId::DeviceId });
//! assert_eq!(replies, vec![Message::DeviceId { device_id: 1 }]);
//! ```

pub mod sonar;
pub mod task;

pub use sonar::{VirtualSonar, VirtualSonarConfig};
pub use task::{
    run_discovery_responder, run_virtual_sonar_task, run_virtual_sonar_udp, VirtualSonarCommand,
};
