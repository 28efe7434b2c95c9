//! Sonar Transport Links
//!
//! This crate describes and drives the transports a sonar device can be
//! reached over:
//!
//! - **Serial**: a USB/UART port at a configured baud rate
//! - **UDP**: a datagram socket connected to a device's host and port
//! - **File**: replay of a recorded byte stream, or a recording sink
//! - **Simulation**: an in-process virtual device
//!
//! [`LinkConfiguration`] is the validated, serializable description;
//! [`Link`] is the live connection built from one.
//!
//! # Example
//!
//! ```rust,no_run
//! use sonar_link::{Link, LinkConfiguration, LinkEvent};
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), sonar_link::LinkError> {
//! let (event_tx, mut event_rx) = mpsc::channel(64);
//! let config = LinkConfiguration::serial("/dev/ttyUSB0", 115200);
//! let mut link = Link::open(config, event_tx).await?;
//!
//! if let Some(LinkEvent::Data { bytes, .. }) = event_rx.recv().await {
//!     println!("received {} bytes", bytes.len());
//! }
//! link.close(std::time::Duration::from_millis(500)).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod link;

pub use config::{ConfigurationError, FileMode, LinkConfiguration, LinkType};
pub use error::LinkError;
pub use link::{Link, LinkEvent, LinkId, LinkStream};
