//! Ping Sonar Detection Library
//!
//! This crate finds Ping sonars on serial ports and UDP networks:
//!
//! - [`PortScanner`] enumerates serial ports, skipping a blocklist of
//!   virtual/system ports
//! - [`DeviceProber`] sends query frames and waits for a valid reply
//! - [`ProtocolDetector`] repeats scan passes on a worker task until a
//!   device answers
//! - [`UdpFinder`] broadcasts discovery requests and reports every
//!   networked sonar that replies
//!
//! # Example
//!
//! ```rust,no_run
//! use sonar_detect::{DetectorConfig, DetectorEvent, ProtocolDetector};
//! use tokio::sync::mpsc;
//!
//! # async fn example() {
//! let (event_tx, mut event_rx) = mpsc::channel(16);
//! let detector = ProtocolDetector::new(DetectorConfig::default(), event_tx);
//! detector.scan();
//!
//! while let Some(event) = event_rx.recv().await {
//!     if let DetectorEvent::ConnectionDetected(config) = event {
//!         println!("Found sonar on {}", config);
//!     }
//! }
//! # }
//! ```

pub mod detector;
pub mod error;
pub mod finder;
pub mod probe;
pub mod scanner;

pub use detector::{
    candidates, device_probe, run_pass, serial_candidates, CandidatesFn, DetectorConfig,
    DetectorEvent, PassOutcome, ProbeFn, ProbeFuture, ProtocolDetector,
};
pub use error::DetectError;
pub use finder::{run_udp_finder, FinderConfig, UdpFinder, PING360_LINK_NAME};
pub use probe::{probe_frames, DeviceProber, ProbeConfig, ProbeResult};
pub use scanner::{PortScanner, ScannerConfig, SerialPortInfo, UsbId, DEFAULT_BLOCKLIST};
