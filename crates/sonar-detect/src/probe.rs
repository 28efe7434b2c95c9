//! Protocol probing for device detection
//!
//! A probe writes canonical query frames to a candidate transport and waits,
//! bounded by a timeout, for any structurally valid, checksum-verified Ping
//! frame in return. The candidate is always released before the probe
//! returns; only its configuration is reported.

use std::time::Duration;

use sonar_link::{LinkConfiguration, LinkType};
use sonar_protocol::{Message, MessageId, PingCodec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, trace, warn};

use crate::error::DetectError;

/// Result of a successful probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Configuration that reached the device
    pub config: LinkConfiguration,
    /// Device id the reply came from
    pub src_device_id: u8,
    /// First decoded reply
    pub reply: Message,
}

/// Configuration for probing
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Time to wait for a reply after writing the probe
    pub timeout: Duration,
    /// Total time allowed for opening a busy serial port
    pub open_timeout: Duration,
    /// Delay between open attempts
    pub open_retry: Duration,
    /// Delay after opening before the probe is written
    pub settle: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            open_timeout: Duration::from_millis(1000),
            open_retry: Duration::from_millis(100),
            settle: Duration::from_millis(50),
        }
    }
}

/// Query frames written to every candidate
pub fn probe_frames() -> Vec<u8> {
    let mut bytes = Message::GeneralRequest {
        requested_id: MessageId::FirmwareVersion.as_u16(),
    }
    .encode(0, 0);
    bytes.extend(
        Message::Request {
            id: MessageId::DeviceId,
        }
        .encode(0, 0),
    );
    bytes
}

/// Ping device prober
#[derive(Debug, Clone, Default)]
pub struct DeviceProber {
    config: ProbeConfig,
}

impl DeviceProber {
    /// Create a new prober with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a prober with custom configuration
    pub fn with_config(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe a stream for a Ping device
    ///
    /// Returns the source id and first decoded reply.
    pub async fn probe<S>(&self, stream: &mut S) -> Option<(u8, Message)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("Sending Ping probe");
        if let Err(e) = stream.write_all(&probe_frames()).await {
            warn!("Failed to write probe: {}", e);
            return None;
        }
        let _ = stream.flush().await;

        let deadline = Instant::now() + self.config.timeout;
        let mut codec = PingCodec::new();
        let mut buf = [0u8; 256];

        loop {
            match timeout_at(deadline, stream.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    trace!("Stream closed during probe");
                    return None;
                }
                Ok(Ok(n)) => {
                    codec.push_bytes(&buf[..n]);
                    if let Some(found) = first_reply(&mut codec) {
                        return Some(found);
                    }
                }
                Ok(Err(e)) => {
                    trace!("Probe read error: {}", e);
                    return None;
                }
                Err(_) => {
                    trace!("Probe timeout");
                    return None;
                }
            }
        }
    }

    /// Probe any candidate configuration
    pub async fn probe_configuration(
        &self,
        config: &LinkConfiguration,
    ) -> Result<ProbeResult, DetectError> {
        match config.link_type() {
            LinkType::Serial => {
                self.probe_port(config.serial_port(), config.serial_baudrate())
                    .await
            }
            LinkType::Udp => self.probe_udp(config.udp_host(), config.udp_port()).await,
            other => Err(DetectError::Unsupported(other.name().to_string())),
        }
    }

    /// Open a serial port, probe it, and close it again
    pub async fn probe_port(
        &self,
        port_name: &str,
        baud_rate: u32,
    ) -> Result<ProbeResult, DetectError> {
        debug!("Probing {} at {} baud", port_name, baud_rate);

        let mut stream = self.open_serial(port_name, baud_rate).await?;

        // Give the port a moment to settle
        sleep(self.config.settle).await;

        let found = self.probe(&mut stream).await;
        drop(stream);

        let (src_device_id, reply) = found.ok_or_else(|| DetectError::Timeout {
            port: port_name.to_string(),
        })?;
        info!("Found Ping device {} on {}", src_device_id, port_name);
        Ok(ProbeResult {
            config: LinkConfiguration::serial(port_name, baud_rate),
            src_device_id,
            reply,
        })
    }

    /// Send the probe to a UDP endpoint and wait for a reply
    pub async fn probe_udp(&self, host: &str, port: u16) -> Result<ProbeResult, DetectError> {
        let target = format!("{}:{}", host, port);
        debug!("Probing UDP {}", target);
        let io_error = |e: std::io::Error| DetectError::IoError {
            port: target.clone(),
            reason: e.to_string(),
        };

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(io_error)?;
        socket.connect((host, port)).await.map_err(io_error)?;
        socket.send(&probe_frames()).await.map_err(io_error)?;

        let deadline = Instant::now() + self.config.timeout;
        let mut codec = PingCodec::new();
        let mut buf = [0u8; 2048];
        let found = loop {
            match timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    codec.push_bytes(&buf[..n]);
                    if let Some(found) = first_reply(&mut codec) {
                        break Some(found);
                    }
                }
                Ok(Err(e)) => {
                    trace!("UDP probe error on {}: {}", target, e);
                    break None;
                }
                Err(_) => break None,
            }
        };

        let (src_device_id, reply) = found.ok_or_else(|| DetectError::Timeout {
            port: target.clone(),
        })?;
        info!("Found Ping device {} at {}", src_device_id, target);
        Ok(ProbeResult {
            config: LinkConfiguration::udp(host, port),
            src_device_id,
            reply,
        })
    }

    /// Open a serial port, retrying while it is busy until the open timeout
    async fn open_serial(
        &self,
        port_name: &str,
        baud_rate: u32,
    ) -> Result<tokio_serial::SerialStream, DetectError> {
        let deadline = Instant::now() + self.config.open_timeout;
        loop {
            match tokio_serial::new(port_name, baud_rate)
                .timeout(Duration::from_millis(100))
                .open_native_async()
            {
                Ok(stream) => return Ok(stream),
                Err(e) if Instant::now() + self.config.open_retry < deadline => {
                    trace!("Open {} failed, retrying: {}", port_name, e);
                    sleep(self.config.open_retry).await;
                }
                Err(e) => {
                    debug!("Failed to open {}: {}", port_name, e);
                    return Err(DetectError::OpenFailed {
                        port: port_name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

/// First checksum-valid frame that decodes, skipping corrupt input
fn first_reply(codec: &mut PingCodec) -> Option<(u8, Message)> {
    while let Some(result) = codec.next_frame() {
        match result {
            Ok(frame) => match Message::decode(&frame) {
                Ok(message) => return Some((frame.src_device_id, message)),
                Err(e) => trace!("Undecodable probe reply: {}", e),
            },
            Err(e) => trace!("Corrupt probe reply: {}", e),
        }
    }
    None
}
