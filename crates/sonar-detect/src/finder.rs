//! UDP broadcast finder for networked sonars
//!
//! Broadcasts the discovery request on a fixed interval and listens for
//! replies on the same socket. Unlike the serial detector it never stops at
//! the first match: every recognized sender address is reported once per run.
//! Reports never wait on a full event channel, so `stop` always completes.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use sonar_link::LinkConfiguration;
use sonar_protocol::discovery::DISCOVERY_REQUEST;
use sonar_protocol::{DeviceType, DiscoveryResponse, COMMAND_PORT, DISCOVERY_PORT};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::detector::DetectorEvent;

/// Name given to configurations synthesized from discovery replies
pub const PING360_LINK_NAME: &str = "Ping360 Port";

/// UDP finder configuration
#[derive(Debug, Clone)]
pub struct FinderConfig {
    /// Time between discovery broadcasts
    pub interval: Duration,
    /// Broadcast destinations
    pub targets: Vec<SocketAddr>,
    /// Local address to bind
    pub bind: SocketAddr,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            targets: vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DISCOVERY_PORT),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 2, 255)), DISCOVERY_PORT),
            ],
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }
}

/// Configuration for a recognized discovery reply
pub fn configuration_for(reply: &DiscoveryResponse, sender: IpAddr) -> Option<LinkConfiguration> {
    match reply.device_type() {
        Some(DeviceType::Ping360) => {
            let mut config = LinkConfiguration::udp(&sender.to_string(), COMMAND_PORT);
            config.set_name(PING360_LINK_NAME);
            Some(config)
        }
        _ => None,
    }
}

/// Run the finder until `stop` fires or the event receiver goes away
pub async fn run_udp_finder(
    socket: UdpSocket,
    config: FinderConfig,
    event_tx: mpsc::Sender<DetectorEvent>,
    mut stop: oneshot::Receiver<()>,
) -> io::Result<()> {
    socket.set_broadcast(true)?;
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut reported: HashSet<SocketAddr> = HashSet::new();
    let mut buf = [0u8; 512];

    info!("UDP finder started on {}", socket.local_addr()?);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for target in &config.targets {
                    if let Err(e) = socket.send_to(DISCOVERY_REQUEST, target).await {
                        // Broadcast to an absent subnet is not fatal
                        trace!("Discovery to {} failed: {}", target, e);
                    }
                }
            }

            ready = socket.readable() => {
                ready?;
                // Drain everything pending before sleeping again
                loop {
                    let (n, from) = match socket.try_recv_from(&mut buf) {
                        Ok(received) => received,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("UDP finder receive error: {}", e);
                            break;
                        }
                    };
                    if buf[..n].starts_with(DISCOVERY_REQUEST) {
                        // Our own broadcast looped back
                        continue;
                    }
                    let reply = match DiscoveryResponse::parse(&buf[..n]) {
                        Ok(reply) => reply,
                        Err(e) => {
                            debug!("Ignoring datagram from {}: {}", from, e);
                            continue;
                        }
                    };
                    let Some(found) = configuration_for(&reply, from.ip()) else {
                        trace!("Unrecognized device {:?} at {}", reply.device_name, from);
                        continue;
                    };
                    if reported.contains(&from) {
                        continue;
                    }
                    match event_tx.try_send(DetectorEvent::ConnectionDetected(found)) {
                        Ok(()) => {
                            info!("Found {} at {}", reply.device_name, from);
                            reported.insert(from);
                        }
                        // Not marked as reported, so the next reply retries it
                        Err(TrySendError::Full(_)) => {
                            debug!("Detector events backed up, dropping reply from {}", from);
                        }
                        Err(TrySendError::Closed(_)) => return Ok(()),
                    }
                }
            }

            _ = &mut stop => {
                debug!("UDP finder stop requested");
                break;
            }
        }
    }

    info!("UDP finder stopped after {} device(s)", reported.len());
    Ok(())
}

/// Handle to a running UDP finder task
#[derive(Debug)]
pub struct UdpFinder {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<()>>,
}

impl UdpFinder {
    /// Bind the finder socket and start broadcasting
    pub async fn spawn(
        config: FinderConfig,
        event_tx: mpsc::Sender<DetectorEvent>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.bind).await?;
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_udp_finder(socket, config, event_tx, stop_rx));
        Ok(Self {
            stop: Some(stop),
            task,
        })
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop broadcasting and wait for the task to release its socket
    pub async fn stop(mut self) -> io::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

impl Drop for UdpFinder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
