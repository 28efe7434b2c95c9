//! Virtual sonar actor tasks
//!
//! These tasks own a [`VirtualSonar`] and talk to a host over a byte stream
//! or a UDP socket. Each runs a select! loop that:
//! - Reads protocol frames and writes the sonar's replies
//! - Emits streamed telemetry at the sonar's ping interval
//! - Handles shutdown commands from a channel

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use sonar_protocol::{DiscoveryResponse, Message, PingCodec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::VirtualSonar;

/// Commands that can be sent to a virtual sonar task
#[derive(Debug, Clone)]
pub enum VirtualSonarCommand {
    /// Stop answering and end the task
    Shutdown,
}

fn ping_timer(sonar: &VirtualSonar) -> Interval {
    let mut timer = interval(Duration::from_millis(u64::from(sonar.ping_interval())));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

/// Decode every complete frame and collect the encoded replies
fn answer(sonar: &mut VirtualSonar, codec: &mut PingCodec, data: &[u8]) -> Vec<u8> {
    codec.push_bytes(data);
    let mut out = Vec::new();
    while let Some(result) = codec.next_frame() {
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Virtual sonar dropped corrupt frame: {}", e);
                continue;
            }
        };
        match Message::decode(&frame) {
            Ok(message) => {
                trace!("Virtual sonar {} got {:?}", sonar.device_id(), message);
                for reply in sonar.process(&message) {
                    out.extend(reply.encode(sonar.device_id(), frame.src_device_id));
                }
            }
            Err(e) => debug!("Virtual sonar could not decode frame: {}", e),
        }
    }
    out
}

/// Run a virtual sonar over a byte stream
///
/// Ends when the stream closes, on `Shutdown`, or when the command channel
/// is dropped.
pub async fn run_virtual_sonar_task<S>(
    mut stream: S,
    mut sonar: VirtualSonar,
    mut cmd_rx: mpsc::Receiver<VirtualSonarCommand>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = PingCodec::new();
    let mut buf = [0u8; 1024];
    let mut timer = ping_timer(&sonar);
    let mut timer_period = sonar.ping_interval();

    info!("Starting virtual sonar task (device {})", sonar.device_id());

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                let n = result?;
                if n == 0 {
                    debug!("Virtual sonar stream closed");
                    break;
                }
                let replies = answer(&mut sonar, &mut codec, &buf[..n]);
                if !replies.is_empty() {
                    stream.write_all(&replies).await?;
                    stream.flush().await?;
                }
                if sonar.ping_interval() != timer_period {
                    timer_period = sonar.ping_interval();
                    timer = ping_timer(&sonar);
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(VirtualSonarCommand::Shutdown) => {
                        info!("Shutdown requested for virtual sonar {}", sonar.device_id());
                        break;
                    }
                    None => {
                        debug!("Command channel closed for virtual sonar {}", sonar.device_id());
                        break;
                    }
                }
            }

            _ = timer.tick() => {
                if let Some(message) = sonar.next_streamed() {
                    stream.write_all(&message.encode(sonar.device_id(), 0)).await?;
                    stream.flush().await?;
                }
            }
        }
    }

    info!("Virtual sonar task ended for device {}", sonar.device_id());
    Ok(())
}

/// Run a virtual sonar behind a UDP socket
///
/// Replies go to the sender of each request; streamed telemetry goes to the
/// most recent peer.
pub async fn run_virtual_sonar_udp(
    socket: UdpSocket,
    mut sonar: VirtualSonar,
    mut cmd_rx: mpsc::Receiver<VirtualSonarCommand>,
) -> io::Result<()> {
    let mut codec = PingCodec::new();
    let mut buf = [0u8; 2048];
    let mut timer = ping_timer(&sonar);
    let mut timer_period = sonar.ping_interval();
    let mut peer: Option<SocketAddr> = None;

    info!("Starting virtual UDP sonar on {}", socket.local_addr()?);

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (n, from) = result?;
                if peer != Some(from) {
                    // A new host starts with a fresh parser
                    codec.clear();
                    peer = Some(from);
                }
                let replies = answer(&mut sonar, &mut codec, &buf[..n]);
                if !replies.is_empty() {
                    socket.send_to(&replies, from).await?;
                }
                if sonar.ping_interval() != timer_period {
                    timer_period = sonar.ping_interval();
                    timer = ping_timer(&sonar);
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(VirtualSonarCommand::Shutdown) | None => break,
                }
            }

            _ = timer.tick() => {
                if let Some(to) = peer {
                    if let Some(message) = sonar.next_streamed() {
                        if let Err(e) = socket.send_to(&message.encode(sonar.device_id(), 0), to).await {
                            warn!("Virtual UDP sonar failed to stream to {}: {}", to, e);
                        }
                    }
                }
            }
        }
    }

    info!("Virtual UDP sonar ended");
    Ok(())
}

/// Answer discovery broadcasts like a networked sonar
pub async fn run_discovery_responder(
    socket: UdpSocket,
    response: DiscoveryResponse,
    mut cmd_rx: mpsc::Receiver<VirtualSonarCommand>,
) -> io::Result<()> {
    let mut buf = [0u8; 256];
    let reply = response.to_datagram();

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (n, from) = result?;
                if buf[..n].starts_with(sonar_protocol::discovery::DISCOVERY_REQUEST) {
                    debug!("Discovery request from {}", from);
                    socket.send_to(&reply, from).await?;
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(VirtualSonarCommand::Shutdown) | None => break,
                }
            }
        }
    }

    Ok(())
}
