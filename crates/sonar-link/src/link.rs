//! Live transport links
//!
//! A [`Link`] owns exactly one OS transport resource. Opening a link spawns
//! an I/O task that forwards inbound bytes as [`LinkEvent::Data`] and writes
//! queued outbound bytes in order. Sends never block the caller.
//!
//! Closing drains pending writes (bounded by a deadline) before the resource
//! is released, and [`Link::close`] returns only after the I/O task has
//! dropped the port or socket. Callers can therefore reopen the same device
//! immediately after `close` returns.

use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sonar_sim::{run_virtual_sonar_task, VirtualSonar, VirtualSonarCommand, VirtualSonarConfig};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

use crate::config::{FileMode, LinkConfiguration, LinkType};
use crate::error::LinkError;

/// Read buffer size for all transports
const READ_BUFFER_LEN: usize = 4096;
/// Capacity of the in-memory pipe backing simulation links
const SIMULATION_PIPE_LEN: usize = 64 * 1024;
/// Grace period on top of a drain deadline before the I/O task is aborted
const CLOSE_GRACE: Duration = Duration::from_millis(200);
/// Poll period while waiting for the serial driver to empty its buffer
const DRAIN_POLL: Duration = Duration::from_millis(10);

static NEXT_LINK_ID: AtomicU32 = AtomicU32::new(1);

/// Unique identifier for a link instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u32);

impl LinkId {
    fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Notifications from a link's I/O task
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Bytes arrived from the transport
    Data { link: LinkId, bytes: Vec<u8> },
    /// The transport ended or failed without being asked to close
    Closed { link: LinkId, reason: String },
}

impl LinkEvent {
    pub fn link(&self) -> LinkId {
        match self {
            LinkEvent::Data { link, .. } | LinkEvent::Closed { link, .. } => *link,
        }
    }
}

/// Byte stream a link can drive
pub trait LinkStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Bytes accepted by the driver but not yet transmitted
    fn pending_output(&self) -> usize {
        0
    }
}

impl LinkStream for SerialStream {
    fn pending_output(&self) -> usize {
        self.bytes_to_write().map(|n| n as usize).unwrap_or(0)
    }
}

impl LinkStream for DuplexStream {}

impl LinkStream for File {}

#[derive(Debug)]
enum LinkCommand {
    Write(Vec<u8>),
    Drain {
        deadline: Instant,
        done: oneshot::Sender<bool>,
    },
    Close {
        deadline: Instant,
    },
}

/// State shared between a link handle and its I/O task
struct Shared {
    id: LinkId,
    name: String,
    event_tx: mpsc::Sender<LinkEvent>,
    open: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl Shared {
    async fn data(&self, bytes: &[u8]) -> bool {
        trace!("{} read {} bytes", self.name, bytes.len());
        self.event_tx
            .send(LinkEvent::Data {
                link: self.id,
                bytes: bytes.to_vec(),
            })
            .await
            .is_ok()
    }

    async fn finish(self, failure: Option<String>) {
        self.open.store(false, Ordering::SeqCst);
        match failure {
            Some(reason) => {
                warn!("{} closed: {}", self.name, reason);
                if let Ok(mut last) = self.last_error.lock() {
                    *last = Some(reason.clone());
                }
                let _ = self
                    .event_tx
                    .send(LinkEvent::Closed {
                        link: self.id,
                        reason,
                    })
                    .await;
            }
            None => debug!("{} released", self.name),
        }
    }
}

/// A live transport connection
pub struct Link {
    id: LinkId,
    config: LinkConfiguration,
    writable: bool,
    cmd_tx: Option<mpsc::UnboundedSender<LinkCommand>>,
    task: Option<JoinHandle<()>>,
    open: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    // Keeps a simulated device alive for as long as the link exists
    _simulation: Option<mpsc::Sender<VirtualSonarCommand>>,
}

impl Link {
    /// Validate the configuration, open its resource and start the I/O task
    pub async fn open(
        config: LinkConfiguration,
        event_tx: mpsc::Sender<LinkEvent>,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        let target = config.to_string();
        let open_failed = |e: &dyn fmt::Display| LinkError::OpenFailed {
            target: target.clone(),
            reason: e.to_string(),
        };

        let link = match config.link_type() {
            LinkType::Serial => {
                let stream =
                    tokio_serial::new(config.serial_port(), config.serial_baudrate())
                        .timeout(Duration::from_millis(100))
                        .open_native_async()
                        .map_err(|e| open_failed(&e))?;
                Self::from_stream(config, stream, true, event_tx)
            }
            LinkType::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .map_err(|e| open_failed(&e))?;
                socket
                    .connect((config.udp_host(), config.udp_port()))
                    .await
                    .map_err(|e| open_failed(&e))?;
                Self::from_socket(config, socket, event_tx)
            }
            LinkType::File => match config.file_mode() {
                Some(FileMode::Read) => {
                    let file = File::open(config.file_path())
                        .await
                        .map_err(|e| open_failed(&e))?;
                    Self::from_stream(config, file, false, event_tx)
                }
                Some(FileMode::Write) => {
                    let file = OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(config.file_path())
                        .await
                        .map_err(|e| open_failed(&e))?;
                    Self::spawn_stream(config, file, false, true, event_tx, None)
                }
                None => return Err(LinkError::Configuration(config.error())),
            },
            LinkType::Simulation => {
                let (link_side, device_side) = tokio::io::duplex(SIMULATION_PIPE_LEN);
                let (sim_tx, sim_rx) = mpsc::channel(8);
                let sonar = VirtualSonar::new(VirtualSonarConfig {
                    autostream: true,
                    ..Default::default()
                });
                tokio::spawn(async move {
                    if let Err(e) = run_virtual_sonar_task(device_side, sonar, sim_rx).await {
                        debug!("Simulated sonar ended: {}", e);
                    }
                });
                Self::spawn_stream(config, link_side, true, false, event_tx, Some(sim_tx))
            }
            LinkType::None | LinkType::Unknown(_) => {
                return Err(LinkError::Configuration(config.error()))
            }
        };

        info!("Opened {} ({})", link.config, link.id);
        Ok(link)
    }

    /// Wrap an already-open byte stream
    ///
    /// Inbound bytes are always read; `writable` controls whether `send` is
    /// accepted.
    pub fn from_stream<T: LinkStream>(
        config: LinkConfiguration,
        io: T,
        writable: bool,
        event_tx: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self::spawn_stream(config, io, true, writable, event_tx, None)
    }

    /// Wrap a connected UDP socket
    pub fn from_socket(
        config: LinkConfiguration,
        socket: UdpSocket,
        event_tx: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let (mut link, shared, cmd_rx) = Self::handle(config, true, event_tx);
        link.task = Some(tokio::spawn(run_socket(socket, shared, cmd_rx)));
        link
    }

    fn spawn_stream<T: LinkStream>(
        config: LinkConfiguration,
        io: T,
        readable: bool,
        writable: bool,
        event_tx: mpsc::Sender<LinkEvent>,
        simulation: Option<mpsc::Sender<VirtualSonarCommand>>,
    ) -> Self {
        let (mut link, shared, cmd_rx) = Self::handle(config, writable, event_tx);
        link.task = Some(tokio::spawn(run_stream(io, readable, shared, cmd_rx)));
        link._simulation = simulation;
        link
    }

    fn handle(
        config: LinkConfiguration,
        writable: bool,
        event_tx: mpsc::Sender<LinkEvent>,
    ) -> (Self, Shared, mpsc::UnboundedReceiver<LinkCommand>) {
        let id = LinkId::next();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let last_error = Arc::new(Mutex::new(None));
        let shared = Shared {
            id,
            name: format!("{} ({})", config, id),
            event_tx,
            open: open.clone(),
            last_error: last_error.clone(),
        };
        let link = Self {
            id,
            config,
            writable,
            cmd_tx: Some(cmd_tx),
            task: None,
            open,
            last_error,
            _simulation: None,
        };
        (link, shared, cmd_rx)
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn configuration(&self) -> &LinkConfiguration {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.cmd_tx.is_some() && self.open.load(Ordering::SeqCst)
    }

    pub fn is_writable(&self) -> bool {
        self.writable && self.is_open()
    }

    /// Last transport error, if the link failed
    pub fn error_string(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Queue bytes for transmission
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), LinkError> {
        if !self.writable {
            return Err(LinkError::NotWritable(self.config.to_string()));
        }
        let tx = self
            .cmd_tx
            .as_ref()
            .filter(|_| self.is_open())
            .ok_or_else(|| LinkError::Closed(self.config.to_string()))?;
        tx.send(LinkCommand::Write(bytes))
            .map_err(|_| LinkError::Closed(self.config.to_string()))
    }

    /// Wait until every queued write has reached the transport
    pub async fn drain(&self, limit: Duration) -> Result<(), LinkError> {
        let tx = self
            .cmd_tx
            .as_ref()
            .ok_or_else(|| LinkError::Closed(self.config.to_string()))?;
        let (done, rx) = oneshot::channel();
        let deadline = Instant::now() + limit;
        tx.send(LinkCommand::Drain { deadline, done })
            .map_err(|_| LinkError::Closed(self.config.to_string()))?;

        match timeout(limit + CLOSE_GRACE, rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) | Err(_) => Err(LinkError::DrainTimeout(self.config.to_string())),
            Ok(Err(_)) => Err(LinkError::Closed(self.config.to_string())),
        }
    }

    /// Drain pending writes, then release the resource
    ///
    /// Returns once the I/O task has exited. Calling it again is a no-op.
    pub async fn close(&mut self, limit: Duration) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(LinkCommand::Close {
                deadline: Instant::now() + limit,
            });
        }

        if timeout(limit + CLOSE_GRACE, &mut task).await.is_err() {
            warn!("{} did not close in time, aborting", self.config);
            task.abort();
            let _ = task.await;
        }
        self.open.store(false, Ordering::SeqCst);
        self._simulation = None;
        info!("Closed {} ({})", self.config, self.id);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("writable", &self.writable)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Flush a stream and wait for the driver to empty its buffer
async fn drain_stream<T: LinkStream>(io: &mut T, deadline: Instant) -> bool {
    match timeout_at(deadline, io.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!("Flush failed: {}", e);
            return false;
        }
        Err(_) => return false,
    }
    loop {
        if io.pending_output() == 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(DRAIN_POLL).await;
    }
}

async fn run_stream<T: LinkStream>(
    mut io: T,
    readable: bool,
    shared: Shared,
    mut cmd_rx: mpsc::UnboundedReceiver<LinkCommand>,
) {
    info!("Starting I/O task for {}", shared.name);
    let mut buf = vec![0u8; READ_BUFFER_LEN];

    let failure = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(LinkCommand::Write(bytes)) => {
                    trace!("{} write {} bytes", shared.name, bytes.len());
                    if let Err(e) = io.write_all(&bytes).await {
                        break Some(format!("write error: {}", e));
                    }
                }
                Some(LinkCommand::Drain { deadline, done }) => {
                    let _ = done.send(drain_stream(&mut io, deadline).await);
                }
                Some(LinkCommand::Close { deadline }) => {
                    if !drain_stream(&mut io, deadline).await {
                        warn!("{} closing with undrained output", shared.name);
                    }
                    let _ = io.shutdown().await;
                    break None;
                }
                None => break None,
            },

            result = io.read(&mut buf), if readable => match result {
                Ok(0) => break Some("end of stream".to_string()),
                Ok(n) => {
                    if !shared.data(&buf[..n]).await {
                        break None;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => break Some(format!("read error: {}", e)),
            },
        }
    };

    drop(io);
    shared.finish(failure).await;
}

async fn run_socket(
    socket: UdpSocket,
    shared: Shared,
    mut cmd_rx: mpsc::UnboundedReceiver<LinkCommand>,
) {
    info!("Starting I/O task for {}", shared.name);
    let mut buf = vec![0u8; READ_BUFFER_LEN];

    let failure = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(LinkCommand::Write(bytes)) => {
                    trace!("{} send {} bytes", shared.name, bytes.len());
                    if let Err(e) = socket.send(&bytes).await {
                        break Some(format!("send error: {}", e));
                    }
                }
                // Datagrams leave the socket synchronously
                Some(LinkCommand::Drain { done, .. }) => {
                    let _ = done.send(true);
                }
                Some(LinkCommand::Close { .. }) | None => break None,
            },

            result = socket.recv(&mut buf) => match result {
                Ok(n) => {
                    if n > 0 && !shared.data(&buf[..n]).await {
                        break None;
                    }
                }
                // ICMP port unreachable from an earlier send; the peer may come up later
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    debug!("{}: {}", shared.name, e);
                }
                Err(e) => break Some(format!("receive error: {}", e)),
            },
        }
    };

    drop(socket);
    shared.finish(failure).await;
}
