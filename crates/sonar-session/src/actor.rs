//! Device Session Actor
//!
//! This module provides the async actor that owns the device link. All link
//! traffic, detection results, timers and user commands are processed here,
//! so front ends only send commands and observe events.
//!
//! # Architecture
//!
//! The actor receives commands through a channel and emits events through
//! another. Internally it also listens to:
//! - Link events (inbound bytes, unexpected close) from the device link and
//!   the optional logging link
//! - Detector and UDP finder events while autodetect is on
//! - The convergence and housekeeping timers, each of which exists only
//!   while it is needed
//! - Completion of a running firmware update
//!
//! # Example
//!
//! ```rust,ignore
//! use sonar_session::{run_session_actor, MemoryStore, SessionCommand, SessionOptions};
//! use tokio::sync::mpsc;
//!
//! let (cmd_tx, cmd_rx) = mpsc::channel(64);
//! let (event_tx, mut event_rx) = mpsc::channel(256);
//!
//! tokio::spawn(run_session_actor(cmd_rx, event_tx, MemoryStore::new(), SessionOptions::default()));
//! cmd_tx.send(SessionCommand::SetAutoDetect(true)).await?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use sonar_detect::{
    device_probe, serial_candidates, CandidatesFn, DetectorConfig, DetectorEvent, FinderConfig,
    ProbeFn, ProtocolDetector, UdpFinder,
};
use sonar_link::{FileMode, Link, LinkConfiguration, LinkEvent};
use sonar_protocol::{Frame, Message, MessageId, PingCodec};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::control::{convergence_step, rate_action, rate_messages, ConvergenceStep, RateAction};
use crate::error::{FirmwareError, SessionError};
use crate::events::SessionEvent;
use crate::firmware::{
    flash_arguments, run_flash_tool, serial_flash_target, FirmwareRequest, FlashTargetFn,
    FlasherConfig,
};
use crate::settings::SettingsStore;
use crate::state::{
    ConfigKey, ConnectionState, DeviceConfiguration, DeviceIdentity, DeviceState,
    SessionSnapshot,
};

/// Messages requested right after a link opens
const INITIAL_REQUESTS: [MessageId; 5] = [
    MessageId::ModeAuto,
    MessageId::Profile,
    MessageId::FirmwareVersion,
    MessageId::DeviceId,
    MessageId::SpeedOfSound,
];

/// Messages polled by the housekeeping timer
const HOUSEKEEPING_REQUESTS: [MessageId; 4] = [
    MessageId::ProcessorTemperature,
    MessageId::PcbTemperature,
    MessageId::Voltage5,
    MessageId::ModeAuto,
];

/// Session actor options
#[derive(Clone)]
pub struct SessionOptions {
    /// Scan for devices from startup
    pub autodetect: bool,
    /// Also broadcast for networked sonars while autodetecting
    pub udp_discovery: Option<FinderConfig>,
    pub detector: DetectorConfig,
    /// Replaces serial port enumeration as the detector's candidate source
    pub candidates: Option<CandidatesFn>,
    /// Replaces the protocol probe used by the detector
    pub probe: Option<ProbeFn>,
    /// Time between configuration convergence passes
    pub convergence_interval: Duration,
    /// Passes sending corrections before convergence gives up
    pub max_convergence_attempts: u32,
    /// Time between temperature/voltage/mode polls
    pub housekeeping_interval: Duration,
    /// Bound on draining a link before it is released
    pub close_timeout: Duration,
    /// Where to record inbound bytes when no explicit log target is given
    pub log_directory: Option<PathBuf>,
    pub flasher: FlasherConfig,
    /// Replaces the serial-only check that picks the port to flash
    pub flash_target: Option<FlashTargetFn>,
    /// Device id this host sends from
    pub host_device_id: u8,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            autodetect: false,
            udp_discovery: None,
            detector: DetectorConfig::default(),
            candidates: None,
            probe: None,
            convergence_interval: Duration::from_millis(500),
            max_convergence_attempts: 20,
            housekeeping_interval: Duration::from_secs(1),
            close_timeout: Duration::from_secs(1),
            log_directory: None,
            flasher: FlasherConfig::default(),
            flash_target: None,
            host_device_id: 0,
        }
    }
}

/// Commands sent to the session actor
#[derive(Debug)]
pub enum SessionCommand {
    /// Close the current link and connect to a new one
    ConnectLink {
        config: LinkConfiguration,
        /// Recording sink; synthesized from `log_directory` when `None`
        log: Option<LinkConfiguration>,
    },

    /// Close the current link
    Disconnect,

    /// Turn automatic detection on or off
    SetAutoDetect(bool),

    /// Stream telemetry at the given rate; out-of-range rates stop streaming
    SetRate { hz: f32 },

    /// Change a desired device parameter and converge to it
    SetParameter { key: ConfigKey, value: u32 },

    /// Poll the device for one message
    Request { id: MessageId },

    /// Flash new firmware over the current serial link
    FlashFirmware { request: FirmwareRequest },

    /// Get a snapshot of the session
    QueryState {
        response: oneshot::Sender<SessionSnapshot>,
    },

    /// Persist device configuration, close everything and stop the actor
    Shutdown,
}

struct FlashJob {
    task: JoinHandle<()>,
    done: oneshot::Receiver<Result<(), FirmwareError>>,
}

/// Internal state of the session actor
struct SessionState<S> {
    options: SessionOptions,
    store: S,
    event_tx: mpsc::Sender<SessionEvent>,
    link_tx: mpsc::Sender<LinkEvent>,
    detector_tx: mpsc::Sender<DetectorEvent>,
    detector: ProtocolDetector,
    finder: Option<UdpFinder>,
    link: Option<Link>,
    log_link: Option<Link>,
    codec: PingCodec,
    state: ConnectionState,
    autodetect: bool,
    /// The current link came from autodetect; losing it turns autodetect back on
    autodetect_connection: bool,
    identity: Option<DeviceIdentity>,
    device: DeviceState,
    config: DeviceConfiguration,
    convergence: Option<Interval>,
    convergence_attempts: u32,
    housekeeping: Option<Interval>,
    streaming: bool,
    flash: Option<FlashJob>,
}

fn timer(period: Duration) -> Interval {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

/// Tick a timer that may not exist; a missing timer never fires
async fn tick(timer: &mut Option<Interval>) -> Instant {
    match timer {
        Some(timer) => timer.tick().await,
        None => std::future::pending().await,
    }
}

async fn flash_done(job: &mut Option<FlashJob>) -> Result<(), FirmwareError> {
    match job {
        Some(job) => (&mut job.done)
            .await
            .unwrap_or_else(|_| Err(FirmwareError::Io("flash task ended early".into()))),
        None => std::future::pending().await,
    }
}

fn log_file_name() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S%3f.bin").to_string()
}

impl<S: SettingsStore> SessionState<S> {
    fn new(
        options: SessionOptions,
        store: S,
        event_tx: mpsc::Sender<SessionEvent>,
        link_tx: mpsc::Sender<LinkEvent>,
        detector_tx: mpsc::Sender<DetectorEvent>,
    ) -> Self {
        let candidates = options
            .candidates
            .clone()
            .unwrap_or_else(|| serial_candidates(&options.detector));
        let probe = options
            .probe
            .clone()
            .unwrap_or_else(|| device_probe(&options.detector));
        let detector = ProtocolDetector::with_probe(
            options.detector.pass_interval,
            detector_tx.clone(),
            candidates,
            probe,
        );

        Self {
            options,
            store,
            event_tx,
            link_tx,
            detector_tx,
            detector,
            finder: None,
            link: None,
            log_link: None,
            codec: PingCodec::new(),
            state: ConnectionState::Disconnected,
            autodetect: false,
            autodetect_connection: false,
            identity: None,
            device: DeviceState::default(),
            config: DeviceConfiguration::default(),
            convergence: None,
            convergence_attempts: 0,
            housekeeping: None,
            streaming: false,
            flash: None,
        }
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Session {} -> {}", self.state, state);
            self.state = state;
            self.emit(SessionEvent::ConnectionStateChanged(state)).await;
        }
    }

    fn link_writable(&self) -> bool {
        self.link.as_ref().is_some_and(Link::is_writable)
    }

    /// Encode and queue a message; skipped when the link cannot carry it
    fn send_message(&self, message: &Message) -> bool {
        let Some(link) = self.link.as_ref().filter(|l| l.is_writable()) else {
            trace!("Not sending {:?}: no writable link", message.id());
            return false;
        };
        let dst = self.identity.map(|i| i.src_device_id).unwrap_or(0);
        match link.send(message.encode(self.options.host_device_id, dst)) {
            Ok(()) => true,
            Err(e) => {
                debug!("Failed to send {}: {}", message.id(), e);
                false
            }
        }
    }

    fn request(&self, id: MessageId) -> bool {
        self.send_message(&Message::Request { id })
    }

    // -------------------------------------------------------------------------
    // Detection
    // -------------------------------------------------------------------------

    async fn start_detection(&mut self) {
        if !self.detector.is_running() {
            info!("Scanning for devices");
        }
        self.detector.scan();

        if let (None, Some(config)) = (&self.finder, &self.options.udp_discovery) {
            match UdpFinder::spawn(config.clone(), self.detector_tx.clone()).await {
                Ok(finder) => self.finder = Some(finder),
                Err(e) => warn!("UDP discovery unavailable: {}", e),
            }
        }
    }

    async fn stop_detection(&mut self) {
        self.detector.stop();
        if let Some(finder) = self.finder.take() {
            if let Err(e) = finder.stop().await {
                debug!("UDP finder ended with error: {}", e);
            }
        }
    }

    async fn set_autodetect(&mut self, enabled: bool) {
        if self.autodetect != enabled {
            info!("Autodetect {}", if enabled { "on" } else { "off" });
            self.autodetect = enabled;
            self.emit(SessionEvent::AutoDetectChanged(enabled)).await;
        }
        if enabled && self.state != ConnectionState::Connected && self.flash.is_none() {
            self.start_detection().await;
        } else {
            self.stop_detection().await;
        }
    }

    async fn handle_detector_event(&mut self, event: DetectorEvent) {
        match event {
            DetectorEvent::ConnectionDetected(config) => {
                self.emit(SessionEvent::DeviceDiscovered(config.clone())).await;
                if !self.autodetect
                    || self.state == ConnectionState::Connected
                    || self.flash.is_some()
                {
                    debug!("Ignoring detected {}", config);
                    return;
                }
                info!("Autodetect connecting to {}", config);
                match self.connect(config, None).await {
                    Ok(()) => self.autodetect_connection = true,
                    Err(e) => {
                        warn!("Autodetected link failed: {}", e);
                        self.emit(SessionEvent::Error(e.to_string())).await;
                    }
                }
            }
            DetectorEvent::ScanFinished => debug!("Detector pass finished"),
        }
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    async fn connect(
        &mut self,
        config: LinkConfiguration,
        log: Option<LinkConfiguration>,
    ) -> Result<(), SessionError> {
        if self.flash.is_some() {
            return Err(SessionError::Busy);
        }
        config.validate()?;

        // The previous link is fully released before the new one opens
        self.close_links().await;
        self.set_state(ConnectionState::Connecting).await;

        let link = match Link::open(config.clone(), self.link_tx.clone()).await {
            Ok(link) => link,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected).await;
                if self.autodetect {
                    self.start_detection().await;
                }
                return Err(e.into());
            }
        };

        self.link = Some(link);
        self.codec = PingCodec::new();
        self.identity = None;
        self.device = DeviceState::default();
        self.config = DeviceConfiguration::default();
        self.emit(SessionEvent::LinkChanged(config.clone())).await;

        self.open_log_link(&config, log).await;

        if !config.is_file() {
            if let Err(e) = self.store.set_last_link_configuration(&config) {
                warn!("Failed to save last link: {}", e);
            }
            if !config.is_simulation() {
                self.detector.append_configuration(config.clone());
            }
        }

        self.set_state(ConnectionState::Connected).await;
        if self.autodetect {
            self.set_autodetect(false).await;
        } else {
            self.stop_detection().await;
        }

        for id in INITIAL_REQUESTS {
            self.request(id);
        }
        if self.link_writable() {
            self.housekeeping = Some(timer(self.options.housekeeping_interval));
        }

        Ok(())
    }

    async fn open_log_link(&mut self, config: &LinkConfiguration, log: Option<LinkConfiguration>) {
        let target = match log {
            Some(log) => Some(log),
            // Replays are not recorded again
            None if !config.is_file() => self.options.log_directory.as_ref().map(|dir| {
                LinkConfiguration::file_log(&dir.join(log_file_name()).to_string_lossy())
            }),
            None => None,
        };
        let Some(target) = target else {
            return;
        };
        if target.file_mode() != Some(FileMode::Write) {
            warn!("Log target {} is not a writable file", target);
            return;
        }
        if let Some(dir) = Path::new(target.file_path()).parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!("Failed to create log directory {}: {}", dir.display(), e);
            }
        }

        match Link::open(target.clone(), self.link_tx.clone()).await {
            Ok(link) => {
                info!("Recording to {}", target.file_path());
                self.log_link = Some(link);
                self.emit(SessionEvent::LogLinkChanged(target)).await;
            }
            Err(e) => warn!("Failed to open log {}: {}", target, e),
        }
    }

    /// Save what the device reports under its id
    fn persist_device_configuration(&mut self) {
        let Some(identity) = self.identity else {
            return;
        };
        let mut record = self.config.clone();
        for key in ConfigKey::ALL {
            if let Some(value) = self.device.reported(key) {
                record.set_value(key, value);
            }
        }
        match self
            .store
            .set_device_configuration(identity.src_device_id, &record)
        {
            Ok(()) => debug!("Saved configuration of device {}", identity.src_device_id),
            Err(e) => warn!("Failed to save device configuration: {}", e),
        }
    }

    /// Stop timers and release both links
    async fn close_links(&mut self) {
        self.persist_device_configuration();
        self.convergence = None;
        self.housekeeping = None;
        self.autodetect_connection = false;
        if self.streaming {
            self.streaming = false;
            self.emit(SessionEvent::StreamingChanged(false)).await;
        }

        if let Some(mut link) = self.link.take() {
            link.close(self.options.close_timeout).await;
        }
        if let Some(mut log) = self.log_link.take() {
            log.close(self.options.close_timeout).await;
        }
        self.identity = None;
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// The device link ended without being asked to
    async fn link_lost(&mut self, reason: String) {
        warn!("Device link lost: {}", reason);
        let resume = self.autodetect_connection;
        self.close_links().await;
        self.emit(SessionEvent::Error(reason)).await;
        if resume {
            self.set_autodetect(true).await;
        } else if self.autodetect {
            self.start_detection().await;
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        let from = event.link();
        let is_device = self.link.as_ref().is_some_and(|l| l.id() == from);
        let is_log = self.log_link.as_ref().is_some_and(|l| l.id() == from);

        match event {
            LinkEvent::Data { bytes, .. } if is_device => {
                if let Some(log) = &self.log_link {
                    if let Err(e) = log.send(bytes.clone()) {
                        debug!("Log link dropped data: {}", e);
                    }
                }
                self.process_bytes(&bytes).await;
            }
            LinkEvent::Closed { reason, .. } if is_device => self.link_lost(reason).await,
            LinkEvent::Closed { reason, .. } if is_log => {
                warn!("Log link closed: {}", reason);
                self.log_link = None;
            }
            other => trace!("Ignoring event from stale {}", other.link()),
        }
    }

    // -------------------------------------------------------------------------
    // Inbound protocol
    // -------------------------------------------------------------------------

    async fn process_bytes(&mut self, bytes: &[u8]) {
        self.codec.push_bytes(bytes);
        while let Some(result) = self.codec.next_frame() {
            match result {
                Ok(frame) => self.handle_frame(frame).await,
                Err(e) => {
                    debug!("Dropped frame: {}", e);
                    let total = self.codec.errors();
                    self.emit(SessionEvent::ParseError {
                        error: e.to_string(),
                        total,
                    })
                    .await;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        if self.identity.is_none() {
            self.seed_identity(&frame).await;
        }
        match Message::decode(&frame) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                debug!("Undecodable message {}: {}", frame.message_id, e);
                let total = self.codec.errors();
                self.emit(SessionEvent::ParseError {
                    error: e.to_string(),
                    total,
                })
                .await;
            }
        }
    }

    /// First frame after connecting: load the device's stored record and
    /// start pushing it to the device
    async fn seed_identity(&mut self, frame: &Frame) {
        let identity = DeviceIdentity::from_frame(frame.src_device_id, frame.dst_device_id);
        info!("Talking to device {}", identity.src_device_id);
        self.identity = Some(identity);

        let stored = self.store.device_configuration(identity.src_device_id);
        self.config = DeviceConfiguration::with_stored(stored.as_ref());
        self.emit(SessionEvent::IdentityChanged(identity)).await;

        if self.link_writable() {
            self.restart_convergence();
        }
    }

    async fn handle_message(&mut self, message: Message) {
        self.device.apply(&message);

        match message {
            Message::FirmwareVersion(firmware) => {
                info!(
                    "Firmware {}.{} (type {}, model {})",
                    firmware.version_major,
                    firmware.version_minor,
                    firmware.device_type,
                    firmware.device_model
                );
                self.emit(SessionEvent::FirmwareVersion(firmware)).await;
                if let Some(identity) = self.identity.as_mut() {
                    identity.apply_firmware(&firmware);
                    let identity = *identity;
                    self.emit(SessionEvent::IdentityChanged(identity)).await;
                }
            }
            Message::DeviceId { device_id } => debug!("Device reports id {}", device_id),
            Message::Distance(distance) => self.emit(SessionEvent::Distance(distance)).await,
            Message::Profile(profile) => {
                let points = profile.points();
                self.emit(SessionEvent::Profile {
                    distance: profile.distance,
                    points,
                })
                .await;
            }
            Message::ProcessorTemperature { centidegrees } => {
                self.emit(SessionEvent::ProcessorTemperature(
                    f32::from(centidegrees) / 100.0,
                ))
                .await
            }
            Message::PcbTemperature { centidegrees } => {
                self.emit(SessionEvent::PcbTemperature(f32::from(centidegrees) / 100.0))
                    .await
            }
            Message::Voltage5 { millivolts } => {
                self.emit(SessionEvent::Voltage { millivolts }).await
            }
            Message::ModeAuto { mode_auto } => self.emit(SessionEvent::ModeAuto(mode_auto)).await,
            Message::PingInterval { ping_interval } => {
                self.emit(SessionEvent::PingInterval(ping_interval)).await
            }
            Message::GainSetting { gain_setting } => {
                self.emit(SessionEvent::GainSetting(gain_setting)).await
            }
            Message::SpeedOfSound { speed_of_sound } => {
                self.emit(SessionEvent::SpeedOfSound(speed_of_sound)).await
            }
            Message::Range {
                scan_start,
                scan_length,
            } => {
                self.emit(SessionEvent::Range {
                    scan_start,
                    scan_length,
                })
                .await
            }
            Message::GeneralInfo(info) => {
                self.emit(SessionEvent::ModeAuto(info.mode_auto)).await;
                self.emit(SessionEvent::PingInterval(info.ping_interval)).await;
                self.emit(SessionEvent::GainSetting(u32::from(info.gain_setting)))
                    .await;
                self.emit(SessionEvent::Voltage {
                    millivolts: info.voltage_5,
                })
                .await;
            }
            Message::AsciiText(text) => {
                info!("Device says: {}", text);
                self.emit(SessionEvent::AsciiText(text)).await;
            }
            Message::Nack { nacked_id, message } => {
                warn!("Device rejected {}: {}", nacked_id, message);
                self.emit(SessionEvent::Nack { nacked_id, message }).await;
            }
            Message::Ack { acked_id } => trace!("Device acked {}", acked_id),
            Message::Unknown { id, payload } => {
                warn!("Unknown message {} ({} bytes)", id, payload.len());
                self.emit(SessionEvent::UnknownMessage { id }).await;
            }
            other => trace!("Ignoring message {}", other.id()),
        }
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    fn restart_convergence(&mut self) {
        self.convergence_attempts = 0;
        self.convergence = Some(timer(self.options.convergence_interval));
    }

    async fn converge(&mut self) {
        match convergence_step(&self.config, &self.device) {
            ConvergenceStep::Converged => {
                info!(
                    "Device configuration converged after {} correction(s)",
                    self.convergence_attempts
                );
                self.convergence = None;
                self.emit(SessionEvent::ConvergenceDone).await;
                self.start_streaming().await;
            }
            ConvergenceStep::Pending(_)
                if self.convergence_attempts >= self.options.max_convergence_attempts =>
            {
                warn!(
                    "Device configuration did not converge after {} attempt(s)",
                    self.convergence_attempts
                );
                self.convergence = None;
                self.emit(SessionEvent::ConvergenceGaveUp {
                    attempts: self.convergence_attempts,
                })
                .await;
                self.start_streaming().await;
            }
            ConvergenceStep::Pending(messages) => {
                self.convergence_attempts += 1;
                trace!(
                    "Convergence attempt {}: {} message(s)",
                    self.convergence_attempts,
                    messages.len()
                );
                for message in &messages {
                    self.send_message(message);
                }
            }
        }
    }

    async fn start_streaming(&mut self) {
        let start = Message::ContinuousStart {
            id: MessageId::Profile.as_u16(),
        };
        if self.send_message(&start) && !self.streaming {
            self.streaming = true;
            self.emit(SessionEvent::StreamingChanged(true)).await;
        }
    }

    async fn housekeep(&mut self) {
        if !self.link_writable() {
            debug!("Housekeeping stopped: link is not writable");
            self.housekeeping = None;
            return;
        }
        for id in HOUSEKEEPING_REQUESTS {
            self.request(id);
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    async fn set_rate(&mut self, hz: f32) -> Result<(), SessionError> {
        let Some(link) = &self.link else {
            return Err(SessionError::NotConnected);
        };
        if !link.is_writable() {
            return Err(SessionError::NotWritable(link.configuration().to_string()));
        }

        let action = rate_action(hz);
        if let RateAction::Start { period_ms } = action {
            self.config
                .set_value(ConfigKey::PingInterval, u32::from(period_ms));
        }
        for message in rate_messages(action) {
            self.send_message(&message);
        }

        let streaming = matches!(action, RateAction::Start { .. });
        info!("Rate {} Hz: {:?}", hz, action);
        if self.streaming != streaming {
            self.streaming = streaming;
            self.emit(SessionEvent::StreamingChanged(streaming)).await;
        }
        Ok(())
    }

    async fn set_parameter(&mut self, key: ConfigKey, value: u32) {
        self.config.set_value(key, value);
        self.emit(SessionEvent::ParameterChanged { key, value }).await;
        if self.identity.is_some() && self.link_writable() {
            self.restart_convergence();
        }
    }

    async fn flash(&mut self, request: FirmwareRequest) -> Result<(), FirmwareError> {
        let config = match self.link.as_ref().filter(|l| l.is_open()) {
            Some(link) => link.configuration().clone(),
            None => return Err(FirmwareError::NotConnected),
        };
        let port = match &self.options.flash_target {
            Some(target) => target(&config)?,
            None => serial_flash_target(&config)?,
        };
        info!("Flashing {} on {}", request.image.display(), port);

        // Nothing else may talk to the device from here on
        self.convergence = None;
        self.housekeeping = None;
        if self.streaming {
            self.send_message(&Message::ContinuousStop {
                id: MessageId::Profile.as_u16(),
            });
        }
        if request.goto_bootloader {
            self.send_message(&Message::GotoBootloader);
        }
        if let Some(link) = &self.link {
            if let Err(e) = link.drain(self.options.flasher.drain_timeout).await {
                warn!("Pending writes not drained before flashing: {}", e);
            }
        }
        self.stop_detection().await;
        self.close_links().await;

        let flasher = self.options.flasher.clone();
        let args = flash_arguments(&request.image, request.baud, request.verify, &port);
        let event_tx = self.event_tx.clone();
        let (done_tx, done) = oneshot::channel();
        let task = tokio::spawn(async move {
            // Let the OS release the port before the tool opens it
            sleep(flasher.settle_delay).await;
            let result = run_flash_tool(&flasher.tool_path, &args, flasher.timeout, &event_tx).await;
            if result.is_ok() {
                // The device reboots into the new firmware
                sleep(flasher.settle_delay).await;
            }
            let _ = done_tx.send(result);
        });
        self.flash = Some(FlashJob { task, done });
        Ok(())
    }

    async fn finish_flash(&mut self, result: Result<(), FirmwareError>) {
        self.flash = None;
        match result {
            Ok(()) => {
                info!("Firmware update complete");
                self.emit(SessionEvent::FlashComplete).await;
                self.set_autodetect(true).await;
            }
            Err(e) => {
                warn!("Firmware update failed: {}", e);
                self.emit(SessionEvent::FlashFailed(e.to_string())).await;
                if self.autodetect {
                    self.start_detection().await;
                }
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            autodetect: self.autodetect,
            link: self.link.as_ref().map(|l| l.configuration().clone()),
            log_link: self.log_link.as_ref().map(|l| l.configuration().clone()),
            identity: self.identity,
            configuration: self.config.clone(),
            device: self.device.clone(),
            streaming: self.streaming,
            flashing: self.flash.is_some(),
            parse_errors: self.codec.errors(),
        }
    }

    /// Handle one command; returns false when the actor should stop
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::ConnectLink { config, log } => {
                if let Err(e) = self.connect(config, log).await {
                    warn!("Connect failed: {}", e);
                    self.emit(SessionEvent::Error(e.to_string())).await;
                }
            }

            SessionCommand::Disconnect => {
                info!("Disconnect requested");
                self.close_links().await;
                if self.autodetect {
                    self.start_detection().await;
                }
            }

            SessionCommand::SetAutoDetect(enabled) => self.set_autodetect(enabled).await,

            SessionCommand::SetRate { hz } => {
                if let Err(e) = self.set_rate(hz).await {
                    warn!("Cannot set rate: {}", e);
                    self.emit(SessionEvent::Error(e.to_string())).await;
                }
            }

            SessionCommand::SetParameter { key, value } => self.set_parameter(key, value).await,

            SessionCommand::Request { id } => {
                if !self.request(id) {
                    debug!("Request for {} skipped", id.name());
                }
            }

            SessionCommand::FlashFirmware { request } => {
                let result = if self.flash.is_some() {
                    Err(SessionError::Busy.to_string())
                } else {
                    self.flash(request).await.map_err(|e| e.to_string())
                };
                if let Err(e) = result {
                    warn!("Firmware update not started: {}", e);
                    self.emit(SessionEvent::FlashFailed(e)).await;
                }
            }

            SessionCommand::QueryState { response } => {
                let _ = response.send(self.snapshot());
            }

            SessionCommand::Shutdown => {
                info!("Shutdown requested");
                return false;
            }
        }
        true
    }

    async fn shutdown(&mut self) {
        if let Some(job) = self.flash.take() {
            warn!("Aborting firmware update");
            job.task.abort();
        }
        self.stop_detection().await;
        self.close_links().await;
    }
}

/// Run the session actor
///
/// This function runs until `Shutdown` is received or the command channel
/// closes. On exit the device configuration is persisted and every link is
/// closed.
///
/// # Arguments
///
/// * `cmd_rx` - Receiver for commands to the actor
/// * `event_tx` - Sender for events emitted by the actor
/// * `store` - Settings storage for link and device configuration
/// * `options` - Timing and detection options
pub async fn run_session_actor<S: SettingsStore>(
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
    store: S,
    options: SessionOptions,
) {
    let (link_tx, mut link_rx) = mpsc::channel(256);
    let (detector_tx, mut detector_rx) = mpsc::channel(16);
    let autodetect = options.autodetect;
    let mut session = SessionState::new(options, store, event_tx, link_tx, detector_tx);

    if let Some(last) = session.store.last_link_configuration() {
        debug!("Last known link: {}", last);
        session.detector.append_configuration(last);
    }
    if autodetect {
        session.set_autodetect(true).await;
    }

    info!("Session actor started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                if !session.handle_command(cmd).await {
                    break;
                }
            }

            Some(event) = link_rx.recv() => session.handle_link_event(event).await,

            Some(event) = detector_rx.recv() => session.handle_detector_event(event).await,

            _ = tick(&mut session.convergence) => session.converge().await,

            _ = tick(&mut session.housekeeping) => session.housekeep().await,

            result = flash_done(&mut session.flash) => session.finish_flash(result).await,
        }
    }

    session.shutdown().await;
    info!("Session actor stopped");
}
