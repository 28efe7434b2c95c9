//! Protocol detector
//!
//! Runs scan passes over candidate link configurations on a worker task
//! separate from the session. A pass tries previously known-good
//! configurations first, then every enumerated serial port, and stops at the
//! first candidate that answers the probe. Passes repeat until a device is
//! found or [`ProtocolDetector::stop`] is called.
//!
//! `stop()` is cooperative: the run flag is checked between candidates, so a
//! probe already in flight always completes (and releases its port) first.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sonar_link::LinkConfiguration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::error::DetectError;
use crate::probe::{DeviceProber, ProbeConfig, ProbeResult};
use crate::scanner::{PortScanner, ScannerConfig};

/// Events emitted by the detector and the UDP finder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorEvent {
    /// A candidate answered the probe
    ConnectionDetected(LinkConfiguration),
    /// Scanning halted, either after a detection or on `stop()`
    ScanFinished,
}

/// Detector configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Pause between scan passes that found nothing
    pub pass_interval: Duration,
    /// Baud rate used for enumerated serial ports
    pub baud_rate: u32,
    pub probe: ProbeConfig,
    pub scanner: ScannerConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            pass_interval: Duration::from_millis(500),
            baud_rate: 115_200,
            probe: ProbeConfig::default(),
            scanner: ScannerConfig::default(),
        }
    }
}

/// Boxed probe future
pub type ProbeFuture = Pin<Box<dyn Future<Output = Result<ProbeResult, DetectError>> + Send>>;

/// Probes one candidate configuration
pub type ProbeFn = Arc<dyn Fn(LinkConfiguration) -> ProbeFuture + Send + Sync>;

/// Lists the candidates discovered on the system for one pass
pub type CandidatesFn = Arc<dyn Fn() -> Vec<LinkConfiguration> + Send + Sync>;

/// How a scan pass ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// A candidate answered
    Detected(LinkConfiguration),
    /// The run flag was cleared between candidates
    Stopped,
    /// Every candidate was tried without success
    Exhausted,
}

/// Order candidates for a pass: known-good first, then the rest, deduplicated
pub fn candidates(
    known: &[LinkConfiguration],
    discovered: Vec<LinkConfiguration>,
) -> Vec<LinkConfiguration> {
    let mut out: Vec<LinkConfiguration> = Vec::with_capacity(known.len() + discovered.len());
    for config in known.iter().cloned().chain(discovered) {
        let duplicate = out
            .iter()
            .any(|c| c.link_type() == config.link_type() && c.args() == config.args());
        if !duplicate {
            out.push(config);
        }
    }
    out
}

/// Probe candidates in order until one answers or the run flag clears
pub async fn run_pass(
    candidates: &[LinkConfiguration],
    run: &watch::Receiver<bool>,
    probe: &ProbeFn,
) -> PassOutcome {
    for candidate in candidates {
        if !*run.borrow() {
            debug!("Scan stopped before {}", candidate);
            return PassOutcome::Stopped;
        }
        match probe(candidate.clone()).await {
            Ok(result) => {
                info!(
                    "Detected device {} on {}",
                    result.src_device_id,
                    candidate.name()
                );
                return PassOutcome::Detected(candidate.clone());
            }
            Err(e) => trace!("No device on {}: {}", candidate, e),
        }
    }
    PassOutcome::Exhausted
}

/// Enumerated serial ports as candidates at the configured baud rate
pub fn serial_candidates(config: &DetectorConfig) -> CandidatesFn {
    let scanner = PortScanner::with_config(config.scanner.clone());
    let baud_rate = config.baud_rate;
    Arc::new(move || match scanner.enumerate_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| LinkConfiguration::serial(&p.port, baud_rate))
            .collect(),
        Err(e) => {
            warn!("Port enumeration failed: {}", e);
            Vec::new()
        }
    })
}

/// Probe with a [`DeviceProber`] built from the configuration
pub fn device_probe(config: &DetectorConfig) -> ProbeFn {
    let prober = DeviceProber::with_config(config.probe.clone());
    Arc::new(move |candidate: LinkConfiguration| {
        let prober = prober.clone();
        Box::pin(async move { prober.probe_configuration(&candidate).await })
    })
}

struct Shared {
    run: watch::Sender<bool>,
    known: watch::Sender<Vec<LinkConfiguration>>,
    busy: AtomicBool,
}

/// Serial device detector
///
/// Owns one worker task for its whole lifetime; `scan()` and `stop()` toggle
/// that worker, so at most one pass is ever active per detector.
pub struct ProtocolDetector {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl ProtocolDetector {
    /// Create a detector that enumerates serial ports and probes them
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: DetectorConfig, event_tx: mpsc::Sender<DetectorEvent>) -> Self {
        Self::with_probe(
            config.pass_interval,
            event_tx,
            serial_candidates(&config),
            device_probe(&config),
        )
    }

    /// Create a detector with custom candidate listing and probing
    pub fn with_probe(
        pass_interval: Duration,
        event_tx: mpsc::Sender<DetectorEvent>,
        ports: CandidatesFn,
        probe: ProbeFn,
    ) -> Self {
        let (run, _) = watch::channel(false);
        let (known, _) = watch::channel(Vec::new());
        let shared = Arc::new(Shared {
            run,
            known,
            busy: AtomicBool::new(false),
        });

        let task = tokio::spawn(run_detector_task(
            shared.clone(),
            event_tx,
            ports,
            probe,
            pass_interval,
        ));

        Self { shared, task }
    }

    /// Remember a configuration to be tried before enumerated ports
    ///
    /// Invalid configurations are ignored. The most recent one goes first.
    pub fn append_configuration(&self, config: LinkConfiguration) {
        if !config.is_valid() {
            debug!("Ignoring invalid configuration {}", config);
            return;
        }
        self.shared.known.send_modify(|known| {
            known.retain(|c| c != &config);
            known.insert(0, config);
        });
    }

    /// Known-good configurations in the order they will be tried
    pub fn known_configurations(&self) -> Vec<LinkConfiguration> {
        self.shared.known.borrow().clone()
    }

    /// Start continuous scan passes
    pub fn scan(&self) {
        if !self.shared.run.send_replace(true) {
            debug!("Detector scan requested");
        }
    }

    /// Stop scanning after the in-flight probe, if any
    pub fn stop(&self) {
        if self.shared.run.send_replace(false) {
            debug!("Detector stop requested");
        }
    }

    /// Whether a scan is requested or a pass is still winding down
    pub fn is_running(&self) -> bool {
        *self.shared.run.borrow() || self.shared.busy.load(Ordering::SeqCst)
    }
}

impl Drop for ProtocolDetector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ProtocolDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolDetector")
            .field("running", &self.is_running())
            .field("known", &self.shared.known.borrow().len())
            .finish()
    }
}

async fn run_detector_task(
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<DetectorEvent>,
    ports: CandidatesFn,
    probe: ProbeFn,
    pass_interval: Duration,
) {
    let mut run_rx = shared.run.subscribe();

    loop {
        // Idle until scan() is called
        while !*run_rx.borrow_and_update() {
            if run_rx.changed().await.is_err() {
                return;
            }
        }

        shared.busy.store(true, Ordering::SeqCst);
        info!("Detector scan started");

        let mut pass = 0u32;
        loop {
            pass += 1;
            let known = shared.known.borrow().clone();
            let list = candidates(&known, ports());
            trace!("Scan pass {} over {} candidate(s)", pass, list.len());

            match run_pass(&list, &run_rx, &probe).await {
                PassOutcome::Detected(config) => {
                    shared.known.send_modify(|known| {
                        known.retain(|c| c != &config);
                        known.insert(0, config.clone());
                    });
                    shared.run.send_replace(false);
                    if event_tx
                        .send(DetectorEvent::ConnectionDetected(config))
                        .await
                        .is_err()
                    {
                        shared.busy.store(false, Ordering::SeqCst);
                        return;
                    }
                    break;
                }
                PassOutcome::Stopped => break,
                PassOutcome::Exhausted => {}
            }

            // Wait for the next pass unless stopped in the meantime
            tokio::select! {
                _ = sleep(pass_interval) => {}
                _ = run_rx.wait_for(|run| !*run) => {}
            }
            if !*run_rx.borrow() {
                break;
            }
        }

        shared.busy.store(false, Ordering::SeqCst);
        info!("Detector scan finished after {} pass(es)", pass);
        if event_tx.send(DetectorEvent::ScanFinished).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fake_probe(answering: &'static str, calls: Arc<AtomicUsize>) -> ProbeFn {
        Arc::new(move |candidate: LinkConfiguration| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if candidate.serial_port() == answering {
                    Ok(ProbeResult {
                        config: candidate.clone(),
                        src_device_id: 1,
                        reply: sonar_protocol::Message::DeviceId { device_id: 1 },
                    })
                } else {
                    Err(DetectError::Timeout {
                        port: candidate.serial_port().to_string(),
                    })
                }
            })
        })
    }

    fn serial(port: &str) -> LinkConfiguration {
        LinkConfiguration::serial(port, 115_200)
    }

    #[test]
    fn test_candidates_known_first_and_deduped() {
        let known = vec![serial("/dev/ttyUSB1")];
        let discovered = vec![serial("/dev/ttyUSB0"), serial("/dev/ttyUSB1")];
        let list = candidates(&known, discovered);
        assert_eq!(list, vec![serial("/dev/ttyUSB1"), serial("/dev/ttyUSB0")]);
    }

    #[tokio::test]
    async fn test_run_pass_stops_at_first_answer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = fake_probe("/dev/ttyUSB1", calls.clone());
        let (_run_tx, run_rx) = watch::channel(true);
        let list = vec![serial("/dev/ttyUSB0"), serial("/dev/ttyUSB1"), serial("/dev/ttyUSB2")];

        let outcome = run_pass(&list, &run_rx, &probe).await;
        assert_eq!(outcome, PassOutcome::Detected(serial("/dev/ttyUSB1")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_pass_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = fake_probe("none", calls.clone());
        let (_run_tx, run_rx) = watch::channel(true);
        let list = vec![serial("/dev/ttyUSB0"), serial("/dev/ttyUSB1")];

        assert_eq!(run_pass(&list, &run_rx, &probe).await, PassOutcome::Exhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_pass_checks_flag_between_candidates() {
        let (run_tx, run_rx) = watch::channel(true);
        let run_tx = Arc::new(run_tx);
        let calls = Arc::new(AtomicUsize::new(0));
        let stopper = run_tx.clone();
        let counter = calls.clone();
        // The first probe clears the flag while in flight; it still completes
        let probe: ProbeFn = Arc::new(move |candidate: LinkConfiguration| {
            counter.fetch_add(1, Ordering::SeqCst);
            stopper.send_replace(false);
            Box::pin(async move {
                Err(DetectError::Timeout {
                    port: candidate.serial_port().to_string(),
                })
            })
        });
        let list = vec![serial("/dev/ttyUSB0"), serial("/dev/ttyUSB1")];

        assert_eq!(run_pass(&list, &run_rx, &probe).await, PassOutcome::Stopped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detector_reports_once_and_halts() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let ports: CandidatesFn = Arc::new(|| vec![serial("/dev/ttyUSB0"), serial("/dev/ttyACM0")]);
        let detector = ProtocolDetector::with_probe(
            Duration::from_millis(10),
            event_tx,
            ports,
            fake_probe("/dev/ttyACM0", calls),
        );
        assert!(!detector.is_running());

        detector.scan();
        assert_eq!(
            event_rx.recv().await,
            Some(DetectorEvent::ConnectionDetected(serial("/dev/ttyACM0")))
        );
        assert_eq!(event_rx.recv().await, Some(DetectorEvent::ScanFinished));
        assert!(!detector.is_running());
        assert_eq!(detector.known_configurations(), vec![serial("/dev/ttyACM0")]);
    }

    #[tokio::test]
    async fn test_detector_known_configuration_tried_first() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let ports: CandidatesFn = Arc::new(|| vec![serial("/dev/ttyUSB0"), serial("/dev/ttyUSB9")]);
        let detector = ProtocolDetector::with_probe(
            Duration::from_millis(10),
            event_tx,
            ports,
            fake_probe("/dev/ttyUSB9", calls.clone()),
        );

        detector.append_configuration(serial("/dev/ttyUSB9"));
        detector.append_configuration(LinkConfiguration::default());
        assert_eq!(detector.known_configurations().len(), 1);

        detector.scan();
        assert_eq!(
            event_rx.recv().await,
            Some(DetectorEvent::ConnectionDetected(serial("/dev/ttyUSB9")))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detector_repeats_passes_until_stopped() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let ports: CandidatesFn = Arc::new(|| vec![serial("/dev/ttyUSB0")]);
        let detector = ProtocolDetector::with_probe(
            Duration::from_millis(5),
            event_tx,
            ports,
            fake_probe("none", calls.clone()),
        );

        detector.scan();
        while calls.load(Ordering::SeqCst) < 3 {
            sleep(Duration::from_millis(5)).await;
        }
        assert!(detector.is_running());

        detector.stop();
        assert_eq!(event_rx.recv().await, Some(DetectorEvent::ScanFinished));
        assert!(!detector.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_waits_pass_interval_between_passes() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let ports: CandidatesFn = Arc::new(|| vec![serial("/dev/ttyUSB0")]);
        let detector = ProtocolDetector::with_probe(
            Duration::from_millis(500),
            event_tx,
            ports,
            fake_probe("none", calls.clone()),
        );

        detector.scan();
        sleep(Duration::from_millis(1250)).await;
        // Passes at 0, 500 and 1000 ms
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        detector.stop();
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn candidates_keep_known_first_without_duplicates(
                known in proptest::collection::vec(0u8..8, 0..5),
                found in proptest::collection::vec(0u8..8, 0..8),
            ) {
                let known: Vec<_> = known.iter().map(|n| serial(&format!("/dev/ttyUSB{}", n))).collect();
                let found: Vec<_> = found.iter().map(|n| serial(&format!("/dev/ttyUSB{}", n))).collect();
                let list = candidates(&known, found.clone());

                for (i, a) in list.iter().enumerate() {
                    prop_assert!(!list[i + 1..].contains(a));
                }
                let mut known_unique = Vec::new();
                for k in &known {
                    if !known_unique.contains(k) {
                        known_unique.push(k.clone());
                    }
                }
                prop_assert_eq!(&list[..known_unique.len()], known_unique.as_slice());
                for f in &found {
                    prop_assert!(list.contains(f));
                }
            }
        }
    }
}
