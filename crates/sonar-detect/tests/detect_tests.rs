//! Detection against virtual sonars on loopback UDP

use std::time::Duration;

use sonar_detect::{
    device_probe, CandidatesFn, DetectError, DetectorConfig, DetectorEvent, DeviceProber,
    ProtocolDetector,
};
use sonar_link::LinkConfiguration;
use sonar_protocol::Message;
use sonar_sim::{run_virtual_sonar_udp, VirtualSonar, VirtualSonarCommand, VirtualSonarConfig};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn spawn_udp_sonar(device_id: u8) -> (u16, mpsc::Sender<VirtualSonarCommand>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let sonar = VirtualSonar::new(VirtualSonarConfig {
        device_id,
        ..Default::default()
    });
    let (cmd_tx, cmd_rx) = mpsc::channel(1);
    tokio::spawn(run_virtual_sonar_udp(socket, sonar, cmd_rx));
    (port, cmd_tx)
}

#[tokio::test]
async fn probe_udp_finds_virtual_sonar() {
    let (port, _cmd) = spawn_udp_sonar(3).await;

    let result = DeviceProber::new().probe_udp("127.0.0.1", port).await.unwrap();
    assert_eq!(result.src_device_id, 3);
    assert_eq!(result.config, LinkConfiguration::udp("127.0.0.1", port));
    assert!(matches!(result.reply, Message::FirmwareVersion(_)));
}

#[tokio::test]
async fn probe_udp_times_out_without_device() {
    // Bound but never answering
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();

    let err = DeviceProber::new()
        .probe_udp("127.0.0.1", port)
        .await
        .unwrap_err();
    assert!(matches!(err, DetectError::Timeout { .. }));
}

#[tokio::test]
async fn replay_and_simulation_are_not_probed() {
    let prober = DeviceProber::new();
    for config in [
        LinkConfiguration::file_replay("/tmp/capture.bin"),
        LinkConfiguration::simulation(),
    ] {
        let err = prober.probe_configuration(&config).await.unwrap_err();
        assert!(matches!(err, DetectError::Unsupported(_)));
    }
}

#[tokio::test]
async fn detector_reports_answering_udp_candidate() {
    let (port, _cmd) = spawn_udp_sonar(1).await;
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_port = silent.local_addr().unwrap().port();

    let config = DetectorConfig {
        pass_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let candidates: CandidatesFn = std::sync::Arc::new(move || {
        vec![
            LinkConfiguration::udp("127.0.0.1", silent_port),
            LinkConfiguration::udp("127.0.0.1", port),
        ]
    });
    let (event_tx, mut event_rx) = mpsc::channel(8);
    let detector = ProtocolDetector::with_probe(
        config.pass_interval,
        event_tx,
        candidates,
        device_probe(&config),
    );

    detector.scan();
    let event = timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        DetectorEvent::ConnectionDetected(LinkConfiguration::udp("127.0.0.1", port))
    );
    assert_eq!(event_rx.recv().await, Some(DetectorEvent::ScanFinished));
}
