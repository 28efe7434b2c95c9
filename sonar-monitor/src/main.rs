//! Ping Sonar Monitor
//!
//! A headless monitor that finds a Ping sonar, keeps it configured and logs
//! everything it reports.
//!
//! Usage: `sonar-monitor [SETTINGS_FILE]`

mod settings;

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use settings::MonitorSettings;
use sonar_session::{run_session_actor, JsonFileStore, SessionCommand, SessionEvent, SettingsStore};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log one session event at a level matching its importance
fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Profile { distance, points } => trace!(
            "Profile: {} mm ({}%), {} points",
            distance.distance,
            distance.confidence,
            points.len()
        ),
        SessionEvent::Distance(d) => debug!("Distance: {} mm ({}%)", d.distance, d.confidence),
        SessionEvent::FlashProgress(percent) => debug!("Flashing: {:.2}%", percent),
        SessionEvent::ParseError { error, total } => {
            warn!("Parse error ({} total): {}", total, error)
        }
        SessionEvent::Error(message) => warn!("{}", message),
        SessionEvent::FlashFailed(message) => error!("Firmware update failed: {}", message),
        other => info!("{:?}", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sonar_monitor=info,sonar_protocol=info,sonar_link=info,sonar_detect=info,sonar_session=info,sonar_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sonar monitor");

    let settings_path = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => MonitorSettings::settings_path().context("could not determine settings path")?,
    };
    let settings = MonitorSettings::load_from(&settings_path);
    if !settings_path.exists() {
        match settings.save_to(&settings_path) {
            Ok(()) => info!("Wrote default settings to {}", settings_path.display()),
            Err(e) => warn!("{}", e),
        }
    }
    debug!("Settings: {:?}", settings);

    let store = JsonFileStore::open(MonitorSettings::store_path(&settings_path));
    info!("Session store: {}", store.path().display());
    let last = store
        .last_link_configuration()
        .filter(|config| config.is_valid());

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let actor = tokio::spawn(run_session_actor(
        cmd_rx,
        event_tx,
        store,
        settings.session_options(),
    ));
    let logger = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    if let Some(config) = last {
        info!("Reconnecting to {}", config);
        cmd_tx
            .send(SessionCommand::ConnectLink { config, log: None })
            .await
            .map_err(|_| anyhow!("session stopped before reconnecting"))?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");

    cmd_tx
        .send(SessionCommand::Shutdown)
        .await
        .map_err(|_| anyhow!("session already stopped"))?;
    actor.await.context("session task failed")?;
    logger.await.context("event logger failed")?;

    Ok(())
}
