//! Monitor settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sonar_detect::{DetectorConfig, FinderConfig, UsbId};
use sonar_session::SessionOptions;

/// Name of the session store kept next to the settings file
const STORE_FILE: &str = "session.json";

/// Monitor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    /// Scan for devices on startup
    pub autodetect: bool,
    /// Broadcast for networked sonars while scanning
    pub udp_discovery: bool,
    /// Record inbound traffic here; nothing is recorded when unset
    pub log_directory: Option<PathBuf>,
    /// Port name patterns to skip in addition to the built-in blocklist
    pub blocklist: Vec<String>,
    /// USB adapters to skip while probing
    pub blocked_usb_ids: Vec<UsbId>,
    /// Baud rate used when probing serial ports
    pub probe_baud_rate: u32,
    /// Milliseconds between configuration convergence passes
    pub convergence_interval_ms: u64,
    /// Passes before convergence gives up
    pub max_convergence_attempts: u32,
    /// Flashing tool; defaults to `stm32flash` next to the executable
    pub flasher_tool: Option<PathBuf>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            autodetect: true,
            udp_discovery: true,
            log_directory: None,
            blocklist: Vec::new(),
            blocked_usb_ids: Vec::new(),
            probe_baud_rate: 115_200,
            convergence_interval_ms: 500,
            max_convergence_attempts: 20,
            flasher_tool: None,
        }
    }
}

impl MonitorSettings {
    /// Get the XDG config directory for sonar-monitor
    /// Uses $XDG_CONFIG_HOME/sonar-monitor, falls back to ~/.config/sonar-monitor
    pub fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("sonar-monitor"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("sonar-monitor"))
    }

    /// Get the default settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Session store that lives next to a settings file
    pub fn store_path(settings_path: &Path) -> PathBuf {
        settings_path
            .parent()
            .map(|dir| dir.join(STORE_FILE))
            .unwrap_or_else(|| PathBuf::from(STORE_FILE))
    }

    /// Load settings from a file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save settings to a file
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {}", e))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        std::fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))
    }

    /// Session actor options these settings describe
    pub fn session_options(&self) -> SessionOptions {
        let mut detector = DetectorConfig {
            baud_rate: self.probe_baud_rate,
            ..Default::default()
        };
        detector
            .scanner
            .skip_patterns
            .extend(self.blocklist.iter().cloned());
        detector.scanner.skip_usb_ids = self.blocked_usb_ids.clone();

        let mut options = SessionOptions {
            autodetect: self.autodetect,
            udp_discovery: self.udp_discovery.then(FinderConfig::default),
            detector,
            convergence_interval: Duration::from_millis(self.convergence_interval_ms.max(1)),
            max_convergence_attempts: self.max_convergence_attempts,
            log_directory: self.log_directory.clone(),
            ..Default::default()
        };
        if let Some(tool) = &self.flasher_tool {
            options.flasher.tool_path = tool.clone();
        }
        options
    }
}
