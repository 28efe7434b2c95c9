//! Persisted session settings
//!
//! The session only stores two things: the last configuration that reached
//! a live device, and per-device configuration records keyed by the device's
//! source id. Stores are explicit objects handed to the session actor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sonar_link::LinkConfiguration;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::state::DeviceConfiguration;

/// Storage backend for session settings
pub trait SettingsStore: Send + Sync + 'static {
    /// Last configuration that reached a live device
    fn last_link_configuration(&self) -> Option<LinkConfiguration>;

    fn set_last_link_configuration(&mut self, config: &LinkConfiguration)
        -> Result<(), SessionError>;

    /// Stored configuration record for a device id
    fn device_configuration(&self, device_id: u8) -> Option<DeviceConfiguration>;

    fn set_device_configuration(
        &mut self,
        device_id: u8,
        config: &DeviceConfiguration,
    ) -> Result<(), SessionError>;
}

/// Everything a store holds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredSettings {
    pub last_link_configuration: Option<LinkConfiguration>,
    pub devices: BTreeMap<u8, DeviceConfiguration>,
}

/// In-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: StoredSettings,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(data: StoredSettings) -> Self {
        Self { data }
    }

    pub fn settings(&self) -> &StoredSettings {
        &self.data
    }
}

impl SettingsStore for MemoryStore {
    fn last_link_configuration(&self) -> Option<LinkConfiguration> {
        self.data.last_link_configuration.clone()
    }

    fn set_last_link_configuration(
        &mut self,
        config: &LinkConfiguration,
    ) -> Result<(), SessionError> {
        self.data.last_link_configuration = Some(config.clone());
        Ok(())
    }

    fn device_configuration(&self, device_id: u8) -> Option<DeviceConfiguration> {
        self.data.devices.get(&device_id).cloned()
    }

    fn set_device_configuration(
        &mut self,
        device_id: u8,
        config: &DeviceConfiguration,
    ) -> Result<(), SessionError> {
        self.data.devices.insert(device_id, config.clone());
        Ok(())
    }
}

/// JSON file store, rewritten on every change
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    data: StoredSettings,
}

impl JsonFileStore {
    /// Open a store at the given path
    ///
    /// A missing or unreadable file starts out empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("Ignoring unreadable settings {}: {}", path.display(), e);
                StoredSettings::default()
            }),
            Err(e) => {
                debug!("No settings at {}: {}", path.display(), e);
                StoredSettings::default()
            }
        };
        Self { path, data }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &StoredSettings {
        &self.data
    }

    fn save(&self) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SessionError::Settings(format!("failed to create settings directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(&self.data)
            .map_err(|e| SessionError::Settings(format!("failed to serialize settings: {}", e)))?;

        std::fs::write(&self.path, json)
            .map_err(|e| SessionError::Settings(format!("failed to write settings: {}", e)))
    }
}

impl SettingsStore for JsonFileStore {
    fn last_link_configuration(&self) -> Option<LinkConfiguration> {
        self.data.last_link_configuration.clone()
    }

    fn set_last_link_configuration(
        &mut self,
        config: &LinkConfiguration,
    ) -> Result<(), SessionError> {
        self.data.last_link_configuration = Some(config.clone());
        self.save()
    }

    fn device_configuration(&self, device_id: u8) -> Option<DeviceConfiguration> {
        self.data.devices.get(&device_id).cloned()
    }

    fn set_device_configuration(
        &mut self,
        device_id: u8,
        config: &DeviceConfiguration,
    ) -> Result<(), SessionError> {
        self.data.devices.insert(device_id, config.clone());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConfigKey;

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new();
        assert!(store.last_link_configuration().is_none());

        let config = LinkConfiguration::serial("/dev/ttyUSB0", 115_200);
        store.set_last_link_configuration(&config).unwrap();
        assert_eq!(store.last_link_configuration(), Some(config));
    }

    #[test]
    fn test_json_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let mut store = JsonFileStore::open(&path);
        let link = LinkConfiguration::udp("192.168.2.2", 12345);
        let mut device = DeviceConfiguration::default();
        device.set_value(ConfigKey::GainSetting, 5);
        store.set_last_link_configuration(&link).unwrap();
        store.set_device_configuration(7, &device).unwrap();

        let reopened = JsonFileStore::open(&path);
        assert_eq!(reopened.last_link_configuration(), Some(link));
        assert_eq!(reopened.device_configuration(7), Some(device));
        assert!(reopened.device_configuration(8).is_none());
    }

    #[test]
    fn test_json_store_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonFileStore::open(&path);
        assert_eq!(store.settings(), &StoredSettings::default());
    }
}
