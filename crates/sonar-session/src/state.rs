//! Device session state tracking

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sonar_link::LinkConfiguration;
use sonar_protocol::{DeviceType, FirmwareVersion, Message};

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Who the connected device is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    /// Device id the device sends from
    pub src_device_id: u8,
    /// Device id the device addresses replies to
    pub dst_device_id: u8,
    pub device_type: DeviceType,
    pub device_model: u8,
    pub firmware_major: u16,
    pub firmware_minor: u16,
}

impl DeviceIdentity {
    /// Seed an identity from the first frame received after connecting
    pub fn from_frame(src_device_id: u8, dst_device_id: u8) -> Self {
        Self {
            src_device_id,
            dst_device_id,
            ..Default::default()
        }
    }

    pub fn apply_firmware(&mut self, firmware: &FirmwareVersion) {
        self.device_type = DeviceType::from(firmware.device_type);
        self.device_model = firmware.device_model;
        self.firmware_major = firmware.version_major;
        self.firmware_minor = firmware.version_minor;
    }
}

/// Device parameters the session keeps in sync with the device
///
/// Ordering matters: convergence walks the keys in this order and automatic
/// mode comes first, because it governs the remaining values on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigKey {
    AutomaticMode,
    GainSetting,
    PingInterval,
    ScanLength,
    ScanStart,
    SpeedOfSound,
}

impl ConfigKey {
    /// All keys in convergence order
    pub const ALL: [ConfigKey; 6] = [
        ConfigKey::AutomaticMode,
        ConfigKey::GainSetting,
        ConfigKey::PingInterval,
        ConfigKey::ScanLength,
        ConfigKey::ScanStart,
        ConfigKey::SpeedOfSound,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ConfigKey::AutomaticMode => "automatic mode",
            ConfigKey::GainSetting => "gain setting",
            ConfigKey::PingInterval => "ping interval",
            ConfigKey::ScanLength => "scan length",
            ConfigKey::ScanStart => "scan start",
            ConfigKey::SpeedOfSound => "speed of sound",
        }
    }

    /// Factory default of the device
    pub fn default_value(&self) -> u32 {
        match self {
            ConfigKey::AutomaticMode => 1,
            ConfigKey::GainSetting => 0,
            ConfigKey::PingInterval => 100,
            ConfigKey::ScanLength => 5000,
            ConfigKey::ScanStart => 0,
            ConfigKey::SpeedOfSound => 1_500_000,
        }
    }
}

/// One configuration value and the default it resets to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigParameter {
    pub value: u32,
    pub default_value: u32,
}

impl ConfigParameter {
    pub fn new(default_value: u32) -> Self {
        Self {
            value: default_value,
            default_value,
        }
    }
}

/// Locally desired device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceConfiguration {
    params: BTreeMap<ConfigKey, ConfigParameter>,
}

impl Default for DeviceConfiguration {
    fn default() -> Self {
        Self {
            params: ConfigKey::ALL
                .iter()
                .map(|key| (*key, ConfigParameter::new(key.default_value())))
                .collect(),
        }
    }
}

impl DeviceConfiguration {
    /// Defaults overlaid with whatever a stored record holds
    ///
    /// Keys missing from the stored record keep their defaults.
    pub fn with_stored(stored: Option<&DeviceConfiguration>) -> Self {
        let mut config = Self::default();
        if let Some(stored) = stored {
            for (key, param) in &stored.params {
                config.params.insert(*key, *param);
            }
        }
        config
    }

    pub fn get(&self, key: ConfigKey) -> ConfigParameter {
        self.params
            .get(&key)
            .copied()
            .unwrap_or_else(|| ConfigParameter::new(key.default_value()))
    }

    pub fn value(&self, key: ConfigKey) -> u32 {
        self.get(key).value
    }

    pub fn set_value(&mut self, key: ConfigKey, value: u32) {
        let default_value = key.default_value();
        self.params
            .entry(key)
            .or_insert_with(|| ConfigParameter::new(default_value))
            .value = value;
    }

    /// Reset every value to its default
    pub fn reset(&mut self) {
        for param in self.params.values_mut() {
            param.value = param.default_value;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConfigKey, ConfigParameter)> + '_ {
        self.params.iter().map(|(k, v)| (*k, *v))
    }
}

/// Values last reported by the device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    pub mode_auto: Option<bool>,
    pub gain_setting: Option<u32>,
    pub ping_interval: Option<u16>,
    pub scan_start: Option<u32>,
    pub scan_length: Option<u32>,
    pub speed_of_sound: Option<u32>,
    /// Latest distance in mm
    pub distance: Option<u32>,
    pub confidence: Option<u16>,
    pub voltage_5: Option<u16>,
    /// Degrees Celsius
    pub processor_temperature: Option<f32>,
    /// Degrees Celsius
    pub pcb_temperature: Option<f32>,
}

impl DeviceState {
    /// Reported value for a configuration key, if the device told us yet
    pub fn reported(&self, key: ConfigKey) -> Option<u32> {
        match key {
            ConfigKey::AutomaticMode => self.mode_auto.map(u32::from),
            ConfigKey::GainSetting => self.gain_setting,
            ConfigKey::PingInterval => self.ping_interval.map(u32::from),
            ConfigKey::ScanLength => self.scan_length,
            ConfigKey::ScanStart => self.scan_start,
            ConfigKey::SpeedOfSound => self.speed_of_sound,
        }
    }

    /// Fold a decoded message into the reported state
    ///
    /// Returns true if the message carried device state.
    pub fn apply(&mut self, message: &Message) -> bool {
        match message {
            Message::ModeAuto { mode_auto } => self.mode_auto = Some(*mode_auto),
            Message::GainSetting { gain_setting } => self.gain_setting = Some(*gain_setting),
            Message::PingInterval { ping_interval } => self.ping_interval = Some(*ping_interval),
            Message::SpeedOfSound { speed_of_sound } => {
                self.speed_of_sound = Some(*speed_of_sound)
            }
            Message::Range {
                scan_start,
                scan_length,
            } => {
                self.scan_start = Some(*scan_start);
                self.scan_length = Some(*scan_length);
            }
            Message::GeneralInfo(info) => {
                self.mode_auto = Some(info.mode_auto);
                self.gain_setting = Some(u32::from(info.gain_setting));
                self.ping_interval = Some(info.ping_interval);
                self.voltage_5 = Some(info.voltage_5);
            }
            Message::Voltage5 { millivolts } => self.voltage_5 = Some(*millivolts),
            Message::ProcessorTemperature { centidegrees } => {
                self.processor_temperature = Some(f32::from(*centidegrees) / 100.0)
            }
            Message::PcbTemperature { centidegrees } => {
                self.pcb_temperature = Some(f32::from(*centidegrees) / 100.0)
            }
            Message::DistanceSimple {
                distance,
                confidence,
            } => {
                self.distance = Some(*distance);
                self.confidence = Some(u16::from(*confidence));
            }
            Message::Distance(d) => self.apply_distance(d),
            Message::Profile(p) => self.apply_distance(&p.distance),
            _ => return false,
        }
        true
    }

    fn apply_distance(&mut self, d: &sonar_protocol::Distance) {
        self.distance = Some(d.distance);
        self.confidence = Some(d.confidence);
        self.scan_start = Some(d.scan_start);
        self.scan_length = Some(d.scan_length);
        self.gain_setting = Some(d.gain_setting);
    }
}

/// Snapshot of the session for queries
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub autodetect: bool,
    pub link: Option<LinkConfiguration>,
    pub log_link: Option<LinkConfiguration>,
    pub identity: Option<DeviceIdentity>,
    pub configuration: DeviceConfiguration,
    pub device: DeviceState,
    pub streaming: bool,
    pub flashing: bool,
    /// Frames dropped by the parser since connecting
    pub parse_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_key() {
        let config = DeviceConfiguration::default();
        assert_eq!(config.iter().count(), ConfigKey::ALL.len());
        assert_eq!(config.value(ConfigKey::AutomaticMode), 1);
        assert_eq!(config.value(ConfigKey::SpeedOfSound), 1_500_000);
        assert_eq!(config.iter().next().map(|(k, _)| k), Some(ConfigKey::AutomaticMode));
    }

    #[test]
    fn test_stored_values_overlay_defaults() {
        let mut stored = DeviceConfiguration::default();
        stored.set_value(ConfigKey::GainSetting, 4);
        let config = DeviceConfiguration::with_stored(Some(&stored));
        assert_eq!(config.value(ConfigKey::GainSetting), 4);
        assert_eq!(config.get(ConfigKey::GainSetting).default_value, 0);
        assert_eq!(config.value(ConfigKey::PingInterval), 100);
    }

    #[test]
    fn test_partial_stored_record() {
        let stored: DeviceConfiguration =
            serde_json::from_str(r#"{"scanLength":{"value":2000,"default_value":5000}}"#).unwrap();
        let config = DeviceConfiguration::with_stored(Some(&stored));
        assert_eq!(config.value(ConfigKey::ScanLength), 2000);
        assert_eq!(config.value(ConfigKey::AutomaticMode), 1);
    }

    #[test]
    fn test_reset() {
        let mut config = DeviceConfiguration::default();
        config.set_value(ConfigKey::ScanStart, 100);
        config.reset();
        assert_eq!(config, DeviceConfiguration::default());
    }

    #[test]
    fn test_device_state_apply() {
        let mut state = DeviceState::default();
        assert_eq!(state.reported(ConfigKey::AutomaticMode), None);

        assert!(state.apply(&Message::ModeAuto { mode_auto: false }));
        assert!(state.apply(&Message::Range {
            scan_start: 10,
            scan_length: 3000
        }));
        assert!(state.apply(&Message::ProcessorTemperature { centidegrees: 4250 }));
        assert!(!state.apply(&Message::Ack { acked_id: 1 }));

        assert_eq!(state.reported(ConfigKey::AutomaticMode), Some(0));
        assert_eq!(state.reported(ConfigKey::ScanLength), Some(3000));
        assert_eq!(state.processor_temperature, Some(42.5));
    }
}
