//! Device families speaking the Ping protocol

/// Device type reported in `firmware_version`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceType {
    #[default]
    Unknown,
    /// Ping single-beam echosounder
    Echosounder,
    /// Ping360 scanning sonar
    Ping360,
}

impl DeviceType {
    /// Returns a human-readable name for the device family
    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Unknown => "Unknown",
            DeviceType::Echosounder => "Ping Echosounder",
            DeviceType::Ping360 => "Ping360",
        }
    }
}

impl From<u8> for DeviceType {
    fn from(value: u8) -> Self {
        match value {
            1 => DeviceType::Echosounder,
            2 => DeviceType::Ping360,
            _ => DeviceType::Unknown,
        }
    }
}

impl From<DeviceType> for u8 {
    fn from(value: DeviceType) -> Self {
        match value {
            DeviceType::Unknown => 0,
            DeviceType::Echosounder => 1,
            DeviceType::Ping360 => 2,
        }
    }
}
