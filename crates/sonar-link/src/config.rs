//! Link configuration and validation
//!
//! A [`LinkConfiguration`] is the declarative description of a transport:
//! its type, an ordered list of string arguments, and a display name.
//! Validity is a pure function of the type and the shape of the arguments,
//! so a configuration can be checked before any OS resource is touched.
//!
//! | type       | args             |
//! |------------|------------------|
//! | Serial     | `[path, baud]`   |
//! | Udp        | `[host, port]`   |
//! | File       | `[path, mode]`   |
//! | Simulation | `[]`             |

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport type tag
///
/// Persisted as a numeric tag so configurations written by other versions
/// still load; tags this build does not know become [`LinkType::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum LinkType {
    None,
    File,
    Serial,
    Udp,
    Simulation,
    Unknown(u8),
}

impl LinkType {
    /// Number of arguments this type requires
    pub fn arity(&self) -> usize {
        match self {
            LinkType::Serial | LinkType::Udp | LinkType::File => 2,
            LinkType::None | LinkType::Simulation | LinkType::Unknown(_) => 0,
        }
    }

    /// Returns a human-readable name for the link type
    pub fn name(&self) -> &'static str {
        match self {
            LinkType::None => "None",
            LinkType::File => "File",
            LinkType::Serial => "Serial",
            LinkType::Udp => "UDP",
            LinkType::Simulation => "Simulation",
            LinkType::Unknown(_) => "Unknown",
        }
    }
}

impl From<u8> for LinkType {
    fn from(tag: u8) -> Self {
        match tag {
            0 => LinkType::None,
            1 => LinkType::File,
            2 => LinkType::Serial,
            3 => LinkType::Udp,
            4 => LinkType::Simulation,
            other => LinkType::Unknown(other),
        }
    }
}

impl From<LinkType> for u8 {
    fn from(link_type: LinkType) -> Self {
        match link_type {
            LinkType::None => 0,
            LinkType::File => 1,
            LinkType::Serial => 2,
            LinkType::Udp => 3,
            LinkType::Simulation => 4,
            LinkType::Unknown(tag) => tag,
        }
    }
}

/// Classification of a configuration
///
/// Variants are ordered: everything up to and including `NoErrors` counts as
/// valid, everything after it is a real error. `MissingConfiguration` sits
/// below the baseline and is never produced by [`LinkConfiguration::error`];
/// it marks the absence of any stored configuration.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigurationError {
    #[error("no link configuration available")]
    MissingConfiguration,
    #[error("no errors")]
    NoErrors,
    #[error("link type not set")]
    NoType,
    #[error("link type is not supported")]
    InvalidType,
    #[error("link arguments are missing")]
    NoArgs,
    #[error("wrong number of link arguments")]
    InvalidArgsNumber,
    #[error("link arguments are empty")]
    ArgsAreEmpty,
    #[error("link address is malformed")]
    InvalidUrl,
}

/// Mode of a file link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Replay previously recorded bytes
    Read,
    /// Record inbound bytes
    Write,
}

impl FileMode {
    fn parse(arg: &str) -> Option<Self> {
        match arg {
            "r" => Some(FileMode::Read),
            "w" => Some(FileMode::Write),
            _ => None,
        }
    }

    fn as_arg(&self) -> &'static str {
        match self {
            FileMode::Read => "r",
            FileMode::Write => "w",
        }
    }
}

/// Declarative description of a transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkConfiguration {
    #[serde(rename = "type")]
    link_type: LinkType,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    name: String,
}

impl Default for LinkConfiguration {
    fn default() -> Self {
        Self {
            link_type: LinkType::None,
            args: Vec::new(),
            name: String::new(),
        }
    }
}

impl LinkConfiguration {
    pub fn new(link_type: LinkType, args: Vec<String>, name: impl Into<String>) -> Self {
        Self {
            link_type,
            args,
            name: name.into(),
        }
    }

    /// Serial port at the given baud rate
    pub fn serial(port: &str, baud_rate: u32) -> Self {
        Self::new(
            LinkType::Serial,
            vec![port.to_string(), baud_rate.to_string()],
            port,
        )
    }

    /// UDP endpoint
    pub fn udp(host: &str, port: u16) -> Self {
        Self::new(
            LinkType::Udp,
            vec![host.to_string(), port.to_string()],
            format!("{}:{}", host, port),
        )
    }

    /// Replay of a recorded file
    pub fn file_replay(path: &str) -> Self {
        Self::file(path, FileMode::Read)
    }

    /// Recording sink
    pub fn file_log(path: &str) -> Self {
        Self::file(path, FileMode::Write)
    }

    fn file(path: &str, mode: FileMode) -> Self {
        Self::new(
            LinkType::File,
            vec![path.to_string(), mode.as_arg().to_string()],
            path,
        )
    }

    /// Synthetic device
    pub fn simulation() -> Self {
        Self::new(LinkType::Simulation, Vec::new(), "Simulation")
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_type(&mut self, link_type: LinkType) {
        self.link_type = link_type;
    }

    pub fn set_args(&mut self, args: Vec<String>) {
        self.args = args;
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Classify the configuration
    ///
    /// Checks run in priority order so the first problem found wins: a
    /// Serial configuration with no args is `NoArgs`, never `ArgsAreEmpty`.
    pub fn error(&self) -> ConfigurationError {
        match self.link_type {
            LinkType::None => return ConfigurationError::NoType,
            LinkType::Unknown(_) => return ConfigurationError::InvalidType,
            _ => {}
        }

        let arity = self.link_type.arity();
        if arity > 0 && self.args.is_empty() {
            return ConfigurationError::NoArgs;
        }
        if self.args.len() != arity {
            return ConfigurationError::InvalidArgsNumber;
        }
        if self.args.iter().any(|arg| arg.is_empty()) {
            return ConfigurationError::ArgsAreEmpty;
        }
        if !self.args_well_formed() {
            return ConfigurationError::InvalidUrl;
        }

        ConfigurationError::NoErrors
    }

    pub fn is_valid(&self) -> bool {
        self.error() <= ConfigurationError::NoErrors
    }

    /// `Ok` when valid, otherwise the classification
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self.error() {
            e if e <= ConfigurationError::NoErrors => Ok(()),
            e => Err(e),
        }
    }

    fn args_well_formed(&self) -> bool {
        match self.link_type {
            LinkType::Serial => self.args[1].parse::<u32>().is_ok_and(|baud| baud > 0),
            LinkType::Udp => {
                is_host(&self.args[0]) && self.args[1].parse::<u16>().is_ok_and(|port| port > 0)
            }
            LinkType::File => FileMode::parse(&self.args[1]).is_some(),
            _ => true,
        }
    }

    fn arg(&self, link_type: LinkType, index: usize) -> &str {
        if self.link_type != link_type {
            return "";
        }
        self.args.get(index).map(String::as_str).unwrap_or_default()
    }

    /// Serial device path, empty for other types
    pub fn serial_port(&self) -> &str {
        self.arg(LinkType::Serial, 0)
    }

    /// Serial baud rate, zero for other types
    pub fn serial_baudrate(&self) -> u32 {
        self.arg(LinkType::Serial, 1).parse().unwrap_or(0)
    }

    /// UDP host, empty for other types
    pub fn udp_host(&self) -> &str {
        self.arg(LinkType::Udp, 0)
    }

    /// UDP port, zero for other types
    pub fn udp_port(&self) -> u16 {
        self.arg(LinkType::Udp, 1).parse().unwrap_or(0)
    }

    /// File path, empty for other types
    pub fn file_path(&self) -> &str {
        self.arg(LinkType::File, 0)
    }

    /// File mode, `None` for other types
    pub fn file_mode(&self) -> Option<FileMode> {
        FileMode::parse(self.arg(LinkType::File, 1))
    }

    pub fn is_file(&self) -> bool {
        self.link_type == LinkType::File
    }

    pub fn is_simulation(&self) -> bool {
        self.link_type == LinkType::Simulation
    }

    /// Whether a link built from this configuration accepts writes
    pub fn is_writable_type(&self) -> bool {
        match self.link_type {
            LinkType::Serial | LinkType::Udp => true,
            LinkType::File => self.file_mode() == Some(FileMode::Write),
            _ => false,
        }
    }
}

/// Full configuration string, e.g. `Serial:/dev/ttyUSB0:115200`
impl fmt::Display for LinkConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.link_type.name())?;
        for arg in &self.args {
            write!(f, ":{}", arg)?;
        }
        Ok(())
    }
}

fn is_host(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_are_valid() {
        assert!(LinkConfiguration::serial("/dev/ttyUSB0", 115200).is_valid());
        assert!(LinkConfiguration::udp("192.168.2.2", 9090).is_valid());
        assert!(LinkConfiguration::udp("ping.local", 12345).is_valid());
        assert!(LinkConfiguration::file_replay("/tmp/run.bin").is_valid());
        assert!(LinkConfiguration::file_log("/tmp/run.bin").is_valid());
        assert!(LinkConfiguration::simulation().is_valid());
    }

    #[test]
    fn test_error_precedence() {
        let none = LinkConfiguration::new(LinkType::None, vec!["x".into()], "");
        assert_eq!(none.error(), ConfigurationError::NoType);

        let unknown = LinkConfiguration::new(LinkType::Unknown(9), Vec::new(), "");
        assert_eq!(unknown.error(), ConfigurationError::InvalidType);

        let no_args = LinkConfiguration::new(LinkType::Serial, Vec::new(), "");
        assert_eq!(no_args.error(), ConfigurationError::NoArgs);

        let one_arg = LinkConfiguration::new(LinkType::Serial, vec!["/dev/ttyS0".into()], "");
        assert_eq!(one_arg.error(), ConfigurationError::InvalidArgsNumber);

        let empty = LinkConfiguration::new(LinkType::Serial, vec![String::new(), "9600".into()], "");
        assert_eq!(empty.error(), ConfigurationError::ArgsAreEmpty);

        let sim_args = LinkConfiguration::new(LinkType::Simulation, vec!["x".into()], "");
        assert_eq!(sim_args.error(), ConfigurationError::InvalidArgsNumber);
    }

    #[test]
    fn test_malformed_args_are_invalid_url() {
        let cases = [
            LinkConfiguration::new(LinkType::Serial, vec!["/dev/ttyS0".into(), "fast".into()], ""),
            LinkConfiguration::new(LinkType::Serial, vec!["/dev/ttyS0".into(), "0".into()], ""),
            LinkConfiguration::new(LinkType::Udp, vec!["bad host".into(), "80".into()], ""),
            LinkConfiguration::new(LinkType::Udp, vec!["10.0.0.1".into(), "70000".into()], ""),
            LinkConfiguration::new(LinkType::File, vec!["/tmp/x".into(), "rw".into()], ""),
        ];
        for config in cases {
            assert_eq!(config.error(), ConfigurationError::InvalidUrl, "{}", config);
        }
    }

    #[test]
    fn test_missing_configuration_ordering() {
        assert!(ConfigurationError::MissingConfiguration < ConfigurationError::NoErrors);
        assert!(ConfigurationError::NoErrors < ConfigurationError::NoType);
        assert!(ConfigurationError::ArgsAreEmpty < ConfigurationError::InvalidUrl);
    }

    #[test]
    fn test_accessors_ignore_other_types() {
        let serial = LinkConfiguration::serial("/dev/ttyACM0", 115200);
        assert_eq!(serial.serial_port(), "/dev/ttyACM0");
        assert_eq!(serial.serial_baudrate(), 115200);
        assert_eq!(serial.udp_host(), "");
        assert_eq!(serial.udp_port(), 0);
        assert_eq!(serial.file_mode(), None);

        let udp = LinkConfiguration::udp("192.168.2.2", 12345);
        assert_eq!(udp.udp_host(), "192.168.2.2");
        assert_eq!(udp.udp_port(), 12345);
        assert_eq!(udp.serial_port(), "");
        assert_eq!(udp.serial_baudrate(), 0);
    }

    #[test]
    fn test_writable_types() {
        assert!(LinkConfiguration::serial("/dev/ttyUSB0", 115200).is_writable_type());
        assert!(LinkConfiguration::udp("127.0.0.1", 1).is_writable_type());
        assert!(LinkConfiguration::file_log("/tmp/x").is_writable_type());
        assert!(!LinkConfiguration::file_replay("/tmp/x").is_writable_type());
        assert!(!LinkConfiguration::simulation().is_writable_type());
    }

    #[test]
    fn test_display_full_string() {
        assert_eq!(
            LinkConfiguration::serial("/dev/ttyUSB0", 115200).to_string(),
            "Serial:/dev/ttyUSB0:115200"
        );
        assert_eq!(LinkConfiguration::simulation().to_string(), "Simulation");
    }
}
