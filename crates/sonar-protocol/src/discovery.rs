//! Ping360 UDP discovery sub-protocol
//!
//! A host broadcasts the ASCII text `Discovery` to UDP port 30303. Each
//! device answers the sender with a CRLF-separated text block:
//!
//! ```text
//! SONAR PING360
//! Blue Robotics
//! MAC Address:- 54-10-EC-79-7D-D1
//! IP Address:- 192.168.2.2(Static)
//! ```
//!
//! The device then accepts Ping protocol frames on UDP port 12345.

use std::net::Ipv4Addr;

use crate::device::DeviceType;
use crate::error::ParseError;

/// Port devices listen on for discovery requests
pub const DISCOVERY_PORT: u16 = 30303;
/// Port devices accept protocol frames on
pub const COMMAND_PORT: u16 = 12345;
/// Payload of a discovery request
pub const DISCOVERY_REQUEST: &[u8] = b"Discovery";
/// Device-name marker identifying a Ping360
pub const PING360_MARKER: &str = "PING360";

const MAC_PREFIX: &str = "MAC Address:-";
const IP_PREFIX: &str = "IP Address:-";

/// Parsed discovery reply
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveryResponse {
    pub device_name: String,
    pub manufacturer: Option<String>,
    pub mac_address: Option<String>,
    pub ip_address: Option<Ipv4Addr>,
}

impl DiscoveryResponse {
    /// Parse a reply datagram
    pub fn parse(datagram: &[u8]) -> Result<Self, ParseError> {
        let text = String::from_utf8_lossy(datagram);
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        let device_name = lines
            .next()
            .ok_or_else(|| ParseError::InvalidDiscovery("empty reply".into()))?
            .to_string();

        let mut response = Self {
            device_name,
            manufacturer: None,
            mac_address: None,
            ip_address: None,
        };

        for line in lines {
            if let Some(mac) = line.strip_prefix(MAC_PREFIX) {
                response.mac_address = Some(mac.trim().to_string());
            } else if let Some(ip) = line.strip_prefix(IP_PREFIX) {
                // "192.168.2.2(Static)" or "192.168.2.2 (DHCP)"
                let addr = ip.split('(').next().unwrap_or_default().trim();
                response.ip_address = addr.parse().ok();
            } else if response.manufacturer.is_none() {
                response.manufacturer = Some(line.to_string());
            }
        }

        Ok(response)
    }

    /// Render as a reply datagram
    pub fn to_datagram(&self) -> Vec<u8> {
        let mut text = format!("{}\r\n", self.device_name);
        if let Some(manufacturer) = &self.manufacturer {
            text.push_str(&format!("{}\r\n", manufacturer));
        }
        if let Some(mac) = &self.mac_address {
            text.push_str(&format!("{} {}\r\n", MAC_PREFIX, mac));
        }
        if let Some(ip) = &self.ip_address {
            text.push_str(&format!("{} {}(Static)\r\n", IP_PREFIX, ip));
        }
        text.into_bytes()
    }

    /// Device family named by the reply, if recognized
    pub fn device_type(&self) -> Option<DeviceType> {
        if self.device_name.to_uppercase().contains(PING360_MARKER) {
            Some(DeviceType::Ping360)
        } else {
            None
        }
    }
}
