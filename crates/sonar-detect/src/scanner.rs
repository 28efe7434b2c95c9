//! Serial port scanner
//!
//! This module enumerates serial ports and filters out names known to be
//! virtual or system ports that never host a sonar, along with USB adapters
//! the user has excluded by vendor and product id.

use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};
use tracing::{debug, info};

use crate::error::DetectError;

/// Port names skipped by default
pub const DEFAULT_BLOCKLIST: &[&str] = &[
    // Bluetooth ports on macOS
    "Bluetooth",
    "cu.Bluetooth-Incoming-Port",
    // Apple system ports
    "cu.SOC",
    "cu.MALS",
    "cu.wlan-debug",
    // Debug/logging ports
    "debug",
];

/// Information about a serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., /dev/ttyUSB0, COM3)
    pub port: String,
    /// USB Vendor ID (if USB)
    pub vid: Option<u16>,
    /// USB Product ID (if USB)
    pub pid: Option<u16>,
    /// USB product string
    pub product: Option<String>,
}

/// USB vendor and product id pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl SerialPortInfo {
    /// USB id, if this is a USB port
    pub fn usb_id(&self) -> Option<UsbId> {
        Some(UsbId {
            vid: self.vid?,
            pid: self.pid?,
        })
    }

    /// Create from serialport crate's port info
    fn from_serialport(name: String, port_type: &SerialPortType) -> Self {
        match port_type {
            SerialPortType::UsbPort(usb) => Self {
                port: name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product.clone(),
            },
            _ => Self {
                port: name,
                vid: None,
                pid: None,
                product: None,
            },
        }
    }
}

/// Serial port scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Skip ports whose name contains any of these patterns
    pub skip_patterns: Vec<String>,
    /// Skip USB ports with these vendor/product ids
    pub skip_usb_ids: Vec<UsbId>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            skip_patterns: DEFAULT_BLOCKLIST.iter().map(|s| s.to_string()).collect(),
            skip_usb_ids: Vec::new(),
        }
    }
}

/// Serial port scanner
#[derive(Debug, Clone, Default)]
pub struct PortScanner {
    config: ScannerConfig,
}

impl PortScanner {
    /// Create a new scanner with the default blocklist
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scanner with custom configuration
    pub fn with_config(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Enumerate all available serial ports not on the blocklist
    pub fn enumerate_ports(&self) -> Result<Vec<SerialPortInfo>, DetectError> {
        debug!("Enumerating serial ports...");
        let ports = available_ports().map_err(|e| DetectError::EnumerationFailed(e.to_string()))?;

        let result: Vec<_> = ports
            .into_iter()
            .map(|p| SerialPortInfo::from_serialport(p.port_name, &p.port_type))
            .filter(|p| !self.is_excluded(p))
            .collect();

        if result.is_empty() {
            debug!("No serial ports found");
        } else {
            info!("Found {} serial port(s)", result.len());
            for port in &result {
                let desc = port.product.as_deref().unwrap_or("Unknown");
                debug!("  {} - {}", port.port, desc);
            }
        }

        Ok(result)
    }

    /// Check a port against both the name blocklist and the USB id list
    pub fn is_excluded(&self, port: &SerialPortInfo) -> bool {
        if self.is_blocked(&port.port) {
            return true;
        }
        match port.usb_id() {
            Some(id) if self.config.skip_usb_ids.contains(&id) => {
                debug!("Skipping {} ({:04x}:{:04x})", port.port, id.vid, id.pid);
                true
            }
            _ => false,
        }
    }

    /// Check if a port name is on the blocklist
    pub fn is_blocked(&self, port: &str) -> bool {
        self.config
            .skip_patterns
            .iter()
            .any(|pattern| port.contains(pattern.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    #[test]
    fn test_serial_port_info_from_usb() {
        let usb_info = SerialPortType::UsbPort(UsbPortInfo {
            vid: 0x0403,
            pid: 0x6015,
            serial_number: Some("DM01ABCD".to_string()),
            manufacturer: Some("FTDI".to_string()),
            product: Some("FT231X USB UART".to_string()),
        });

        let info = SerialPortInfo::from_serialport("/dev/ttyUSB0".to_string(), &usb_info);

        assert_eq!(info.vid, Some(0x0403));
        assert_eq!(info.pid, Some(0x6015));
        assert_eq!(info.product.as_deref(), Some("FT231X USB UART"));
        assert_eq!(
            info.usb_id(),
            Some(UsbId {
                vid: 0x0403,
                pid: 0x6015
            })
        );

        let pci = SerialPortInfo::from_serialport("/dev/ttyS0".to_string(), &SerialPortType::PciPort);
        assert_eq!(pci.usb_id(), None);
    }

    #[test]
    fn test_usb_id_exclusion() {
        let scanner = PortScanner::with_config(ScannerConfig {
            skip_usb_ids: vec![UsbId {
                vid: 0x2341,
                pid: 0x0043,
            }],
            ..Default::default()
        });
        let port = |name: &str, vid, pid| SerialPortInfo {
            port: name.to_string(),
            vid,
            pid,
            product: None,
        };

        assert!(scanner.is_excluded(&port("/dev/ttyACM0", Some(0x2341), Some(0x0043))));
        assert!(!scanner.is_excluded(&port("/dev/ttyUSB0", Some(0x0403), Some(0x6015))));
        assert!(!scanner.is_excluded(&port("/dev/ttyS0", None, None)));
        // Name blocklist still applies
        assert!(scanner.is_excluded(&port("/dev/cu.Bluetooth-Incoming-Port", None, None)));
    }

    #[test]
    fn test_usb_ids_from_json() {
        let config: ScannerConfig =
            serde_json::from_str(r#"{ "skip_usb_ids": [{ "vid": 9025, "pid": 67 }] }"#).unwrap();
        assert_eq!(config.skip_usb_ids, vec![UsbId { vid: 0x2341, pid: 0x0043 }]);
        // Omitted fields keep their defaults
        assert!(config.skip_patterns.contains(&"debug".to_string()));
    }

    #[test]
    fn test_blocklist() {
        let scanner = PortScanner::new();
        assert!(scanner.is_blocked("/dev/cu.Bluetooth-Incoming-Port"));
        assert!(scanner.is_blocked("/dev/cu.SOC"));
        assert!(scanner.is_blocked("/dev/cu.wlan-debug"));
        assert!(!scanner.is_blocked("/dev/ttyUSB0"));
        assert!(!scanner.is_blocked("COM3"));
    }

    #[test]
    fn test_custom_blocklist() {
        let scanner = PortScanner::with_config(ScannerConfig {
            skip_patterns: vec!["ttyS".to_string()],
            ..Default::default()
        });
        assert!(scanner.is_blocked("/dev/ttyS0"));
        assert!(!scanner.is_blocked("/dev/cu.SOC"));
    }
}
