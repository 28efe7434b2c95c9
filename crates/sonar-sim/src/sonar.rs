//! Virtual sonar device
//!
//! Holds the state a Ping echosounder reports and answers protocol messages
//! the way the firmware does: polls get the requested message back, set
//! commands are applied and acknowledged, anything else is nacked.

use std::f32::consts::TAU;

use serde::{Deserialize, Serialize};
use sonar_protocol::{
    DeviceType, Distance, FirmwareVersion, GeneralInfo, Message, MessageId, Profile,
};
use tracing::debug;

/// Configuration for creating a virtual sonar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualSonarConfig {
    /// Device id used as frame source
    pub device_id: u8,
    pub device_model: u8,
    pub firmware_major: u16,
    pub firmware_minor: u16,
    /// Samples per profile
    pub profile_points: u16,
    /// Stream profiles from power-on without waiting for `continuous_start`
    pub autostream: bool,
    /// Initial milliseconds between pings
    pub ping_interval: u16,
    /// Initial speed of sound in mm/s
    pub speed_of_sound: u32,
    /// Initial scan window start in mm
    pub scan_start: u32,
    /// Initial scan window length in mm
    pub scan_length: u32,
    pub mode_auto: bool,
    pub gain_setting: u32,
}

impl Default for VirtualSonarConfig {
    fn default() -> Self {
        Self {
            device_id: 1,
            device_model: 1,
            firmware_major: 3,
            firmware_minor: 29,
            profile_points: 200,
            autostream: false,
            ping_interval: 100,
            speed_of_sound: 1_500_000,
            scan_start: 0,
            scan_length: 5000,
            mode_auto: true,
            gain_setting: 0,
        }
    }
}

/// A simulated Ping echosounder
#[derive(Debug)]
pub struct VirtualSonar {
    config: VirtualSonarConfig,
    device_id: u8,
    ping_interval: u16,
    speed_of_sound: u32,
    scan_start: u32,
    scan_length: u32,
    mode_auto: bool,
    gain_setting: u32,
    ping_enable: bool,
    streaming: Option<u16>,
    ping_number: u32,
    in_bootloader: bool,
}

impl VirtualSonar {
    pub fn new(config: VirtualSonarConfig) -> Self {
        Self {
            device_id: config.device_id,
            ping_interval: config.ping_interval,
            speed_of_sound: config.speed_of_sound,
            scan_start: config.scan_start,
            scan_length: config.scan_length,
            mode_auto: config.mode_auto,
            gain_setting: config.gain_setting,
            ping_enable: true,
            streaming: config
                .autostream
                .then_some(MessageId::Profile.as_u16()),
            ping_number: 0,
            in_bootloader: false,
            config,
        }
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn ping_interval(&self) -> u16 {
        self.ping_interval
    }

    pub fn mode_auto(&self) -> bool {
        self.mode_auto
    }

    pub fn gain_setting(&self) -> u32 {
        self.gain_setting
    }

    pub fn scan_range(&self) -> (u32, u32) {
        (self.scan_start, self.scan_length)
    }

    pub fn speed_of_sound(&self) -> u32 {
        self.speed_of_sound
    }

    /// Whether continuous output is active
    pub fn streaming(&self) -> bool {
        self.streaming.is_some() && self.ping_enable && !self.in_bootloader
    }

    pub fn in_bootloader(&self) -> bool {
        self.in_bootloader
    }

    /// Handle one inbound message and return the replies
    pub fn process(&mut self, message: &Message) -> Vec<Message> {
        if self.in_bootloader {
            return Vec::new();
        }

        let reply = match message {
            Message::Request { id } => self.report(*id),
            Message::GeneralRequest { requested_id } => match MessageId::from_u16(*requested_id) {
                Some(id) => self.report(id),
                None => self.nack(message.id(), "unknown message"),
            },
            Message::SetDeviceId { device_id } => {
                self.device_id = *device_id;
                self.ack(message)
            }
            Message::SetRange {
                scan_start,
                scan_length,
            } => {
                self.scan_start = *scan_start;
                self.scan_length = (*scan_length).max(1);
                self.ack(message)
            }
            Message::SetSpeedOfSound { speed_of_sound } => {
                self.speed_of_sound = *speed_of_sound;
                self.ack(message)
            }
            Message::SetModeAuto { mode_auto } => {
                self.mode_auto = *mode_auto;
                self.ack(message)
            }
            Message::SetPingInterval { ping_interval } => {
                self.ping_interval = (*ping_interval).max(10);
                self.ack(message)
            }
            Message::SetGainSetting { gain_setting } => {
                self.gain_setting = u32::from(*gain_setting);
                self.ack(message)
            }
            Message::SetPingEnable { enabled } => {
                self.ping_enable = *enabled;
                self.ack(message)
            }
            Message::GotoBootloader => {
                debug!("Virtual sonar {} entering bootloader", self.device_id);
                let ack = self.ack(message);
                self.in_bootloader = true;
                self.streaming = None;
                ack
            }
            Message::ContinuousStart { id } => {
                if *id == MessageId::Profile.as_u16() || *id == MessageId::Distance.as_u16() {
                    self.streaming = Some(*id);
                    self.ack(message)
                } else {
                    self.nack(message.id(), "cannot stream this message")
                }
            }
            Message::ContinuousStop { .. } => {
                self.streaming = None;
                self.ack(message)
            }
            other => self.nack(other.id(), "unsupported"),
        };

        vec![reply]
    }

    /// Next message of the continuous stream, if streaming
    pub fn next_streamed(&mut self) -> Option<Message> {
        if !self.streaming() {
            return None;
        }
        match self.streaming.and_then(MessageId::from_u16) {
            Some(MessageId::Distance) => Some(Message::Distance(self.ping().distance)),
            _ => Some(Message::Profile(self.ping())),
        }
    }

    fn ack(&self, message: &Message) -> Message {
        Message::Ack {
            acked_id: message.id(),
        }
    }

    fn nack(&self, id: u16, text: &str) -> Message {
        Message::Nack {
            nacked_id: id,
            message: text.to_string(),
        }
    }

    /// Reply to a poll for the given message
    fn report(&mut self, id: MessageId) -> Message {
        match id {
            MessageId::FirmwareVersion => Message::FirmwareVersion(FirmwareVersion {
                device_type: DeviceType::Echosounder.into(),
                device_model: self.config.device_model,
                version_major: self.config.firmware_major,
                version_minor: self.config.firmware_minor,
            }),
            MessageId::DeviceId => Message::DeviceId {
                device_id: self.device_id,
            },
            MessageId::Voltage5 => Message::Voltage5 {
                millivolts: 5000 + (self.ping_number % 20) as u16,
            },
            MessageId::SpeedOfSound => Message::SpeedOfSound {
                speed_of_sound: self.speed_of_sound,
            },
            MessageId::Range => Message::Range {
                scan_start: self.scan_start,
                scan_length: self.scan_length,
            },
            MessageId::ModeAuto => Message::ModeAuto {
                mode_auto: self.mode_auto,
            },
            MessageId::PingInterval => Message::PingInterval {
                ping_interval: self.ping_interval,
            },
            MessageId::GainSetting => Message::GainSetting {
                gain_setting: self.gain_setting,
            },
            MessageId::TransmitDuration => Message::TransmitDuration {
                transmit_duration: 50,
            },
            MessageId::GeneralInfo => Message::GeneralInfo(GeneralInfo {
                version_major: self.config.firmware_major,
                version_minor: self.config.firmware_minor,
                voltage_5: 5000,
                ping_interval: self.ping_interval,
                gain_setting: self.gain_setting.min(u32::from(u8::MAX)) as u8,
                mode_auto: self.mode_auto,
            }),
            MessageId::DistanceSimple => {
                let d = self.ping().distance;
                Message::DistanceSimple {
                    distance: d.distance,
                    confidence: d.confidence.min(100) as u8,
                }
            }
            MessageId::Distance => Message::Distance(self.ping().distance),
            MessageId::ProcessorTemperature => Message::ProcessorTemperature { centidegrees: 4200 },
            MessageId::PcbTemperature => Message::PcbTemperature { centidegrees: 3850 },
            MessageId::PingEnable => Message::PingEnable {
                enabled: self.ping_enable,
            },
            MessageId::Profile => Message::Profile(self.ping()),
            other => self.nack(other.as_u16(), "not readable"),
        }
    }

    /// Fire one synthetic ping
    ///
    /// The echo sweeps slowly through the middle half of the scan window.
    fn ping(&mut self) -> Profile {
        self.ping_number = self.ping_number.wrapping_add(1);
        let phase = (self.ping_number % 200) as f32 / 200.0 * TAU;
        let center = 0.5 + 0.25 * phase.sin();
        let points = usize::from(self.config.profile_points.max(1));
        let width = 0.03f32;

        let profile_data = (0..points)
            .map(|i| {
                let x = i as f32 / points as f32;
                let echo = (-(x - center).powi(2) / (2.0 * width * width)).exp() * 230.0;
                let noise = ((i as u32 * 31 + self.ping_number * 17) % 13) as f32;
                (echo + noise).min(255.0) as u8
            })
            .collect();

        Profile {
            distance: Distance {
                distance: self.scan_start + (center * self.scan_length as f32) as u32,
                confidence: 90,
                transmit_duration: 50,
                ping_number: self.ping_number,
                scan_start: self.scan_start,
                scan_length: self.scan_length,
                gain_setting: self.gain_setting,
            },
            profile_data,
        }
    }
}

impl Default for VirtualSonar {
    fn default() -> Self {
        Self::new(VirtualSonarConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_returns_requested_message() {
        let mut sonar = VirtualSonar::default();
        let replies = sonar.process(&Message::Request {
            id: MessageId::FirmwareVersion,
        });
        assert!(matches!(
            replies.as_slice(),
            [Message::FirmwareVersion(FirmwareVersion {
                version_major: 3,
                ..
            })]
        ));
    }

    #[test]
    fn test_set_is_applied_and_acked() {
        let mut sonar = VirtualSonar::default();
        let replies = sonar.process(&Message::SetModeAuto { mode_auto: false });
        assert_eq!(replies, vec![Message::Ack { acked_id: 1003 }]);
        assert!(!sonar.mode_auto());

        sonar.process(&Message::SetRange {
            scan_start: 500,
            scan_length: 2000,
        });
        assert_eq!(sonar.scan_range(), (500, 2000));
    }

    #[test]
    fn test_streaming_lifecycle() {
        let mut sonar = VirtualSonar::default();
        assert!(sonar.next_streamed().is_none());

        sonar.process(&Message::ContinuousStart { id: 1300 });
        let Some(Message::Profile(profile)) = sonar.next_streamed() else {
            panic!("expected profile");
        };
        assert_eq!(profile.profile_data.len(), 200);
        assert_eq!(profile.distance.scan_length, 5000);

        sonar.process(&Message::ContinuousStop { id: 1300 });
        assert!(sonar.next_streamed().is_none());
    }

    #[test]
    fn test_bootloader_goes_silent() {
        let mut sonar = VirtualSonar::new(VirtualSonarConfig {
            autostream: true,
            ..Default::default()
        });
        assert!(sonar.streaming());
        sonar.process(&Message::GotoBootloader);
        assert!(sonar.in_bootloader());
        assert!(!sonar.streaming());
        assert!(sonar
            .process(&Message::Request {
                id: MessageId::DeviceId
            })
            .is_empty());
    }

    #[test]
    fn test_unsupported_message_nacked() {
        let mut sonar = VirtualSonar::default();
        let replies = sonar.process(&Message::AsciiText("hi".into()));
        assert!(matches!(replies.as_slice(), [Message::Nack { nacked_id: 3, .. }]));
    }
}
