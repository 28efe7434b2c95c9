//! Ping message catalog
//!
//! Each message id maps to a fixed little-endian field layout. [`Message`]
//! is the typed view of a [`Frame`]; decoding never fails on an unknown id,
//! which comes back as [`Message::Unknown`] for the caller to report.
//!
//! A frame with a known id and an empty payload is the generic poll: the host
//! asks the device to send that message. It decodes as [`Message::Request`].

use crate::error::ParseError;
use crate::frame::Frame;

/// Protocol message ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum MessageId {
    Ack = 1,
    Nack = 2,
    AsciiText = 3,
    GeneralRequest = 6,
    SetDeviceId = 1000,
    SetRange = 1001,
    SetSpeedOfSound = 1002,
    SetModeAuto = 1003,
    SetPingInterval = 1004,
    SetGainSetting = 1005,
    SetPingEnable = 1006,
    GotoBootloader = 1100,
    FirmwareVersion = 1200,
    DeviceId = 1201,
    Voltage5 = 1202,
    SpeedOfSound = 1203,
    Range = 1204,
    ModeAuto = 1205,
    PingInterval = 1206,
    GainSetting = 1207,
    TransmitDuration = 1208,
    GeneralInfo = 1210,
    DistanceSimple = 1211,
    Distance = 1212,
    ProcessorTemperature = 1213,
    PcbTemperature = 1214,
    PingEnable = 1215,
    Profile = 1300,
    ContinuousStart = 1400,
    ContinuousStop = 1401,
}

impl MessageId {
    /// All known ids, in numeric order
    pub const ALL: [MessageId; 30] = [
        MessageId::Ack,
        MessageId::Nack,
        MessageId::AsciiText,
        MessageId::GeneralRequest,
        MessageId::SetDeviceId,
        MessageId::SetRange,
        MessageId::SetSpeedOfSound,
        MessageId::SetModeAuto,
        MessageId::SetPingInterval,
        MessageId::SetGainSetting,
        MessageId::SetPingEnable,
        MessageId::GotoBootloader,
        MessageId::FirmwareVersion,
        MessageId::DeviceId,
        MessageId::Voltage5,
        MessageId::SpeedOfSound,
        MessageId::Range,
        MessageId::ModeAuto,
        MessageId::PingInterval,
        MessageId::GainSetting,
        MessageId::TransmitDuration,
        MessageId::GeneralInfo,
        MessageId::DistanceSimple,
        MessageId::Distance,
        MessageId::ProcessorTemperature,
        MessageId::PcbTemperature,
        MessageId::PingEnable,
        MessageId::Profile,
        MessageId::ContinuousStart,
        MessageId::ContinuousStop,
    ];

    /// Numeric id on the wire
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Look up a known id
    pub fn from_u16(id: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_u16() == id)
    }

    /// Protocol name of the message
    pub fn name(self) -> &'static str {
        match self {
            MessageId::Ack => "ack",
            MessageId::Nack => "nack",
            MessageId::AsciiText => "ascii_text",
            MessageId::GeneralRequest => "general_request",
            MessageId::SetDeviceId => "set_device_id",
            MessageId::SetRange => "set_range",
            MessageId::SetSpeedOfSound => "set_speed_of_sound",
            MessageId::SetModeAuto => "set_mode_auto",
            MessageId::SetPingInterval => "set_ping_interval",
            MessageId::SetGainSetting => "set_gain_setting",
            MessageId::SetPingEnable => "set_ping_enable",
            MessageId::GotoBootloader => "goto_bootloader",
            MessageId::FirmwareVersion => "firmware_version",
            MessageId::DeviceId => "device_id",
            MessageId::Voltage5 => "voltage_5",
            MessageId::SpeedOfSound => "speed_of_sound",
            MessageId::Range => "range",
            MessageId::ModeAuto => "mode_auto",
            MessageId::PingInterval => "ping_interval",
            MessageId::GainSetting => "gain_setting",
            MessageId::TransmitDuration => "transmit_duration",
            MessageId::GeneralInfo => "general_info",
            MessageId::DistanceSimple => "distance_simple",
            MessageId::Distance => "distance",
            MessageId::ProcessorTemperature => "processor_temperature",
            MessageId::PcbTemperature => "pcb_temperature",
            MessageId::PingEnable => "ping_enable",
            MessageId::Profile => "profile",
            MessageId::ContinuousStart => "continuous_start",
            MessageId::ContinuousStop => "continuous_stop",
        }
    }
}

impl TryFrom<u16> for MessageId {
    type Error = u16;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        Self::from_u16(id).ok_or(id)
    }
}

/// Device identification reported by `firmware_version`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareVersion {
    pub device_type: u8,
    pub device_model: u8,
    pub version_major: u16,
    pub version_minor: u16,
}

/// Aggregate status reported by `general_info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GeneralInfo {
    pub version_major: u16,
    pub version_minor: u16,
    /// Board voltage in millivolts
    pub voltage_5: u16,
    /// Milliseconds between pings
    pub ping_interval: u16,
    pub gain_setting: u8,
    pub mode_auto: bool,
}

/// Distance measurement with the scan window it was taken in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Distance {
    /// Distance to target in millimeters
    pub distance: u32,
    /// Confidence in percent
    pub confidence: u16,
    /// Acoustic pulse length in microseconds
    pub transmit_duration: u16,
    pub ping_number: u32,
    /// Start of the scan window in millimeters
    pub scan_start: u32,
    /// Length of the scan window in millimeters
    pub scan_length: u32,
    pub gain_setting: u32,
}

/// Echo intensity profile across the scan window
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Profile {
    pub distance: Distance,
    /// Raw intensity samples, 0 to 255
    pub profile_data: Vec<u8>,
}

impl Profile {
    /// Intensities normalized linearly to `[0.0, 1.0]`
    pub fn points(&self) -> Vec<f32> {
        self.profile_data
            .iter()
            .map(|&b| f32::from(b) / 255.0)
            .collect()
    }
}

/// Typed protocol message
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Message {
    Ack { acked_id: u16 },
    Nack { nacked_id: u16, message: String },
    AsciiText(String),
    GeneralRequest { requested_id: u16 },
    /// Empty-payload poll for the given message
    Request { id: MessageId },

    SetDeviceId { device_id: u8 },
    SetRange { scan_start: u32, scan_length: u32 },
    SetSpeedOfSound { speed_of_sound: u32 },
    SetModeAuto { mode_auto: bool },
    SetPingInterval { ping_interval: u16 },
    SetGainSetting { gain_setting: u8 },
    SetPingEnable { enabled: bool },

    GotoBootloader,
    ContinuousStart { id: u16 },
    ContinuousStop { id: u16 },

    FirmwareVersion(FirmwareVersion),
    DeviceId { device_id: u8 },
    /// Board voltage in millivolts
    Voltage5 { millivolts: u16 },
    /// Speed of sound in mm/s
    SpeedOfSound { speed_of_sound: u32 },
    Range { scan_start: u32, scan_length: u32 },
    ModeAuto { mode_auto: bool },
    PingInterval { ping_interval: u16 },
    GainSetting { gain_setting: u32 },
    TransmitDuration { transmit_duration: u16 },
    GeneralInfo(GeneralInfo),
    DistanceSimple { distance: u32, confidence: u8 },
    Distance(Distance),
    /// Temperature in centidegrees Celsius
    ProcessorTemperature { centidegrees: u16 },
    /// Temperature in centidegrees Celsius
    PcbTemperature { centidegrees: u16 },
    PingEnable { enabled: bool },
    Profile(Profile),

    /// Message id not in the catalog
    Unknown { id: u16, payload: Vec<u8> },
}

impl Message {
    /// Numeric message id
    pub fn id(&self) -> u16 {
        let id = match self {
            Message::Ack { .. } => MessageId::Ack,
            Message::Nack { .. } => MessageId::Nack,
            Message::AsciiText(_) => MessageId::AsciiText,
            Message::GeneralRequest { .. } => MessageId::GeneralRequest,
            Message::Request { id } => *id,
            Message::SetDeviceId { .. } => MessageId::SetDeviceId,
            Message::SetRange { .. } => MessageId::SetRange,
            Message::SetSpeedOfSound { .. } => MessageId::SetSpeedOfSound,
            Message::SetModeAuto { .. } => MessageId::SetModeAuto,
            Message::SetPingInterval { .. } => MessageId::SetPingInterval,
            Message::SetGainSetting { .. } => MessageId::SetGainSetting,
            Message::SetPingEnable { .. } => MessageId::SetPingEnable,
            Message::GotoBootloader => MessageId::GotoBootloader,
            Message::ContinuousStart { .. } => MessageId::ContinuousStart,
            Message::ContinuousStop { .. } => MessageId::ContinuousStop,
            Message::FirmwareVersion(_) => MessageId::FirmwareVersion,
            Message::DeviceId { .. } => MessageId::DeviceId,
            Message::Voltage5 { .. } => MessageId::Voltage5,
            Message::SpeedOfSound { .. } => MessageId::SpeedOfSound,
            Message::Range { .. } => MessageId::Range,
            Message::ModeAuto { .. } => MessageId::ModeAuto,
            Message::PingInterval { .. } => MessageId::PingInterval,
            Message::GainSetting { .. } => MessageId::GainSetting,
            Message::TransmitDuration { .. } => MessageId::TransmitDuration,
            Message::GeneralInfo(_) => MessageId::GeneralInfo,
            Message::DistanceSimple { .. } => MessageId::DistanceSimple,
            Message::Distance(_) => MessageId::Distance,
            Message::ProcessorTemperature { .. } => MessageId::ProcessorTemperature,
            Message::PcbTemperature { .. } => MessageId::PcbTemperature,
            Message::PingEnable { .. } => MessageId::PingEnable,
            Message::Profile(_) => MessageId::Profile,
            Message::Unknown { id, .. } => return *id,
        };
        id.as_u16()
    }

    /// Decode the payload of a frame according to its id
    pub fn decode(frame: &Frame) -> Result<Self, ParseError> {
        let Some(id) = MessageId::from_u16(frame.message_id) else {
            return Ok(Message::Unknown {
                id: frame.message_id,
                payload: frame.payload.clone(),
            });
        };

        if frame.payload.is_empty() && id != MessageId::GotoBootloader {
            return Ok(Message::Request { id });
        }

        let mut r = PayloadReader::new(id, &frame.payload);
        let message = match id {
            MessageId::Ack => Message::Ack {
                acked_id: r.u16()?,
            },
            MessageId::Nack => Message::Nack {
                nacked_id: r.u16()?,
                message: r.text(),
            },
            MessageId::AsciiText => Message::AsciiText(r.text()),
            MessageId::GeneralRequest => Message::GeneralRequest {
                requested_id: r.u16()?,
            },
            MessageId::SetDeviceId => Message::SetDeviceId {
                device_id: r.u8()?,
            },
            MessageId::SetRange => Message::SetRange {
                scan_start: r.u32()?,
                scan_length: r.u32()?,
            },
            MessageId::SetSpeedOfSound => Message::SetSpeedOfSound {
                speed_of_sound: r.u32()?,
            },
            MessageId::SetModeAuto => Message::SetModeAuto {
                mode_auto: r.u8()? != 0,
            },
            MessageId::SetPingInterval => Message::SetPingInterval {
                ping_interval: r.u16()?,
            },
            MessageId::SetGainSetting => Message::SetGainSetting {
                gain_setting: r.u8()?,
            },
            MessageId::SetPingEnable => Message::SetPingEnable {
                enabled: r.u8()? != 0,
            },
            MessageId::GotoBootloader => Message::GotoBootloader,
            MessageId::ContinuousStart => Message::ContinuousStart { id: r.u16()? },
            MessageId::ContinuousStop => Message::ContinuousStop { id: r.u16()? },
            MessageId::FirmwareVersion => Message::FirmwareVersion(FirmwareVersion {
                device_type: r.u8()?,
                device_model: r.u8()?,
                version_major: r.u16()?,
                version_minor: r.u16()?,
            }),
            MessageId::DeviceId => Message::DeviceId {
                device_id: r.u8()?,
            },
            MessageId::Voltage5 => Message::Voltage5 {
                millivolts: r.u16()?,
            },
            MessageId::SpeedOfSound => Message::SpeedOfSound {
                speed_of_sound: r.u32()?,
            },
            MessageId::Range => Message::Range {
                scan_start: r.u32()?,
                scan_length: r.u32()?,
            },
            MessageId::ModeAuto => Message::ModeAuto {
                mode_auto: r.u8()? != 0,
            },
            MessageId::PingInterval => Message::PingInterval {
                ping_interval: r.u16()?,
            },
            MessageId::GainSetting => Message::GainSetting {
                gain_setting: r.u32()?,
            },
            MessageId::TransmitDuration => Message::TransmitDuration {
                transmit_duration: r.u16()?,
            },
            MessageId::GeneralInfo => Message::GeneralInfo(GeneralInfo {
                version_major: r.u16()?,
                version_minor: r.u16()?,
                voltage_5: r.u16()?,
                ping_interval: r.u16()?,
                gain_setting: r.u8()?,
                mode_auto: r.u8()? != 0,
            }),
            MessageId::DistanceSimple => Message::DistanceSimple {
                distance: r.u32()?,
                confidence: r.u8()?,
            },
            MessageId::Distance => Message::Distance(r.distance()?),
            MessageId::ProcessorTemperature => Message::ProcessorTemperature {
                centidegrees: r.u16()?,
            },
            MessageId::PcbTemperature => Message::PcbTemperature {
                centidegrees: r.u16()?,
            },
            MessageId::PingEnable => Message::PingEnable {
                enabled: r.u8()? != 0,
            },
            MessageId::Profile => {
                let distance = r.distance()?;
                let len = usize::from(r.u16()?);
                Message::Profile(Profile {
                    distance,
                    profile_data: r.bytes(len)?.to_vec(),
                })
            }
        };
        Ok(message)
    }

    /// Serialize the typed fields into a payload
    pub fn payload(&self) -> Vec<u8> {
        let mut w = Vec::new();
        match self {
            Message::Ack { acked_id } => w.extend_from_slice(&acked_id.to_le_bytes()),
            Message::Nack { nacked_id, message } => {
                w.extend_from_slice(&nacked_id.to_le_bytes());
                w.extend_from_slice(message.as_bytes());
                w.push(0);
            }
            Message::AsciiText(text) => {
                w.extend_from_slice(text.as_bytes());
                w.push(0);
            }
            Message::GeneralRequest { requested_id } => {
                w.extend_from_slice(&requested_id.to_le_bytes())
            }
            Message::Request { .. } | Message::GotoBootloader => {}
            Message::SetDeviceId { device_id } | Message::DeviceId { device_id } => {
                w.push(*device_id)
            }
            Message::SetRange {
                scan_start,
                scan_length,
            }
            | Message::Range {
                scan_start,
                scan_length,
            } => {
                w.extend_from_slice(&scan_start.to_le_bytes());
                w.extend_from_slice(&scan_length.to_le_bytes());
            }
            Message::SetSpeedOfSound { speed_of_sound }
            | Message::SpeedOfSound { speed_of_sound } => {
                w.extend_from_slice(&speed_of_sound.to_le_bytes())
            }
            Message::SetModeAuto { mode_auto } | Message::ModeAuto { mode_auto } => {
                w.push(u8::from(*mode_auto))
            }
            Message::SetPingInterval { ping_interval } | Message::PingInterval { ping_interval } => {
                w.extend_from_slice(&ping_interval.to_le_bytes())
            }
            Message::SetGainSetting { gain_setting } => w.push(*gain_setting),
            Message::SetPingEnable { enabled } | Message::PingEnable { enabled } => {
                w.push(u8::from(*enabled))
            }
            Message::ContinuousStart { id } | Message::ContinuousStop { id } => {
                w.extend_from_slice(&id.to_le_bytes())
            }
            Message::FirmwareVersion(fw) => {
                w.push(fw.device_type);
                w.push(fw.device_model);
                w.extend_from_slice(&fw.version_major.to_le_bytes());
                w.extend_from_slice(&fw.version_minor.to_le_bytes());
            }
            Message::Voltage5 { millivolts } => w.extend_from_slice(&millivolts.to_le_bytes()),
            Message::GainSetting { gain_setting } => {
                w.extend_from_slice(&gain_setting.to_le_bytes())
            }
            Message::TransmitDuration { transmit_duration } => {
                w.extend_from_slice(&transmit_duration.to_le_bytes())
            }
            Message::GeneralInfo(info) => {
                w.extend_from_slice(&info.version_major.to_le_bytes());
                w.extend_from_slice(&info.version_minor.to_le_bytes());
                w.extend_from_slice(&info.voltage_5.to_le_bytes());
                w.extend_from_slice(&info.ping_interval.to_le_bytes());
                w.push(info.gain_setting);
                w.push(u8::from(info.mode_auto));
            }
            Message::DistanceSimple {
                distance,
                confidence,
            } => {
                w.extend_from_slice(&distance.to_le_bytes());
                w.push(*confidence);
            }
            Message::Distance(d) => write_distance(&mut w, d),
            Message::ProcessorTemperature { centidegrees }
            | Message::PcbTemperature { centidegrees } => {
                w.extend_from_slice(&centidegrees.to_le_bytes())
            }
            Message::Profile(profile) => {
                write_distance(&mut w, &profile.distance);
                w.extend_from_slice(&(profile.profile_data.len() as u16).to_le_bytes());
                w.extend_from_slice(&profile.profile_data);
            }
            Message::Unknown { payload, .. } => w.extend_from_slice(payload),
        }
        w
    }

    /// Build a frame carrying this message
    pub fn to_frame(&self, src_device_id: u8, dst_device_id: u8) -> Frame {
        Frame::new(self.id(), self.payload()).with_ids(src_device_id, dst_device_id)
    }

    /// Encode straight to wire bytes
    pub fn encode(&self, src_device_id: u8, dst_device_id: u8) -> Vec<u8> {
        self.to_frame(src_device_id, dst_device_id).encode()
    }
}

fn write_distance(w: &mut Vec<u8>, d: &Distance) {
    w.extend_from_slice(&d.distance.to_le_bytes());
    w.extend_from_slice(&d.confidence.to_le_bytes());
    w.extend_from_slice(&d.transmit_duration.to_le_bytes());
    w.extend_from_slice(&d.ping_number.to_le_bytes());
    w.extend_from_slice(&d.scan_start.to_le_bytes());
    w.extend_from_slice(&d.scan_length.to_le_bytes());
    w.extend_from_slice(&d.gain_setting.to_le_bytes());
}

/// Cursor over a payload that reports short reads against the message id
struct PayloadReader<'a> {
    id: MessageId,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(id: MessageId, bytes: &'a [u8]) -> Self {
        Self { id, bytes, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(ParseError::PayloadTooShort {
                id: self.id.as_u16(),
                expected: end,
                actual: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Remaining bytes as text, stopping at the first NUL
    fn text(&mut self) -> String {
        let rest = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        String::from_utf8_lossy(&rest[..end]).into_owned()
    }

    fn distance(&mut self) -> Result<Distance, ParseError> {
        Ok(Distance {
            distance: self.u32()?,
            confidence: self.u16()?,
            transmit_duration: self.u16()?,
            ping_number: self.u32()?,
            scan_start: self.u32()?,
            scan_length: self.u32()?,
            gain_setting: self.u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(message: &Message) -> Message {
        Message::decode(&message.to_frame(1, 0)).unwrap()
    }

    #[test]
    fn test_message_id_lookup() {
        assert_eq!(MessageId::from_u16(1300), Some(MessageId::Profile));
        assert_eq!(MessageId::try_from(9999), Err(9999));
        for id in MessageId::ALL {
            assert_eq!(MessageId::from_u16(id.as_u16()), Some(id));
        }
    }

    #[test]
    fn test_empty_payload_is_request() {
        let frame = Frame::new(MessageId::Voltage5.as_u16(), Vec::new());
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::Request {
                id: MessageId::Voltage5
            }
        );
        assert_eq!(
            Message::decode(&Frame::new(1100, Vec::new())).unwrap(),
            Message::GotoBootloader
        );
    }

    #[test]
    fn test_firmware_version_decode() {
        let frame = Frame::new(1200, vec![1, 2, 3, 0, 29, 0]);
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::FirmwareVersion(FirmwareVersion {
                device_type: 1,
                device_model: 2,
                version_major: 3,
                version_minor: 29,
            })
        );
    }

    #[test]
    fn test_voltage_in_millivolts() {
        let frame = Frame::new(1202, 5012u16.to_le_bytes().to_vec());
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::Voltage5 { millivolts: 5012 }
        );
    }

    #[test]
    fn test_profile_points_normalized() {
        let profile = Profile {
            distance: Distance::default(),
            profile_data: vec![0, 51, 255],
        };
        let Message::Profile(decoded) = decode(&Message::Profile(profile)) else {
            panic!("expected profile");
        };
        assert_eq!(decoded.points(), vec![0.0, 0.2, 1.0]);
    }

    #[test]
    fn test_nack_text_stops_at_nul() {
        let mut payload = 1003u16.to_le_bytes().to_vec();
        payload.extend_from_slice(b"bad value\0junk");
        let frame = Frame::new(2, payload);
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::Nack {
                nacked_id: 1003,
                message: "bad value".into()
            }
        );
    }

    #[test]
    fn test_unknown_id_is_not_fatal() {
        let frame = Frame::new(4242, vec![1, 2, 3]);
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::Unknown {
                id: 4242,
                payload: vec![1, 2, 3]
            }
        );
    }

    #[test]
    fn test_short_payload_reported() {
        let frame = Frame::new(1204, vec![1, 2, 3]);
        assert_eq!(
            Message::decode(&frame),
            Err(ParseError::PayloadTooShort {
                id: 1204,
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_set_commands_roundtrip() {
        for msg in [
            Message::SetModeAuto { mode_auto: true },
            Message::SetRange {
                scan_start: 100,
                scan_length: 5000,
            },
            Message::SetPingInterval { ping_interval: 100 },
            Message::ContinuousStart { id: 1300 },
        ] {
            assert_eq!(decode(&msg), msg);
        }
    }
}
