//! Configuration convergence and rate control
//!
//! Pure decision functions used by the session actor. They look at the
//! desired configuration and what the device last reported, and return the
//! messages to send; the actor owns timers and the link.

use sonar_protocol::{Message, MessageId, MAX_PING_FREQUENCY_HZ};

use crate::state::{ConfigKey, DeviceConfiguration, DeviceState};

/// Outcome of one convergence pass
#[derive(Debug, Clone, PartialEq)]
pub enum ConvergenceStep {
    /// Device matches every desired value that matters
    Converged,
    /// Messages to send before checking again
    Pending(Vec<Message>),
}

/// A desired value as it fits on the wire, which is what the device can report back
fn wire_value(key: ConfigKey, value: u32) -> u32 {
    match key {
        ConfigKey::AutomaticMode => u32::from(value != 0),
        ConfigKey::GainSetting => value.min(u32::from(u8::MAX)),
        ConfigKey::PingInterval => value.min(u32::from(u16::MAX)),
        _ => value,
    }
}

/// Compare desired and reported values and build the corrections
///
/// Keys are walked in order. A mismatched key produces a set command followed
/// by a poll for the value, so the next pass sees the device's answer. When
/// automatic mode is desired the walk stops after it: the device then manages
/// the remaining values itself.
pub fn convergence_step(desired: &DeviceConfiguration, device: &DeviceState) -> ConvergenceStep {
    let mut out = Vec::new();
    let mut range_pending = false;

    for key in ConfigKey::ALL {
        let value = wire_value(key, desired.value(key));
        if device.reported(key) != Some(value) {
            match key {
                ConfigKey::AutomaticMode => {
                    out.push(Message::SetModeAuto {
                        mode_auto: value != 0,
                    });
                    out.push(Message::Request {
                        id: MessageId::ModeAuto,
                    });
                }
                ConfigKey::GainSetting => {
                    out.push(Message::SetGainSetting {
                        gain_setting: value as u8,
                    });
                    out.push(Message::Request {
                        id: MessageId::GainSetting,
                    });
                }
                ConfigKey::PingInterval => {
                    out.push(Message::SetPingInterval {
                        ping_interval: value as u16,
                    });
                    out.push(Message::Request {
                        id: MessageId::PingInterval,
                    });
                }
                // Start and length travel together in one command
                ConfigKey::ScanLength | ConfigKey::ScanStart => {
                    if !range_pending {
                        range_pending = true;
                        out.push(Message::SetRange {
                            scan_start: desired.value(ConfigKey::ScanStart),
                            scan_length: desired.value(ConfigKey::ScanLength),
                        });
                        out.push(Message::Request {
                            id: MessageId::Range,
                        });
                    }
                }
                ConfigKey::SpeedOfSound => {
                    out.push(Message::SetSpeedOfSound {
                        speed_of_sound: value,
                    });
                    out.push(Message::Request {
                        id: MessageId::SpeedOfSound,
                    });
                }
            }
        }

        if key == ConfigKey::AutomaticMode && value != 0 {
            break;
        }
    }

    if out.is_empty() {
        ConvergenceStep::Converged
    } else {
        ConvergenceStep::Pending(out)
    }
}

/// What a rate request does to streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAction {
    /// Stop continuous output
    Stop,
    /// Set the ping interval and (re)start continuous output
    Start { period_ms: u16 },
}

/// Convert a requested telemetry rate to an action
///
/// Rates that are not positive or exceed the device maximum stop streaming.
pub fn rate_action(hz: f32) -> RateAction {
    if !hz.is_finite() || hz <= 0.0 || hz > MAX_PING_FREQUENCY_HZ {
        return RateAction::Stop;
    }
    RateAction::Start {
        period_ms: (1000.0 / hz) as u16,
    }
}

/// Messages carrying out a rate action
pub fn rate_messages(action: RateAction) -> Vec<Message> {
    let profile = MessageId::Profile.as_u16();
    match action {
        RateAction::Stop => vec![Message::ContinuousStop { id: profile }],
        RateAction::Start { period_ms } => vec![
            Message::SetPingInterval {
                ping_interval: period_ms,
            },
            Message::ContinuousStart { id: profile },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matching_state(config: &DeviceConfiguration) -> DeviceState {
        DeviceState {
            mode_auto: Some(config.value(ConfigKey::AutomaticMode) != 0),
            gain_setting: Some(config.value(ConfigKey::GainSetting)),
            ping_interval: Some(config.value(ConfigKey::PingInterval) as u16),
            scan_start: Some(config.value(ConfigKey::ScanStart)),
            scan_length: Some(config.value(ConfigKey::ScanLength)),
            speed_of_sound: Some(config.value(ConfigKey::SpeedOfSound)),
            ..Default::default()
        }
    }

    #[test]
    fn test_converged_when_everything_matches() {
        let config = DeviceConfiguration::default();
        let state = matching_state(&config);
        assert_eq!(convergence_step(&config, &state), ConvergenceStep::Converged);
    }

    #[test]
    fn test_unknown_device_values_are_set() {
        let mut config = DeviceConfiguration::default();
        config.set_value(ConfigKey::AutomaticMode, 0);
        let ConvergenceStep::Pending(messages) =
            convergence_step(&config, &DeviceState::default())
        else {
            panic!("expected pending");
        };
        assert_eq!(messages[0], Message::SetModeAuto { mode_auto: false });
        assert!(messages.contains(&Message::SetSpeedOfSound {
            speed_of_sound: 1_500_000
        }));
        // One range command for both start and length
        let ranges = messages
            .iter()
            .filter(|m| matches!(m, Message::SetRange { .. }))
            .count();
        assert_eq!(ranges, 1);
    }

    #[test]
    fn test_out_of_range_values_compare_as_sent() {
        let mut config = DeviceConfiguration::default();
        config.set_value(ConfigKey::AutomaticMode, 0);
        config.set_value(ConfigKey::GainSetting, 1000);
        let mut state = matching_state(&config);
        state.gain_setting = Some(3);

        let ConvergenceStep::Pending(messages) = convergence_step(&config, &state) else {
            panic!("expected pending");
        };
        assert_eq!(messages[0], Message::SetGainSetting { gain_setting: 255 });

        // The device answers with the value it was sent
        state.gain_setting = Some(255);
        assert_eq!(convergence_step(&config, &state), ConvergenceStep::Converged);
    }

    #[test]
    fn test_nonzero_automatic_mode_matches_enabled() {
        let mut config = DeviceConfiguration::default();
        config.set_value(ConfigKey::AutomaticMode, 7);
        let mut state = matching_state(&config);
        state.mode_auto = Some(true);
        assert_eq!(convergence_step(&config, &state), ConvergenceStep::Converged);
    }

    #[test]
    fn test_automatic_mode_exits_early() {
        let config = DeviceConfiguration::default();
        let mut state = matching_state(&config);
        // Device disagrees on everything but automatic mode
        state.gain_setting = Some(6);
        state.scan_length = Some(1);
        assert_eq!(convergence_step(&config, &state), ConvergenceStep::Converged);
    }

    #[test]
    fn test_automatic_mode_mismatch_stops_after_mode() {
        let config = DeviceConfiguration::default();
        let mut state = matching_state(&config);
        state.mode_auto = Some(false);
        state.gain_setting = Some(6);
        assert_eq!(
            convergence_step(&config, &state),
            ConvergenceStep::Pending(vec![
                Message::SetModeAuto { mode_auto: true },
                Message::Request {
                    id: MessageId::ModeAuto
                },
            ])
        );
    }

    #[test]
    fn test_manual_mode_checks_remaining_keys() {
        let mut config = DeviceConfiguration::default();
        config.set_value(ConfigKey::AutomaticMode, 0);
        config.set_value(ConfigKey::GainSetting, 3);
        let mut state = matching_state(&config);
        state.gain_setting = Some(0);
        assert_eq!(
            convergence_step(&config, &state),
            ConvergenceStep::Pending(vec![
                Message::SetGainSetting { gain_setting: 3 },
                Message::Request {
                    id: MessageId::GainSetting
                },
            ])
        );
    }

    #[test]
    fn test_rate_action() {
        assert_eq!(rate_action(0.0), RateAction::Stop);
        assert_eq!(rate_action(-1.0), RateAction::Stop);
        assert_eq!(rate_action(60.0), RateAction::Stop);
        assert_eq!(rate_action(f32::NAN), RateAction::Stop);
        assert_eq!(rate_action(10.0), RateAction::Start { period_ms: 100 });
        assert_eq!(rate_action(50.0), RateAction::Start { period_ms: 20 });
        assert_eq!(rate_action(3.0), RateAction::Start { period_ms: 333 });
    }

    #[test]
    fn test_rate_messages() {
        assert_eq!(
            rate_messages(RateAction::Start { period_ms: 100 }),
            vec![
                Message::SetPingInterval { ping_interval: 100 },
                Message::ContinuousStart { id: 1300 },
            ]
        );
        assert_eq!(
            rate_messages(RateAction::Stop),
            vec![Message::ContinuousStop { id: 1300 }]
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn in_range_rates_start_streaming(hz in 0.01f32..=50.0) {
                match rate_action(hz) {
                    RateAction::Start { period_ms } => {
                        prop_assert_eq!(period_ms, (1000.0 / hz) as u16);
                    }
                    RateAction::Stop => prop_assert!(false, "{} Hz stopped streaming", hz),
                }
            }

            #[test]
            fn out_of_range_rates_stop(hz in 50.001f32..1000.0) {
                prop_assert_eq!(rate_action(hz), RateAction::Stop);
            }
        }
    }
}
