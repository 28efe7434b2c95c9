//! Persistence and validity properties of link configurations

use sonar_link::{ConfigurationError, LinkConfiguration, LinkType};

#[test]
fn persisted_form_uses_type_tag() {
    let config = LinkConfiguration::udp("192.168.2.2", 12345);
    let json = serde_json::to_value(&config).unwrap();
    assert_eq!(json["type"], 3);
    assert_eq!(json["args"][0], "192.168.2.2");
    assert_eq!(json["args"][1], "12345");
    assert_eq!(json["name"], "192.168.2.2:12345");
}

#[test]
fn unknown_persisted_tag_is_invalid_type() {
    let config: LinkConfiguration =
        serde_json::from_str(r#"{"type": 42, "args": ["a", "b"], "name": "future"}"#).unwrap();
    assert_eq!(config.link_type(), LinkType::Unknown(42));
    assert_eq!(config.error(), ConfigurationError::InvalidType);
    assert!(!config.is_valid());
}

#[test]
fn missing_fields_default() {
    let config: LinkConfiguration = serde_json::from_str(r#"{"type": 0}"#).unwrap();
    assert_eq!(config, LinkConfiguration::default());
    assert_eq!(config.error(), ConfigurationError::NoType);
}

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn link_type() -> impl Strategy<Value = LinkType> {
        prop_oneof![
            Just(LinkType::None),
            Just(LinkType::File),
            Just(LinkType::Serial),
            Just(LinkType::Udp),
            Just(LinkType::Simulation),
            (5u8..=255).prop_map(LinkType::Unknown),
        ]
    }

    fn configuration() -> impl Strategy<Value = LinkConfiguration> {
        (
            link_type(),
            prop::collection::vec("[a-zA-Z0-9/._:-]{0,12}", 0..4),
            "[ -~]{0,16}",
        )
            .prop_map(|(t, args, name)| LinkConfiguration::new(t, args, name))
    }

    fn valid_configuration() -> impl Strategy<Value = LinkConfiguration> {
        prop_oneof![
            ("/dev/tty[A-Z]{3}[0-9]", 1u32..4_000_000)
                .prop_map(|(port, baud)| LinkConfiguration::serial(&port, baud)),
            (any::<[u8; 4]>(), 1u16..)
                .prop_map(|(ip, port)| {
                    let host = std::net::Ipv4Addr::from(ip).to_string();
                    LinkConfiguration::udp(&host, port)
                }),
            "/tmp/[a-z]{1,8}\\.bin".prop_map(|p| LinkConfiguration::file_replay(&p)),
            "/tmp/[a-z]{1,8}\\.bin".prop_map(|p| LinkConfiguration::file_log(&p)),
            Just(LinkConfiguration::simulation()),
        ]
    }

    proptest! {
        #[test]
        fn persist_roundtrip(config in configuration()) {
            let json = serde_json::to_string(&config).unwrap();
            let restored: LinkConfiguration = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(restored, config);
        }

        #[test]
        fn valid_configs_roundtrip_and_stay_valid(config in valid_configuration()) {
            prop_assert_eq!(config.error(), ConfigurationError::NoErrors);
            let json = serde_json::to_string(&config).unwrap();
            let restored: LinkConfiguration = serde_json::from_str(&json).unwrap();
            prop_assert!(restored.is_valid());
            prop_assert_eq!(restored, config);
        }

        #[test]
        fn is_valid_matches_ordering(config in configuration()) {
            prop_assert_eq!(config.is_valid(), config.error() <= ConfigurationError::NoErrors);
            prop_assert_eq!(config.is_valid(), config.validate().is_ok());
        }

        #[test]
        fn none_type_always_no_type(args in prop::collection::vec(".{0,8}", 0..4)) {
            let config = LinkConfiguration::new(LinkType::None, args, "x");
            prop_assert_eq!(config.error(), ConfigurationError::NoType);
        }

        #[test]
        fn serial_without_args_is_no_args(name in ".{0,8}") {
            let config = LinkConfiguration::new(LinkType::Serial, Vec::new(), name);
            prop_assert_eq!(config.error(), ConfigurationError::NoArgs);
        }
    }
}
