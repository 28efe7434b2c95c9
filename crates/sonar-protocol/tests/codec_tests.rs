//! Streaming codec behaviour over realistic byte streams

use sonar_protocol::{Distance, Message, MessageId, ParseError, PingCodec, Profile};

fn profile(points: Vec<u8>) -> Message {
    Message::Profile(Profile {
        distance: Distance {
            distance: 1234,
            confidence: 87,
            transmit_duration: 100,
            ping_number: 7,
            scan_start: 0,
            scan_length: 5000,
            gain_setting: 2,
        },
        profile_data: points,
    })
}

fn decode_all(codec: &mut PingCodec) -> (Vec<Message>, Vec<ParseError>) {
    let mut messages = Vec::new();
    let mut errors = Vec::new();
    while let Some(result) = codec.next_frame() {
        match result {
            Ok(frame) => messages.push(Message::decode(&frame).unwrap()),
            Err(e) => errors.push(e),
        }
    }
    (messages, errors)
}

#[test]
fn mixed_stream_decodes_in_order() {
    let mut stream = Vec::new();
    stream.extend(Message::Voltage5 { millivolts: 5010 }.encode(1, 0));
    stream.extend(profile(vec![0, 128, 255]).encode(1, 0));
    stream.extend(Message::AsciiText("hello".into()).encode(1, 0));

    let mut codec = PingCodec::new();
    for chunk in stream.chunks(7) {
        codec.push_bytes(chunk);
    }

    let (messages, errors) = decode_all(&mut codec);
    assert!(errors.is_empty());
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0], Message::Voltage5 { millivolts: 5010 });
    assert_eq!(messages[1], profile(vec![0, 128, 255]));
    assert_eq!(messages[2], Message::AsciiText("hello".into()));
}

#[test]
fn corrupt_frame_does_not_stall_stream() {
    let mut corrupt = Message::Request {
        id: MessageId::DeviceId,
    }
    .encode(0, 1);
    let last = corrupt.len() - 1;
    corrupt[last] = corrupt[last].wrapping_add(1);

    let mut codec = PingCodec::new();
    codec.push_bytes(&Message::DeviceId { device_id: 1 }.encode(1, 0));
    codec.push_bytes(&corrupt);
    codec.push_bytes(&Message::DeviceId { device_id: 2 }.encode(1, 0));

    let (messages, errors) = decode_all(&mut codec);
    assert_eq!(
        messages,
        vec![
            Message::DeviceId { device_id: 1 },
            Message::DeviceId { device_id: 2 }
        ]
    );
    assert_eq!(errors.len(), 1);
    assert_eq!(codec.parsed(), 2);
    assert_eq!(codec.errors(), 1);
}

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    // Payload bytes below 0x40 never form a "BR" start marker, so any
    // resync lands on the following frame.
    fn quiet_payload() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(0u8..0x40, 1..64)
    }

    proptest! {
        #[test]
        fn resync_after_corrupted_payload(
            bad in quiet_payload(),
            good in quiet_payload(),
            flip in any::<prop::sample::Index>(),
        ) {
            let mut corrupt = profile(bad).encode(1, 0);
            // Skip the header and profile fields, then corrupt one intensity byte
            let data_start = 8 + 24 + 2;
            let idx = data_start + flip.index(corrupt.len() - data_start - 2);
            corrupt[idx] = corrupt[idx].wrapping_add(1) & 0x3F;

            let expected = profile(good);
            let mut codec = PingCodec::new();
            codec.push_bytes(&corrupt);
            codec.push_bytes(&expected.encode(1, 0));

            let (messages, errors) = decode_all(&mut codec);
            prop_assert_eq!(errors.len(), 1);
            prop_assert_eq!(codec.parsed(), 1);
            prop_assert_eq!(messages, vec![expected]);
        }

        #[test]
        fn profile_points_linear(points in prop::collection::vec(any::<u8>(), 0..512)) {
            let Message::Profile(decoded) = Message::decode(
                &profile(points.clone()).to_frame(1, 0)
            ).unwrap() else {
                panic!("expected profile");
            };

            let normalized = decoded.points();
            prop_assert_eq!(normalized.len(), points.len());
            for (value, raw) in normalized.iter().zip(&points) {
                prop_assert!((0.0..=1.0).contains(value));
                prop_assert!((value * 255.0 - f32::from(*raw)).abs() < 1e-3);
            }
        }
    }
}
