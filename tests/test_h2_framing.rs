use tidehttp::h2::framing::{
    decode_frame, encode_data, encode_goaway, encode_headers, encode_ping, encode_priority,
    encode_rst_stream, encode_settings, encode_settings_ack, encode_window_update,
    settings_records,
};
use tidehttp::types::{Http2ErrorCode, Http2FrameType, PriorityInfo};

#[test]
fn data_frames_decode_to_their_inputs() {
    for stream_id in [1u32, 3, 0x7FFF_FFFF] {
        for payload in [&b""[..], b"x", &[0x42; 1000]] {
            for end_stream in [false, true] {
                let raw = encode_data(stream_id, payload, end_stream);
                let frame = decode_frame(&raw).unwrap();
                assert_eq!(frame.frame_type, Http2FrameType::Data);
                assert_eq!(frame.stream_id, stream_id);
                assert_eq!(&frame.payload[..], payload);
                assert_eq!(frame.is_end_stream(), end_stream);
            }
        }
    }
}

#[test]
fn rst_stream_carries_every_error_code() {
    for raw_code in 0u32..=0xd {
        let code = Http2ErrorCode::from(raw_code);
        let frame = decode_frame(&encode_rst_stream(7, code)).unwrap();
        assert_eq!(frame.frame_type, Http2FrameType::RstStream);
        assert_eq!(frame.stream_id, 7);
        assert_eq!(frame.error_code, raw_code);
    }
}

#[test]
fn settings_records_survive_the_codec() {
    let records = vec![(0x1u16, 4096u32), (0x3, 100), (0x4, 65_535), (0x5, 16_384)];
    let raw = encode_settings(&records);
    let frame = decode_frame(&raw).unwrap();
    assert_eq!(frame.frame_type, Http2FrameType::Settings);
    assert_eq!(frame.stream_id, 0);
    assert!(!frame.is_ack());
    let decoded: Vec<(u16, u32)> = settings_records(&frame.payload).collect();
    assert_eq!(decoded, records);

    let ack = decode_frame(&encode_settings_ack()).unwrap();
    assert!(ack.is_ack());
    assert!(ack.payload.is_empty());
}

#[test]
fn ping_payload_and_ack_flag_roundtrip() {
    let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
    for ack in [false, true] {
        let frame = decode_frame(&encode_ping(payload, ack)).unwrap();
        assert_eq!(frame.frame_type, Http2FrameType::Ping);
        assert_eq!(frame.ping_payload, payload);
        assert_eq!(frame.is_ack(), ack);
    }
}

#[test]
fn goaway_fields_roundtrip() {
    for debug_data in [&b""[..], b"shutting down"] {
        let raw = encode_goaway(41, Http2ErrorCode::EnhanceYourCalm, debug_data);
        let frame = decode_frame(&raw).unwrap();
        assert_eq!(frame.frame_type, Http2FrameType::GoAway);
        assert_eq!(frame.goaway_last_stream_id, 41);
        assert_eq!(frame.error_code, 0xb);
    }
}

#[test]
fn window_update_increment_roundtrip() {
    for (stream_id, increment) in [(0u32, 1u32), (5, 65_535), (9, 0x7FFF_FFFF)] {
        let frame = decode_frame(&encode_window_update(stream_id, increment)).unwrap();
        assert_eq!(frame.frame_type, Http2FrameType::WindowUpdate);
        assert_eq!(frame.stream_id, stream_id);
        assert_eq!(frame.window_increment, increment);
    }
}

#[test]
fn priority_fields_roundtrip() {
    for exclusive in [false, true] {
        let priority = PriorityInfo {
            exclusive,
            dependency: 3,
            weight: 201,
        };
        let frame = decode_frame(&encode_priority(11, priority)).unwrap();
        assert_eq!(frame.frame_type, Http2FrameType::Priority);
        assert_eq!(frame.priority, Some(priority));
    }
}

#[test]
fn header_blocks_reassemble_across_continuations() {
    for block_len in [0usize, 1, 99, 100, 101, 750] {
        let block: Vec<u8> = (0..block_len).map(|i| i as u8).collect();
        for end_stream in [false, true] {
            let frames = encode_headers(9, &block, end_stream, 100);

            let mut reassembled = Vec::new();
            for (i, raw) in frames.iter().enumerate() {
                let frame = decode_frame(raw).unwrap();
                let expected_type = if i == 0 {
                    Http2FrameType::Headers
                } else {
                    Http2FrameType::Continuation
                };
                assert_eq!(frame.frame_type, expected_type);
                assert_eq!(frame.stream_id, 9);
                // END_STREAM rides only on the opening HEADERS frame.
                assert_eq!(frame.is_end_stream(), i == 0 && end_stream);
                assert_eq!(frame.is_end_headers(), i == frames.len() - 1);
                assert!(frame.payload.len() <= 100);
                reassembled.extend_from_slice(&frame.payload);
            }
            assert_eq!(reassembled, block);
        }
    }
}
