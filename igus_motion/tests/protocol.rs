use igus_motion::protocol::*;

fn config_frame() -> Frame {
    let config = ConfigPayload {
        num_keyframes: 3,
        active_axes: 2,
        enc_to_mot: [64, 64, 0, 0, 0, 0, 0, 0],
        lookahead: 200,
    };
    Frame::with_payload(Command::Config, &config).unwrap()
}

#[test]
fn every_single_byte_flip_is_detected() {
    let bytes = config_frame().encode();
    assert_eq!(bytes.len(), ConfigPayload::SIZE + FRAME_OVERHEAD);

    // Version, command, length and payload are covered by the checksum,
    // which sits right before the terminator
    for i in 1..bytes.len() - 1 {
        let mut corrupt = bytes.clone();
        corrupt[i] ^= 0x01;
        assert!(Frame::decode(&corrupt).is_err(), "Flip at byte {} went unnoticed", i);
        let mut parser = FrameParser::new();
        assert!(parser.feed(&corrupt).is_empty(), "Parser accepted a flip at byte {}", i);
    }
}

#[test]
fn parser_resynchronizes_after_noise() {
    let first = Frame::simple(Command::Init);
    let second = config_frame();

    let mut stream = b"1ZP+2\r#1P0\r".to_vec();
    stream.extend(first.encode());
    stream.extend(b"noise");
    stream.extend(second.encode());

    let mut parser = FrameParser::new();
    let frames = parser.feed(&stream);
    assert_eq!(frames, vec![first, second]);
    assert_eq!(parser.state(), ParserState::Start);
}

#[test]
fn truncated_frame_costs_only_the_next_frame() {
    let frame = config_frame();
    let mut stream = frame.encode()[..7].to_vec();
    stream.extend(frame.encode());
    stream.extend(frame.encode());

    let mut parser = FrameParser::new();
    assert_eq!(parser.feed(&stream), vec![frame]);
}

#[test]
fn parser_handles_split_delivery() {
    let frame = config_frame();
    let bytes = frame.encode();
    let mut parser = FrameParser::new();
    let mut frames = Vec::new();
    for chunk in bytes.chunks(5) {
        frames.extend(parser.feed(chunk));
    }
    assert_eq!(frames, vec![frame]);
}

#[test]
fn parser_ignores_other_protocol_versions() {
    let mut frame = Frame::simple(Command::Play);
    frame.version = VERSION - 1;
    let mut parser = FrameParser::new();
    assert!(parser.feed(&frame.encode()).is_empty());
}

#[test]
fn motion_reply_carries_feedback_under_motion_code() {
    let feedback = FeedbackPayload { num_axes: 1, flags: 0, positions: [12, NO_POSITION, 0, 0, 0, 0, 0, 0] };
    let reply = Frame::with_payload(Command::Motion, &feedback).unwrap();
    let request = Frame::with_payload(Command::Motion, &MotionPayload::default()).unwrap();
    assert_eq!(reply.header(), request.header());

    let decoded = Frame::decode(&reply.encode()).unwrap();
    let back: FeedbackPayload = decoded.payload_as().unwrap();
    assert_eq!(back.positions[0], 12);
    assert_eq!(back.positions[1], NO_POSITION);
    assert!(!back.is_playing());
}

#[test]
fn header_alignment_skips_ascii_echo() {
    let reply = Frame::simple(Command::Init).encode();
    let mut buffer = b"1ZP".to_vec();
    buffer.extend(&reply[..3]);
    assert!(align_to_header(&mut buffer, &reply[..3]));
    buffer.extend(&reply[3..]);
    assert_eq!(Frame::decode(&buffer).unwrap(), Frame::simple(Command::Init));
}
