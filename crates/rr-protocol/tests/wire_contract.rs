// Black-box contract tests: literal wire examples that peers depend on.
// These pin the byte-level protocol; change them only with a protocol rev.

use rr_protocol::{Frame, FrameParser, parse_record};

#[test]
fn publisher_frame_wire_example() {
    // The canonical example: topic "prices", five payload bytes.
    assert_eq!(Frame::new("prices", b"HELLO".to_vec()).encode(), b"prices|5|HELLO");
}

#[test]
fn split_mid_payload_reassembles_exactly() {
    // Two frames back to back, the second split across reads as
    // "t|2|A" + "B" — the boundary falls inside the payload.
    let mut parser = FrameParser::new(64 * 1024);
    let mut frames = parser.feed(b"t|2|ABt|2|C").unwrap();
    frames.extend(parser.feed(b"D").unwrap());

    assert_eq!(
        frames,
        vec![
            Frame::new("t", b"AB".to_vec()),
            Frame::new("t", b"CD".to_vec()),
        ]
    );

    // Re-encoding reproduces the sent bytes, concatenated.
    let wire: Vec<u8> = frames.iter().flat_map(Frame::encode).collect();
    assert_eq!(wire, b"t|2|ABt|2|CD");
}

#[test]
fn every_split_of_a_three_frame_stream_round_trips() {
    let frames = [
        Frame::new("news.sports", b"scores".to_vec()),
        Frame::new("news", Vec::new()),
        Frame::new("prices", vec![0u8, b'|', b'\r', 255]),
    ];
    let wire: Vec<u8> = frames.iter().flat_map(Frame::encode).collect();

    for a in 0..=wire.len() {
        for b in a..=wire.len() {
            let mut parser = FrameParser::new(64 * 1024);
            let mut got = parser.feed(&wire[..a]).unwrap();
            got.extend(parser.feed(&wire[a..b]).unwrap());
            got.extend(parser.feed(&wire[b..]).unwrap());
            assert_eq!(got.as_slice(), frames.as_slice(), "splits at {a},{b}");
        }
    }
}

#[test]
fn command_record_wire_example() {
    let rec = parse_record("alice|subscribe|prices,news|0").unwrap();
    assert_eq!(
        (rec.name.as_str(), rec.op.as_str(), rec.timeout_ms),
        ("alice", "subscribe", 0)
    );
    assert_eq!(rec.patterns(), vec!["prices", "news"]);
}
