//! Integration tests for the broker-core protocol layer.
//!
//! These tests drive the public API the way the framed socket does: bytes
//! arrive in arbitrary chunks, get appended to a buffer, and complete frames
//! are drained from the front.  They also check the handshake codec against
//! an independent accept-key implementation.

use broker_core::protocol::{
    compute_upgrade_response, decode_frame, encode_frame, encode_frame_masked,
    handshake::accept_key, Frame, FrameError, MessageDeflater, MessageInflater, Opcode,
    UpgradeHeaders,
};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

const MASK: [u8; 4] = [0xA1, 0xB2, 0xC3, 0xD4];

/// Feeds `wire` to the decoder in `chunk`-sized pieces and returns every
/// frame in arrival order.
fn decode_in_chunks(wire: &[u8], chunk: usize) -> Vec<Frame> {
    let mut buf = Vec::new();
    let mut frames = Vec::new();
    for piece in wire.chunks(chunk) {
        buf.extend_from_slice(piece);
        loop {
            match decode_frame(&buf) {
                Ok((frame, consumed)) => {
                    buf.drain(..consumed);
                    frames.push(frame);
                }
                Err(FrameError::InsufficientData { .. }) => break,
                Err(e) => panic!("unexpected decode error: {e}"),
            }
        }
    }
    assert!(buf.is_empty(), "no bytes may be left over");
    frames
}

// ── Handshake ─────────────────────────────────────────────────────────────────

#[test]
fn test_accept_key_matches_independent_implementation() {
    for key in [
        "dGhlIHNhbXBsZSBub25jZQ==",
        "x3JJHMbDL1EzLkh9GBhXDw==",
        "AQIDBAUGBwgJCgsMDQ4PEA==",
        "not-even-base64",
    ] {
        assert_eq!(accept_key(key), derive_accept_key(key.as_bytes()), "key {key}");
    }
}

#[test]
fn test_upgrade_response_embeds_independent_accept_key() {
    let key = "x3JJHMbDL1EzLkh9GBhXDw==";
    let headers: UpgradeHeaders = [("Sec-WebSocket-Key", key)].into_iter().collect();
    let result = compute_upgrade_response(&headers).unwrap();
    let text = String::from_utf8(result.response_bytes).unwrap();
    let expected = format!("Sec-WebSocket-Accept: {}\r\n", derive_accept_key(key.as_bytes()));
    assert!(text.contains(&expected));
    assert!(text.ends_with("\r\n\r\n"));
}

// ── Framing ───────────────────────────────────────────────────────────────────

#[test]
fn test_coalesced_frames_decode_in_order() {
    // Three client frames delivered in a single read.
    let mut wire = encode_frame_masked(&Frame::text("one"), MASK);
    wire.extend(encode_frame_masked(&Frame::binary(vec![2; 200]), MASK));
    wire.extend(encode_frame_masked(&Frame::ping(b"p".to_vec()), MASK));

    let frames = decode_in_chunks(&wire, wire.len());

    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].payload, b"one");
    assert_eq!(frames[1].payload.len(), 200);
    assert_eq!(frames[2].opcode, Opcode::Ping);
}

#[test]
fn test_byte_at_a_time_delivery_never_yields_short_frame() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
    let wire = encode_frame_masked(&Frame::binary(payload.clone()), MASK);

    let frames = decode_in_chunks(&wire, 1);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload, payload);
}

#[test]
fn test_fragmented_message_frames_are_reported_individually() {
    // Reassembly is the socket's job; the codec reports each fragment.
    let first = Frame {
        fin: false,
        rsv1: false,
        opcode: Opcode::Text,
        masked: false,
        payload: b"hel".to_vec(),
    };
    let last = Frame {
        fin: true,
        rsv1: false,
        opcode: Opcode::Continuation,
        masked: false,
        payload: b"lo".to_vec(),
    };
    let mut wire = encode_frame_masked(&first, MASK);
    wire.extend(encode_frame_masked(&last, MASK));

    let frames = decode_in_chunks(&wire, 3);

    assert_eq!(frames.len(), 2);
    assert!(!frames[0].fin);
    assert_eq!(frames[1].opcode, Opcode::Continuation);
    let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.clone()).collect();
    assert_eq!(joined, b"hello");
}

#[test]
fn test_server_frames_are_unmasked() {
    let bytes = encode_frame(&Frame::binary(vec![9; 4]));
    let (frame, _) = decode_frame(&bytes).unwrap();
    assert!(!frame.masked);
    assert_eq!(bytes[1] & 0x80, 0);
}

// ── Compression ───────────────────────────────────────────────────────────────

#[test]
fn test_compressed_messages_survive_chunked_delivery() {
    let mut deflater = MessageDeflater::new();
    let mut inflater = MessageInflater::new(1 << 20);
    let messages = [
        br#"{"type":"call","id":1,"channel":"ping","command":"echo"}"#.to_vec(),
        br#"{"type":"call","id":2,"channel":"ping","command":"echo"}"#.to_vec(),
        vec![b'z'; 5_000],
    ];

    let mut wire = Vec::new();
    for message in &messages {
        let mut frame = Frame::binary(deflater.compress(message).unwrap());
        frame.rsv1 = true;
        wire.extend(encode_frame_masked(&frame, MASK));
    }

    let frames = decode_in_chunks(&wire, 7);

    assert_eq!(frames.len(), messages.len());
    for (frame, original) in frames.iter().zip(messages.iter()) {
        assert!(frame.rsv1);
        assert_eq!(&inflater.decompress(&frame.payload).unwrap(), original);
    }
}
