use bytes::{Bytes, BytesMut};
use curvemq_codec::frame::{Decoder, encode};
use curvemq_codec::Error;

fn parts(frames: &[&[u8]]) -> Vec<Bytes> {
    frames.iter().map(|f| Bytes::copy_from_slice(f)).collect()
}

#[test]
fn single_frame_round_trip() {
    let message = parts(&[b"HI"]);
    let mut wire = BytesMut::new();
    encode(&message, &mut wire);

    // flags, length, payload
    assert_eq!(&wire[..], &[0x00, 0x02, b'H', b'I']);

    let mut decoder = Decoder::default();
    let decoded = decoder.decode(&mut wire).unwrap().unwrap();
    assert_eq!(decoded, message);
    assert!(wire.is_empty());
}

#[test]
fn multipart_more_flags() {
    let message = parts(&[b"UNKNOWNCOMMAND", b"a.a"]);
    let mut wire = BytesMut::new();
    encode(&message, &mut wire);

    // First frame carries the more bit, the last does not.
    assert_eq!(wire[0], 0x01);
    let second = 2 + message[0].len();
    assert_eq!(wire[second], 0x00);

    let mut decoder = Decoder::default();
    assert_eq!(decoder.decode(&mut wire).unwrap().unwrap(), message);
}

#[test]
fn long_frame_round_trip() {
    let big = vec![0xabu8; 70_000];
    let message = parts(&[b"x.blob", b"tag12345", &big]);
    let mut wire = BytesMut::new();
    encode(&message, &mut wire);

    let mut decoder = Decoder::default();
    let decoded = decoder.decode(&mut wire).unwrap().unwrap();
    assert_eq!(decoded.len(), 3);
    assert_eq!(decoded[2].len(), 70_000);
}

#[test]
fn empty_frames_are_legal() {
    let message = parts(&[b"x.r", b"", b""]);
    let mut wire = BytesMut::new();
    encode(&message, &mut wire);

    let mut decoder = Decoder::default();
    assert_eq!(decoder.decode(&mut wire).unwrap().unwrap(), message);
}

#[test]
fn fragmented_input() {
    let message = parts(&[b"REPLY", b"tag98765", b"payload"]);
    let mut wire = BytesMut::new();
    encode(&message, &mut wire);

    // Drive the decoder one byte at a time; it must only emit the message
    // once the final byte arrives.
    let mut decoder = Decoder::default();
    let mut stream = BytesMut::new();
    let total = wire.len();
    for (fed, byte) in wire.iter().enumerate() {
        stream.extend_from_slice(&[*byte]);
        let out = decoder.decode(&mut stream).unwrap();
        if fed + 1 < total {
            assert!(out.is_none());
        } else {
            assert_eq!(out.unwrap(), message);
        }
    }
}

#[test]
fn back_to_back_messages() {
    let first = parts(&[b"HI"]);
    let second = parts(&[b"x.x", b"body"]);
    let mut wire = BytesMut::new();
    encode(&first, &mut wire);
    encode(&second, &mut wire);

    let mut decoder = Decoder::default();
    assert_eq!(decoder.decode(&mut wire).unwrap().unwrap(), first);
    assert_eq!(decoder.decode(&mut wire).unwrap().unwrap(), second);
    assert!(decoder.decode(&mut wire).unwrap().is_none());
}

#[test]
fn oversize_frame_rejected() {
    // Hand-craft a long-form header claiming a frame far past the cap.
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&[0x02]);
    wire.extend_from_slice(&(1u64 << 40).to_be_bytes());

    let mut decoder = Decoder::default();
    assert_eq!(decoder.decode(&mut wire), Err(Error::FrameOversize));
}
