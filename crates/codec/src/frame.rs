//! ZMTP-flavoured multipart framing.
//!
//! Each frame on the wire is a flags octet followed by a length and the
//! payload. Bit 0 of the flags marks a continuation (`more`); bit 1 selects
//! the long form, where the length is a 64-bit big-endian integer instead of
//! a single octet. A multipart message is a maximal run of frames whose last
//! frame has the `more` bit clear.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::Error;

const MORE: u8 = 0x01;
const LONG: u8 = 0x02;

/// Frames larger than this are treated as a protocol violation rather than
/// buffered; a peer sending one is disconnected by the caller.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Serialises one multipart message into `dst`.
///
/// Every frame except the last is written with the `more` flag so receivers
/// can reassemble the message boundary.
pub fn encode(frames: &[Bytes], dst: &mut BytesMut) {
    debug_assert!(!frames.is_empty());

    for (index, frame) in frames.iter().enumerate() {
        let mut flags = if index + 1 < frames.len() { MORE } else { 0 };
        if frame.len() > u8::MAX as usize {
            flags |= LONG;
        }

        dst.put_u8(flags);
        if flags & LONG != 0 {
            dst.put_u64(frame.len() as u64);
        } else {
            dst.put_u8(frame.len() as u8);
        }

        dst.extend_from_slice(frame);
    }
}

/// Incremental multipart decoder.
///
/// Feed it the raw byte stream as it arrives; completed messages come out as
/// `Vec<Bytes>`. Partial frames and partial messages are retained across
/// calls, so the decoder can be driven with arbitrarily fragmented input.
#[derive(Default)]
pub struct Decoder {
    parts: Vec<Bytes>,
}

impl Decoder {
    /// Consumes as many whole frames from `src` as are available, returning
    /// the next complete multipart message, or `None` if more bytes are
    /// needed.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<Bytes>>, Error> {
        loop {
            if src.len() < 2 {
                return Ok(None);
            }

            let flags = src[0];
            let (length, header) = if flags & LONG != 0 {
                if src.len() < 9 {
                    return Ok(None);
                }

                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[1..9]);
                (u64::from_be_bytes(raw) as usize, 9)
            } else {
                (src[1] as usize, 2)
            };

            if length > MAX_FRAME_SIZE {
                return Err(Error::FrameOversize);
            }

            if src.len() < header + length {
                return Ok(None);
            }

            src.advance(header);
            self.parts.push(src.split_to(length).freeze());

            if flags & MORE == 0 {
                return Ok(Some(std::mem::take(&mut self.parts)));
            }
        }
    }
}
