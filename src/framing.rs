//! Byte-stuffed framing over the byte-stream transport (spec.md §4.2).
//!
//! Each TL packet is wrapped as: `0xCC` (delimiter) `<escaped packet bytes>`
//! `<CRC16, escaped>` `0xCC` (delimiter), where `0xCC` and the escape byte
//! `0x77` appearing inside the packet or CRC are each replaced by `0x77`
//! followed by the original byte XORed with `0x77`. The CRC is MCRF4XX
//! (poly 0x8408, init 0xFFFF, reflected) computed over the unescaped,
//! un-stuffed packet bytes.
//!
//! This is implemented as a [`tokio_util::codec`] pair so any
//! `AsyncRead + AsyncWrite` transport can be wrapped in a
//! [`tokio_util::codec::Framed`] to get a stream/sink of whole packets.

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_MCRF4XX};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

pub const DELIMITER: u8 = 0xCC;
pub const ESCAPE: u8 = 0x77;

const MCRF4XX: Crc<u16> = Crc::<u16>::new(&CRC_16_MCRF4XX);

/// The same CRC16 MCRF4XX used by the frame trailer, exposed for pairing
/// packets (spec.md §4.3), which carry their own CRC inside the payload
/// rather than a MAC.
pub fn crc16(data: &[u8]) -> u16 {
    MCRF4XX.checksum(data)
}

fn escape_into(out: &mut Vec<u8>, byte: u8) {
    if byte == DELIMITER || byte == ESCAPE {
        out.push(ESCAPE);
        out.push(byte ^ ESCAPE);
    } else {
        out.push(byte);
    }
}

/// Frame a single packet's bytes for transmission, including delimiters,
/// escaping, and the trailing CRC.
pub fn encode_frame(packet: &[u8]) -> Vec<u8> {
    let crc = MCRF4XX.checksum(packet).to_le_bytes();

    let mut framed = Vec::with_capacity(packet.len() + crc.len() + 4);
    framed.push(DELIMITER);

    for &byte in packet.iter().chain(crc.iter()) {
        escape_into(&mut framed, byte);
    }

    framed.push(DELIMITER);
    framed
}

/// The unescape/CRC-verify half of the frame codec, applied to the bytes
/// found between two delimiters (exclusive).
fn decode_frame(escaped: &[u8]) -> Option<Vec<u8>> {
    let mut unescaped = Vec::with_capacity(escaped.len());
    let mut iter = escaped.iter().copied();

    while let Some(byte) = iter.next() {
        if byte == ESCAPE {
            let next = iter.next()?;
            unescaped.push(next ^ ESCAPE);
        } else {
            unescaped.push(byte);
        }
    }

    if unescaped.len() < 2 {
        return None;
    }

    let crc_offset = unescaped.len() - 2;
    let (payload, crc_bytes) = unescaped.split_at(crc_offset);
    let received_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);

    if MCRF4XX.checksum(payload) == received_crc {
        Some(payload.to_vec())
    } else {
        None
    }
}

/// A `tokio_util::codec::{Decoder, Encoder}` implementation of the frame
/// layer. Decodes emit one inner (unframed, CRC-verified) packet per call;
/// frames that fail CRC are discarded and decoding continues with the next
/// delimiter, matching spec.md's "discard and continue" parser policy.
#[derive(Default)]
pub struct FrameCodec {
    /// Whether we are currently between a start and end delimiter.
    inside: bool,
}

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if !self.inside {
                // Discard bytes outside a frame until we see a delimiter.
                match src.iter().position(|&b| b == DELIMITER) {
                    Some(pos) => {
                        src.advance(pos + 1);
                        self.inside = true;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            // We're inside a frame: find the next delimiter, respecting escapes.
            let mut i = 0;
            let mut escaped_next = false;
            let mut end = None;

            while i < src.len() {
                let byte = src[i];

                if escaped_next {
                    escaped_next = false;
                } else if byte == ESCAPE {
                    escaped_next = true;
                } else if byte == DELIMITER {
                    end = Some(i);
                    break;
                }

                i += 1;
            }

            match end {
                Some(end) => {
                    let frame_bytes = src.split_to(end);
                    src.advance(1); // consume the trailing delimiter
                    self.inside = false;

                    match decode_frame(&frame_bytes) {
                        Some(packet) => return Ok(Some(packet)),
                        None => continue, // CRC failure: discard, keep scanning
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(&encode_frame(&item));
        Ok(())
    }
}
