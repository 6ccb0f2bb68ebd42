//! Wire framing: synchronization marker, byte stuffing and CRC-16.
//!
//! Frame format:
//! - SYNC (1 octet): 0x7E frame start marker
//! - PROTOCOL + PAYLOAD (16 octets, stuffed): the application message
//! - CRC-16 (2 octets, stuffed, high octet first): polynomial
//!   x^16 + x^12 + x^5 + 1, initial value 0xFFFF, computed over the
//!   unstuffed protocol id and payload
//!
//! Stuffing is HDLC-style: the reserved octets SYNC and ESC never appear in
//! a frame body; each is sent as ESC followed by the octet XOR 0x20. The XOR
//! transform is its own inverse and is applied identically on encode and
//! decode, so a SYNC octet on the wire is unambiguous as a frame start.
//!
//! There is no acknowledgement and no retransmission request at this layer:
//! a frame failing the CRC is simply dropped.

use heapless::Vec;
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::protocol::{Message, MSG_SIZE};

/// Frame start marker.
pub const SYNC: u8 = 0x7E;
/// Escape octet introducing a stuffed reserved value.
pub const ESC: u8 = 0x7D;
/// XOR mask applied to an escaped octet.
const ESC_XOR: u8 = 0x20;

/// De-stuffed frame body: protocol id + payload + CRC-16.
pub const BODY_SIZE: usize = MSG_SIZE + 2;
/// Worst-case encoded frame: SYNC plus every body octet escaped.
pub const MAX_FRAME_SIZE: usize = 1 + 2 * BODY_SIZE;

const_assert_eq!(BODY_SIZE, 18);

/// An encoded frame as it goes onto the wire.
pub type FrameBuf = Vec<u8, MAX_FRAME_SIZE>;

/// Errors surfaced by the frame decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A complete frame arrived but its CRC did not verify.
    #[error("frame CRC mismatch")]
    InvalidCrc,
}

/// CRC-16 with polynomial 0x1021, initial value 0xFFFF, no reflection.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &octet in data {
        crc ^= u16::from(octet) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ 0x1021
            };
        }
    }
    crc
}

fn stuff(out: &mut FrameBuf, octet: u8) {
    // Pushes cannot fail: MAX_FRAME_SIZE covers every octet escaped.
    if octet == SYNC || octet == ESC {
        let _ = out.push(ESC);
        let _ = out.push(octet ^ ESC_XOR);
    } else {
        let _ = out.push(octet);
    }
}

/// Encode one message into its stuffed octet stream.
#[must_use]
pub fn encode(msg: &Message) -> FrameBuf {
    let raw = msg.octets();
    let crc = crc16(raw);
    let mut out = FrameBuf::new();
    let _ = out.push(SYNC);
    for &octet in raw {
        stuff(&mut out, octet);
    }
    stuff(&mut out, (crc >> 8) as u8);
    stuff(&mut out, crc as u8);
    out
}

/// Byte-at-a-time frame decoder.
///
/// Hunts for SYNC, de-stuffs the body, collects exactly [`BODY_SIZE`]
/// octets and verifies the CRC. Stuffing guarantees SYNC never occurs
/// inside a valid body, so one seen mid-frame can only mean corruption:
/// the decoder abandons the current frame and resynchronizes on it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    in_frame: bool,
    escaped: bool,
    body: Vec<u8, BODY_SIZE>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.in_frame = false;
        self.escaped = false;
        self.body.clear();
    }

    /// Feed one octet from the wire.
    ///
    /// Returns `Ok(Some(message))` when a frame completes with a valid CRC,
    /// `Ok(None)` while hunting or mid-frame, and `Err(InvalidCrc)` for a
    /// completed frame that fails the check.
    pub fn feed(&mut self, octet: u8) -> Result<Option<Message>, FrameError> {
        if octet == SYNC {
            self.reset();
            self.in_frame = true;
            return Ok(None);
        }
        if !self.in_frame {
            return Ok(None);
        }

        let octet = if self.escaped {
            self.escaped = false;
            octet ^ ESC_XOR
        } else if octet == ESC {
            self.escaped = true;
            return Ok(None);
        } else {
            octet
        };

        let _ = self.body.push(octet);
        if self.body.len() < BODY_SIZE {
            return Ok(None);
        }

        let mut raw = [0u8; MSG_SIZE];
        raw.copy_from_slice(&self.body[..MSG_SIZE]);
        let wire_crc =
            u16::from(self.body[MSG_SIZE]) << 8 | u16::from(self.body[MSG_SIZE + 1]);
        self.reset();

        if crc16(&raw) == wire_crc {
            Ok(Some(Message::from_octets(raw)))
        } else {
            Err(FrameError::InvalidCrc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_stream(bytes: &[u8]) -> Result<Option<Message>, FrameError> {
        let mut decoder = FrameDecoder::new();
        for &octet in bytes {
            match decoder.feed(octet) {
                Ok(Some(msg)) => return Ok(Some(msg)),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    #[test]
    fn test_crc_reference_vectors() {
        // The classic CCITT check string.
        assert_eq!(crc16(b"123456789"), 0x29B1);
        // An all-zero message (id 0x00, zero payload).
        assert_eq!(crc16(&[0u8; MSG_SIZE]), 0x6A0A);
    }

    #[test]
    fn test_roundtrip_plain_message() {
        let mut msg = Message::new(0x81);
        msg.octets_mut()[5] = 0x02;
        msg.octets_mut()[9] = 0x42;
        let stream = encode(&msg);
        assert_eq!(stream[0], SYNC);
        let decoded = decode_stream(&stream).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_roundtrip_reserved_octets_everywhere() {
        let mut raw = [0u8; MSG_SIZE];
        for (i, octet) in raw.iter_mut().enumerate() {
            *octet = if i % 2 == 0 { SYNC } else { ESC };
        }
        let msg = Message::from_octets(raw);
        let stream = encode(&msg);
        let decoded = decode_stream(&stream).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_sync_never_appears_inside_encoded_stream() {
        // Worst case payload: every octet is the marker itself.
        let msg = Message::from_octets([SYNC; MSG_SIZE]);
        let stream = encode(&msg);
        assert!(!stream[1..].contains(&SYNC));
    }

    #[test]
    fn test_corrupted_crc_is_rejected() {
        let msg = Message::new(0x61);
        let mut stream = encode(&msg);
        let last = stream.len() - 1;
        stream[last] ^= 0x01;
        assert_eq!(decode_stream(&stream), Err(FrameError::InvalidCrc));
    }

    #[test]
    fn test_resync_after_leading_garbage() {
        let msg = Message::new(0x81);
        let mut bytes = std::vec::Vec::new();
        bytes.extend_from_slice(&[0x00, 0x12, 0x99]);
        bytes.extend_from_slice(&encode(&msg));
        let decoded = decode_stream(&bytes).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_resync_on_mid_frame_sync() {
        // A truncated frame followed by a complete one: the complete frame
        // must still be recovered.
        let msg = Message::new(0x81);
        let good = encode(&msg);
        let mut bytes = std::vec::Vec::new();
        bytes.extend_from_slice(&good[..7]);
        bytes.extend_from_slice(&good);
        let decoded = decode_stream(&bytes).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }
}
