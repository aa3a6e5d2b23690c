//! Wire format for data frames and acknowledgments.
//!
//! All multi-byte integers are big-endian. Nothing in this module does I/O.
//!
//! ```text
//! windowed data frame
//! +---------+------------------+------------------------+-----------------+
//! | flags 1 | length 2         | sequence_id 4          | payload length  |
//! +---------+------------------+------------------------+-----------------+
//!   bit0 = is_final
//!
//! legacy alternating-bit frame
//! +---------------------+------------------+-----------------+
//! | (seq<<1)|is_final 1 | length 2         | payload length  |
//! +---------------------+------------------+-----------------+
//!
//! acknowledgment: value 4 (cumulative next-expected id), legacy: value 1
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Every datagram we emit fits in this many bytes.
pub const DATAGRAM_BUDGET: usize = 1024;

/// Header length of a windowed data frame.
pub const HEADER_LEN: usize = 7;

/// Header length of a legacy alternating-bit frame.
pub const LEGACY_HEADER_LEN: usize = 3;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = DATAGRAM_BUDGET - HEADER_LEN;

/// Acknowledgment frames are exactly this long.
pub const ACK_LEN: usize = 4;

/// Handshake steps are acknowledged with the ordinals 0, 1 and 2 in the same
/// 4-byte ack space, so the data phase numbers its packets from here on.
pub const DATA_SEQUENCE_BASE: u32 = 3;

const FLAG_FINAL: u8 = 0b0000_0001;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes is shorter than its header")]
    TooShort { len: usize },

    #[error("declared length {declared} exceeds the {available} bytes remaining")]
    LengthOverrun { declared: usize, available: usize },

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("acknowledgment must be {expected} bytes, got {len}")]
    BadAckLength { expected: usize, len: usize },

    #[error("alternating-bit sequence must be 0 or 1, got {0}")]
    BadSequenceBit(u8),
}

/// A decoded data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub is_final: bool,
    pub sequence_id: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn data(sequence_id: u32, payload: Bytes) -> Self {
        Self { is_final: false, sequence_id, payload }
    }

    /// The zero-length end-of-stream marker.
    pub fn end_marker(sequence_id: u32) -> Self {
        Self { is_final: true, sequence_id, payload: Bytes::new() }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        encode(self.sequence_id, self.is_final, &self.payload)
    }
}

/// Build `[flags | length | sequence_id] + payload`.
pub fn encode(sequence_id: u32, is_final: bool, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge { len: payload.len(), max: MAX_PAYLOAD });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(if is_final { FLAG_FINAL } else { 0 });
    buf.put_u16(payload.len() as u16);
    buf.put_u32(sequence_id);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Parse a windowed data frame. Bytes beyond the declared length are ignored.
pub fn decode(frame: &[u8]) -> Result<Packet, FrameError> {
    if frame.len() < HEADER_LEN {
        return Err(FrameError::TooShort { len: frame.len() });
    }

    let flags = frame[0];
    let declared = u16::from_be_bytes([frame[1], frame[2]]) as usize;
    let sequence_id = u32::from_be_bytes([frame[3], frame[4], frame[5], frame[6]]);

    let available = frame.len() - HEADER_LEN;
    if declared > available {
        return Err(FrameError::LengthOverrun { declared, available });
    }
    if declared > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge { len: declared, max: MAX_PAYLOAD });
    }

    Ok(Packet {
        is_final: flags & FLAG_FINAL != 0,
        sequence_id,
        payload: Bytes::copy_from_slice(&frame[HEADER_LEN..HEADER_LEN + declared]),
    })
}

pub fn encode_ack(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Anything that is not exactly [`ACK_LEN`] bytes is not an acknowledgment.
pub fn decode_ack(frame: &[u8]) -> Result<u32, FrameError> {
    let bytes: [u8; ACK_LEN] = frame
        .try_into()
        .map_err(|_| FrameError::BadAckLength { expected: ACK_LEN, len: frame.len() })?;
    Ok(u32::from_be_bytes(bytes))
}

/// A decoded legacy alternating-bit frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyPacket {
    pub sequence_bit: u8,
    pub is_final: bool,
    pub payload: Bytes,
}

pub fn encode_legacy(sequence_bit: u8, is_final: bool, payload: &[u8]) -> Result<Bytes, FrameError> {
    if sequence_bit > 1 {
        return Err(FrameError::BadSequenceBit(sequence_bit));
    }
    let max = DATAGRAM_BUDGET - LEGACY_HEADER_LEN;
    if payload.len() > max {
        return Err(FrameError::PayloadTooLarge { len: payload.len(), max });
    }

    let mut buf = BytesMut::with_capacity(LEGACY_HEADER_LEN + payload.len());
    buf.put_u8((sequence_bit << 1) | u8::from(is_final));
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

pub fn decode_legacy(frame: &[u8]) -> Result<LegacyPacket, FrameError> {
    if frame.len() < LEGACY_HEADER_LEN {
        return Err(FrameError::TooShort { len: frame.len() });
    }

    let declared = u16::from_be_bytes([frame[1], frame[2]]) as usize;
    let available = frame.len() - LEGACY_HEADER_LEN;
    if declared > available {
        return Err(FrameError::LengthOverrun { declared, available });
    }

    Ok(LegacyPacket {
        sequence_bit: (frame[0] >> 1) & 1,
        is_final: frame[0] & FLAG_FINAL != 0,
        payload: Bytes::copy_from_slice(&frame[LEGACY_HEADER_LEN..LEGACY_HEADER_LEN + declared]),
    })
}

pub fn encode_legacy_ack(sequence_bit: u8) -> Bytes {
    Bytes::copy_from_slice(&[sequence_bit & 1])
}

pub fn decode_legacy_ack(frame: &[u8]) -> Result<u8, FrameError> {
    match frame {
        [bit @ (0 | 1)] => Ok(*bit),
        [other] => Err(FrameError::BadSequenceBit(*other)),
        _ => Err(FrameError::BadAckLength { expected: 1, len: frame.len() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        for (id, is_final, payload) in [
            (DATA_SEQUENCE_BASE, false, &b"hello"[..]),
            (u32::MAX, true, &b""[..]),
            (42, false, &[0xAB; MAX_PAYLOAD][..]),
        ] {
            let frame = encode(id, is_final, payload).unwrap();
            let packet = decode(&frame).unwrap();
            assert_eq!(packet.sequence_id, id);
            assert_eq!(packet.is_final, is_final);
            assert_eq!(&packet.payload[..], payload);
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let frame = encode(0x0102_0304, true, b"xy").unwrap();
        assert_eq!(&frame[..], &[0x01, 0x00, 0x02, 0x01, 0x02, 0x03, 0x04, b'x', b'y']);
    }

    #[test]
    fn end_marker_is_empty_and_final() {
        let frame = Packet::end_marker(9).encode().unwrap();
        assert_eq!(frame.len(), HEADER_LEN);
        let packet = decode(&frame).unwrap();
        assert!(packet.is_final);
        assert!(packet.is_empty());
        assert_eq!(packet.sequence_id, 9);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            encode(3, false, &payload),
            Err(FrameError::PayloadTooLarge { len: MAX_PAYLOAD + 1, max: MAX_PAYLOAD })
        );
    }

    #[test]
    fn full_frame_fits_datagram_budget() {
        let frame = encode(3, false, &[0u8; MAX_PAYLOAD]).unwrap();
        assert_eq!(frame.len(), DATAGRAM_BUDGET);
    }

    #[test]
    fn decode_short_buffer_fails() {
        assert_eq!(decode(&[0u8; 6]), Err(FrameError::TooShort { len: 6 }));
        assert_eq!(decode(&[]), Err(FrameError::TooShort { len: 0 }));
    }

    #[test]
    fn decode_truncated_payload_fails() {
        let frame = encode(5, false, b"abcd").unwrap();
        assert_eq!(
            decode(&frame[..frame.len() - 1]),
            Err(FrameError::LengthOverrun { declared: 4, available: 3 })
        );
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut frame = encode(5, false, b"abcd").unwrap().to_vec();
        frame.extend_from_slice(b"junk");
        assert_eq!(&decode(&frame).unwrap().payload[..], b"abcd");
    }

    #[test]
    fn decode_ignores_unknown_flag_bits() {
        let mut frame = encode(5, false, b"").unwrap().to_vec();
        frame[0] = 0b1111_1110;
        assert!(!decode(&frame).unwrap().is_final);
    }

    #[test]
    fn ack_roundtrip_and_length_check() {
        assert_eq!(decode_ack(&encode_ack(0xDEAD_BEEF)).unwrap(), 0xDEAD_BEEF);
        assert_eq!(&encode_ack(2)[..], &[0, 0, 0, 2]);
        assert_eq!(
            decode_ack(&[0, 0, 1]),
            Err(FrameError::BadAckLength { expected: ACK_LEN, len: 3 })
        );
        assert!(decode_ack(&encode(3, false, b"").unwrap()).is_err());
    }

    #[test]
    fn legacy_frame_packs_bit_and_final_flag() {
        let frame = encode_legacy(1, true, b"z").unwrap();
        assert_eq!(&frame[..], &[0b11, 0x00, 0x01, b'z']);

        let packet = decode_legacy(&frame).unwrap();
        assert_eq!(packet.sequence_bit, 1);
        assert!(packet.is_final);
        assert_eq!(&packet.payload[..], b"z");
    }

    #[test]
    fn legacy_rejects_wide_sequence() {
        assert_eq!(encode_legacy(2, false, b""), Err(FrameError::BadSequenceBit(2)));
        assert!(matches!(
            decode_legacy(&[0, 0, 9, 1]),
            Err(FrameError::LengthOverrun { declared: 9, available: 1 })
        ));
    }

    #[test]
    fn legacy_ack_is_one_byte() {
        assert_eq!(decode_legacy_ack(&encode_legacy_ack(1)).unwrap(), 1);
        assert_eq!(decode_legacy_ack(&[7]), Err(FrameError::BadSequenceBit(7)));
        assert!(decode_legacy_ack(&[0, 1]).is_err());
    }
}
