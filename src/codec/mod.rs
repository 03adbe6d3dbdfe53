//! DFSI frame codec — bit-exact encode/decode of the TIA-102.BAHA payload
//! layouts, in both the "standard" block form and the manufacturer
//! (Quantar-style) form.
//!
//! Everything in this module tree is pure: byte buffers in, typed frame
//! records out, and back. No I/O and no state.

pub mod control;
pub mod fec;
pub mod fsc;
pub mod mot;
pub mod standard;

use thiserror::Error;

/// Length of one IMBE codeword. The payload is opaque to the bridge.
pub const IMBE_LEN: usize = 11;

// DFSI frame-type opcodes (byte 0 of every manufacturer frame, and the
// frame-type byte of full-rate voice in both framings).
pub const FT_MOT_START_STOP: u8 = 0x00;
pub const FT_MOT_VHDR_1: u8 = 0x60;
pub const FT_MOT_VHDR_2: u8 = 0x61;
pub const FT_LDU1_VOICE1: u8 = 0x62;
pub const FT_LDU1_VOICE2: u8 = 0x63;
pub const FT_LDU1_VOICE3: u8 = 0x64;
pub const FT_LDU1_VOICE4: u8 = 0x65;
pub const FT_LDU1_VOICE5: u8 = 0x66;
pub const FT_LDU1_VOICE6: u8 = 0x67;
pub const FT_LDU1_VOICE7: u8 = 0x68;
pub const FT_LDU1_VOICE8: u8 = 0x69;
pub const FT_LDU1_VOICE9: u8 = 0x6A;
pub const FT_LDU2_VOICE10: u8 = 0x6B;
pub const FT_LDU2_VOICE11: u8 = 0x6C;
pub const FT_LDU2_VOICE12: u8 = 0x6D;
pub const FT_LDU2_VOICE13: u8 = 0x6E;
pub const FT_LDU2_VOICE14: u8 = 0x6F;
pub const FT_LDU2_VOICE15: u8 = 0x70;
pub const FT_LDU2_VOICE16: u8 = 0x71;
pub const FT_LDU2_VOICE17: u8 = 0x72;
pub const FT_LDU2_VOICE18: u8 = 0x73;

/// Decode failures for any DFSI frame shape.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short: got {got} bytes, need {need}")]
    TooShort { got: usize, need: usize },
    #[error("unexpected opcode {opcode:#04x}")]
    BadOpcode { opcode: u8 },
    #[error("invalid field value {value:#04x} for {field}")]
    BadField { field: &'static str, value: u8 },
}

/// True for any full-rate-voice frame type in either LDU.
pub fn is_voice_frame(ft: u8) -> bool {
    (FT_LDU1_VOICE1..=FT_LDU2_VOICE18).contains(&ft)
}

/// True for the nine LDU1 voice frame types.
pub fn is_ldu1_frame(ft: u8) -> bool {
    (FT_LDU1_VOICE1..=FT_LDU1_VOICE9).contains(&ft)
}

/// True for the nine LDU2 voice frame types.
pub fn is_ldu2_frame(ft: u8) -> bool {
    (FT_LDU2_VOICE10..=FT_LDU2_VOICE18).contains(&ft)
}

/// 1-based position of a voice frame within its LDU (1..=9).
pub fn frame_position(ft: u8) -> Option<usize> {
    if is_ldu1_frame(ft) {
        Some((ft - FT_LDU1_VOICE1) as usize + 1)
    } else if is_ldu2_frame(ft) {
        Some((ft - FT_LDU2_VOICE10) as usize + 1)
    } else {
        None
    }
}

/// Repack octets into 6-bit symbols ("hexbits"), MSB first.
///
/// Reads `count * 6` bits from `bytes` and returns one symbol per output
/// byte, each in 0..=63. The input must hold at least `ceil(count * 6 / 8)`
/// bytes.
pub fn bytes_to_hexbits(bytes: &[u8], count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(count);
    for s in 0..count {
        let mut v = 0u8;
        for k in 0..6 {
            let bit = s * 6 + k;
            let b = (bytes[bit / 8] >> (7 - (bit % 8))) & 0x01;
            v = (v << 1) | b;
        }
        out.push(v);
    }
    out
}

/// Inverse of [`bytes_to_hexbits`]: pack 6-bit symbols back into octets,
/// MSB first. Returns `floor(hexbits.len() * 6 / 8)` bytes; trailing bits
/// short of a full octet are dropped.
pub fn hexbits_to_bytes(hexbits: &[u8]) -> Vec<u8> {
    let nbytes = hexbits.len() * 6 / 8;
    let mut out = vec![0u8; nbytes];
    for (s, &h) in hexbits.iter().enumerate() {
        for k in 0..6 {
            let bit = s * 6 + k;
            if bit / 8 >= nbytes {
                break;
            }
            let b = (h >> (5 - k)) & 0x01;
            out[bit / 8] |= b << (7 - (bit % 8));
        }
    }
    out
}

/// Render a buffer as a spaced hex string for the raw packet trace.
pub fn hex_dump(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            s.push(if i % 16 == 0 { '\n' } else { ' ' });
        }
        s.push_str(&format!("{:02X}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_position() {
        assert_eq!(frame_position(FT_LDU1_VOICE1), Some(1));
        assert_eq!(frame_position(FT_LDU1_VOICE9), Some(9));
        assert_eq!(frame_position(FT_LDU2_VOICE10), Some(1));
        assert_eq!(frame_position(FT_LDU2_VOICE18), Some(9));
        assert_eq!(frame_position(FT_MOT_VHDR_1), None);
    }

    #[test]
    fn test_hexbits_roundtrip() {
        // 9 bytes <-> 12 hexbits, the LDU1 link-control shape
        let bytes = [0x00u8, 0x00, 0x00, 0x00, 0x01, 0xF4, 0x01, 0x23, 0x45];
        let hb = bytes_to_hexbits(&bytes, 12);
        assert_eq!(
            hb,
            vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0x34, 0x00, 0x12, 0x0D, 0x05]
        );
        assert_eq!(hexbits_to_bytes(&hb), bytes.to_vec());
    }

    #[test]
    fn test_hexbits_all_ones() {
        let bytes = [0xFFu8; 3];
        let hb = bytes_to_hexbits(&bytes, 4);
        assert_eq!(hb, vec![0x3F; 4]);
        assert_eq!(hexbits_to_bytes(&hb), bytes.to_vec());
    }

    #[test]
    fn test_hex_dump_wraps() {
        let data: Vec<u8> = (0..18).collect();
        let s = hex_dump(&data);
        assert!(s.contains("00 01 02"));
        assert_eq!(s.lines().count(), 2);
    }
}
