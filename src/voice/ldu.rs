//! The 216-byte LDU buffers and the packed record form exchanged with the
//! FNE.
//!
//! Two layouts share this module:
//! - the *semantic buffer*: 9 IMBE codewords at fixed offsets plus
//!   interstitial sideband triplets and the low-speed data pair;
//! - the *record form* on the FNE wire: nine tagged records written
//!   back-to-back from offset 0, one per voice frame, in the same shapes
//!   the manufacturer DFSI framing uses.

use crate::codec::mot;
use crate::codec::IMBE_LEN;

/// Size of both LDU layouts.
pub const LDU_LEN: usize = 216;

/// IMBE codeword offsets in the semantic buffer.
pub const IMBE_OFFSETS: [usize; 9] = [10, 26, 55, 80, 105, 130, 155, 180, 204];

/// Sideband triplet slots in the semantic buffer (link control for LDU1,
/// encryption sync for LDU2).
pub const SIDEBAND_OFFSETS: [usize; 4] = [51, 76, 101, 126];

/// Low-speed data pair in the semantic buffer.
pub const LSD_OFFSET: usize = 151;

/// Record start offsets in the packed form.
pub const RECORD_OFFSETS: [usize; 9] = [0, 22, 36, 53, 70, 87, 104, 121, 138];

/// Record lengths in the packed form.
pub const RECORD_LENGTHS: [usize; 9] = [22, 14, 17, 17, 17, 17, 17, 17, 16];

/// IMBE offset within each packed record.
pub const RECORD_IMBE_OFFSETS: [usize; 9] = [10, 1, 5, 5, 5, 5, 5, 5, 4];

/// Which LDU a buffer or record group belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LduKind {
    Ldu1,
    Ldu2,
}

impl LduKind {
    /// Record tag of the first voice frame (0x62 or 0x6B); subsequent
    /// records increment from it.
    pub fn base_tag(&self) -> u8 {
        match self {
            LduKind::Ldu1 => crate::codec::FT_LDU1_VOICE1,
            LduKind::Ldu2 => crate::codec::FT_LDU2_VOICE10,
        }
    }
}

/// One semantic LDU buffer. Reset to zero at call start; owned by the
/// voice path scheduler for the life of a stream.
#[derive(Debug, Clone)]
pub struct LduBuffer {
    data: [u8; LDU_LEN],
}

impl Default for LduBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LduBuffer {
    pub fn new() -> Self {
        LduBuffer {
            data: [0; LDU_LEN],
        }
    }

    pub fn reset(&mut self) {
        self.data = [0; LDU_LEN];
    }

    pub fn set_imbe(&mut self, n: usize, imbe: &[u8; IMBE_LEN]) {
        let at = IMBE_OFFSETS[n];
        self.data[at..at + IMBE_LEN].copy_from_slice(imbe);
    }

    pub fn imbe(&self, n: usize) -> [u8; IMBE_LEN] {
        let at = IMBE_OFFSETS[n];
        self.data[at..at + IMBE_LEN].try_into().unwrap()
    }

    pub fn set_triplet(&mut self, slot: usize, bytes: [u8; 3]) {
        let at = SIDEBAND_OFFSETS[slot];
        self.data[at..at + 3].copy_from_slice(&bytes);
    }

    pub fn triplet(&self, slot: usize) -> [u8; 3] {
        let at = SIDEBAND_OFFSETS[slot];
        self.data[at..at + 3].try_into().unwrap()
    }

    pub fn set_lsd(&mut self, lsd1: u8, lsd2: u8) {
        self.data[LSD_OFFSET] = lsd1;
        self.data[LSD_OFFSET + 1] = lsd2;
    }

    pub fn lsd(&self) -> (u8, u8) {
        (self.data[LSD_OFFSET], self.data[LSD_OFFSET + 1])
    }
}

/// Check the nine record tags of a packed LDU payload.
pub fn detect(payload: &[u8], kind: LduKind) -> bool {
    if payload.len() < LDU_LEN {
        return false;
    }
    let base = kind.base_tag();
    RECORD_OFFSETS
        .iter()
        .enumerate()
        .all(|(n, &at)| payload[at] == base + n as u8)
}

/// Classify a packed LDU payload by its record tags.
pub fn detect_kind(payload: &[u8]) -> Option<LduKind> {
    if detect(payload, LduKind::Ldu1) {
        Some(LduKind::Ldu1)
    } else if detect(payload, LduKind::Ldu2) {
        Some(LduKind::Ldu2)
    } else {
        None
    }
}

/// Voice and sideband content pulled out of a packed LDU payload.
#[derive(Debug, Clone)]
pub struct UnpackedLdu {
    pub imbe: [[u8; IMBE_LEN]; 9],
    /// Additional-data triplets of records 3..=8.
    pub triplets: [[u8; 3]; 6],
    pub lsd: [u8; 2],
}

/// Copy the codewords and sideband bytes out of a packed payload. The
/// caller has already verified the record tags with [`detect_kind`].
pub fn unpack(payload: &[u8]) -> UnpackedLdu {
    let mut imbe = [[0u8; IMBE_LEN]; 9];
    for n in 0..9 {
        let at = RECORD_OFFSETS[n] + RECORD_IMBE_OFFSETS[n];
        imbe[n].copy_from_slice(&payload[at..at + IMBE_LEN]);
    }
    let mut triplets = [[0u8; 3]; 6];
    for (i, t) in triplets.iter_mut().enumerate() {
        let at = RECORD_OFFSETS[i + 2] + 1;
        t.copy_from_slice(&payload[at..at + 3]);
    }
    let lsd_at = RECORD_OFFSETS[8] + 1;
    UnpackedLdu {
        imbe,
        triplets,
        lsd: [payload[lsd_at], payload[lsd_at + 1]],
    }
}

/// Pack a semantic buffer into the record form.
///
/// Records 3..=5 take the buffer's first three sideband slots. For LDU1
/// the RS parity (9 bytes) fills records 6..=8; for LDU2 the fourth
/// sideband slot (algorithm id and key id) fills record 6 and the parity
/// (6 bytes) records 7..=8. Record 9 carries the LSD pair.
pub fn pack_records(buf: &LduBuffer, kind: LduKind, parity: &[u8]) -> [u8; LDU_LEN] {
    let mut out = [0u8; LDU_LEN];
    let base = kind.base_tag();

    for n in 0..9 {
        let at = RECORD_OFFSETS[n];
        out[at] = base + n as u8;

        let imbe = buf.imbe(n);
        let imbe_at = at + RECORD_IMBE_OFFSETS[n];
        out[imbe_at..imbe_at + IMBE_LEN].copy_from_slice(&imbe);

        let additional: Option<[u8; 3]> = match n {
            0 => {
                // first record mirrors the start-of-stream core
                out[at + 1] = mot::SOS_MARKER;
                out[at + 2] = mot::RT_ENABLED;
                out[at + 3] = mot::START_STREAM;
                out[at + 4] = mot::TYPE_VOICE;
                None
            }
            2..=4 => Some(buf.triplet(n - 2)),
            5 => match kind {
                LduKind::Ldu1 => Some(parity[0..3].try_into().unwrap()),
                LduKind::Ldu2 => Some(buf.triplet(3)),
            },
            6 | 7 => {
                let p = match kind {
                    LduKind::Ldu1 => &parity[(n - 5) * 3..(n - 4) * 3],
                    LduKind::Ldu2 => &parity[(n - 6) * 3..(n - 5) * 3],
                };
                Some(p.try_into().unwrap())
            }
            8 => {
                let (lsd1, lsd2) = buf.lsd();
                Some([lsd1, lsd2, 0x00])
            }
            _ => None,
        };
        if let Some(bytes) = additional {
            out[at + 1..at + 4].copy_from_slice(&bytes);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout_is_contiguous() {
        for n in 0..8 {
            assert_eq!(RECORD_OFFSETS[n] + RECORD_LENGTHS[n], RECORD_OFFSETS[n + 1]);
        }
        assert!(RECORD_OFFSETS[8] + RECORD_LENGTHS[8] <= LDU_LEN);
    }

    #[test]
    fn test_buffer_accessors() {
        let mut buf = LduBuffer::new();
        buf.set_imbe(4, &[0x77; IMBE_LEN]);
        assert_eq!(buf.imbe(4), [0x77; IMBE_LEN]);
        assert_eq!(buf.imbe(3), [0x00; IMBE_LEN]);
        buf.set_triplet(2, [1, 2, 3]);
        assert_eq!(buf.triplet(2), [1, 2, 3]);
        buf.set_lsd(0xAB, 0xCD);
        assert_eq!(buf.lsd(), (0xAB, 0xCD));
        buf.reset();
        assert_eq!(buf.imbe(4), [0x00; IMBE_LEN]);
    }

    #[test]
    fn test_pack_then_detect_and_unpack_ldu1() {
        let mut buf = LduBuffer::new();
        for n in 0..9 {
            buf.set_imbe(n, &[(n as u8 + 1); IMBE_LEN]);
        }
        buf.set_triplet(0, [0x00, 0x90, 0x01]); // lco, mfid, so
        buf.set_triplet(1, [0x00, 0x01, 0xF4]); // dst
        buf.set_triplet(2, [0x01, 0x23, 0x45]); // src
        buf.set_lsd(0x12, 0x34);

        let parity = [0x34, 0xAC, 0x87, 0x50, 0xE9, 0xF5, 0x77, 0x31, 0xF7];
        let packed = pack_records(&buf, LduKind::Ldu1, &parity);

        assert_eq!(detect_kind(&packed), Some(LduKind::Ldu1));
        let unpacked = unpack(&packed);
        for n in 0..9 {
            assert_eq!(unpacked.imbe[n], [(n as u8 + 1); IMBE_LEN]);
        }
        assert_eq!(unpacked.triplets[0], [0x00, 0x90, 0x01]);
        assert_eq!(unpacked.triplets[1], [0x00, 0x01, 0xF4]);
        assert_eq!(unpacked.triplets[2], [0x01, 0x23, 0x45]);
        assert_eq!(unpacked.triplets[3], [0x34, 0xAC, 0x87]);
        assert_eq!(unpacked.triplets[4], [0x50, 0xE9, 0xF5]);
        assert_eq!(unpacked.triplets[5], [0x77, 0x31, 0xF7]);
        assert_eq!(unpacked.lsd, [0x12, 0x34]);
    }

    #[test]
    fn test_pack_then_unpack_ldu2() {
        let mut buf = LduBuffer::new();
        for n in 0..9 {
            buf.set_imbe(n, &[0xE0 | n as u8; IMBE_LEN]);
        }
        buf.set_triplet(0, [1, 2, 3]); // MI 0..3
        buf.set_triplet(1, [4, 5, 6]); // MI 3..6
        buf.set_triplet(2, [7, 8, 9]); // MI 6..9
        buf.set_triplet(3, [0x80, 0x12, 0x34]); // algo, key id

        let parity = [0xE4, 0x79, 0x0E, 0x1C, 0xEC, 0xEE];
        let packed = pack_records(&buf, LduKind::Ldu2, &parity);

        assert_eq!(detect_kind(&packed), Some(LduKind::Ldu2));
        let unpacked = unpack(&packed);
        assert_eq!(unpacked.triplets[3], [0x80, 0x12, 0x34]);
        assert_eq!(unpacked.triplets[4], [0xE4, 0x79, 0x0E]);
        assert_eq!(unpacked.triplets[5], [0x1C, 0xEC, 0xEE]);
    }

    #[test]
    fn test_detect_rejects_wrong_tags() {
        let buf = LduBuffer::new();
        let mut packed = pack_records(&buf, LduKind::Ldu1, &[0; 9]);
        assert!(detect(&packed, LduKind::Ldu1));
        assert!(!detect(&packed, LduKind::Ldu2));
        packed[RECORD_OFFSETS[4]] = 0x00;
        assert_eq!(detect_kind(&packed), None);
    }

    #[test]
    fn test_detect_rejects_short_payload() {
        assert!(!detect(&[0x62; 100], LduKind::Ldu1));
    }
}
