//! RTP packet encoding/decoding for the DFSI voice conveyance channel.
//!
//! RTP header format (RFC 3550):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! DFSI payloads ride as the RTP payload; the SSRC carries the configured
//! peer id.

use anyhow::{bail, Result};

/// RTP header size in bytes (no CSRC, no extension).
pub const RTP_HEADER_SIZE: usize = 12;

/// P25 DFSI payload type.
pub const PT_P25_DFSI: u8 = 100;

/// Timestamp increment per voice packet (8000 Hz * 20ms = 160).
pub const TIMESTAMP_INCREMENT: u32 = 160;

/// Parsed RTP packet.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}

/// Encode an RTP packet into bytes.
pub fn encode(payload_type: u8, seq: u16, timestamp: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RTP_HEADER_SIZE + payload.len());

    // Byte 0: V=2, P=0, X=0, CC=0 -> 0x80
    buf.push(0x80);
    // Byte 1: M=0, PT
    buf.push(payload_type & 0x7F);
    // Bytes 2-3: sequence number (big-endian)
    buf.extend_from_slice(&seq.to_be_bytes());
    // Bytes 4-7: timestamp (big-endian)
    buf.extend_from_slice(&timestamp.to_be_bytes());
    // Bytes 8-11: SSRC (big-endian)
    buf.extend_from_slice(&ssrc.to_be_bytes());
    // Payload
    buf.extend_from_slice(payload);

    buf
}

/// Decode bytes into an RTP packet.
pub fn decode(data: &[u8]) -> Result<RtpPacket> {
    if data.len() < RTP_HEADER_SIZE {
        bail!("RTP packet too short: {} bytes", data.len());
    }

    let version = (data[0] >> 6) & 0x03;
    if version != 2 {
        bail!("Unsupported RTP version: {}", version);
    }

    let padding = (data[0] >> 5) & 0x01 != 0;
    let extension = (data[0] >> 4) & 0x01 != 0;
    let csrc_count = data[0] & 0x0F;
    let marker = (data[1] >> 7) & 0x01 != 0;
    let payload_type = data[1] & 0x7F;
    let sequence_number = u16::from_be_bytes([data[2], data[3]]);
    let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    let header_len = RTP_HEADER_SIZE + (csrc_count as usize) * 4;
    if data.len() < header_len {
        bail!(
            "RTP packet too short for {} CSRCs: {} bytes",
            csrc_count,
            data.len()
        );
    }

    let payload = data[header_len..].to_vec();

    Ok(RtpPacket {
        version,
        padding,
        extension,
        csrc_count,
        marker,
        payload_type,
        sequence_number,
        timestamp,
        ssrc,
        payload,
    })
}

/// Monotonic 16-bit RTP sequence counter, wrapping at 2^16, resettable on
/// explicit request (first packet of a new stream).
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: u16,
}

impl SequenceCounter {
    pub fn new() -> Self {
        SequenceCounter { next: 0 }
    }

    /// The sequence value for the next outbound packet. `reset` restarts
    /// the counter at zero before taking the value.
    pub fn next(&mut self, reset: bool) -> u16 {
        if reset {
            self.next = 0;
        }
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }
}
