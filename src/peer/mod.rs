//! FNE peer adapter — the seam between the bridge and the FNE transport
//! library.
//!
//! The library is an opaque collaborator: it delivers validated P25 data
//! events through the callbacks below and accepts outbound P25 messages
//! keyed by a packet sequence and stream id. Peer registration, pings and
//! authentication live entirely on its side.

use anyhow::Result;
use tokio::sync::mpsc;

/// Size of the P25 message header exchanged with the FNE.
pub const P25_MSG_HDR_SIZE: usize = 24;

/// Outbound function/sub-function pair for protocol traffic.
pub const FUNC_PROTOCOL: u8 = 0x00;
/// P25 protocol sub-function.
pub const SUBFUNC_P25: u8 = 0x02;

// P25 data unit identifiers.
pub const DUID_HDU: u8 = 0x00;
pub const DUID_TDU: u8 = 0x03;
pub const DUID_LDU1: u8 = 0x05;
pub const DUID_TSDU: u8 = 0x07;
pub const DUID_LDU2: u8 = 0x0A;
pub const DUID_PDU: u8 = 0x0C;
pub const DUID_TDULC: u8 = 0x0F;

// Call types.
pub const CALL_TYPE_GROUP: u8 = 0x00;
pub const CALL_TYPE_PRIVATE: u8 = 0x01;

/// Clear-voice algorithm id.
pub const ALGO_UNENCRYPT: u8 = 0x80;

/// Outbound primitive exposed by the FNE library.
pub trait FnePeer: Send + Sync {
    fn send_master(
        &self,
        func: (u8, u8),
        payload: &[u8],
        pkt_seq: u16,
        stream_id: u32,
    ) -> Result<()>;
}

/// A validated P25 data event delivered by the FNE library. `data` holds
/// the 24-byte message header followed by the LDU payload.
#[derive(Debug, Clone)]
pub struct P25DataEvent {
    pub peer_id: u32,
    pub src_id: u32,
    pub dst_id: u32,
    pub call_type: u8,
    pub duid: u8,
    pub frame_type: u8,
    pub stream_id: u32,
    pub data: Vec<u8>,
}

/// The 24-byte P25 message header shared by both directions.
///
/// ```text
/// 0     1      2       3..5  6..8  9..12     13..19    20    21    22    23
/// +-----+------+-------+-----+-----+---------+---------+-----+-----+-----+-----+
/// | LCO | MFId | ctrl  | dst | src | peer id | reserved| LSD1| LSD2| DUID| len |
/// +-----+------+-------+-----+-----+---------+---------+-----+-----+-----+-----+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct P25MessageHeader {
    pub lco: u8,
    pub mfid: u8,
    /// Service options / control byte.
    pub control: u8,
    pub dst_id: u32,
    pub src_id: u32,
    pub peer_id: u32,
    pub lsd1: u8,
    pub lsd2: u8,
    pub duid: u8,
    pub frame_length: u8,
}

impl P25MessageHeader {
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < P25_MSG_HDR_SIZE {
            return None;
        }
        Some(P25MessageHeader {
            lco: data[0],
            mfid: data[1],
            control: data[2],
            dst_id: u32::from_be_bytes([0, data[3], data[4], data[5]]),
            src_id: u32::from_be_bytes([0, data[6], data[7], data[8]]),
            peer_id: u32::from_be_bytes([data[9], data[10], data[11], data[12]]),
            lsd1: data[20],
            lsd2: data[21],
            duid: data[22],
            frame_length: data[23],
        })
    }

    pub fn encode(&self) -> [u8; P25_MSG_HDR_SIZE] {
        let mut buf = [0u8; P25_MSG_HDR_SIZE];
        buf[0] = self.lco;
        buf[1] = self.mfid;
        buf[2] = self.control;
        buf[3..6].copy_from_slice(&self.dst_id.to_be_bytes()[1..]);
        buf[6..9].copy_from_slice(&self.src_id.to_be_bytes()[1..]);
        buf[9..13].copy_from_slice(&self.peer_id.to_be_bytes());
        buf[20] = self.lsd1;
        buf[21] = self.lsd2;
        buf[22] = self.duid;
        buf[23] = self.frame_length;
        buf
    }
}

/// Stand-in for the external FNE transport. The real peer library plugs
/// in here; until it is attached, outbound messages are counted and
/// dropped.
#[derive(Debug, Default)]
pub struct NullPeer {
    sent: std::sync::atomic::AtomicU64,
}

impl NullPeer {
    pub fn sent(&self) -> u64 {
        self.sent.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl FnePeer for NullPeer {
    fn send_master(
        &self,
        _func: (u8, u8),
        payload: &[u8],
        pkt_seq: u16,
        stream_id: u32,
    ) -> Result<()> {
        self.sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::trace!(
            "No FNE link; dropping {} byte message (seq {}, stream {:#010x})",
            payload.len(),
            pkt_seq,
            stream_id
        );
        Ok(())
    }
}

/// Thin adapter registered with the FNE library. Handlers run on the
/// library's thread and must stay cheap: events cross into the scheduler
/// task over a channel.
#[derive(Clone)]
pub struct PeerAdapter {
    events: mpsc::UnboundedSender<P25DataEvent>,
}

impl PeerAdapter {
    pub fn new(events: mpsc::UnboundedSender<P25DataEvent>) -> Self {
        PeerAdapter { events }
    }

    /// P25 pre-validation callback; the bridge accepts everything and
    /// filters in the scheduler.
    #[allow(clippy::too_many_arguments)]
    pub fn p25_data_validate(
        &self,
        _peer_id: u32,
        _src_id: u32,
        _dst_id: u32,
        _call_type: u8,
        _duid: u8,
        _frame_type: u8,
        _stream_id: u32,
        _raw: &[u8],
    ) -> bool {
        true
    }

    pub fn p25_data_received(&self, event: P25DataEvent) {
        let _ = self.events.send(event);
    }

    /// DMR traffic is accepted by validation and ignored.
    pub fn dmr_data_validate(&self) -> bool {
        true
    }

    pub fn dmr_data_received(&self) {
        tracing::trace!("Ignoring DMR data");
    }

    /// NXDN traffic is accepted by validation and ignored.
    pub fn nxdn_data_validate(&self) -> bool {
        true
    }

    pub fn nxdn_data_received(&self) {
        tracing::trace!("Ignoring NXDN data");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let hdr = P25MessageHeader {
            lco: 0x00,
            mfid: 0x90,
            control: 0x01,
            dst_id: 0x0001F4,
            src_id: 0x012345,
            peer_id: 9000100,
            lsd1: 0xAB,
            lsd2: 0xCD,
            duid: DUID_LDU1,
            frame_length: 216,
        };
        let enc = hdr.encode();
        assert_eq!(enc.len(), P25_MSG_HDR_SIZE);
        assert_eq!(P25MessageHeader::decode(&enc), Some(hdr));
    }

    #[test]
    fn test_header_decode_short() {
        assert_eq!(P25MessageHeader::decode(&[0u8; 10]), None);
    }

    #[test]
    fn test_adapter_forwards_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = PeerAdapter::new(tx);
        assert!(adapter.p25_data_validate(1, 2, 3, CALL_TYPE_GROUP, DUID_LDU1, 0, 4, &[]));
        adapter.p25_data_received(P25DataEvent {
            peer_id: 1,
            src_id: 2,
            dst_id: 3,
            call_type: CALL_TYPE_GROUP,
            duid: DUID_LDU1,
            frame_type: 0,
            stream_id: 4,
            data: vec![0; P25_MSG_HDR_SIZE],
        });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.stream_id, 4);
    }
}
