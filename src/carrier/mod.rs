//! DFSI transport carriers: RTP-over-UDP and the framed serial link.
//!
//! Both carriers accept the same outbound item and deliver raw DFSI
//! payloads inbound; the voice path scheduler never sees the transport.

pub mod rtp;
pub mod serial;
pub mod udp;

/// One outbound DFSI payload handed to a carrier.
#[derive(Debug, Clone)]
pub struct TxPayload {
    pub data: Vec<u8>,
    /// Voice payloads are paced at the 20 ms IMBE cadence on serial.
    pub imbe: bool,
    /// Restart the RTP sequence counter at zero (first packet of a
    /// stream). Ignored by the serial carrier.
    pub reset_seq: bool,
}

/// Clonable transmit handle over whichever carrier is active.
#[derive(Debug, Clone)]
pub enum DfsiTx {
    Udp(udp::UdpTx),
    Serial(serial::SerialTx),
}

impl DfsiTx {
    pub fn send(&self, payload: TxPayload) {
        match self {
            DfsiTx::Udp(tx) => tx.send(payload),
            DfsiTx::Serial(tx) => tx.send_p25(payload),
        }
    }
}
