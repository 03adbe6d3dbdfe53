//! UDP DFSI carrier — binds the local RTP port, wraps outbound payloads in
//! an RTP header and validates/unwraps inbound packets from the master
//! endpoint.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::rtp;
use super::TxPayload;
use crate::codec::hex_dump;

/// Statistics for the voice conveyance channel.
#[derive(Debug, Default)]
pub struct UdpStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
}

/// Clonable handle used by the scheduler to transmit payloads.
#[derive(Debug, Clone)]
pub struct UdpTx {
    tx: mpsc::UnboundedSender<TxPayload>,
}

impl UdpTx {
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<TxPayload>) -> Self {
        UdpTx { tx }
    }

    pub fn send(&self, payload: TxPayload) {
        // Send fails only after the carrier stopped; drop silently then.
        let _ = self.tx.send(payload);
    }
}

/// A running UDP DFSI carrier.
pub struct UdpCarrier {
    socket: Arc<UdpSocket>,
    master: Arc<Mutex<SocketAddr>>,
    stats: Arc<Mutex<UdpStats>>,
    send_handle: Option<tokio::task::JoinHandle<()>>,
    recv_handle: Option<tokio::task::JoinHandle<()>>,
}

impl UdpCarrier {
    /// Bind the local RTP port and start the send/receive loops. Outbound
    /// items arrive on `tx_rx` (the sending side lives in a [`UdpTx`]);
    /// inbound DFSI payloads are delivered on `rx_out`.
    pub async fn start(
        local_port: u16,
        master: SocketAddr,
        ssrc: u32,
        raw_trace: bool,
        rx_out: mpsc::UnboundedSender<Vec<u8>>,
        tx_rx: mpsc::UnboundedReceiver<TxPayload>,
    ) -> Result<Self> {
        let bind_addr = format!("0.0.0.0:{}", local_port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind RTP socket on {}", bind_addr))?;
        tracing::info!(
            "DFSI carrier bound to {}, master: {}",
            socket.local_addr()?,
            master
        );

        let socket = Arc::new(socket);
        let master = Arc::new(Mutex::new(master));
        let stats = Arc::new(Mutex::new(UdpStats::default()));

        let send_handle = {
            let socket = socket.clone();
            let master = master.clone();
            let stats = stats.clone();
            tokio::spawn(send_loop(socket, master, ssrc, raw_trace, stats, tx_rx))
        };

        let recv_handle = {
            let socket = socket.clone();
            let master = master.clone();
            let stats = stats.clone();
            tokio::spawn(recv_loop(socket, master, raw_trace, stats, rx_out))
        };

        Ok(UdpCarrier {
            socket,
            master,
            stats,
            send_handle: Some(send_handle),
            recv_handle: Some(recv_handle),
        })
    }

    /// Retarget the master endpoint (voice-conveyance port learned from the
    /// FSC connect response).
    pub fn set_master(&self, addr: SocketAddr) {
        let mut master = self.master.lock().unwrap();
        if *master != addr {
            tracing::info!("DFSI master endpoint retargeted to {}", addr);
            *master = addr;
        }
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Stop the carrier. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(h) = self.send_handle.take() {
            h.abort();
            let _ = h.await;
        }
        if let Some(h) = self.recv_handle.take() {
            h.abort();
            let _ = h.await;
        }
        let stats = self.stats.lock().unwrap();
        tracing::info!(
            "DFSI carrier stopped. Sent: {}, received: {}, dropped: {}",
            stats.packets_sent,
            stats.packets_received,
            stats.packets_dropped
        );
    }
}

impl Drop for UdpCarrier {
    fn drop(&mut self) {
        if let Some(h) = self.send_handle.take() {
            h.abort();
        }
        if let Some(h) = self.recv_handle.take() {
            h.abort();
        }
    }
}

/// Send loop: wrap queued payloads in an RTP header and transmit to the
/// master endpoint.
async fn send_loop(
    socket: Arc<UdpSocket>,
    master: Arc<Mutex<SocketAddr>>,
    ssrc: u32,
    raw_trace: bool,
    stats: Arc<Mutex<UdpStats>>,
    mut tx_rx: mpsc::UnboundedReceiver<TxPayload>,
) {
    let mut seq = rtp::SequenceCounter::new();
    let mut timestamp: u32 = 0;

    while let Some(item) = tx_rx.recv().await {
        let packet = rtp::encode(
            rtp::PT_P25_DFSI,
            seq.next(item.reset_seq),
            timestamp,
            ssrc,
            &item.data,
        );
        timestamp = timestamp.wrapping_add(rtp::TIMESTAMP_INCREMENT);

        if raw_trace {
            tracing::debug!("DFSI send ({} bytes)\n{}", packet.len(), hex_dump(&packet));
        }

        let target = *master.lock().unwrap();
        match socket.send_to(&packet, target).await {
            Ok(_) => {
                stats.lock().unwrap().packets_sent += 1;
            }
            Err(e) => {
                tracing::warn!("RTP send failed: {:#}", e);
            }
        }
    }
}

/// Receive loop: validate origin and RTP framing, hand payloads upward.
async fn recv_loop(
    socket: Arc<UdpSocket>,
    master: Arc<Mutex<SocketAddr>>,
    raw_trace: bool,
    stats: Arc<Mutex<UdpStats>>,
    rx_out: mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut buf = [0u8; 2048];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let data = &buf[..len];
                let expected = *master.lock().unwrap();
                if from != expected {
                    tracing::warn!("Dropping packet from unexpected endpoint {}", from);
                    stats.lock().unwrap().packets_dropped += 1;
                    continue;
                }
                if len < rtp::RTP_HEADER_SIZE {
                    tracing::warn!("Dropping runt packet from {} ({} bytes)", from, len);
                    stats.lock().unwrap().packets_dropped += 1;
                    continue;
                }
                let pkt = match rtp::decode(data) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable RTP packet: {:#}", e);
                        stats.lock().unwrap().packets_dropped += 1;
                        continue;
                    }
                };
                if pkt.payload_type != rtp::PT_P25_DFSI {
                    tracing::warn!(
                        "Dropping RTP packet with payload type {} (expected {})",
                        pkt.payload_type,
                        rtp::PT_P25_DFSI
                    );
                    stats.lock().unwrap().packets_dropped += 1;
                    continue;
                }

                if raw_trace {
                    tracing::debug!("DFSI recv ({} bytes)\n{}", len, hex_dump(data));
                }
                stats.lock().unwrap().packets_received += 1;
                let _ = rx_out.send(pkt.payload);
            }
            Err(e) => {
                tracing::warn!("RTP recv error: {:#}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
