//! Supervisor — wires the configured components together and owns their
//! start/stop ordering.
//!
//! Modes:
//! - UDP DFSI: FSC control plus the RTP carrier. Unless connection
//!   establishment is disabled, the carrier comes up only after the remote
//!   answers CONNECT, targeted at its advertised voice-conveyance port.
//! - Serial DFSI: the serial carrier alone, no FSC.
//! - Serial/UDP: reserved.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::carrier::serial::SerialCarrier;
use crate::carrier::udp::{UdpCarrier, UdpTx};
use crate::carrier::{DfsiTx, TxPayload};
use crate::config::{Config, Mode};
use crate::control::{ControlEvent, ControlService};
use crate::peer::{FnePeer, P25DataEvent, PeerAdapter};
use crate::voice::scheduler::VoiceScheduler;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("bridge is already started")]
    AlreadyStarted,
    #[error("bridge cannot be restarted once stopped")]
    NotRestartable,
    #[error("{0} mode is not implemented")]
    ModeNotImplemented(&'static str),
}

struct Running {
    control: Option<ControlService>,
    udp_slot: Arc<Mutex<Option<UdpCarrier>>>,
    serial: Option<SerialCarrier>,
    events_task: Option<tokio::task::JoinHandle<()>>,
    scheduler: tokio::task::JoinHandle<()>,
}

/// Owns the bridge components for the configured mode.
pub struct Supervisor {
    config: Config,
    peer: Arc<dyn FnePeer>,
    fne_tx: mpsc::UnboundedSender<P25DataEvent>,
    fne_rx: Option<mpsc::UnboundedReceiver<P25DataEvent>>,
    running: Option<Running>,
}

impl Supervisor {
    pub fn new(config: Config, peer: Arc<dyn FnePeer>) -> Self {
        let (fne_tx, fne_rx) = mpsc::unbounded_channel();
        Supervisor {
            config,
            peer,
            fne_tx,
            fne_rx: Some(fne_rx),
            running: None,
        }
    }

    /// The adapter to register with the FNE library.
    pub fn adapter(&self) -> PeerAdapter {
        PeerAdapter::new(self.fne_tx.clone())
    }

    /// Start the components for the configured mode. Fails when already
    /// running.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(SupervisorError::AlreadyStarted.into());
        }
        let mode = self.config.mode()?;
        if mode == Mode::SerialUdp {
            return Err(SupervisorError::ModeNotImplemented("serial/UDP").into());
        }
        let fne_rx = self
            .fne_rx
            .take()
            .ok_or(SupervisorError::NotRestartable)?;

        let cfg = &self.config;
        let (dfsi_in_tx, dfsi_in_rx) = mpsc::unbounded_channel();

        let running = match mode {
            Mode::UdpDvm => {
                let (dfsi_out_tx, dfsi_out_rx) = mpsc::unbounded_channel::<TxPayload>();
                let scheduler = VoiceScheduler::new(
                    self.peer.clone(),
                    cfg.peer_id,
                    DfsiTx::Udp(UdpTx::from_sender(dfsi_out_tx)),
                    cfg.the_manufacturer,
                );
                let scheduler = tokio::spawn(scheduler.run(fne_rx, dfsi_in_rx));
                let udp_slot: Arc<Mutex<Option<UdpCarrier>>> = Arc::new(Mutex::new(None));

                let mut running = Running {
                    control: None,
                    udp_slot: udp_slot.clone(),
                    serial: None,
                    events_task: None,
                    scheduler,
                };

                if cfg.no_connection_establishment {
                    let master = resolve(&cfg.remote_dfsi_address, cfg.remote_rtp_port).await?;
                    let carrier = UdpCarrier::start(
                        cfg.local_rtp_port,
                        master,
                        cfg.peer_id,
                        cfg.raw_packet_trace,
                        dfsi_in_tx,
                        dfsi_out_rx,
                    )
                    .await?;
                    *udp_slot.lock().await = Some(carrier);
                } else {
                    let control_remote =
                        resolve(&cfg.remote_dfsi_address, cfg.remote_control_port).await?;
                    let (event_tx, event_rx) = mpsc::unbounded_channel();
                    running.control = Some(
                        ControlService::start(
                            cfg.local_control_port,
                            control_remote,
                            cfg.local_rtp_port,
                            cfg.peer_id,
                            cfg.dfsi_heartbeat,
                            event_tx,
                        )
                        .await?,
                    );
                    running.events_task = Some(tokio::spawn(control_event_loop(
                        event_rx,
                        udp_slot,
                        cfg.remote_dfsi_address.clone(),
                        cfg.local_rtp_port,
                        cfg.peer_id,
                        cfg.raw_packet_trace,
                        dfsi_in_tx,
                        dfsi_out_rx,
                    )));
                }
                running
            }

            Mode::SerialDvm => {
                let carrier = SerialCarrier::start(
                    &cfg.serial_port_name,
                    cfg.serial_baudrate,
                    cfg.serial_tx_jitter,
                    cfg.raw_packet_trace,
                    dfsi_in_tx,
                )?;
                let scheduler = VoiceScheduler::new(
                    self.peer.clone(),
                    cfg.peer_id,
                    DfsiTx::Serial(carrier.transmitter()),
                    cfg.the_manufacturer,
                );
                Running {
                    control: None,
                    udp_slot: Arc::new(Mutex::new(None)),
                    serial: Some(carrier),
                    events_task: None,
                    scheduler: tokio::spawn(scheduler.run(fne_rx, dfsi_in_rx)),
                }
            }

            Mode::SerialUdp => unreachable!(),
        };

        self.running = Some(running);
        tracing::info!("Bridge started");
        Ok(())
    }

    /// Stop everything in reverse start order. Idempotent.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        if let Some(h) = running.events_task.take() {
            h.abort();
            let _ = h.await;
        }
        if let Some(mut carrier) = running.udp_slot.lock().await.take() {
            carrier.stop().await;
        }
        if let Some(mut serial) = running.serial.take() {
            serial.stop();
        }
        if let Some(mut control) = running.control.take() {
            control.stop().await;
        }
        running.scheduler.abort();
        let _ = running.scheduler.await;
        tracing::info!("Bridge stopped");
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {}:{}", host, port))?
        .next()
        .with_context(|| format!("No address found for {}:{}", host, port))
}

/// React to FSC notifications: bring the RTP carrier up against the
/// advertised voice-conveyance port, retarget it on reconnects.
#[allow(clippy::too_many_arguments)]
async fn control_event_loop(
    mut event_rx: mpsc::UnboundedReceiver<ControlEvent>,
    udp_slot: Arc<Mutex<Option<UdpCarrier>>>,
    remote_host: String,
    local_rtp_port: u16,
    peer_id: u32,
    raw_trace: bool,
    dfsi_in_tx: mpsc::UnboundedSender<Vec<u8>>,
    dfsi_out_rx: mpsc::UnboundedReceiver<TxPayload>,
) {
    let mut pending = Some((dfsi_in_tx, dfsi_out_rx));
    while let Some(event) = event_rx.recv().await {
        match event {
            ControlEvent::Connected { vc_base_port } => {
                let master = match resolve(&remote_host, vc_base_port).await {
                    Ok(addr) => addr,
                    Err(e) => {
                        tracing::error!("Cannot target voice conveyance: {:#}", e);
                        continue;
                    }
                };
                let mut slot = udp_slot.lock().await;
                if let Some(carrier) = slot.as_ref() {
                    carrier.set_master(master);
                } else if let Some((in_tx, out_rx)) = pending.take() {
                    match UdpCarrier::start(
                        local_rtp_port,
                        master,
                        peer_id,
                        raw_trace,
                        in_tx,
                        out_rx,
                    )
                    .await
                    {
                        Ok(carrier) => *slot = Some(carrier),
                        Err(e) => tracing::error!("Failed to start DFSI carrier: {:#}", e),
                    }
                }
            }
            ControlEvent::Disconnected => {
                tracing::warn!("FSC link lost; voice conveyance continues best-effort");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockPeer {
        calls: StdMutex<Vec<Vec<u8>>>,
    }

    impl FnePeer for MockPeer {
        fn send_master(
            &self,
            _func: (u8, u8),
            payload: &[u8],
            _pkt_seq: u16,
            _stream_id: u32,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn udp_config(remote: SocketAddr) -> Config {
        Config {
            address: "fne.example.net".to_string(),
            peer_id: 9000100,
            mode: 1,
            no_connection_establishment: true,
            the_manufacturer: true,
            local_rtp_port: 0,
            remote_dfsi_address: remote.ip().to_string(),
            remote_rtp_port: remote.port(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_serial_udp_mode_fails() {
        let config = Config {
            mode: 3,
            ..Config::default()
        };
        let mut supervisor = Supervisor::new(config, Arc::new(MockPeer::default()));
        let err = supervisor.start().await.unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }

    #[tokio::test]
    async fn test_double_start_fails_and_stop_is_idempotent() {
        let remote = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = udp_config(remote.local_addr().unwrap());
        let mut supervisor = Supervisor::new(config, Arc::new(MockPeer::default()));

        supervisor.start().await.unwrap();
        let err = supervisor.start().await.unwrap_err();
        assert!(err.to_string().contains("already started"));

        supervisor.stop().await;
        supervisor.stop().await; // no-op
    }

    #[tokio::test]
    async fn test_fne_event_reaches_the_wire() {
        use crate::peer::{CALL_TYPE_GROUP, DUID_LDU1, P25MessageHeader};
        use crate::voice::ldu::{pack_records, LduBuffer, LduKind, LDU_LEN};

        let remote = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = udp_config(remote.local_addr().unwrap());
        let mut supervisor = Supervisor::new(config, Arc::new(MockPeer::default()));
        supervisor.start().await.unwrap();
        let adapter = supervisor.adapter();

        let hdr = P25MessageHeader {
            dst_id: 0x0001F4,
            src_id: 0x012345,
            duid: DUID_LDU1,
            frame_length: LDU_LEN as u8,
            ..P25MessageHeader::default()
        };
        let mut data = hdr.encode().to_vec();
        data.extend_from_slice(&pack_records(&LduBuffer::new(), LduKind::Ldu1, &[0; 9]));
        adapter.p25_data_received(P25DataEvent {
            peer_id: 9000100,
            src_id: 0x012345,
            dst_id: 0x0001F4,
            call_type: CALL_TYPE_GROUP,
            duid: DUID_LDU1,
            frame_type: 0,
            stream_id: 0x42,
            data,
        });

        // stream start (3 packets) plus nine voice frames, RTP-wrapped
        let mut buf = [0u8; 512];
        for i in 0..12u16 {
            let (len, _) = tokio::time::timeout(
                std::time::Duration::from_secs(2),
                remote.recv_from(&mut buf),
            )
            .await
            .unwrap()
            .unwrap();
            let pkt = crate::carrier::rtp::decode(&buf[..len]).unwrap();
            assert_eq!(pkt.ssrc, 9000100);
            assert_eq!(pkt.sequence_number, i);
        }

        supervisor.stop().await;
    }
}
