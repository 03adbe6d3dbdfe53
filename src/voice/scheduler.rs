//! Voice path scheduler — drives both conversions: unpacking FNE logical
//! data units into per-frame DFSI packets, and reassembling DFSI voice
//! streams into peer LDU1/LDU2 messages.
//!
//! All mutable call state lives here, confined to the scheduler task; the
//! carriers and the peer adapter talk to it over channels. The half-duplex
//! interlock drops inbound voice for one direction while the other owns
//! the air.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::carrier::{DfsiTx, TxPayload};
use crate::codec::{
    self, fec, mot, standard, FT_LDU1_VOICE1, FT_LDU2_VOICE10,
};
use crate::peer::{
    FnePeer, P25DataEvent, P25MessageHeader, ALGO_UNENCRYPT, CALL_TYPE_GROUP, DUID_LDU1,
    DUID_LDU2, DUID_TDU, DUID_TDULC, FUNC_PROTOCOL, P25_MSG_HDR_SIZE, SUBFUNC_P25,
};
use crate::voice::ldu::{self, LduBuffer, LduKind, LDU_LEN};
use crate::voice::RemoteCallData;

/// Default network access code for generated start-of-stream NIDs.
const DEFAULT_NAC: u16 = 0x293;

/// Random non-zero stream id for a new DFSI-originated call.
fn random_stream_id() -> u32 {
    let id = uuid::Uuid::new_v4();
    let bytes = id.as_bytes();
    let v = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if v == 0 {
        1
    } else {
        v
    }
}

pub struct VoiceScheduler {
    peer: Arc<dyn FnePeer>,
    peer_id: u32,
    dfsi_tx: DfsiTx,
    manufacturer: bool,

    // FNE -> DFSI stream state
    rx_stream_id: u32,
    rx_type: u8,
    rx_start: Instant,
    rx_frames: u64,
    call_in_progress: bool,
    superframe: u8,

    // DFSI -> FNE stream state
    remote_call_in_progress: bool,
    tx_stream_id: u32,
    p25_seq_no: u16,
    p25_n: u8,
    ldu1: LduBuffer,
    ldu2: LduBuffer,
    call_data: RemoteCallData,
    pending_vhdr: Option<Vec<u8>>,
    remote_start: Instant,
    remote_frames: u64,
}

impl VoiceScheduler {
    pub fn new(peer: Arc<dyn FnePeer>, peer_id: u32, dfsi_tx: DfsiTx, manufacturer: bool) -> Self {
        VoiceScheduler {
            peer,
            peer_id,
            dfsi_tx,
            manufacturer,
            rx_stream_id: 0,
            rx_type: DUID_TDU,
            rx_start: Instant::now(),
            rx_frames: 0,
            call_in_progress: false,
            superframe: 0,
            remote_call_in_progress: false,
            tx_stream_id: 0,
            p25_seq_no: 0,
            p25_n: 0,
            ldu1: LduBuffer::new(),
            ldu2: LduBuffer::new(),
            call_data: RemoteCallData::default(),
            pending_vhdr: None,
            remote_start: Instant::now(),
            remote_frames: 0,
        }
    }

    /// Drive the scheduler until both input channels close.
    pub async fn run(
        mut self,
        mut fne_rx: mpsc::UnboundedReceiver<P25DataEvent>,
        mut dfsi_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        tracing::info!(
            "Voice path scheduler started ({} framing)",
            if self.manufacturer {
                "manufacturer"
            } else {
                "standard"
            }
        );
        loop {
            tokio::select! {
                event = fne_rx.recv() => match event {
                    Some(event) => self.handle_fne_event(event),
                    None => break,
                },
                data = dfsi_rx.recv() => match data {
                    Some(data) => self.handle_dfsi_payload(&data),
                    None => break,
                },
            }
        }
        tracing::info!("Voice path scheduler stopped");
    }

    // ---- FNE -> DFSI ----

    pub fn handle_fne_event(&mut self, event: P25DataEvent) {
        match event.duid {
            DUID_LDU1 | DUID_LDU2 | DUID_TDU | DUID_TDULC => {}
            other => {
                tracing::trace!("Ignoring P25 DUID {:#04x}", other);
                return;
            }
        }
        if event.call_type != CALL_TYPE_GROUP {
            tracing::warn!(
                "Rejecting private call {} -> {}",
                event.src_id,
                event.dst_id
            );
            return;
        }
        if self.remote_call_in_progress {
            tracing::trace!("Dropping FNE voice while a remote call is in progress");
            return;
        }

        if event.duid == DUID_TDU || event.duid == DUID_TDULC {
            if !self.rx_terminated() {
                self.emit_stream_end();
                tracing::info!(
                    "Call end: {} -> TG {} ({} frames, {:.1}s)",
                    event.src_id,
                    event.dst_id,
                    self.rx_frames,
                    self.rx_start.elapsed().as_secs_f64()
                );
                self.call_in_progress = false;
            }
            self.rx_type = event.duid;
            return;
        }

        let Some(hdr) = P25MessageHeader::decode(&event.data) else {
            tracing::error!("Dropping short P25 message ({} bytes)", event.data.len());
            return;
        };
        let payload = &event.data[P25_MSG_HDR_SIZE..];

        if event.stream_id != self.rx_stream_id {
            self.rx_stream_id = event.stream_id;
            self.rx_start = Instant::now();
            self.rx_frames = 0;
            self.superframe = 0;
            self.call_in_progress = true;
            tracing::info!(
                "Call start: {} -> TG {} (stream {:#010x})",
                event.src_id,
                event.dst_id,
                event.stream_id
            );
            self.emit_stream_start(&hdr, event.dst_id);
        }
        self.rx_type = event.duid;

        match ldu::detect_kind(payload) {
            Some(LduKind::Ldu1) => {
                let unpacked = ldu::unpack(payload);
                self.rx_frames += 9;
                self.emit_ldu1(&hdr, event.dst_id, event.src_id, &unpacked);
            }
            Some(LduKind::Ldu2) => {
                let unpacked = ldu::unpack(payload);
                self.rx_frames += 9;
                self.emit_ldu2(&hdr, &unpacked);
                self.superframe = self.superframe.wrapping_add(1);
            }
            None => {
                tracing::error!(
                    "Dropping LDU payload with bad record tags (DUID {:#04x})",
                    event.duid
                );
            }
        }
    }

    fn rx_terminated(&self) -> bool {
        self.rx_type == DUID_TDU || self.rx_type == DUID_TDULC
    }

    fn send_dfsi(&self, data: Vec<u8>, imbe: bool, reset_seq: bool) {
        self.dfsi_tx.send(TxPayload {
            data,
            imbe,
            reset_seq,
        });
    }

    fn emit_stream_start(&mut self, hdr: &P25MessageHeader, dst_id: u32) {
        let header_data = mot::VoiceHeaderData {
            mi: [0; 9],
            mfid: hdr.mfid,
            algo_id: ALGO_UNENCRYPT,
            key_id: 0,
            talkgroup: dst_id as u16,
        };

        if self.manufacturer {
            let (hcw1, hcw2) = header_data.to_hcws();
            self.send_dfsi(mot::StartOfStream::start().encode().to_vec(), false, true);
            self.send_dfsi(mot::VoiceHeader1::new(hcw1).encode().to_vec(), false, false);
            self.send_dfsi(
                mot::VoiceHeader2 {
                    hcw: hcw2,
                    source: 0,
                }
                .encode()
                .to_vec(),
                false,
                false,
            );
        } else {
            let sos = standard::StartOfStream {
                nid: DEFAULT_NAC << 4,
                error_count: 0,
            };
            self.send_dfsi(
                standard::Payload::new(vec![standard::Block::StartOfStream(sos)]).encode(),
                false,
                true,
            );
            let expanded = header_data.expand();
            let p1: [u8; 18] = expanded[..18].try_into().unwrap();
            let p2: [u8; 18] = expanded[18..].try_into().unwrap();
            self.send_dfsi(
                standard::Payload::new(vec![standard::Block::VoiceHeaderP1(p1)]).encode(),
                false,
                false,
            );
            self.send_dfsi(
                standard::Payload::new(vec![standard::Block::VoiceHeaderP2(p2)]).encode(),
                false,
                false,
            );
        }
    }

    fn emit_stream_end(&mut self) {
        if self.manufacturer {
            self.send_dfsi(mot::StartOfStream::stop().encode().to_vec(), false, false);
        } else {
            self.send_dfsi(
                standard::Payload::new(vec![standard::Block::EndOfStream]).encode(),
                false,
                false,
            );
        }
    }

    fn emit_ldu1(
        &mut self,
        hdr: &P25MessageHeader,
        dst_id: u32,
        src_id: u32,
        unpacked: &ldu::UnpackedLdu,
    ) {
        let dst = dst_id.to_be_bytes();
        let src = src_id.to_be_bytes();
        let lc = [
            hdr.lco, hdr.mfid, hdr.control, dst[1], dst[2], dst[3], src[1], src[2], src[3],
        ];
        let parity = rs_parity_24_12(&lc);
        let lsd = [hdr.lsd1, hdr.lsd2];

        for n in 0..9usize {
            let frame_type = FT_LDU1_VOICE1 + n as u8;
            let additional: &[u8] = match n + 1 {
                3 => &lc[0..3],
                4 => &lc[3..6],
                5 => &lc[6..9],
                6 => &parity[0..3],
                7 => &parity[3..6],
                8 => &parity[6..9],
                9 => &lsd,
                _ => &[],
            };
            self.emit_voice_frame(frame_type, &unpacked.imbe[n], additional);
        }
    }

    fn emit_ldu2(&mut self, hdr: &P25MessageHeader, unpacked: &ldu::UnpackedLdu) {
        // MI, algorithm and key id ride in the incoming record sideband.
        let mut es = [0u8; 12];
        es[0..3].copy_from_slice(&unpacked.triplets[0]);
        es[3..6].copy_from_slice(&unpacked.triplets[1]);
        es[6..9].copy_from_slice(&unpacked.triplets[2]);
        es[9..12].copy_from_slice(&unpacked.triplets[3]);
        let parity = rs_parity_24_16(&es);
        let lsd = [hdr.lsd1, hdr.lsd2];

        for n in 0..9usize {
            let frame_type = FT_LDU2_VOICE10 + n as u8;
            let additional: &[u8] = match n + 1 {
                3 => &es[0..3],
                4 => &es[3..6],
                5 => &es[6..9],
                6 => &es[9..12],
                7 => &parity[0..3],
                8 => &parity[3..6],
                9 => &lsd,
                _ => &[],
            };
            self.emit_voice_frame(frame_type, &unpacked.imbe[n], additional);
        }
    }

    fn emit_voice_frame(&mut self, frame_type: u8, imbe: &[u8; codec::IMBE_LEN], additional: &[u8]) {
        let data = if self.manufacturer {
            let mut frv = mot::FullRateVoice::new(frame_type);
            frv.imbe = *imbe;
            frv.additional_data = additional.to_vec();
            frv.encode()
        } else {
            let mut frv = standard::FullRateVoice::new(frame_type);
            frv.imbe = *imbe;
            frv.additional_data = additional.to_vec();
            frv.superframe_counter = self.superframe & 0x03;
            standard::Payload::new(vec![standard::Block::FullRateVoice(frv)]).encode()
        };
        self.send_dfsi(data, true, false);
    }

    // ---- DFSI -> FNE ----

    pub fn handle_dfsi_payload(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.call_in_progress {
            tracing::trace!("Dropping DFSI voice while an FNE call is in progress");
            return;
        }
        if self.manufacturer {
            self.handle_mot_payload(data);
        } else {
            self.handle_standard_payload(data);
        }
    }

    fn handle_mot_payload(&mut self, data: &[u8]) {
        match data[0] {
            codec::FT_MOT_START_STOP => match mot::StartOfStream::decode(data) {
                Ok(sos) if sos.start_stop == mot::START_STREAM => self.begin_remote_call(),
                Ok(sos) if sos.start_stop == mot::STOP_STREAM => self.end_remote_call(),
                Ok(sos) => {
                    tracing::error!("Unknown start/stop discriminator {:#04x}", sos.start_stop)
                }
                Err(e) => tracing::error!("Dropping bad start-of-stream: {}", e),
            },
            codec::FT_MOT_VHDR_1 => match mot::VoiceHeader1::decode(data) {
                Ok(vhdr) => self.pending_vhdr = Some(vhdr.hcw.to_vec()),
                Err(e) => tracing::error!("Dropping bad voice header 1: {}", e),
            },
            codec::FT_MOT_VHDR_2 => match mot::VoiceHeader2::decode(data) {
                Ok(vhdr) => {
                    if let Some(hcw1) = self.pending_vhdr.take() {
                        let hcw1: [u8; mot::HCW_LEN] = hcw1.try_into().unwrap();
                        let header = mot::VoiceHeaderData::from_hcws(&hcw1, &vhdr.hcw);
                        self.apply_voice_header(header);
                    } else {
                        tracing::warn!("Voice header 2 without a preceding part 1");
                    }
                }
                Err(e) => tracing::error!("Dropping bad voice header 2: {}", e),
            },
            ft if codec::is_voice_frame(ft) => match mot::FullRateVoice::decode(data) {
                Ok(frv) => self.accumulate(frv.frame_type, &frv.imbe, &frv.additional_data),
                Err(e) => tracing::error!("Dropping bad voice frame: {}", e),
            },
            other => tracing::error!("Dropping DFSI frame with unknown opcode {:#04x}", other),
        }
    }

    fn handle_standard_payload(&mut self, data: &[u8]) {
        let payload = match standard::Payload::decode(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Dropping bad DFSI payload: {}", e);
                return;
            }
        };
        for block in payload.blocks {
            match block {
                standard::Block::StartOfStream(_) => self.begin_remote_call(),
                standard::Block::EndOfStream => self.end_remote_call(),
                standard::Block::VoiceHeaderP1(half) => self.pending_vhdr = Some(half.to_vec()),
                standard::Block::VoiceHeaderP2(half) => {
                    if let Some(first) = self.pending_vhdr.take() {
                        let mut expanded = [0u8; mot::VHDR_HEXBITS];
                        expanded[..18].copy_from_slice(&first);
                        expanded[18..].copy_from_slice(&half);
                        let header = mot::VoiceHeaderData::from_hexbits(&expanded);
                        self.apply_voice_header(header);
                    } else {
                        tracing::warn!("Voice header part 2 without a preceding part 1");
                    }
                }
                standard::Block::FullRateVoice(frv) => {
                    self.accumulate(frv.frame_type, &frv.imbe, &frv.additional_data)
                }
            }
        }
    }

    fn apply_voice_header(&mut self, header: mot::VoiceHeaderData) {
        tracing::debug!(
            "Voice header: TG {} algo {:#04x} kid {:#06x}",
            header.talkgroup,
            header.algo_id,
            header.key_id
        );
        self.call_data.message_indicator = header.mi;
        self.call_data.mfid = header.mfid;
        self.call_data.algorithm_id = header.algo_id;
        self.call_data.key_id = header.key_id;
        self.call_data.dst_id = header.talkgroup as u32;
    }

    fn begin_remote_call(&mut self) {
        if self.remote_call_in_progress {
            return;
        }
        self.remote_call_in_progress = true;
        self.tx_stream_id = 0;
        self.p25_seq_no = 0;
        self.p25_n = 0;
        self.ldu1.reset();
        self.ldu2.reset();
        self.call_data.reset();
        self.pending_vhdr = None;
        self.remote_start = Instant::now();
        self.remote_frames = 0;
        tracing::info!("Remote call start");
    }

    fn end_remote_call(&mut self) {
        if !self.remote_call_in_progress {
            return;
        }
        self.send_terminator();
        tracing::info!(
            "Remote call end: {} -> TG {} ({} frames, {:.1}s)",
            self.call_data.src_id,
            self.call_data.dst_id,
            self.remote_frames,
            self.remote_start.elapsed().as_secs_f64()
        );
        self.remote_call_in_progress = false;
        self.tx_stream_id = 0;
        self.p25_n = 0;
    }

    fn accumulate(&mut self, frame_type: u8, imbe: &[u8; codec::IMBE_LEN], additional: &[u8]) {
        let Some(position) = codec::frame_position(frame_type) else {
            return;
        };
        if !self.remote_call_in_progress {
            // stream start was lost; open the call on first voice
            self.begin_remote_call();
        }
        if self.tx_stream_id == 0 {
            self.tx_stream_id = random_stream_id();
            tracing::debug!("Remote stream id {:#010x}", self.tx_stream_id);
        }
        self.remote_frames += 1;

        let is_ldu1 = codec::is_ldu1_frame(frame_type);
        if is_ldu1 {
            self.ldu1.set_imbe(position - 1, imbe);
            self.p25_n = position as u8 - 1;
        } else {
            self.ldu2.set_imbe(position - 1, imbe);
            self.p25_n = 9 + position as u8 - 1;
        }

        let triplet: Option<[u8; 3]> = (additional.len() >= 3)
            .then(|| additional[..3].try_into().unwrap());

        match (is_ldu1, position) {
            (true, 3) => {
                if let Some(t) = triplet {
                    self.call_data.lco = t[0];
                    self.call_data.mfid = t[1];
                    self.call_data.service_options = t[2];
                    self.ldu1.set_triplet(0, t);
                }
            }
            (true, 4) => {
                if let Some(t) = triplet {
                    self.call_data.dst_id = u32::from_be_bytes([0, t[0], t[1], t[2]]);
                    self.ldu1.set_triplet(1, t);
                }
            }
            (true, 5) => {
                if let Some(t) = triplet {
                    self.call_data.src_id = u32::from_be_bytes([0, t[0], t[1], t[2]]);
                    self.ldu1.set_triplet(2, t);
                }
            }
            (true, 6) => {
                // received link-control parity; kept only for reference
                if let Some(t) = triplet {
                    self.ldu1.set_triplet(3, t);
                }
            }
            (false, 3) => {
                if let Some(t) = triplet {
                    self.call_data.message_indicator[0..3].copy_from_slice(&t);
                    self.ldu2.set_triplet(0, t);
                }
            }
            (false, 4) => {
                if let Some(t) = triplet {
                    self.call_data.message_indicator[3..6].copy_from_slice(&t);
                    self.ldu2.set_triplet(1, t);
                }
            }
            (false, 5) => {
                if let Some(t) = triplet {
                    self.call_data.message_indicator[6..9].copy_from_slice(&t);
                    self.ldu2.set_triplet(2, t);
                }
            }
            (false, 6) => {
                if let Some(t) = triplet {
                    self.call_data.algorithm_id = t[0];
                    self.call_data.key_id = u16::from_be_bytes([t[1], t[2]]);
                    self.ldu2.set_triplet(3, t);
                }
            }
            (_, 9) => {
                if additional.len() >= 2 {
                    self.call_data.lsd1 = additional[0];
                    self.call_data.lsd2 = additional[1];
                    if is_ldu1 {
                        self.ldu1.set_lsd(additional[0], additional[1]);
                    } else {
                        self.ldu2.set_lsd(additional[0], additional[1]);
                    }
                }
            }
            _ => {}
        }

        if position == 9 {
            if is_ldu1 {
                self.emit_peer_ldu(LduKind::Ldu1);
            } else {
                self.emit_peer_ldu(LduKind::Ldu2);
            }
        }
    }

    fn emit_peer_ldu(&mut self, kind: LduKind) {
        tracing::trace!("LDU complete at voice block {}", self.p25_n);
        let cd = &self.call_data;
        let (packed, duid) = match kind {
            LduKind::Ldu1 => {
                let dst = cd.dst_id.to_be_bytes();
                let src = cd.src_id.to_be_bytes();
                let lc = [
                    cd.lco,
                    cd.mfid,
                    cd.service_options,
                    dst[1],
                    dst[2],
                    dst[3],
                    src[1],
                    src[2],
                    src[3],
                ];
                let parity = rs_parity_24_12(&lc);
                (ldu::pack_records(&self.ldu1, kind, &parity), DUID_LDU1)
            }
            LduKind::Ldu2 => {
                let mut es = [0u8; 12];
                es[0..9].copy_from_slice(&cd.message_indicator);
                es[9] = cd.algorithm_id;
                es[10..12].copy_from_slice(&cd.key_id.to_be_bytes());
                let parity = rs_parity_24_16(&es);
                (ldu::pack_records(&self.ldu2, kind, &parity), DUID_LDU2)
            }
        };

        let hdr = P25MessageHeader {
            lco: cd.lco,
            mfid: cd.mfid,
            control: cd.service_options,
            dst_id: cd.dst_id,
            src_id: cd.src_id,
            peer_id: self.peer_id,
            lsd1: cd.lsd1,
            lsd2: cd.lsd2,
            duid,
            frame_length: LDU_LEN as u8,
        };

        let mut message = Vec::with_capacity(P25_MSG_HDR_SIZE + LDU_LEN);
        message.extend_from_slice(&hdr.encode());
        message.extend_from_slice(&packed);
        self.send_peer(&message);
    }

    fn send_terminator(&mut self) {
        let cd = &self.call_data;
        let hdr = P25MessageHeader {
            lco: cd.lco,
            mfid: cd.mfid,
            control: cd.service_options,
            dst_id: cd.dst_id,
            src_id: cd.src_id,
            peer_id: self.peer_id,
            lsd1: cd.lsd1,
            lsd2: cd.lsd2,
            duid: DUID_TDU,
            frame_length: 0,
        };
        let message = hdr.encode().to_vec();
        self.send_peer(&message);
    }

    fn send_peer(&mut self, message: &[u8]) {
        let pkt_seq = self.p25_seq_no;
        if let Err(e) = self.peer.send_master(
            (FUNC_PROTOCOL, SUBFUNC_P25),
            message,
            pkt_seq,
            self.tx_stream_id,
        ) {
            tracing::error!("Peer send failed: {:#}", e);
            return;
        }
        self.p25_seq_no = self.p25_seq_no.wrapping_add(1);
    }
}

fn rs_parity_24_12(lc: &[u8; 9]) -> [u8; 9] {
    let hexbits: [u8; 12] = codec::bytes_to_hexbits(lc, 12).try_into().unwrap();
    codec::hexbits_to_bytes(&fec::encode_24_12(&hexbits))
        .try_into()
        .unwrap()
}

fn rs_parity_24_16(es: &[u8; 12]) -> [u8; 6] {
    let hexbits: [u8; 16] = codec::bytes_to_hexbits(es, 16).try_into().unwrap();
    codec::hexbits_to_bytes(&fec::encode_24_16(&hexbits))
        .try_into()
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::udp::UdpTx;
    use crate::codec::IMBE_LEN;
    use anyhow::Result;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockPeer {
        calls: Mutex<Vec<(u16, u32, Vec<u8>)>>,
    }

    impl FnePeer for MockPeer {
        fn send_master(
            &self,
            func: (u8, u8),
            payload: &[u8],
            pkt_seq: u16,
            stream_id: u32,
        ) -> Result<()> {
            assert_eq!(func, (FUNC_PROTOCOL, SUBFUNC_P25));
            self.calls
                .lock()
                .unwrap()
                .push((pkt_seq, stream_id, payload.to_vec()));
            Ok(())
        }
    }

    fn test_scheduler(
        manufacturer: bool,
    ) -> (
        VoiceScheduler,
        mpsc::UnboundedReceiver<TxPayload>,
        Arc<MockPeer>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(MockPeer::default());
        let scheduler = VoiceScheduler::new(
            peer.clone(),
            9000100,
            DfsiTx::Udp(UdpTx::from_sender(tx)),
            manufacturer,
        );
        (scheduler, rx, peer)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TxPayload>) -> Vec<TxPayload> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    /// An FNE LDU1 event with every codeword set to `[0x11..0xBB]`.
    fn ldu1_event(stream_id: u32, call_type: u8) -> P25DataEvent {
        let imbe: [u8; IMBE_LEN] = [
            0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB,
        ];
        let mut buf = LduBuffer::new();
        for n in 0..9 {
            buf.set_imbe(n, &imbe);
        }
        buf.set_triplet(0, [0x00, 0x00, 0x00]);
        buf.set_triplet(1, [0x00, 0x01, 0xF4]);
        buf.set_triplet(2, [0x01, 0x23, 0x45]);
        buf.set_lsd(0xAB, 0xCD);
        let lc = [0x00, 0x00, 0x00, 0x00, 0x01, 0xF4, 0x01, 0x23, 0x45];
        let packed = ldu::pack_records(&buf, LduKind::Ldu1, &rs_parity_24_12(&lc));

        let hdr = P25MessageHeader {
            lco: 0,
            mfid: 0,
            control: 0,
            dst_id: 0x0001F4,
            src_id: 0x012345,
            peer_id: 9000100,
            lsd1: 0xAB,
            lsd2: 0xCD,
            duid: DUID_LDU1,
            frame_length: LDU_LEN as u8,
        };
        let mut data = hdr.encode().to_vec();
        data.extend_from_slice(&packed);

        P25DataEvent {
            peer_id: 9000100,
            src_id: 0x012345,
            dst_id: 0x0001F4,
            call_type,
            duid: DUID_LDU1,
            frame_type: 0,
            stream_id,
            data,
        }
    }

    fn standard_frv_payload(frame_type: u8, imbe: [u8; IMBE_LEN], additional: &[u8]) -> Vec<u8> {
        let mut frv = standard::FullRateVoice::new(frame_type);
        frv.imbe = imbe;
        frv.additional_data = additional.to_vec();
        standard::Payload::new(vec![standard::Block::FullRateVoice(frv)]).encode()
    }

    fn standard_sos_payload() -> Vec<u8> {
        standard::Payload::new(vec![standard::Block::StartOfStream(
            standard::StartOfStream::default(),
        )])
        .encode()
    }

    #[test]
    fn test_fne_ldu1_emission_manufacturer() {
        let (mut scheduler, mut rx, _peer) = test_scheduler(true);
        scheduler.handle_fne_event(ldu1_event(0x42, CALL_TYPE_GROUP));

        let out = drain(&mut rx);
        assert_eq!(out.len(), 12);

        // stream start: SOS, VHDR1, VHDR2
        assert_eq!(out[0].data.len(), 10);
        assert_eq!(out[0].data[3], mot::START_STREAM);
        assert!(out[0].reset_seq);
        assert_eq!(out[1].data.len(), 30);
        assert_eq!(out[1].data[0], codec::FT_MOT_VHDR_1);
        assert_eq!(out[2].data.len(), 22);
        assert_eq!(out[2].data[0], codec::FT_MOT_VHDR_2);

        // nine voice frames
        let imbe: [u8; IMBE_LEN] = [
            0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB,
        ];
        let lengths = [22, 13, 17, 17, 17, 17, 17, 17, 16];
        let imbe_offsets = [10, 1, 5, 5, 5, 5, 5, 5, 4];
        for n in 0..9 {
            let frame = &out[3 + n];
            assert!(frame.imbe);
            assert_eq!(frame.data.len(), lengths[n], "frame {}", n + 1);
            assert_eq!(frame.data[0], FT_LDU1_VOICE1 + n as u8);
            let at = imbe_offsets[n];
            assert_eq!(&frame.data[at..at + IMBE_LEN], &imbe, "frame {}", n + 1);
        }

        // VC4 carries the talkgroup, VC5 the source
        assert_eq!(&out[6].data[1..4], &[0x00, 0x01, 0xF4]);
        assert_eq!(&out[7].data[1..4], &[0x01, 0x23, 0x45]);
        // VC9 carries the low-speed data
        assert_eq!(&out[11].data[1..3], &[0xAB, 0xCD]);
    }

    #[test]
    fn test_private_call_rejected() {
        let (mut scheduler, mut rx, _peer) = test_scheduler(true);
        scheduler.handle_fne_event(ldu1_event(0x42, crate::peer::CALL_TYPE_PRIVATE));
        assert!(drain(&mut rx).is_empty());
        assert!(!scheduler.call_in_progress);
    }

    #[test]
    fn test_terminator_emits_end_of_stream_once() {
        let (mut scheduler, mut rx, _peer) = test_scheduler(true);
        scheduler.handle_fne_event(ldu1_event(0x42, CALL_TYPE_GROUP));
        drain(&mut rx);

        let mut tdu = ldu1_event(0x42, CALL_TYPE_GROUP);
        tdu.duid = DUID_TDU;
        scheduler.handle_fne_event(tdu.clone());
        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data[3], mot::STOP_STREAM);
        assert!(!scheduler.call_in_progress);

        // a second terminator is a no-op
        scheduler.handle_fne_event(tdu);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_dfsi_ldu1_reassembly_standard() {
        let (mut scheduler, _rx, peer) = test_scheduler(false);

        scheduler.handle_dfsi_payload(&standard_sos_payload());
        for n in 0..9u8 {
            let additional: Vec<u8> = match n + 1 {
                3 => vec![0x00, 0x00, 0x00],
                4 => vec![0x00, 0x01, 0xF4],
                5 => vec![0x01, 0x23, 0x45],
                6..=8 => vec![0x00, 0x00, 0x00],
                9 => vec![0xAB, 0xCD],
                _ => Vec::new(),
            };
            scheduler.handle_dfsi_payload(&standard_frv_payload(
                FT_LDU1_VOICE1 + n,
                [n + 1; IMBE_LEN],
                &additional,
            ));
        }

        let calls = peer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (pkt_seq, stream_id, ref payload) = calls[0];
        assert_eq!(pkt_seq, 0);
        assert_ne!(stream_id, 0);
        assert_eq!(payload.len(), P25_MSG_HDR_SIZE + LDU_LEN);

        let hdr = P25MessageHeader::decode(payload).unwrap();
        assert_eq!(hdr.duid, DUID_LDU1);
        assert_eq!(hdr.dst_id, 0x0001F4);
        assert_eq!(hdr.src_id, 0x012345);
        assert_eq!(hdr.peer_id, 9000100);

        let packed = &payload[P25_MSG_HDR_SIZE..];
        assert_eq!(ldu::detect_kind(packed), Some(LduKind::Ldu1));
        let unpacked = ldu::unpack(packed);
        for n in 0..9 {
            assert_eq!(unpacked.imbe[n], [n as u8 + 1; IMBE_LEN]);
        }
        assert_eq!(unpacked.lsd, [0xAB, 0xCD]);
    }

    #[test]
    fn test_dfsi_ldu2_reassembly_standard() {
        let (mut scheduler, _rx, peer) = test_scheduler(false);

        scheduler.handle_dfsi_payload(&standard_sos_payload());
        for n in 0..9u8 {
            scheduler.handle_dfsi_payload(&standard_frv_payload(
                FT_LDU1_VOICE1 + n,
                [0x10 | n; IMBE_LEN],
                &[0x00, 0x00, 0x00],
            ));
        }
        for n in 0..9u8 {
            let additional: Vec<u8> = match n + 1 {
                3 => vec![1, 2, 3],
                4 => vec![4, 5, 6],
                5 => vec![7, 8, 9],
                6 => vec![0x80, 0x12, 0x34],
                7 | 8 => vec![0x00, 0x00, 0x00],
                9 => vec![0x55, 0x66],
                _ => Vec::new(),
            };
            scheduler.handle_dfsi_payload(&standard_frv_payload(
                FT_LDU2_VOICE10 + n,
                [0x20 | n; IMBE_LEN],
                &additional,
            ));
        }

        let calls = peer.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let (pkt_seq, stream_id, ref payload) = calls[1];
        assert_eq!(pkt_seq, 1);
        assert_eq!(stream_id, calls[0].1);

        let hdr = P25MessageHeader::decode(payload).unwrap();
        assert_eq!(hdr.duid, DUID_LDU2);

        let packed = &payload[P25_MSG_HDR_SIZE..];
        assert_eq!(ldu::detect_kind(packed), Some(LduKind::Ldu2));
        let unpacked = ldu::unpack(packed);
        assert_eq!(unpacked.triplets[0], [1, 2, 3]);
        assert_eq!(unpacked.triplets[3], [0x80, 0x12, 0x34]);
        // recomputed encryption-sync parity, pinned from the reference
        assert_eq!(unpacked.triplets[4], [0xE4, 0x79, 0x0E]);
        assert_eq!(unpacked.triplets[5], [0x1C, 0xEC, 0xEE]);
        assert_eq!(unpacked.lsd, [0x55, 0x66]);
    }

    #[test]
    fn test_half_duplex_interlock_drops_dfsi() {
        let (mut scheduler, mut rx, peer) = test_scheduler(false);
        scheduler.call_in_progress = true;

        scheduler.handle_dfsi_payload(&standard_sos_payload());
        scheduler.handle_dfsi_payload(&standard_frv_payload(
            FT_LDU1_VOICE1,
            [0xFF; IMBE_LEN],
            &[],
        ));

        assert!(peer.calls.lock().unwrap().is_empty());
        assert!(drain(&mut rx).is_empty());
        assert!(!scheduler.remote_call_in_progress);
        assert_eq!(scheduler.ldu1.imbe(0), [0x00; IMBE_LEN]);
    }

    #[test]
    fn test_half_duplex_interlock_drops_fne() {
        let (mut scheduler, mut rx, _peer) = test_scheduler(true);
        scheduler.remote_call_in_progress = true;
        scheduler.handle_fne_event(ldu1_event(0x42, CALL_TYPE_GROUP));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_mot_stop_sends_terminator() {
        let (mut scheduler, _rx, peer) = test_scheduler(true);

        scheduler.handle_dfsi_payload(&mot::StartOfStream::start().encode());
        let mut frv = mot::FullRateVoice::new(FT_LDU1_VOICE1);
        frv.imbe = [0x01; IMBE_LEN];
        scheduler.handle_dfsi_payload(&frv.encode());
        assert!(scheduler.remote_call_in_progress);
        assert_ne!(scheduler.tx_stream_id, 0);

        scheduler.handle_dfsi_payload(&mot::StartOfStream::stop().encode());
        assert!(!scheduler.remote_call_in_progress);
        assert_eq!(scheduler.tx_stream_id, 0);

        let calls = peer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let hdr = P25MessageHeader::decode(&calls[0].2).unwrap();
        assert_eq!(hdr.duid, DUID_TDU);
        assert_eq!(calls[0].2.len(), P25_MSG_HDR_SIZE);
    }

    #[test]
    fn test_mot_voice_header_populates_call_data() {
        let (mut scheduler, _rx, _peer) = test_scheduler(true);
        scheduler.handle_dfsi_payload(&mot::StartOfStream::start().encode());

        let header = mot::VoiceHeaderData {
            mi: [1, 2, 3, 4, 5, 6, 7, 8, 9],
            mfid: 0x90,
            algo_id: 0xAA,
            key_id: 0x1234,
            talkgroup: 0x01F4,
        };
        let (hcw1, hcw2) = header.to_hcws();
        scheduler.handle_dfsi_payload(&mot::VoiceHeader1::new(hcw1).encode());
        scheduler.handle_dfsi_payload(
            &mot::VoiceHeader2 {
                hcw: hcw2,
                source: 0,
            }
            .encode(),
        );

        assert_eq!(scheduler.call_data.algorithm_id, 0xAA);
        assert_eq!(scheduler.call_data.key_id, 0x1234);
        assert_eq!(scheduler.call_data.dst_id, 0x01F4);
        assert_eq!(scheduler.call_data.message_indicator, [1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    /// Full loop: an FNE LDU1 unpacked to manufacturer frames and fed back
    /// through a second scheduler reproduces the original packed LDU.
    #[test]
    fn test_ldu1_roundtrip_through_dfsi() {
        let (mut fne_side, mut rx, _peer) = test_scheduler(true);
        let event = ldu1_event(0x42, CALL_TYPE_GROUP);
        let original = event.data[P25_MSG_HDR_SIZE..].to_vec();
        fne_side.handle_fne_event(event);
        let frames = drain(&mut rx);

        let (mut dfsi_side, _rx2, peer2) = test_scheduler(true);
        for frame in &frames {
            dfsi_side.handle_dfsi_payload(&frame.data);
        }

        let calls = peer2.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(&calls[0].2[P25_MSG_HDR_SIZE..], &original[..]);
    }
}
