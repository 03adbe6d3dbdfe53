//! Serial DFSI carrier — start-byte/length/command envelope over a serial
//! port, with jitter-buffered 20 ms pacing of outbound voice.
//!
//! Envelope:
//! ```text
//! +------+-----+-----+------+-----------+
//! | 0xFE | len | cmd | 0x00 | payload.. |
//! +------+-----+-----+------+-----------+
//! ```
//! `len` counts the whole frame including the four header bytes. The
//! receiver discards bytes until a 0xFE start byte, reads length and
//! command, then exactly `len - 3` further bytes.
//!
//! The serial port is blocking, so both directions run on dedicated
//! threads; inbound payloads cross into the async world over a channel.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use super::TxPayload;
use crate::codec::hex_dump;

/// Frame start byte.
pub const FRAME_START: u8 = 0xFE;
/// Envelope header length (start, length, command, filler).
pub const HEADER_LEN: usize = 4;

/// P25 data command.
pub const CMD_P25_DATA: u8 = 0x31;
/// Debug commands 0xF1..0xF5 carry free text plus 0..4 trailing
/// big-endian i16 parameters.
pub const CMD_DEBUG_BASE: u8 = 0xF1;
pub const CMD_DEBUG_MAX: u8 = 0xF5;

/// Spacing of queued IMBE messages (the 50 Hz voice cadence).
pub const IMBE_SPACING_MS: u64 = 20;
/// Spacing of queued non-voice messages.
pub const NORMAL_SPACING_MS: u64 = 5;

/// Wrap a payload in the serial envelope.
pub fn encode_frame(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(FRAME_START);
    buf.push((HEADER_LEN + payload.len()) as u8);
    buf.push(command);
    buf.push(0x00);
    buf.extend_from_slice(payload);
    buf
}

/// A complete received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    pub command: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
enum DecodeState {
    Scan,
    Length,
    Command,
    Payload,
}

/// Strict receive state machine: scan for 0xFE, read length and command,
/// then exactly `length - 3` payload bytes (the first of which is the
/// filler octet).
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    length: u8,
    command: u8,
    raw: Vec<u8>,
    remaining: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            state: DecodeState::Scan,
            length: 0,
            command: 0,
            raw: Vec::new(),
            remaining: 0,
        }
    }

    /// Feed one byte; returns a frame when it completes one.
    pub fn push(&mut self, byte: u8) -> Option<SerialFrame> {
        match self.state {
            DecodeState::Scan => {
                if byte == FRAME_START {
                    self.state = DecodeState::Length;
                }
                None
            }
            DecodeState::Length => {
                self.length = byte;
                if (byte as usize) < HEADER_LEN {
                    tracing::warn!("Serial frame with invalid length {}", byte);
                    self.state = DecodeState::Scan;
                } else {
                    self.state = DecodeState::Command;
                }
                None
            }
            DecodeState::Command => {
                self.command = byte;
                self.remaining = self.length as usize - 3;
                self.raw.clear();
                self.state = DecodeState::Payload;
                None
            }
            DecodeState::Payload => {
                self.raw.push(byte);
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.state = DecodeState::Scan;
                    Some(SerialFrame {
                        command: self.command,
                        // strip the filler octet
                        payload: self.raw[1..].to_vec(),
                    })
                } else {
                    None
                }
            }
        }
    }
}

/// Decode a debug frame into its text and trailing parameters.
pub fn decode_debug(command: u8, payload: &[u8]) -> Option<(String, Vec<i16>)> {
    if !(CMD_DEBUG_BASE..=CMD_DEBUG_MAX).contains(&command) {
        return None;
    }
    let nparams = (command - CMD_DEBUG_BASE) as usize;
    if payload.len() < nparams * 2 {
        return None;
    }
    let split = payload.len() - nparams * 2;
    let text = String::from_utf8_lossy(&payload[..split]).trim_end().to_string();
    let params = payload[split..]
        .chunks_exact(2)
        .map(|c| i16::from_be_bytes([c[0], c[1]]))
        .collect();
    Some((text, params))
}

/// Kind of a queued transmit message, for pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Normal,
    Imbe,
}

/// One queued transmit message with its scheduled send time, in
/// milliseconds on the carrier's stopwatch.
#[derive(Debug)]
pub struct TxMessage {
    pub bytes: Vec<u8>,
    pub deadline_ms: u64,
    pub kind: TxKind,
}

/// Single-producer/single-consumer FIFO with the jitter schedule.
///
/// Scheduling: the first message of a burst goes out `jitter_ms` after
/// enqueue; later messages chain 20 ms (IMBE) or 5 ms (normal) behind the
/// previous deadline. When the previous deadline has fallen further behind
/// the clock than `jitter_ms`, the burst is considered over and the
/// sequence restarts.
#[derive(Debug)]
pub struct JitterQueue {
    jitter_ms: u64,
    queue: VecDeque<TxMessage>,
    last_deadline_ms: Option<u64>,
}

impl JitterQueue {
    pub fn new(jitter_ms: u64) -> Self {
        JitterQueue {
            jitter_ms,
            queue: VecDeque::new(),
            last_deadline_ms: None,
        }
    }

    pub fn push(&mut self, now_ms: u64, bytes: Vec<u8>, kind: TxKind) {
        let deadline_ms = match self.last_deadline_ms {
            Some(prev) if now_ms <= prev + self.jitter_ms => {
                prev + match kind {
                    TxKind::Imbe => IMBE_SPACING_MS,
                    TxKind::Normal => NORMAL_SPACING_MS,
                }
            }
            _ => now_ms + self.jitter_ms,
        };
        self.last_deadline_ms = Some(deadline_ms);
        self.queue.push_back(TxMessage {
            bytes,
            deadline_ms,
            kind,
        });
    }

    /// The head message, if its deadline has passed.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<TxMessage> {
        if self.queue.front()?.deadline_ms <= now_ms {
            self.queue.pop_front()
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

struct TxShared {
    start: Instant,
    queue: Mutex<JitterQueue>,
}

/// Clonable handle used by the scheduler to queue outbound frames.
#[derive(Clone)]
pub struct SerialTx {
    shared: Arc<TxShared>,
}

impl std::fmt::Debug for SerialTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTx").finish()
    }
}

impl SerialTx {
    pub fn send_p25(&self, payload: TxPayload) {
        let kind = if payload.imbe {
            TxKind::Imbe
        } else {
            TxKind::Normal
        };
        let bytes = encode_frame(CMD_P25_DATA, &payload.data);
        let now_ms = self.shared.start.elapsed().as_millis() as u64;
        self.shared.queue.lock().unwrap().push(now_ms, bytes, kind);
    }
}

/// A running serial carrier: one reader thread, one paced writer thread.
pub struct SerialCarrier {
    tx: SerialTx,
    cancel: Arc<AtomicBool>,
    read_handle: Option<thread::JoinHandle<()>>,
    write_handle: Option<thread::JoinHandle<()>>,
}

impl SerialCarrier {
    /// Open the port and start both threads. Inbound P25 payloads are
    /// delivered on `rx_out`.
    pub fn start(
        port_name: &str,
        baud_rate: u32,
        jitter_ms: u64,
        raw_trace: bool,
        rx_out: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .with_context(|| format!("Failed to open serial port {}", port_name))?;
        let reader = port
            .try_clone()
            .context("Failed to clone serial port handle")?;
        tracing::info!("Serial carrier on {} at {} baud", port_name, baud_rate);
        Ok(Self::spawn(
            Box::new(reader),
            Box::new(port),
            jitter_ms,
            raw_trace,
            rx_out,
        ))
    }

    fn spawn(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        jitter_ms: u64,
        raw_trace: bool,
        rx_out: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        let shared = Arc::new(TxShared {
            start: Instant::now(),
            queue: Mutex::new(JitterQueue::new(jitter_ms)),
        });
        let cancel = Arc::new(AtomicBool::new(false));

        let read_handle = {
            let cancel = cancel.clone();
            thread::spawn(move || read_loop(reader, cancel, raw_trace, rx_out))
        };
        let write_handle = {
            let cancel = cancel.clone();
            let shared = shared.clone();
            thread::spawn(move || write_loop(writer, cancel, raw_trace, shared))
        };

        SerialCarrier {
            tx: SerialTx { shared },
            cancel,
            read_handle: Some(read_handle),
            write_handle: Some(write_handle),
        }
    }

    pub fn transmitter(&self) -> SerialTx {
        self.tx.clone()
    }

    /// Stop both threads and join them. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(h) = self.read_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.write_handle.take() {
            let _ = h.join();
        }
        tracing::info!("Serial carrier stopped");
    }
}

impl Drop for SerialCarrier {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    cancel: Arc<AtomicBool>,
    raw_trace: bool,
    rx_out: mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 256];

    while !cancel.load(Ordering::Relaxed) {
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                tracing::warn!("Serial read error: {:#}", e);
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        for &b in &buf[..n] {
            let Some(frame) = decoder.push(b) else {
                continue;
            };
            match frame.command {
                CMD_P25_DATA => {
                    if raw_trace {
                        tracing::debug!(
                            "Serial recv ({} bytes)\n{}",
                            frame.payload.len(),
                            hex_dump(&frame.payload)
                        );
                    }
                    let _ = rx_out.send(frame.payload);
                }
                cmd @ CMD_DEBUG_BASE..=CMD_DEBUG_MAX => {
                    match decode_debug(cmd, &frame.payload) {
                        Some((text, params)) if params.is_empty() => {
                            tracing::debug!("Serial debug: {}", text)
                        }
                        Some((text, params)) => {
                            tracing::debug!("Serial debug: {} {:?}", text, params)
                        }
                        None => tracing::warn!("Malformed serial debug frame"),
                    }
                }
                other => {
                    tracing::warn!("Unknown serial command {:#04x}", other);
                }
            }
        }
    }
}

fn write_loop(
    mut writer: Box<dyn Write + Send>,
    cancel: Arc<AtomicBool>,
    raw_trace: bool,
    shared: Arc<TxShared>,
) {
    while !cancel.load(Ordering::Relaxed) {
        let now_ms = shared.start.elapsed().as_millis() as u64;
        let due = shared.queue.lock().unwrap().pop_due(now_ms);
        match due {
            Some(msg) => {
                if raw_trace {
                    tracing::debug!(
                        "Serial send {:?} at {} ms ({} bytes)\n{}",
                        msg.kind,
                        msg.deadline_ms,
                        msg.bytes.len(),
                        hex_dump(&msg.bytes)
                    );
                }
                if let Err(e) = writer.write_all(&msg.bytes).and_then(|_| writer.flush()) {
                    tracing::warn!("Serial write error: {:#}", e);
                }
            }
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
}
