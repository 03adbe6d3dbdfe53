//! Standard (TIA-102.BAHA) framing: start/end-of-stream, full-rate voice,
//! voice-header blocks, and the block-oriented payload container.
//!
//! A standard payload is a control octet, `block_header_count` block
//! headers, then the block bodies in header order:
//! ```text
//! +---------+-----------+-----------+-----+--------+--------+-----+
//! | control | blk hdr 1 | blk hdr 2 | ... | body 1 | body 2 | ... |
//! +---------+-----------+-----------+-----+--------+--------+-----+
//! ```

use super::control::{
    BlockHeader, ControlOctet, BLOCK_END_OF_STREAM, BLOCK_FULL_RATE_VOICE, BLOCK_START_OF_STREAM,
    BLOCK_VOICE_HEADER_P1, BLOCK_VOICE_HEADER_P2,
};
use super::{frame_position, FrameError, IMBE_LEN};

/// Wire length of a standard start-of-stream block.
pub const START_OF_STREAM_LEN: usize = 4;
/// Fixed prefix of a standard full-rate voice block (frame type, IMBE,
/// status bytes) before any additional frame data.
pub const FRV_FIXED_LEN: usize = 14;
/// Each voice-header block carries half of the 36 expanded hexbits.
pub const VOICE_HEADER_BLOCK_LEN: usize = 18;

/// Standard start-of-stream: `{NID:u16be, reserved:4|error_count:4, 0x00}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartOfStream {
    pub nid: u16,
    pub error_count: u8,
}

impl StartOfStream {
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < START_OF_STREAM_LEN {
            return Err(FrameError::TooShort {
                got: data.len(),
                need: START_OF_STREAM_LEN,
            });
        }
        Ok(StartOfStream {
            nid: u16::from_be_bytes([data[0], data[1]]),
            error_count: data[2] & 0x0F,
        })
    }

    pub fn encode(&self) -> [u8; START_OF_STREAM_LEN] {
        let nid = self.nid.to_be_bytes();
        [nid[0], nid[1], self.error_count & 0x0F, 0x00]
    }
}

/// Number of additional frame data bytes behind the fixed FRV prefix for a
/// given voice frame type. Positions 3..=8 carry sideband triplets,
/// position 9 carries the two LSD bytes.
pub fn additional_data_len(frame_type: u8) -> usize {
    match frame_position(frame_type) {
        Some(3..=8) => 3,
        Some(9) => 2,
        _ => 0,
    }
}

/// Total wire length of a standard FRV block of the given frame type.
pub fn frv_block_len(frame_type: u8) -> usize {
    FRV_FIXED_LEN + additional_data_len(frame_type)
}

/// Standard full-rate voice block.
///
/// ```text
/// 0    1          12          13         14
/// +----+----------+-----------+----------+-------------------+
/// | FT | IMBE x11 | E2:M:L:E4 | SFC:BUSY | additional data.. |
/// +----+----------+-----------+----------+-------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullRateVoice {
    pub frame_type: u8,
    pub imbe: [u8; IMBE_LEN],
    pub total_errors: u8,
    pub mute_frame: bool,
    pub lost_frame: bool,
    pub e4: u8,
    pub superframe_counter: u8,
    pub busy: u8,
    pub additional_data: Vec<u8>,
}

impl FullRateVoice {
    pub fn new(frame_type: u8) -> Self {
        FullRateVoice {
            frame_type,
            imbe: [0; IMBE_LEN],
            total_errors: 0,
            mute_frame: false,
            lost_frame: false,
            e4: 0,
            superframe_counter: 0,
            busy: 0,
            additional_data: Vec::new(),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRV_FIXED_LEN {
            return Err(FrameError::TooShort {
                got: data.len(),
                need: FRV_FIXED_LEN,
            });
        }
        let frame_type = data[0];
        if !super::is_voice_frame(frame_type) {
            return Err(FrameError::BadOpcode { opcode: frame_type });
        }
        let mut imbe = [0u8; IMBE_LEN];
        imbe.copy_from_slice(&data[1..1 + IMBE_LEN]);
        Ok(FullRateVoice {
            frame_type,
            imbe,
            total_errors: (data[12] >> 5) & 0x07,
            mute_frame: (data[12] & 0x10) == 0x10,
            lost_frame: (data[12] & 0x08) == 0x08,
            e4: data[12] & 0x07,
            superframe_counter: (data[13] >> 2) & 0x03,
            busy: data[13] & 0x03,
            additional_data: data[FRV_FIXED_LEN..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRV_FIXED_LEN + self.additional_data.len());
        buf.push(self.frame_type);
        buf.extend_from_slice(&self.imbe);
        buf.push(
            ((self.total_errors & 0x07) << 5)
                | (if self.mute_frame { 0x10 } else { 0x00 })
                | (if self.lost_frame { 0x08 } else { 0x00 })
                | (self.e4 & 0x07),
        );
        buf.push(((self.superframe_counter & 0x03) << 2) | (self.busy & 0x03));
        buf.extend_from_slice(&self.additional_data);
        buf
    }
}

/// One block of a standard payload, typed by its block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    StartOfStream(StartOfStream),
    EndOfStream,
    FullRateVoice(FullRateVoice),
    /// Expanded hexbits 0..18 of the RS-encoded voice header.
    VoiceHeaderP1([u8; VOICE_HEADER_BLOCK_LEN]),
    /// Expanded hexbits 18..36 of the RS-encoded voice header.
    VoiceHeaderP2([u8; VOICE_HEADER_BLOCK_LEN]),
}

impl Block {
    pub fn block_type(&self) -> u8 {
        match self {
            Block::StartOfStream(_) => BLOCK_START_OF_STREAM,
            Block::EndOfStream => BLOCK_END_OF_STREAM,
            Block::FullRateVoice(_) => BLOCK_FULL_RATE_VOICE,
            Block::VoiceHeaderP1(_) => BLOCK_VOICE_HEADER_P1,
            Block::VoiceHeaderP2(_) => BLOCK_VOICE_HEADER_P2,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Block::StartOfStream(sos) => buf.extend_from_slice(&sos.encode()),
            Block::EndOfStream => {}
            Block::FullRateVoice(frv) => buf.extend_from_slice(&frv.encode()),
            Block::VoiceHeaderP1(h) | Block::VoiceHeaderP2(h) => buf.extend_from_slice(h),
        }
    }
}

/// A full standard DFSI payload: control octet, block headers, blocks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    pub control: ControlOctet,
    pub blocks: Vec<Block>,
}

impl Payload {
    /// Build a payload from blocks. The signal bit is set when any block is
    /// a stream-control block (start/end of stream, voice header).
    pub fn new(blocks: Vec<Block>) -> Self {
        let signal = blocks
            .iter()
            .any(|b| !matches!(b, Block::FullRateVoice(_)));
        Payload {
            control: ControlOctet {
                signal,
                compact: true,
                block_header_count: blocks.len() as u8,
            },
            blocks,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::TooShort { got: 0, need: 1 });
        }
        let control = ControlOctet::decode(data[0]);
        let verbose = !control.compact;
        let hdr_len = if verbose { 4 } else { 1 };
        let count = control.block_header_count as usize;

        let mut offset = 1;
        let mut headers = Vec::with_capacity(count);
        for _ in 0..count {
            if data.len() < offset + hdr_len {
                return Err(FrameError::TooShort {
                    got: data.len(),
                    need: offset + hdr_len,
                });
            }
            headers.push(BlockHeader::decode(&data[offset..], verbose)?);
            offset += hdr_len;
        }

        let mut blocks = Vec::with_capacity(count);
        for hdr in &headers {
            let block = match hdr.block_type {
                BLOCK_START_OF_STREAM => {
                    let sos = StartOfStream::decode(&data[offset..])?;
                    offset += START_OF_STREAM_LEN;
                    Block::StartOfStream(sos)
                }
                BLOCK_END_OF_STREAM => Block::EndOfStream,
                BLOCK_FULL_RATE_VOICE => {
                    if data.len() < offset + FRV_FIXED_LEN {
                        return Err(FrameError::TooShort {
                            got: data.len(),
                            need: offset + FRV_FIXED_LEN,
                        });
                    }
                    let len = frv_block_len(data[offset]);
                    if data.len() < offset + len {
                        return Err(FrameError::TooShort {
                            got: data.len(),
                            need: offset + len,
                        });
                    }
                    let frv = FullRateVoice::decode(&data[offset..offset + len])?;
                    offset += len;
                    Block::FullRateVoice(frv)
                }
                BLOCK_VOICE_HEADER_P1 | BLOCK_VOICE_HEADER_P2 => {
                    if data.len() < offset + VOICE_HEADER_BLOCK_LEN {
                        return Err(FrameError::TooShort {
                            got: data.len(),
                            need: offset + VOICE_HEADER_BLOCK_LEN,
                        });
                    }
                    let mut h = [0u8; VOICE_HEADER_BLOCK_LEN];
                    h.copy_from_slice(&data[offset..offset + VOICE_HEADER_BLOCK_LEN]);
                    offset += VOICE_HEADER_BLOCK_LEN;
                    if hdr.block_type == BLOCK_VOICE_HEADER_P1 {
                        Block::VoiceHeaderP1(h)
                    } else {
                        Block::VoiceHeaderP2(h)
                    }
                }
                other => return Err(FrameError::BadOpcode { opcode: other }),
            };
            blocks.push(block);
        }

        Ok(Payload { control, blocks })
    }

    pub fn encode(&self) -> Vec<u8> {
        let verbose = !self.control.compact;
        let mut control = self.control;
        control.block_header_count = self.blocks.len() as u8;

        let mut buf = vec![control.encode()];
        for block in &self.blocks {
            let mut hdr = BlockHeader::new(block.block_type());
            if verbose {
                let mut body = Vec::new();
                block.encode_into(&mut body);
                hdr.block_length = body.len() as u16;
            }
            buf.extend_from_slice(&hdr.encode(verbose));
        }
        for block in &self.blocks {
            block.encode_into(&mut buf);
        }
        buf
    }
}
