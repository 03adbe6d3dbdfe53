//! Fixed Station Control (FSC) message family for the UDP control channel.
//!
//! Every message starts `{message id, version}`; CONNECT and DISCONNECT
//! carry a correlation tag at byte 2. Responses (including the connect
//! response with the remote voice-conveyance port) ride inside an ACK:
//!
//! ```text
//! 0     1     2        3        4        5      6       7..
//! +-----+-----+--------+--------+--------+------+-------+----------+
//! | ACK | ver | ack id | ack vr | ack tg | code | r len | r bytes  |
//! +-----+-----+--------+--------+--------+------+-------+----------+
//! ```

use super::FrameError;

/// Protocol version carried by every FSC message.
pub const FSC_VERSION: u8 = 1;

// Message ids.
pub const FSC_CONNECT: u8 = 0;
pub const FSC_DISCONNECT: u8 = 1;
pub const FSC_ACK: u8 = 2;
pub const FSC_HEARTBEAT: u8 = 3;

pub const FSC_CONNECT_LEN: usize = 11;
pub const FSC_DISCONNECT_LEN: usize = 3;
pub const FSC_HEARTBEAT_LEN: usize = 2;
pub const FSC_ACK_LEN: usize = 6;
pub const FSC_CONNECT_RESPONSE_LEN: usize = 3;

/// ACK response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    ControlAck = 0,
    ControlNak = 1,
    ControlNakConnected = 2,
    ControlNakMUnsupported = 3,
    ControlNakVUnsupported = 4,
    ControlNakFUnsupported = 5,
    ControlNakParms = 6,
    ControlNakBusy = 7,
}

impl ResponseCode {
    pub fn from_u8(v: u8) -> Result<Self, FrameError> {
        Ok(match v {
            0 => ResponseCode::ControlAck,
            1 => ResponseCode::ControlNak,
            2 => ResponseCode::ControlNakConnected,
            3 => ResponseCode::ControlNakMUnsupported,
            4 => ResponseCode::ControlNakVUnsupported,
            5 => ResponseCode::ControlNakFUnsupported,
            6 => ResponseCode::ControlNakParms,
            7 => ResponseCode::ControlNakBusy,
            other => {
                return Err(FrameError::BadField {
                    field: "response code",
                    value: other,
                })
            }
        })
    }

    pub fn is_nak(&self) -> bool {
        !matches!(self, ResponseCode::ControlAck)
    }
}

/// CONNECT: advertises our voice-conveyance port, SSRC and heartbeat
/// periods to the remote RFSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect {
    pub correlation_tag: u8,
    pub vc_base_port: u16,
    pub vc_ssrc: u32,
    pub fs_heartbeat_period: u8,
    pub host_heartbeat_period: u8,
}

impl Connect {
    fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FSC_CONNECT_LEN {
            return Err(FrameError::TooShort {
                got: data.len(),
                need: FSC_CONNECT_LEN,
            });
        }
        Ok(Connect {
            correlation_tag: data[2],
            vc_base_port: u16::from_be_bytes([data[3], data[4]]),
            vc_ssrc: u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
            fs_heartbeat_period: data[9],
            host_heartbeat_period: data[10],
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![FSC_CONNECT, FSC_VERSION, self.correlation_tag];
        buf.extend_from_slice(&self.vc_base_port.to_be_bytes());
        buf.extend_from_slice(&self.vc_ssrc.to_be_bytes());
        buf.push(self.fs_heartbeat_period);
        buf.push(self.host_heartbeat_period);
        buf
    }
}

/// Connect response payload, carried in the response bytes of
/// ACK(CONNECT, CONTROL_ACK): `{version, vc_base_port:u16be}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub vc_base_port: u16,
}

impl ConnectResponse {
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FSC_CONNECT_RESPONSE_LEN {
            return Err(FrameError::TooShort {
                got: data.len(),
                need: FSC_CONNECT_RESPONSE_LEN,
            });
        }
        Ok(ConnectResponse {
            vc_base_port: u16::from_be_bytes([data[1], data[2]]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![FSC_VERSION];
        buf.extend_from_slice(&self.vc_base_port.to_be_bytes());
        buf
    }
}

/// ACK/NAK of a previously received message, optionally carrying a typed
/// response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub ack_message_id: u8,
    pub ack_version: u8,
    pub ack_correlation_tag: u8,
    pub response_code: ResponseCode,
    pub response_data: Vec<u8>,
}

impl Ack {
    fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FSC_ACK_LEN {
            return Err(FrameError::TooShort {
                got: data.len(),
                need: FSC_ACK_LEN,
            });
        }
        let response_data = if data.len() > FSC_ACK_LEN {
            let n = data[FSC_ACK_LEN] as usize;
            if data.len() < FSC_ACK_LEN + 1 + n {
                return Err(FrameError::TooShort {
                    got: data.len(),
                    need: FSC_ACK_LEN + 1 + n,
                });
            }
            data[FSC_ACK_LEN + 1..FSC_ACK_LEN + 1 + n].to_vec()
        } else {
            Vec::new()
        };
        Ok(Ack {
            ack_message_id: data[2],
            ack_version: data[3],
            ack_correlation_tag: data[4],
            response_code: ResponseCode::from_u8(data[5])?,
            response_data,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![
            FSC_ACK,
            FSC_VERSION,
            self.ack_message_id,
            self.ack_version,
            self.ack_correlation_tag,
            self.response_code as u8,
        ];
        if !self.response_data.is_empty() {
            buf.push(self.response_data.len() as u8);
            buf.extend_from_slice(&self.response_data);
        }
        buf
    }

    /// The connect response payload, when this is an ACK of a CONNECT.
    pub fn connect_response(&self) -> Option<ConnectResponse> {
        if self.ack_message_id == FSC_CONNECT && !self.response_code.is_nak() {
            ConnectResponse::decode(&self.response_data).ok()
        } else {
            None
        }
    }
}

/// The FSC message family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect(Connect),
    Heartbeat,
    Ack(Ack),
    Disconnect { correlation_tag: u8 },
}

impl Message {
    pub fn message_id(&self) -> u8 {
        match self {
            Message::Connect(_) => FSC_CONNECT,
            Message::Heartbeat => FSC_HEARTBEAT,
            Message::Ack(_) => FSC_ACK,
            Message::Disconnect { .. } => FSC_DISCONNECT,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FSC_HEARTBEAT_LEN {
            return Err(FrameError::TooShort {
                got: data.len(),
                need: FSC_HEARTBEAT_LEN,
            });
        }
        if data[1] != FSC_VERSION {
            return Err(FrameError::BadField {
                field: "fsc version",
                value: data[1],
            });
        }
        match data[0] {
            FSC_CONNECT => Ok(Message::Connect(Connect::decode(data)?)),
            FSC_HEARTBEAT => Ok(Message::Heartbeat),
            FSC_ACK => Ok(Message::Ack(Ack::decode(data)?)),
            FSC_DISCONNECT => {
                if data.len() < FSC_DISCONNECT_LEN {
                    return Err(FrameError::TooShort {
                        got: data.len(),
                        need: FSC_DISCONNECT_LEN,
                    });
                }
                Ok(Message::Disconnect {
                    correlation_tag: data[2],
                })
            }
            other => Err(FrameError::BadOpcode { opcode: other }),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Connect(c) => c.encode(),
            Message::Heartbeat => vec![FSC_HEARTBEAT, FSC_VERSION],
            Message::Ack(a) => a.encode(),
            Message::Disconnect { correlation_tag } => {
                vec![FSC_DISCONNECT, FSC_VERSION, *correlation_tag]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_roundtrip() {
        let msg = Message::Connect(Connect {
            correlation_tag: 7,
            vc_base_port: 27500,
            vc_ssrc: 0xDEADBEEF,
            fs_heartbeat_period: 5,
            host_heartbeat_period: 5,
        });
        let enc = msg.encode();
        assert_eq!(enc.len(), FSC_CONNECT_LEN);
        assert_eq!(enc[0], FSC_CONNECT);
        assert_eq!(enc[1], FSC_VERSION);
        assert_eq!(Message::decode(&enc).unwrap(), msg);
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let enc = Message::Heartbeat.encode();
        assert_eq!(enc, vec![FSC_HEARTBEAT, FSC_VERSION]);
        assert_eq!(Message::decode(&enc).unwrap(), Message::Heartbeat);
    }

    #[test]
    fn test_disconnect_roundtrip() {
        let msg = Message::Disconnect { correlation_tag: 3 };
        let enc = msg.encode();
        assert_eq!(enc.len(), FSC_DISCONNECT_LEN);
        assert_eq!(Message::decode(&enc).unwrap(), msg);
    }

    #[test]
    fn test_ack_without_response() {
        let msg = Message::Ack(Ack {
            ack_message_id: FSC_HEARTBEAT,
            ack_version: FSC_VERSION,
            ack_correlation_tag: 0,
            response_code: ResponseCode::ControlAck,
            response_data: Vec::new(),
        });
        let enc = msg.encode();
        assert_eq!(enc.len(), FSC_ACK_LEN);
        assert_eq!(Message::decode(&enc).unwrap(), msg);
    }

    #[test]
    fn test_ack_with_connect_response() {
        let resp = ConnectResponse {
            vc_base_port: 27500,
        };
        let msg = Message::Ack(Ack {
            ack_message_id: FSC_CONNECT,
            ack_version: FSC_VERSION,
            ack_correlation_tag: 9,
            response_code: ResponseCode::ControlAck,
            response_data: resp.encode(),
        });
        let enc = msg.encode();
        assert_eq!(enc.len(), FSC_ACK_LEN + 1 + FSC_CONNECT_RESPONSE_LEN);

        let dec = Message::decode(&enc).unwrap();
        let Message::Ack(ack) = dec else {
            panic!("not an ack");
        };
        assert_eq!(ack.ack_correlation_tag, 9);
        assert_eq!(ack.connect_response(), Some(resp));
    }

    #[test]
    fn test_nak_has_no_connect_response() {
        let msg = Ack {
            ack_message_id: FSC_CONNECT,
            ack_version: FSC_VERSION,
            ack_correlation_tag: 1,
            response_code: ResponseCode::ControlNakBusy,
            response_data: ConnectResponse { vc_base_port: 1 }.encode(),
        };
        assert!(msg.response_code.is_nak());
        assert_eq!(msg.connect_response(), None);
    }

    #[test]
    fn test_rejects_bad_version() {
        assert!(Message::decode(&[FSC_HEARTBEAT, 2]).is_err());
    }

    #[test]
    fn test_rejects_unknown_id() {
        assert!(Message::decode(&[0x7E, FSC_VERSION, 0]).is_err());
    }

    #[test]
    fn test_truncated_ack_response() {
        let mut enc = Message::Ack(Ack {
            ack_message_id: FSC_CONNECT,
            ack_version: FSC_VERSION,
            ack_correlation_tag: 0,
            response_code: ResponseCode::ControlAck,
            response_data: vec![1, 2, 3],
        })
        .encode();
        enc.truncate(enc.len() - 1);
        assert!(Message::decode(&enc).is_err());
    }
}
