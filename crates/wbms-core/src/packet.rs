//! Sub-packet splitting and the typed message catalogue.
//!
//! A frame payload is a run of sub-packets:
//!
//! ```text
//! ┌─────────┬──────────┬──────────────┬─────────┬──────────┬─────
//! │ Id (1)  │ Len (1)  │ Body (Len)   │ Id (1)  │ Len (1)  │ ...
//! └─────────┴──────────┴──────────────┴─────────┴──────────┴─────
//! ```
//!
//! Each body is decoded once into a [`Message`]. All multi-byte fields are
//! big-endian.

use crate::error::{PacketError, QueueError, ResultCode};
use crate::frame::{FrameBuf, SessionId};
use crate::SUBPACKET_HEADER_SIZE;
use serde::{Deserialize, Serialize};

/// Session establishment request (logged-out)
pub const CONNECT_REQUEST: u8 = 0x01;
/// Session establishment response (logged-out)
pub const CONNECT_RESPONSE: u8 = 0x02;
/// Session teardown request
pub const DISCONNECT_REQUEST: u8 = 0x03;
/// Session teardown response
pub const DISCONNECT_RESPONSE: u8 = 0x04;
/// Periodic status poll (background class)
pub const STATUS_REQUEST: u8 = 0x05;
/// Answer to a status poll
pub const STATUS_REPORT: u8 = 0x06;
/// First command id
pub const COMMAND_FIRST: u8 = 0x20;
/// Last command id
pub const COMMAND_LAST: u8 = 0x7F;
/// Set on a command id to form its response id
pub const RESPONSE_FLAG: u8 = 0x80;

/// Command id of the system-mode command
pub const CMD_SET_MODE: u8 = 0x20;
/// Command id of the manager reset command
pub const CMD_RESET_DEVICE: u8 = 0x21;

const CONNECT_RESPONSE_LEN: usize = 14;

/// One sub-packet view (zero-copy)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubPacket<'a> {
    /// Message id
    pub id: u8,
    /// Message body
    pub body: &'a [u8],
}

/// Iterator over the sub-packets of a payload.
///
/// Yields `Err(PacketError::Truncated)` once, then stops, when a sub-packet
/// would run past the end of the payload.
#[derive(Debug, Clone)]
pub struct SubPackets<'a> {
    rest: &'a [u8],
    done: bool,
}

/// Split a verified payload into sub-packets
#[must_use]
pub fn split(payload: &[u8]) -> SubPackets<'_> {
    SubPackets {
        rest: payload,
        done: false,
    }
}

impl<'a> Iterator for SubPackets<'a> {
    type Item = Result<SubPacket<'a>, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.rest.is_empty() {
            return None;
        }

        let available = self.rest.len();
        if available < SUBPACKET_HEADER_SIZE {
            self.done = true;
            return Some(Err(PacketError::Truncated {
                declared: SUBPACKET_HEADER_SIZE,
                available,
            }));
        }

        let id = self.rest[0];
        let end = SUBPACKET_HEADER_SIZE + usize::from(self.rest[1]);
        if end > available {
            self.done = true;
            return Some(Err(PacketError::Truncated {
                declared: end,
                available,
            }));
        }

        let body = &self.rest[SUBPACKET_HEADER_SIZE..end];
        self.rest = &self.rest[end..];
        Some(Ok(SubPacket { id, body }))
    }
}

/// Manager role negotiated at connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    /// Not (yet) reported
    #[default]
    Unknown = 0,
    /// Primary manager
    Primary = 1,
    /// Secondary manager
    Secondary = 2,
}

impl Role {
    fn from_wire(id: u8, value: u8) -> Result<Self, PacketError> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Primary),
            2 => Ok(Self::Secondary),
            _ => Err(PacketError::InvalidField { id, field: "role" }),
        }
    }
}

/// Connect request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Correlation token
    pub token: u16,
    /// Re-establishing a session lost with the link
    pub reconnect: bool,
    /// Host expects a dual-manager network
    pub dual_manager: bool,
}

/// Connect response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Correlation token
    pub token: u16,
    /// Manager verdict
    pub rc: ResultCode,
    /// Manager role
    pub role: Role,
    /// Manager protocol version
    pub protocol_version: u16,
    /// Hash of the manager's network configuration
    pub config_hash: u32,
    /// Session id issued for this host
    pub session: SessionId,
    /// Alternate (DMH) topology active
    pub dmh_active: bool,
    /// Manager configured for a dual-manager network
    pub dual_manager: bool,
    /// Nodes in the network
    pub node_count: u8,
    /// Measurement packets per node per interval
    pub packets_per_interval: u8,
}

impl ConnectResponse {
    /// Measurement packets the host must buffer per interval
    #[must_use]
    pub fn measurement_buffer_len(&self) -> usize {
        usize::from(self.node_count) * usize::from(self.packets_per_interval)
    }
}

/// Status report body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    /// Correlation token
    pub token: u16,
    /// Current system mode
    pub mode: u8,
    /// Nodes currently joined
    pub node_count: u8,
}

/// Generic command response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Command id (without the response flag)
    pub id: u8,
    /// Correlation token
    pub token: u16,
    /// Result code
    pub rc: ResultCode,
    /// Command-specific data
    pub body: Vec<u8>,
}

/// Decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Host → manager: log in
    ConnectRequest(ConnectRequest),
    /// Manager → host: login verdict
    ConnectResponse(ConnectResponse),
    /// Host → manager: log out
    DisconnectRequest {
        /// Correlation token
        token: u16,
    },
    /// Manager → host: logout verdict
    DisconnectResponse {
        /// Correlation token
        token: u16,
        /// Result code
        rc: ResultCode,
    },
    /// Host → manager: background status poll
    StatusRequest {
        /// Correlation token
        token: u16,
    },
    /// Manager → host: status
    StatusReport(StatusReport),
    /// Host → manager: generic command
    Command {
        /// Command id in `COMMAND_FIRST..=COMMAND_LAST`
        id: u8,
        /// Correlation token
        token: u16,
        /// Command-specific body
        body: Vec<u8>,
    },
    /// Manager → host: generic command response
    CommandResponse(CommandResponse),
}

fn expect_len(id: u8, body: &[u8], expected: usize) -> Result<(), PacketError> {
    if body.len() == expected {
        Ok(())
    } else {
        Err(PacketError::BadLength {
            id,
            expected,
            actual: body.len(),
        })
    }
}

fn expect_min_len(id: u8, body: &[u8], expected: usize) -> Result<(), PacketError> {
    if body.len() >= expected {
        Ok(())
    } else {
        Err(PacketError::BadLength {
            id,
            expected,
            actual: body.len(),
        })
    }
}

fn be16(body: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([body[at], body[at + 1]])
}

fn result_code(id: u8, value: u8) -> Result<ResultCode, PacketError> {
    ResultCode::try_from(value).map_err(|_| PacketError::InvalidField {
        id,
        field: "result code",
    })
}

impl Message {
    /// Wire id of this message
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            Self::ConnectRequest(_) => CONNECT_REQUEST,
            Self::ConnectResponse(_) => CONNECT_RESPONSE,
            Self::DisconnectRequest { .. } => DISCONNECT_REQUEST,
            Self::DisconnectResponse { .. } => DISCONNECT_RESPONSE,
            Self::StatusRequest { .. } => STATUS_REQUEST,
            Self::StatusReport(_) => STATUS_REPORT,
            Self::Command { id, .. } => *id,
            Self::CommandResponse(r) => r.id | RESPONSE_FLAG,
        }
    }

    /// Correlation token
    #[must_use]
    pub fn token(&self) -> u16 {
        match self {
            Self::ConnectRequest(r) => r.token,
            Self::ConnectResponse(r) => r.token,
            Self::DisconnectRequest { token }
            | Self::DisconnectResponse { token, .. }
            | Self::StatusRequest { token }
            | Self::Command { token, .. } => *token,
            Self::StatusReport(r) => r.token,
            Self::CommandResponse(r) => r.token,
        }
    }

    /// Check whether the message may travel outside a session
    #[must_use]
    pub fn is_session_message(&self) -> bool {
        matches!(self, Self::ConnectRequest(_) | Self::ConnectResponse(_))
    }

    /// Decode one sub-packet
    ///
    /// # Errors
    ///
    /// Returns `PacketError` for unknown ids, bad lengths or out-of-range
    /// fields.
    pub fn decode(packet: SubPacket<'_>) -> Result<Self, PacketError> {
        let SubPacket { id, body } = packet;
        match id {
            CONNECT_REQUEST => {
                expect_len(id, body, 3)?;
                Ok(Self::ConnectRequest(ConnectRequest {
                    token: be16(body, 0),
                    reconnect: body[2] & 0x01 != 0,
                    dual_manager: body[2] & 0x02 != 0,
                }))
            }
            CONNECT_RESPONSE => {
                expect_len(id, body, CONNECT_RESPONSE_LEN)?;
                Ok(Self::ConnectResponse(ConnectResponse {
                    token: be16(body, 0),
                    rc: result_code(id, body[2])?,
                    role: Role::from_wire(id, body[3])?,
                    protocol_version: be16(body, 4),
                    config_hash: u32::from_be_bytes([body[6], body[7], body[8], body[9]]),
                    session: SessionId::new(body[10]),
                    dmh_active: body[11] & 0x01 != 0,
                    dual_manager: body[11] & 0x02 != 0,
                    node_count: body[12],
                    packets_per_interval: body[13],
                }))
            }
            DISCONNECT_REQUEST => {
                expect_len(id, body, 2)?;
                Ok(Self::DisconnectRequest {
                    token: be16(body, 0),
                })
            }
            DISCONNECT_RESPONSE => {
                expect_len(id, body, 3)?;
                Ok(Self::DisconnectResponse {
                    token: be16(body, 0),
                    rc: result_code(id, body[2])?,
                })
            }
            STATUS_REQUEST => {
                expect_len(id, body, 2)?;
                Ok(Self::StatusRequest {
                    token: be16(body, 0),
                })
            }
            STATUS_REPORT => {
                expect_len(id, body, 4)?;
                Ok(Self::StatusReport(StatusReport {
                    token: be16(body, 0),
                    mode: body[2],
                    node_count: body[3],
                }))
            }
            COMMAND_FIRST..=COMMAND_LAST => {
                expect_min_len(id, body, 2)?;
                Ok(Self::Command {
                    id,
                    token: be16(body, 0),
                    body: body[2..].to_vec(),
                })
            }
            _ if id & RESPONSE_FLAG != 0
                && (COMMAND_FIRST..=COMMAND_LAST).contains(&(id & !RESPONSE_FLAG)) =>
            {
                expect_min_len(id, body, 3)?;
                Ok(Self::CommandResponse(CommandResponse {
                    id: id & !RESPONSE_FLAG,
                    token: be16(body, 0),
                    rc: result_code(id, body[2])?,
                    body: body[3..].to_vec(),
                }))
            }
            _ => Err(PacketError::UnknownMessage(id)),
        }
    }

    /// Encode the message body (without the sub-packet header)
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONNECT_RESPONSE_LEN);
        match self {
            Self::ConnectRequest(r) => {
                out.extend_from_slice(&r.token.to_be_bytes());
                out.push(u8::from(r.reconnect) | (u8::from(r.dual_manager) << 1));
            }
            Self::ConnectResponse(r) => {
                out.extend_from_slice(&r.token.to_be_bytes());
                out.push(r.rc as u8);
                out.push(r.role as u8);
                out.extend_from_slice(&r.protocol_version.to_be_bytes());
                out.extend_from_slice(&r.config_hash.to_be_bytes());
                out.push(r.session.as_u8());
                out.push(u8::from(r.dmh_active) | (u8::from(r.dual_manager) << 1));
                out.push(r.node_count);
                out.push(r.packets_per_interval);
            }
            Self::DisconnectRequest { token } | Self::StatusRequest { token } => {
                out.extend_from_slice(&token.to_be_bytes());
            }
            Self::DisconnectResponse { token, rc } => {
                out.extend_from_slice(&token.to_be_bytes());
                out.push(*rc as u8);
            }
            Self::StatusReport(r) => {
                out.extend_from_slice(&r.token.to_be_bytes());
                out.push(r.mode);
                out.push(r.node_count);
            }
            Self::Command { token, body, .. } => {
                out.extend_from_slice(&token.to_be_bytes());
                out.extend_from_slice(body);
            }
            Self::CommandResponse(r) => {
                out.extend_from_slice(&r.token.to_be_bytes());
                out.push(r.rc as u8);
                out.extend_from_slice(&r.body);
            }
        }
        out
    }

    /// Append this message to an outgoing frame
    ///
    /// # Errors
    ///
    /// Returns `QueueError` if the frame has no room for it.
    pub fn write_to(&self, frame: &mut FrameBuf) -> Result<(), QueueError> {
        frame.push_packet(self.id(), &self.encode_body())
    }
}
