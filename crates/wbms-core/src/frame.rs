//! Frame encoding and decoding for the wBMS link.
//!
//! Every exchange on the link is exactly [`FRAME_SIZE`] bytes:
//!
//! ```text
//! ┌────────────┬────────────┬──────────────────────┬──────────┬────────────┐
//! │ Length (1) │ Session(1) │ Payload (Length)     │ (unused) │ CRC32 (4)  │
//! └────────────┴────────────┴──────────────────────┴──────────┴────────────┘
//! ```
//!
//! A zero length marks an idle frame. The CRC trailer is big-endian and
//! covers exactly `FRAME_HEADER_SIZE + length` bytes, seeded with
//! [`CRC_SEED`].

use crate::error::{FrameError, QueueError};
use crate::{
    CRC_OFFSET, CRC_SEED, FRAME_CRC_SIZE, FRAME_HEADER_SIZE, FRAME_SIZE, MAX_PAYLOAD_SIZE,
    SESSION_ID_OFFSET, SUBPACKET_HEADER_SIZE,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One raw exchange
pub type RawFrame = [u8; FRAME_SIZE];

/// Session key carried in every frame.
///
/// Managers issue ids in `0x01..=0xFE` at login. `LOGGED_OUT` marks frames
/// exchanged outside a session; `INVALID` is never issued and is what a
/// corrupted or undriven bus tends to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(u8);

impl SessionId {
    /// Never issued
    pub const INVALID: Self = Self(0x00);

    /// Reserved logged-out sentinel
    pub const LOGGED_OUT: Self = Self(0xFF);

    /// Wrap a raw byte
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw byte value
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Check whether a manager may hand out this id at login
    #[must_use]
    pub fn is_issuable(self) -> bool {
        self != Self::INVALID && self != Self::LOGGED_OUT
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Compute the frame CRC over `covered` (header + payload)
#[must_use]
pub fn frame_crc(covered: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(CRC_SEED);
    hasher.update(covered);
    hasher.finalize()
}

/// Classified view of a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind<'a> {
    /// Zero-length frame; classified by session id alone
    Idle {
        /// Session id byte
        session: SessionId,
    },
    /// Frame carrying sub-packets, integrity already verified
    Data {
        /// Session id byte
        session: SessionId,
        /// Payload slice (zero-copy)
        payload: &'a [u8],
    },
}

/// Parse and integrity-check a received frame (zero-copy).
///
/// # Errors
///
/// - `FrameError::TooShort` if `raw` is shorter than one exchange
/// - `FrameError::PayloadOverflow` if the length byte exceeds the capacity
/// - `FrameError::CrcMismatch` if the trailer does not match
pub fn parse_frame(raw: &[u8]) -> Result<FrameKind<'_>, FrameError> {
    if raw.len() < FRAME_SIZE {
        return Err(FrameError::TooShort {
            expected: FRAME_SIZE,
            actual: raw.len(),
        });
    }

    let len = usize::from(raw[0]);
    let session = SessionId(raw[SESSION_ID_OFFSET]);
    if len == 0 {
        return Ok(FrameKind::Idle { session });
    }
    if len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadOverflow {
            len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let received = u32::from_be_bytes([
        raw[CRC_OFFSET],
        raw[CRC_OFFSET + 1],
        raw[CRC_OFFSET + 2],
        raw[CRC_OFFSET + 3],
    ]);
    let computed = frame_crc(&raw[..FRAME_HEADER_SIZE + len]);
    if received != computed {
        return Err(FrameError::CrcMismatch { received, computed });
    }

    Ok(FrameKind::Data {
        session,
        payload: &raw[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len],
    })
}

/// Outgoing frame buffer.
///
/// Sub-packets accumulate in place; [`FrameBuf::seal`] stamps the header and
/// CRC just before the exchange so the session id is always current.
pub struct FrameBuf {
    raw: Box<RawFrame>,
    len: usize,
}

impl FrameBuf {
    /// Create an empty (idle) frame
    #[must_use]
    pub fn new() -> Self {
        Self {
            raw: Box::new([0u8; FRAME_SIZE]),
            len: 0,
        }
    }

    /// Payload bytes queued so far
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.len
    }

    /// Check whether no sub-packet is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes still available
    #[must_use]
    pub fn remaining(&self) -> usize {
        MAX_PAYLOAD_SIZE - self.len
    }

    /// Queued payload
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.raw[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + self.len]
    }

    /// Append one sub-packet.
    ///
    /// # Errors
    ///
    /// - `QueueError::BodyTooLong` if the body does not fit the length byte
    /// - `QueueError::FrameFull` if the frame has no room left
    pub fn push_packet(&mut self, id: u8, body: &[u8]) -> Result<(), QueueError> {
        let body_len = u8::try_from(body.len()).map_err(|_| QueueError::BodyTooLong(body.len()))?;
        let needed = SUBPACKET_HEADER_SIZE + body.len();
        if needed > self.remaining() {
            return Err(QueueError::FrameFull {
                needed,
                remaining: self.remaining(),
            });
        }

        let start = FRAME_HEADER_SIZE + self.len;
        self.raw[start] = id;
        self.raw[start + 1] = body_len;
        self.raw[start + SUBPACKET_HEADER_SIZE..start + needed].copy_from_slice(body);
        self.len += needed;
        Ok(())
    }

    /// Stamp length, session id and CRC; return the bytes to clock out
    #[allow(clippy::cast_possible_truncation)]
    pub fn seal(&mut self, session: SessionId) -> &RawFrame {
        // len <= MAX_PAYLOAD_SIZE < 256
        self.raw[0] = self.len as u8;
        self.raw[SESSION_ID_OFFSET] = session.as_u8();
        let crc = frame_crc(&self.raw[..FRAME_HEADER_SIZE + self.len]);
        self.raw[CRC_OFFSET..CRC_OFFSET + FRAME_CRC_SIZE].copy_from_slice(&crc.to_be_bytes());
        &self.raw
    }

    /// Drop every queued sub-packet
    pub fn clear(&mut self) {
        self.raw.fill(0);
        self.len = 0;
    }
}

impl Default for FrameBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuf")
            .field("len", &self.len)
            .field("payload", &hex::encode(self.payload()))
            .finish()
    }
}

/// Builder for complete frames (simulators, tests, tooling)
#[derive(Debug, Default)]
pub struct FrameBuilder {
    session: Option<SessionId>,
    payload: Vec<u8>,
}

impl FrameBuilder {
    /// Create a new frame builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session id (defaults to `LOGGED_OUT`)
    #[must_use]
    pub fn session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Append one sub-packet
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn packet(mut self, id: u8, body: &[u8]) -> Self {
        self.payload.push(id);
        self.payload.push(body.len() as u8);
        self.payload.extend_from_slice(body);
        self
    }

    /// Append raw payload bytes
    #[must_use]
    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Build the full exchange
    ///
    /// # Errors
    ///
    /// Returns `FrameError::PayloadOverflow` if the payload exceeds the
    /// frame capacity.
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(self) -> Result<Vec<u8>, FrameError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadOverflow {
                len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = vec![0u8; FRAME_SIZE];
        buf[0] = len as u8;
        buf[SESSION_ID_OFFSET] = self.session.unwrap_or(SessionId::LOGGED_OUT).as_u8();
        buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].copy_from_slice(&self.payload);
        let crc = frame_crc(&buf[..FRAME_HEADER_SIZE + len]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }
}
