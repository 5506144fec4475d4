//! Error types for the wBMS link layer.
//!
//! Transport and integrity failures are absorbed below the command boundary
//! (counted, logged, retried by scheduling). Only parameter, state and
//! timeout conditions reach a caller, either synchronously as [`ApiError`]
//! or asynchronously as a [`ResultCode`] in a completion.

use crate::port::PortAddress;
use std::borrow::Cow;
use thiserror::Error;
use wbms_transport::{ChipSelect, DeviceId, TransportError};

/// Umbrella error for the crate
#[derive(Debug, Error)]
pub enum Error {
    /// Frame parsing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Sub-packet decoding error
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Port registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Outgoing frame queueing error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Request engine error
    #[error("request error: {0}")]
    Request(#[from] RequestError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Network API error
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Physical transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Frame-level errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer shorter than one exchange
    #[error("frame too short: expected {expected}, got {actual}")]
    TooShort {
        /// Required size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Declared payload length exceeds the frame capacity
    #[error("payload length {len} exceeds maximum {max}")]
    PayloadOverflow {
        /// Declared length
        len: usize,
        /// Maximum payload
        max: usize,
    },

    /// CRC trailer does not match the header and payload
    #[error("crc mismatch: trailer 0x{received:08X}, computed 0x{computed:08X}")]
    CrcMismatch {
        /// CRC carried in the frame
        received: u32,
        /// CRC computed over the frame
        computed: u32,
    },
}

/// Sub-packet errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Sub-packet runs past the end of the payload
    #[error("truncated sub-packet: declared {declared} bytes, {available} available")]
    Truncated {
        /// Bytes the sub-packet header claims
        declared: usize,
        /// Bytes left in the payload
        available: usize,
    },

    /// Message id not in the catalogue
    #[error("unknown message id 0x{0:02X}")]
    UnknownMessage(u8),

    /// Body length does not fit the message layout
    #[error("message 0x{id:02X}: expected {expected} bytes, got {actual}")]
    BadLength {
        /// Message id
        id: u8,
        /// Required body length
        expected: usize,
        /// Actual body length
        actual: usize,
    },

    /// A field holds a value outside its domain
    #[error("message 0x{id:02X}: invalid {field}")]
    InvalidField {
        /// Message id
        id: u8,
        /// Field name
        field: &'static str,
    },
}

/// Port registry errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// Every registry slot is taken
    #[error("no free port slot")]
    NoSlot,

    /// The same bus/chip-select pair is already registered
    #[error("{device}/{chip_select} already registered")]
    AlreadyRegistered {
        /// Bus
        device: DeviceId,
        /// Chip select
        chip_select: ChipSelect,
    },

    /// The physical driver refused to initialise the bus
    #[error("driver init failed for {0}")]
    DriverInitFailed(DeviceId),
}

/// Errors queueing a message on a port's outgoing frame
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Handle does not name an active port
    #[error("unknown port")]
    UnknownPort,

    /// The pending frame has no room for the sub-packet
    #[error("frame full: need {needed} bytes, {remaining} remaining")]
    FrameFull {
        /// Bytes needed including the sub-packet header
        needed: usize,
        /// Bytes left in the frame
        remaining: usize,
    },

    /// Body longer than a sub-packet can declare
    #[error("message body of {0} bytes exceeds sub-packet limit")]
    BodyTooLong(usize),
}

/// Request engine errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// Zero or out-of-range timeout, or a request is already outstanding
    #[error("invalid request parameter")]
    InvalidParameter,

    /// No valid request, or the token does not match
    #[error("no matching request")]
    Fail,
}

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A network needs at least one manager
    #[error("no managers configured")]
    NoManagers,

    /// At most two managers are supported
    #[error("{0} managers configured, at most 2 supported")]
    TooManyManagers(usize),

    /// The same port is listed twice
    #[error("manager {0} listed twice")]
    DuplicateManager(PortAddress),

    /// A value that must be non-zero is zero
    #[error("{0} must be non-zero")]
    Zero(&'static str),

    /// Any other invalid value
    #[error("invalid configuration: {0}")]
    Invalid(Cow<'static, str>),
}

/// Errors returned synchronously by the network API
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Bad argument
    #[error("invalid parameter: {0}")]
    InvalidParameter(Cow<'static, str>),

    /// Network lock held by another command, or a connect is running
    #[error("network busy")]
    Busy,

    /// Operation needs a connected manager
    #[error("not connected")]
    NotConnected,

    /// Network id does not name an open network
    #[error("unknown network")]
    UnknownNetwork,

    /// Network table is full
    #[error("no free network slot")]
    NoSlot,

    /// Port registry failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Outgoing frame failure
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Request engine failure
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Asynchronous result code carried by completions and responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultCode {
    /// Operation succeeded
    Success = 0x00,
    /// Generic failure
    Fail = 0x01,
    /// Partial result; call again to continue
    InProgress = 0x02,
    /// No response within the retry ceiling
    Timeout = 0x03,
    /// Peers disagree on roles, version or mode
    InvalidState = 0x04,
    /// Peers report different configuration hashes
    ConfigurationMismatch = 0x05,
    /// Manager rejected a parameter
    InvalidParameter = 0x06,
    /// Manager not ready; retry later
    Busy = 0x07,
    /// Manager has no session for this host
    NotConnected = 0x08,
    /// Acknowledgement only; the final response follows
    Interim = 0x09,
}

impl ResultCode {
    /// Check for `Success`
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl TryFrom<u8> for ResultCode {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Success),
            0x01 => Ok(Self::Fail),
            0x02 => Ok(Self::InProgress),
            0x03 => Ok(Self::Timeout),
            0x04 => Ok(Self::InvalidState),
            0x05 => Ok(Self::ConfigurationMismatch),
            0x06 => Ok(Self::InvalidParameter),
            0x07 => Ok(Self::Busy),
            0x08 => Ok(Self::NotConnected),
            0x09 => Ok(Self::Interim),
            _ => Err(PacketError::InvalidField {
                id: 0,
                field: "result code",
            }),
        }
    }
}
