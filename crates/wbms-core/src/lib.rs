//! # wBMS Core
//!
//! Transport and session layer of the wireless battery-management network
//! interface.
//!
//! This crate provides:
//! - Fixed-size frame encoding and decoding with CRC32 integrity
//! - Sub-packet splitting and typed message decoding
//! - Per-port receive buffer pools and the port registry
//! - The per-tick frame multiplexer (idle / user / background traffic)
//! - Link presence detection
//! - The generic single-outstanding request engine
//! - Session establishment with one or two managers (`node` module)
//! - A simulated manager for host-side testing (`sim` module)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Node (Stack / Network)                    │
//! │   (connect state machine, requests, locks, events, callbacks)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Transport Manager                         │
//! │   (port registry, multiplexer, link monitor, receive decode)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Frames                                    │
//! │   (256-byte exchanges: length, session id, payload, CRC32)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod buffer;
pub mod error;
pub mod frame;
pub mod link;
pub mod mux;
pub mod node;
pub mod packet;
pub mod port;
pub mod request;
pub mod sim;

pub use error::{
    ApiError, ConfigError, Error, FrameError, PacketError, QueueError, RegistryError,
    RequestError, ResultCode,
};
pub use frame::{FrameBuf, FrameBuilder, FrameKind, SessionId, frame_crc, parse_frame};
pub use link::{LinkConfig, LinkMonitor, LinkTransition};
pub use mux::{LinkReport, PacketSink, TransportManager};
pub use node::{
    Api, Callbacks, Completion, CompletionData, ConnectInfo, Event, ManagerInfo, Network,
    NetworkConfig, NetworkId, Stack, StackConfig,
};
pub use packet::{Message, Role, SubPacket};
pub use port::{PortAddress, PortHandle, PortStats, TrafficClass};
pub use request::{RequestEngine, TimeoutOutcome};
pub use sim::{SimConfig, SimManager, SimNetwork};

/// Size of every exchange on the link, in bytes
pub const FRAME_SIZE: usize = 256;

/// Header size: payload length byte + session id byte
pub const FRAME_HEADER_SIZE: usize = 2;

/// CRC32 trailer size
pub const FRAME_CRC_SIZE: usize = 4;

/// Largest payload a frame can carry
pub const MAX_PAYLOAD_SIZE: usize = FRAME_SIZE - FRAME_HEADER_SIZE - FRAME_CRC_SIZE;

/// Offset of the session id byte
pub const SESSION_ID_OFFSET: usize = 1;

/// Offset of the big-endian CRC32 trailer
pub const CRC_OFFSET: usize = FRAME_SIZE - FRAME_CRC_SIZE;

/// CRC32 seed shared with the managers
pub const CRC_SEED: u32 = 0x5A5A_5A5A;

/// Sub-packet header: message id + message length
pub const SUBPACKET_HEADER_SIZE: usize = 2;

/// Receive slots owned by each port
pub const RX_SLOTS_PER_PORT: usize = 2;
