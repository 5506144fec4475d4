//! Transport endpoints ("ports").
//!
//! A port is one physical link to a manager: a bus plus a chip-select line.
//! It owns its receive slots, its three outgoing frames, its statistics and
//! its link/session state. Ports live in the [`TransportManager`] arena and
//! are addressed by generation-checked [`PortHandle`]s.
//!
//! [`TransportManager`]: crate::mux::TransportManager

use crate::buffer::RxPool;
use crate::frame::{FrameBuf, SessionId};
use crate::link::{LinkConfig, LinkMonitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use wbms_transport::{ChipSelect, DeviceId};

/// Physical address of a manager link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortAddress {
    /// Bus
    pub device: DeviceId,
    /// Chip select on the bus
    pub chip_select: ChipSelect,
}

impl PortAddress {
    /// Create a new port address
    #[must_use]
    pub const fn new(device: u8, chip_select: u8) -> Self {
        Self {
            device: DeviceId(device),
            chip_select: ChipSelect(chip_select),
        }
    }
}

impl fmt::Display for PortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.chip_select)
    }
}

/// Generation-checked reference to a registered port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}.{}", self.index, self.generation)
    }
}

/// Logical frame class chosen for one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficClass {
    /// Empty frame (keep-alive / resynchronisation)
    Idle,
    /// User-initiated commands
    User,
    /// Periodic background commands
    Background,
}

/// Rolling per-port statistics (all counters wrap)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStats {
    /// Exchanges submitted
    pub tx_frames: u32,
    /// Idle frames submitted
    pub idle_frames_sent: u32,
    /// User frames submitted
    pub user_frames_sent: u32,
    /// Background frames submitted
    pub background_frames_sent: u32,
    /// Frames decoded
    pub rx_frames: u32,
    /// Frames carrying our session id
    pub valid_frames: u32,
    /// Frames carrying the logged-out sentinel or a foreign session
    pub logged_out_frames: u32,
    /// Data frames from a session that is no longer ours
    pub stale_frames: u32,
    /// Integrity failures
    pub rx_errors: u32,
    /// Transmit submissions refused by the driver
    pub tx_errors: u32,
    /// Ticks dropped for want of a receive slot
    pub alloc_failures: u32,
    /// Sub-packets running past the payload
    pub truncated_packets: u32,
    /// Sub-packets with an unknown id or layout
    pub unknown_packets: u32,
    /// Link-up transitions
    pub link_up_count: u32,
    /// Link-lost transitions
    pub link_down_count: u32,
}

/// Owning key of a port (network id), used only to route events
pub type OwnerKey = u16;

pub(crate) struct Port {
    pub(crate) address: PortAddress,
    pub(crate) owner: OwnerKey,
    pub(crate) rx: RxPool,
    pub(crate) in_flight: Option<usize>,
    pub(crate) idle: FrameBuf,
    pub(crate) user: FrameBuf,
    pub(crate) background: FrameBuf,
    pub(crate) session: SessionId,
    pub(crate) connected: bool,
    pub(crate) link: LinkMonitor,
    pub(crate) has_completed: bool,
    pub(crate) previous_was_user: bool,
    pub(crate) transmitted: bool,
    pub(crate) reset_in_progress: bool,
    pub(crate) stats: PortStats,
}

impl Port {
    pub(crate) fn new(address: PortAddress, owner: OwnerKey, link: LinkConfig) -> Self {
        Self {
            address,
            owner,
            rx: RxPool::new(),
            in_flight: None,
            idle: FrameBuf::new(),
            user: FrameBuf::new(),
            background: FrameBuf::new(),
            session: SessionId::LOGGED_OUT,
            connected: false,
            link: LinkMonitor::new(link),
            has_completed: false,
            previous_was_user: false,
            transmitted: false,
            reset_in_progress: false,
            stats: PortStats::default(),
        }
    }

    /// Pick the class of the next outgoing frame
    pub(crate) fn select_class(&self) -> TrafficClass {
        if !self.has_completed {
            return TrafficClass::Idle;
        }
        match (!self.user.is_empty(), !self.background.is_empty()) {
            (true, true) if self.previous_was_user => TrafficClass::Background,
            (true, true) | (true, false) => TrafficClass::User,
            (false, true) => TrafficClass::Background,
            (false, false) => TrafficClass::Idle,
        }
    }

    /// Drop the session and everything queued under it
    pub(crate) fn log_out(&mut self) {
        self.session = SessionId::LOGGED_OUT;
        self.connected = false;
        self.user.clear();
        self.background.clear();
    }
}
