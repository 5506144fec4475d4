//! Events, completions and the callbacks that deliver them

use crate::error::ResultCode;
use crate::packet::Role;
use crate::port::PortAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an open network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId(pub u16);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net{}", self.0)
    }
}

/// Unsolicited notification, delivered from `Stack::process_task`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A manager issued us a session
    Connected(PortAddress),
    /// A manager session ended (disconnect or link loss)
    Disconnected(PortAddress),
    /// The link to a manager came up
    PortUp(PortAddress),
    /// The link to a manager was lost
    PortDown(PortAddress),
    /// The network lock was held past the watchdog and force-released
    LockReleaseFault {
        /// Command holding the lock
        api: Api,
    },
}

/// Network API that produced a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Api {
    /// Session establishment
    Connect,
    /// Session teardown
    Disconnect,
    /// Generic command
    Command,
    /// System mode change
    SetMode,
    /// Manager reset
    ResetManager,
}

/// Per-manager outcome of a connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerInfo {
    /// Manager link
    pub address: PortAddress,
    /// Negotiated role
    pub role: Role,
    /// Reported protocol version
    pub protocol_version: u16,
    /// Session held
    pub connected: bool,
}

/// Data reported with a connect completion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectInfo {
    /// Shared configuration hash (zero unless the connect succeeded)
    pub config_hash: u32,
    /// Alternate topology active
    pub dmh_active: bool,
    /// Measurement packets to buffer per interval
    pub measurement_buffer_len: usize,
    /// Managers in configuration order
    pub managers: Vec<ManagerInfo>,
}

/// Payload of a completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionData {
    /// No data
    None,
    /// Connect result
    Connect(ConnectInfo),
    /// Response body of a generic command
    Command {
        /// Command id
        id: u8,
        /// Response data
        body: Vec<u8>,
    },
}

/// Terminal result of one network API call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// API that was called
    pub api: Api,
    /// Result code
    pub result: ResultCode,
    /// Result data
    pub data: CompletionData,
}

/// Completion callback
pub type CompletionCallback = Box<dyn FnMut(NetworkId, &Completion) + Send>;

/// Event callback
pub type EventCallback = Box<dyn FnMut(NetworkId, &Event) + Send>;

/// Callbacks registered when a network is opened
#[derive(Default)]
pub struct Callbacks {
    /// Receives exactly one completion per accepted API call
    pub on_completion: Option<CompletionCallback>,
    /// Receives unsolicited events
    pub on_event: Option<EventCallback>,
}

impl Callbacks {
    /// Create callbacks from two closures
    pub fn new(
        on_completion: impl FnMut(NetworkId, &Completion) + Send + 'static,
        on_event: impl FnMut(NetworkId, &Event) + Send + 'static,
    ) -> Self {
        Self {
            on_completion: Some(Box::new(on_completion)),
            on_event: Some(Box::new(on_event)),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_completion", &self.on_completion.is_some())
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}
