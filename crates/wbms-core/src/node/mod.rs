//! Session orchestration for wBMS networks.
//!
//! This module sits on top of the [`TransportManager`](crate::mux::TransportManager)
//! and provides:
//! - The connect state machine for one or two managers
//! - Disconnect, generic commands, mode changes and manager resets
//! - Per-network command locks with a watchdog
//! - Events and completions delivered through user callbacks
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wbms_core::node::{Callbacks, NetworkConfig, Stack, StackConfig};
//! use wbms_core::PortAddress;
//! use wbms_transport::{ScriptedDriver, SystemClock};
//!
//! let (driver, _script) = ScriptedDriver::new();
//! let mut stack = Stack::new(
//!     StackConfig::default(),
//!     Box::new(driver),
//!     Arc::new(SystemClock::new()),
//! )?;
//!
//! let callbacks = Callbacks::new(
//!     |net, done| println!("{net}: {:?} -> {:?}", done.api, done.result),
//!     |net, event| println!("{net}: {event:?}"),
//! );
//! let config = NetworkConfig::with_managers([PortAddress::new(0, 0), PortAddress::new(0, 1)]);
//! let net = stack.open_network(config, callbacks)?;
//! stack.connect(net)?;
//!
//! loop {
//!     stack.tick();
//!     stack.process_task();
//! #   break;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod connect;
pub mod event;
pub mod lock;
pub mod network;
pub mod stack;

pub use config::{ConnectConfig, MAX_MANAGERS, NetworkConfig, RequestConfig, StackConfig};
pub use connect::{ConnectOutcome, ConnectState, PeerResolution, PeerState};
pub use event::{
    Api, Callbacks, Completion, CompletionCallback, CompletionData, ConnectInfo, Event,
    EventCallback, ManagerInfo, NetworkId,
};
pub use lock::{FlagLock, Lock, LockGuard};
pub use network::Network;
pub use stack::Stack;
