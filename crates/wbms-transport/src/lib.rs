//! # wBMS Transport
//!
//! Physical transport interfaces for the wBMS link layer.
//!
//! This crate provides:
//! - The `PhysicalDriver` trait for full-duplex SPI exchanges with a manager
//! - Monotonic millisecond clocks (`SystemClock`, `ManualClock`)
//! - Periodic alarms that drive the polling tick (`TokioAlarm`)
//! - A scripted driver for host-side simulation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alarm;
pub mod clock;
pub mod driver;
pub mod scripted;

pub use alarm::{PeriodicAlarm, TokioAlarm};
pub use clock::{Clock, ManualClock, SystemClock};
pub use driver::{
    ChipSelect, CompletionFn, DeviceId, PhysicalDriver, TransportError, TransportResult,
};
pub use scripted::{Exchange, Responder, ScriptHandle, ScriptedDriver};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Period of the polling tick (one exchange per device per tick)
    pub tick_period: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(1),
        }
    }
}
