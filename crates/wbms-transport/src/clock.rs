//! Monotonic millisecond clocks.
//!
//! Timestamps are `u32` milliseconds and wrap after ~49 days; consumers
//! compare them with wrapping subtraction.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Monotonic millisecond timestamp source
pub trait Clock: Send + Sync {
    /// Current time in milliseconds (wrapping)
    fn now_ms(&self) -> u32;
}

/// Clock backed by `std::time::Instant`
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose epoch is now
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u32 {
        // Truncation is the wrap.
        self.origin.elapsed().as_millis() as u32
    }
}

/// Manually advanced clock for simulation and tests.
///
/// Clones share the same time source.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU32>,
}

impl ManualClock {
    /// Create a clock starting at `start` milliseconds
    #[must_use]
    pub fn starting_at(start: u32) -> Self {
        Self {
            now: Arc::new(AtomicU32::new(start)),
        }
    }

    /// Move time forward (wrapping)
    pub fn advance(&self, ms: u32) {
        let now = self.now.load(Ordering::Acquire);
        self.now.store(now.wrapping_add(ms), Ordering::Release);
    }

    /// Jump to an absolute time
    pub fn set(&self, ms: u32) {
        self.now.store(ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::Acquire)
    }
}
