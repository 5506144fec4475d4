//! Link presence detection.
//!
//! Every decoded frame feeds one of three running counters. The link is
//! declared lost after a run of integrity failures (or, while a session is
//! held, a run of logged-out frames) and declared up again after a run of
//! frames that were at least well formed.

use serde::{Deserialize, Serialize};

/// Link detection thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Running error (or logged-out) count above which the link is lost
    pub lost_threshold: u16,
    /// Running valid + logged-out count above which the link is up
    pub up_threshold: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            lost_threshold: 50,
            up_threshold: 5,
        }
    }
}

/// Link state change reported by [`LinkMonitor::evaluate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransition {
    /// Link declared lost
    Lost,
    /// Link declared available
    Established,
}

/// Per-port running counters and link state
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    config: LinkConfig,
    available: bool,
    running_errors: u16,
    running_logged_out: u16,
    running_valid: u16,
}

impl LinkMonitor {
    /// Create a monitor with the link down
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            available: false,
            running_errors: 0,
            running_logged_out: 0,
            running_valid: 0,
        }
    }

    /// Check whether the link is currently up
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Running integrity error count
    #[must_use]
    pub fn running_errors(&self) -> u16 {
        self.running_errors
    }

    /// Running logged-out count
    #[must_use]
    pub fn running_logged_out(&self) -> u16 {
        self.running_logged_out
    }

    /// Running valid count
    #[must_use]
    pub fn running_valid(&self) -> u16 {
        self.running_valid
    }

    /// Idle frame carrying our own session id
    pub fn record_valid_idle(&mut self) {
        self.running_valid = self.running_valid.saturating_add(1);
        self.running_errors = 0;
    }

    /// Data frame carrying our own session id
    pub fn record_valid_data(&mut self) {
        self.running_valid = self.running_valid.saturating_add(1);
        self.running_errors = 0;
        self.running_logged_out = 0;
    }

    /// Frame failing length or CRC checks, or idle with the invalid id
    pub fn record_error(&mut self) {
        self.running_errors = self.running_errors.saturating_add(1);
    }

    /// Frame carrying the logged-out sentinel or another host's session
    pub fn record_logged_out(&mut self) {
        self.running_logged_out = self.running_logged_out.saturating_add(1);
    }

    /// Apply the thresholds after a frame has been counted.
    ///
    /// `connected` enables loss on a run of logged-out frames: a manager
    /// that forgot our session keeps answering, but logged out.
    pub fn evaluate(&mut self, connected: bool) -> Option<LinkTransition> {
        if self.available {
            let errors = self.running_errors > self.config.lost_threshold;
            let logged_out = connected && self.running_logged_out > self.config.lost_threshold;
            if errors || logged_out {
                tracing::debug!(
                    "Link lost (errors {}, logged out {})",
                    self.running_errors,
                    self.running_logged_out
                );
                self.reset_counters();
                self.available = false;
                return Some(LinkTransition::Lost);
            }
        } else {
            let alive = self.running_logged_out.saturating_add(self.running_valid);
            if alive > self.config.up_threshold {
                tracing::debug!("Link established after {} frames", alive);
                self.reset_counters();
                self.available = true;
                return Some(LinkTransition::Established);
            }
        }
        None
    }

    fn reset_counters(&mut self) {
        self.running_errors = 0;
        self.running_logged_out = 0;
        self.running_valid = 0;
    }
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new(LinkConfig::default())
    }
}
