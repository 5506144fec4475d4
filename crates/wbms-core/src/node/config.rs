//! Stack and network configuration

use crate::error::ConfigError;
use crate::link::LinkConfig;
use crate::port::PortAddress;
use serde::{Deserialize, Serialize};

/// Most managers a network can have
pub const MAX_MANAGERS: usize = 2;

/// Stack-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Port arena capacity
    pub max_ports: usize,

    /// Networks that may be open at once
    pub max_networks: usize,

    /// Completion queue capacity (at least one entry per port)
    pub completion_queue_depth: usize,

    /// Link detection thresholds applied to every port
    pub link: LinkConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_ports: 4,
            max_networks: 2,
            completion_queue_depth: 8,
            link: LinkConfig::default(),
        }
    }
}

impl StackConfig {
    /// Check the configuration for values the stack cannot run with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_ports == 0 {
            return Err(ConfigError::Zero("max_ports"));
        }
        if self.max_networks == 0 {
            return Err(ConfigError::Zero("max_networks"));
        }
        if self.completion_queue_depth < self.max_ports {
            return Err(ConfigError::Invalid(
                format!(
                    "completion_queue_depth {} is below max_ports {}",
                    self.completion_queue_depth, self.max_ports
                )
                .into(),
            ));
        }
        if self.link.lost_threshold == 0 || self.link.up_threshold == 0 {
            return Err(ConfigError::Zero("link threshold"));
        }
        Ok(())
    }
}

/// Session establishment settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Time allowed for one connect round
    pub round_timeout_ms: u32,

    /// Rounds re-sent before pending managers are given up on
    pub max_retries: u8,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            round_timeout_ms: 1000,
            max_retries: 3,
        }
    }
}

/// Generic request settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Time allowed for a response
    pub timeout_ms: u32,

    /// Re-issues before the request expires
    pub max_retries: u8,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            max_retries: 3,
        }
    }
}

/// Per-network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// One or two manager links
    pub managers: Vec<PortAddress>,

    /// Re-establish the session when a lost link comes back
    pub auto_maintain: bool,

    /// Connect state machine settings
    pub connect: ConnectConfig,

    /// Generic request settings
    pub request: RequestConfig,

    /// Longest a command may hold the network lock
    pub lock_watchdog_ms: u32,

    /// Status poll period per connected manager (`None` disables polling)
    pub background_interval_ms: Option<u32>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            managers: Vec::new(),
            auto_maintain: true,
            connect: ConnectConfig::default(),
            request: RequestConfig::default(),
            lock_watchdog_ms: 10_000,
            background_interval_ms: None,
        }
    }
}

impl NetworkConfig {
    /// Create a configuration for the given managers with defaults elsewhere
    #[must_use]
    pub fn with_managers(managers: impl IntoIterator<Item = PortAddress>) -> Self {
        Self {
            managers: managers.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Check whether two managers are configured
    #[must_use]
    pub fn is_dual(&self) -> bool {
        self.managers.len() == MAX_MANAGERS
    }

    /// Check the configuration for values a network cannot run with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.managers.as_slice() {
            [] => return Err(ConfigError::NoManagers),
            [a, b] if a == b => return Err(ConfigError::DuplicateManager(*a)),
            m if m.len() > MAX_MANAGERS => return Err(ConfigError::TooManyManagers(m.len())),
            _ => {}
        }

        if self.connect.round_timeout_ms == 0 {
            return Err(ConfigError::Zero("connect.round_timeout_ms"));
        }
        if self.request.timeout_ms == 0 {
            return Err(ConfigError::Zero("request.timeout_ms"));
        }
        for (name, value) in [
            ("connect.round_timeout_ms", self.connect.round_timeout_ms),
            ("request.timeout_ms", self.request.timeout_ms),
        ] {
            if value > u32::MAX / 2 {
                return Err(ConfigError::Invalid(
                    format!("{name} {value} too close to the clock wrap").into(),
                ));
            }
        }
        if self.lock_watchdog_ms == 0 {
            return Err(ConfigError::Zero("lock_watchdog_ms"));
        }
        if self.background_interval_ms == Some(0) {
            return Err(ConfigError::Zero("background_interval_ms"));
        }
        Ok(())
    }
}
