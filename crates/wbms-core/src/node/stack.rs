//! The stack: one transport manager shared by every open network.
//!
//! `Stack` is the public entry point. `tick` runs from the periodic alarm
//! and only moves frames; `process_task` runs in the foreground and is the
//! single place where decoded traffic reaches the networks and callbacks
//! fire.

use super::config::{NetworkConfig, StackConfig};
use super::event::{Api, Callbacks, NetworkId};
use super::lock::{FlagLock, Lock, LockGuard};
use super::network::Network;
use crate::error::{ApiError, ConfigError};
use crate::mux::{LinkReport, PacketSink, TransportManager};
use crate::packet::{CMD_SET_MODE, Message};
use crate::port::{PortAddress, PortHandle, PortStats};
use std::collections::VecDeque;
use std::sync::Arc;
use wbms_transport::{Clock, PhysicalDriver};

enum Inbound {
    LoggedOut(PortHandle, Message),
    LoggedIn(PortHandle, Message),
    Link(PortHandle, LinkReport),
}

impl Inbound {
    fn port(&self) -> PortHandle {
        match self {
            Self::LoggedOut(port, _) | Self::LoggedIn(port, _) | Self::Link(port, _) => *port,
        }
    }
}

/// Decoded traffic waiting for the next `process_task`
#[derive(Default)]
struct Inbox {
    queue: VecDeque<Inbound>,
}

impl PacketSink for Inbox {
    fn on_logged_out(&mut self, port: PortHandle, message: Message) {
        self.queue.push_back(Inbound::LoggedOut(port, message));
    }

    fn on_logged_in(&mut self, port: PortHandle, message: Message) {
        self.queue.push_back(Inbound::LoggedIn(port, message));
    }

    fn on_link(&mut self, port: PortHandle, report: LinkReport) {
        self.queue.push_back(Inbound::Link(port, report));
    }
}

/// Host-side network interface stack
pub struct Stack {
    config: StackConfig,
    mux: TransportManager,
    clock: Arc<dyn Clock>,
    networks: Vec<Option<Network>>,
    inbox: Inbox,
    lifecycle: Arc<dyn Lock>,
}

impl Stack {
    /// Create a stack over a physical driver
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn new(
        config: StackConfig,
        driver: Box<dyn PhysicalDriver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mux = TransportManager::new(
            driver,
            config.max_ports,
            config.completion_queue_depth,
            config.link,
        );
        let networks = (0..config.max_networks).map(|_| None).collect();
        Ok(Self {
            config,
            mux,
            clock,
            networks,
            inbox: Inbox::default(),
            lifecycle: Arc::new(FlagLock::new()),
        })
    }

    /// Serialize network open/close with other holders of `lock`
    #[must_use]
    pub fn with_lifecycle_lock(mut self, lock: Arc<dyn Lock>) -> Self {
        self.lifecycle = lock;
        self
    }

    /// Stack configuration
    #[must_use]
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Transport manager (read-only)
    #[must_use]
    pub fn transport(&self) -> &TransportManager {
        &self.mux
    }

    /// Open a network with a [`FlagLock`] as its command lock
    ///
    /// # Errors
    ///
    /// See [`Stack::open_network_with_lock`].
    pub fn open_network(
        &mut self,
        config: NetworkConfig,
        callbacks: Callbacks,
    ) -> Result<NetworkId, ApiError> {
        self.open_network_with_lock(config, callbacks, Box::new(FlagLock::new()))
    }

    /// Open a network and register a port for each of its managers.
    ///
    /// # Errors
    ///
    /// - `ApiError::Busy` if another open or close holds the lifecycle lock
    /// - `ApiError::Config` for an invalid configuration
    /// - `ApiError::NoSlot` when every network slot is taken
    /// - `ApiError::Registry` if a port cannot be registered; ports already
    ///   registered for this network are unregistered again
    pub fn open_network_with_lock(
        &mut self,
        config: NetworkConfig,
        callbacks: Callbacks,
        lock: Box<dyn Lock>,
    ) -> Result<NetworkId, ApiError> {
        let _guard = LockGuard::acquire(&*self.lifecycle)?;
        config.validate()?;

        let index = self
            .networks
            .iter()
            .position(Option::is_none)
            .ok_or(ApiError::NoSlot)?;
        let owner = u16::try_from(index).map_err(|_| ApiError::NoSlot)?;

        let mut ports = Vec::with_capacity(config.managers.len());
        for &address in &config.managers {
            match self.mux.register(address, owner) {
                Ok(port) => ports.push(port),
                Err(e) => {
                    for port in ports {
                        self.mux.unregister(port);
                    }
                    return Err(e.into());
                }
            }
        }

        let id = NetworkId(owner);
        tracing::info!("Opened {} with managers {:?}", id, config.managers);
        self.networks[index] = Some(Network::new(id, config, ports, callbacks, lock));
        Ok(id)
    }

    /// Close a network and unregister its ports.
    ///
    /// A command still in progress is dropped without a completion.
    ///
    /// # Errors
    ///
    /// - `ApiError::Busy` if another open or close holds the lifecycle lock
    /// - `ApiError::UnknownNetwork` if `id` is not open
    pub fn close_network(&mut self, id: NetworkId) -> Result<(), ApiError> {
        let _guard = LockGuard::acquire(&*self.lifecycle)?;
        let network = self
            .networks
            .get_mut(usize::from(id.0))
            .and_then(Option::take)
            .ok_or(ApiError::UnknownNetwork)?;
        for &port in network.ports() {
            self.mux.unregister(port);
        }
        tracing::info!("Closed {}", id);
        Ok(())
    }

    /// Open network by id
    #[must_use]
    pub fn network(&self, id: NetworkId) -> Option<&Network> {
        self.networks.get(usize::from(id.0)).and_then(Option::as_ref)
    }

    fn with_network<T>(
        &mut self,
        id: NetworkId,
        f: impl FnOnce(&mut Network, &mut TransportManager, u32) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let now = self.clock.now_ms();
        let network = self
            .networks
            .get_mut(usize::from(id.0))
            .and_then(Option::as_mut)
            .ok_or(ApiError::UnknownNetwork)?;
        f(network, &mut self.mux, now)
    }

    /// Establish sessions with every manager of the network.
    ///
    /// Completes with `Api::Connect` and the connect data.
    ///
    /// # Errors
    ///
    /// `ApiError::Busy` if a connect is running or the lock is held.
    pub fn connect(&mut self, id: NetworkId) -> Result<(), ApiError> {
        self.with_network(id, |net, mux, now| net.connect(mux, now))
    }

    /// End the sessions with every connected manager.
    ///
    /// # Errors
    ///
    /// `ApiError::NotConnected` if no manager is connected, `ApiError::Busy`
    /// if the lock is held.
    pub fn disconnect(&mut self, id: NetworkId) -> Result<(), ApiError> {
        self.with_network(id, |net, mux, now| net.disconnect(mux, now))
    }

    /// Send a generic command to the primary manager (or the only one
    /// connected).
    ///
    /// # Errors
    ///
    /// - `ApiError::InvalidParameter` for an id outside the command range
    /// - `ApiError::NotConnected` if no manager is connected
    /// - `ApiError::Busy` if the lock is held
    pub fn submit_command(
        &mut self,
        id: NetworkId,
        command: u8,
        body: Vec<u8>,
    ) -> Result<(), ApiError> {
        self.with_network(id, |net, mux, now| {
            net.submit_command(mux, now, Api::Command, command, body)
        })
    }

    /// Change the system mode.
    ///
    /// # Errors
    ///
    /// As [`Stack::submit_command`].
    pub fn set_mode(&mut self, id: NetworkId, mode: u8) -> Result<(), ApiError> {
        self.with_network(id, |net, mux, now| {
            net.submit_command(mux, now, Api::SetMode, CMD_SET_MODE, vec![mode])
        })
    }

    /// Reset one manager. The link loss that follows is not reported as a
    /// disconnect.
    ///
    /// # Errors
    ///
    /// - `ApiError::InvalidParameter` if `address` is not in the network
    /// - `ApiError::NotConnected` if that manager is not connected
    /// - `ApiError::Busy` if the lock is held
    pub fn reset_manager(&mut self, id: NetworkId, address: PortAddress) -> Result<(), ApiError> {
        self.with_network(id, |net, mux, now| net.reset_manager(mux, now, address))
    }

    /// Statistics of one manager link
    ///
    /// # Errors
    ///
    /// `ApiError::UnknownNetwork` or `ApiError::InvalidParameter` if the
    /// network or manager does not exist.
    pub fn port_statistics(
        &self,
        id: NetworkId,
        address: PortAddress,
    ) -> Result<PortStats, ApiError> {
        let network = self.network(id).ok_or(ApiError::UnknownNetwork)?;
        network
            .port_for(address)
            .and_then(|port| self.mux.stats(port))
            .ok_or_else(|| {
                ApiError::InvalidParameter(format!("{address} is not a manager of {id}").into())
            })
    }

    /// Check whether a manager currently holds a session
    #[must_use]
    pub fn is_manager_connected(&self, id: NetworkId, address: PortAddress) -> bool {
        self.network(id)
            .and_then(|net| net.port_for(address))
            .is_some_and(|port| self.mux.is_connected(port))
    }

    /// Check whether a manager's link is up
    #[must_use]
    pub fn is_link_available(&self, id: NetworkId, address: PortAddress) -> bool {
        self.network(id)
            .and_then(|net| net.port_for(address))
            .is_some_and(|port| self.mux.is_link_available(port))
    }

    /// Polling tick: drain completions, decode, submit the next exchanges
    pub fn tick(&mut self) {
        self.mux.tick(&mut self.inbox);
    }

    /// Foreground processing: route decoded traffic, run timers, retries
    /// and reconnects, then deliver events and completions.
    pub fn process_task(&mut self) {
        let now = self.clock.now_ms();

        while let Some(item) = self.inbox.queue.pop_front() {
            let Some(owner) = self.mux.owner(item.port()) else {
                continue;
            };
            let Some(network) = self
                .networks
                .get_mut(usize::from(owner))
                .and_then(Option::as_mut)
            else {
                continue;
            };
            match item {
                Inbound::LoggedOut(port, message) => {
                    network.on_logged_out(&mut self.mux, port, message);
                }
                Inbound::LoggedIn(port, message) => {
                    network.on_logged_in(&mut self.mux, port, message);
                }
                Inbound::Link(port, report) => network.on_link(&self.mux, port, report),
            }
        }

        for network in self.networks.iter_mut().flatten() {
            network.poll(&mut self.mux, now);
            network.deliver();
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("config", &self.config)
            .field("networks", &self.networks)
            .field("inbox", &self.inbox.queue.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::event::{Completion, Event};
    use std::sync::Mutex;
    use wbms_transport::{ManualClock, ScriptHandle, ScriptedDriver};

    type Log = Arc<Mutex<Vec<Completion>>>;

    fn stack(max_networks: usize) -> (Stack, ScriptHandle, ManualClock) {
        let (driver, script) = ScriptedDriver::new();
        script.set_auto_complete(true);
        let clock = ManualClock::starting_at(1_000);
        let config = StackConfig {
            max_networks,
            ..StackConfig::default()
        };
        let stack = Stack::new(config, Box::new(driver), Arc::new(clock.clone())).unwrap();
        (stack, script, clock)
    }

    fn recording() -> (Callbacks, Log, Arc<Mutex<Vec<Event>>>) {
        let completions: Log = Arc::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let (c, e) = (Arc::clone(&completions), Arc::clone(&events));
        let callbacks = Callbacks::new(
            move |_, done| c.lock().unwrap().push(done.clone()),
            move |_, event| e.lock().unwrap().push(event.clone()),
        );
        (callbacks, completions, events)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let (driver, _script) = ScriptedDriver::new();
        let config = StackConfig {
            max_ports: 0,
            ..StackConfig::default()
        };
        let result = Stack::new(config, Box::new(driver), Arc::new(ManualClock::default()));
        assert!(matches!(result, Err(ConfigError::Zero("max_ports"))));
    }

    #[test]
    fn test_open_and_close_network() {
        let (mut stack, script, _clock) = stack(2);
        let managers = [PortAddress::new(0, 0), PortAddress::new(0, 1)];
        let id = stack
            .open_network(NetworkConfig::with_managers(managers), Callbacks::default())
            .unwrap();
        assert_eq!(id, NetworkId(0));
        assert_eq!(stack.transport().handles().len(), 2);
        assert_eq!(script.init_calls().len(), 1);

        stack.close_network(id).unwrap();
        assert!(stack.network(id).is_none());
        assert!(stack.transport().handles().is_empty());
        assert_eq!(script.close_calls().len(), 1);
        assert_eq!(stack.close_network(id), Err(ApiError::UnknownNetwork));
    }

    #[test]
    fn test_open_network_slots() {
        let (mut stack, _script, _clock) = stack(1);
        let first = NetworkConfig::with_managers([PortAddress::new(0, 0)]);
        let second = NetworkConfig::with_managers([PortAddress::new(1, 0)]);
        stack.open_network(first, Callbacks::default()).unwrap();
        assert_eq!(
            stack.open_network(second, Callbacks::default()),
            Err(ApiError::NoSlot)
        );
    }

    #[test]
    fn test_open_network_rolls_back_ports() {
        let (mut stack, _script, _clock) = stack(2);
        let taken = PortAddress::new(0, 1);
        stack
            .open_network(NetworkConfig::with_managers([taken]), Callbacks::default())
            .unwrap();

        let clash = NetworkConfig::with_managers([PortAddress::new(0, 0), taken]);
        let result = stack.open_network(clash, Callbacks::default());
        assert!(matches!(result, Err(ApiError::Registry(_))));
        assert_eq!(stack.transport().handles().len(), 1);
        assert!(stack.network(NetworkId(1)).is_none());
    }

    #[test]
    fn test_open_network_rejects_invalid_config() {
        let (mut stack, _script, _clock) = stack(1);
        let result = stack.open_network(NetworkConfig::default(), Callbacks::default());
        assert_eq!(result, Err(ApiError::Config(ConfigError::NoManagers)));
    }

    #[test]
    fn test_shared_lifecycle_lock() {
        let (stack, _script, _clock) = stack(1);
        let shared: Arc<FlagLock> = Arc::new(FlagLock::new());
        let mut stack = stack.with_lifecycle_lock(Arc::clone(&shared) as Arc<dyn Lock>);

        assert!(shared.try_acquire());
        let config = NetworkConfig::with_managers([PortAddress::new(0, 0)]);
        assert_eq!(
            stack.open_network(config.clone(), Callbacks::default()),
            Err(ApiError::Busy)
        );
        shared.release();
        assert!(stack.open_network(config, Callbacks::default()).is_ok());
        assert!(!shared.is_held());
    }

    #[test]
    fn test_unknown_network() {
        let (mut stack, _script, _clock) = stack(1);
        assert_eq!(stack.connect(NetworkId(0)), Err(ApiError::UnknownNetwork));
        assert_eq!(stack.connect(NetworkId(7)), Err(ApiError::UnknownNetwork));
        assert_eq!(
            stack.port_statistics(NetworkId(0), PortAddress::new(0, 0)),
            Err(ApiError::UnknownNetwork)
        );
    }

    #[test]
    fn test_commands_need_a_session() {
        let (mut stack, _script, _clock) = stack(1);
        let id = stack
            .open_network(
                NetworkConfig::with_managers([PortAddress::new(0, 0)]),
                Callbacks::default(),
            )
            .unwrap();
        assert_eq!(stack.disconnect(id), Err(ApiError::NotConnected));
        assert_eq!(stack.set_mode(id, 2), Err(ApiError::NotConnected));
        assert!(matches!(
            stack.submit_command(id, 0x05, Vec::new()),
            Err(ApiError::InvalidParameter(_))
        ));
        assert!(matches!(
            stack.reset_manager(id, PortAddress::new(3, 3)),
            Err(ApiError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_connect_times_out_without_manager() {
        let (mut stack, script, clock) = stack(1);
        let (callbacks, completions, _events) = recording();
        let address = PortAddress::new(0, 0);
        let id = stack
            .open_network(NetworkConfig::with_managers([address]), callbacks)
            .unwrap();

        stack.connect(id).unwrap();
        assert_eq!(stack.connect(id), Err(ApiError::Busy));

        // Nothing answers: four rounds of one second each.
        for _ in 0..5 {
            stack.tick();
            stack.process_task();
            clock.advance(1_001);
        }
        stack.process_task();

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].api, Api::Connect);
        assert_eq!(completions[0].result, crate::ResultCode::Timeout);
        assert!(stack.network(id).unwrap().busy_with().is_none());
        assert!(!script.sent().is_empty());
        assert!(stack.port_statistics(id, address).unwrap().tx_frames > 0);
    }
}
