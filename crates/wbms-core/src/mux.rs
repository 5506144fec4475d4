//! Port registry, frame multiplexer and receive decode.
//!
//! [`TransportManager`] owns every port and the physical driver. Once per
//! tick it drains the completion queue (decoding each finished exchange and
//! handing the results to a [`PacketSink`]) and then submits at most one
//! exchange per bus.
//!
//! The driver's completion callback is the only code that may run outside
//! the foreground: it pushes `(device, chip select)` onto a bounded
//! lock-free queue and touches nothing else.

use crate::error::{QueueError, RegistryError};
use crate::frame::{FrameKind, SessionId, parse_frame};
use crate::link::{LinkConfig, LinkTransition};
use crate::packet::{Message, split};
use crate::port::{OwnerKey, Port, PortAddress, PortHandle, PortStats, TrafficClass};
use crate::FRAME_HEADER_SIZE;
use crossbeam_queue::ArrayQueue;
use std::collections::BTreeSet;
use std::sync::Arc;
use wbms_transport::{ChipSelect, CompletionFn, DeviceId, PhysicalDriver};

/// Link state change as seen by the owner of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkReport {
    /// What happened
    pub transition: LinkTransition,
    /// The port held a session when the link was lost
    pub was_connected: bool,
    /// A manager reset was in progress on this port
    pub reset_in_progress: bool,
}

/// Receiver of decoded traffic
pub trait PacketSink {
    /// Message received in a frame carrying the logged-out sentinel
    fn on_logged_out(&mut self, port: PortHandle, message: Message);

    /// Message received in a frame carrying the port's own session id
    fn on_logged_in(&mut self, port: PortHandle, message: Message);

    /// Link came up or went down
    fn on_link(&mut self, port: PortHandle, report: LinkReport);
}

struct Slot {
    generation: u32,
    port: Option<Port>,
}

/// Owner of all ports and the physical driver
pub struct TransportManager {
    driver: Box<dyn PhysicalDriver>,
    slots: Vec<Slot>,
    completions: Arc<ArrayQueue<(DeviceId, ChipSelect)>>,
    link: LinkConfig,
}

enum Route {
    LoggedOut,
    LoggedIn,
}

impl TransportManager {
    /// Create a manager with a fixed number of port slots
    pub fn new(
        driver: Box<dyn PhysicalDriver>,
        max_ports: usize,
        completion_queue_depth: usize,
        link: LinkConfig,
    ) -> Self {
        Self {
            driver,
            slots: (0..max_ports)
                .map(|_| Slot {
                    generation: 0,
                    port: None,
                })
                .collect(),
            completions: Arc::new(ArrayQueue::new(completion_queue_depth.max(1))),
            link,
        }
    }

    /// Register a port.
    ///
    /// The bus is initialised only for the first active port on it.
    ///
    /// # Errors
    ///
    /// - `RegistryError::AlreadyRegistered` for a duplicate address
    /// - `RegistryError::NoSlot` when the arena is full
    /// - `RegistryError::DriverInitFailed` if the driver refuses the bus
    pub fn register(
        &mut self,
        address: PortAddress,
        owner: OwnerKey,
    ) -> Result<PortHandle, RegistryError> {
        if self.ports().any(|(_, port)| port.address == address) {
            return Err(RegistryError::AlreadyRegistered {
                device: address.device,
                chip_select: address.chip_select,
            });
        }

        let index = self
            .slots
            .iter()
            .position(|slot| slot.port.is_none())
            .ok_or(RegistryError::NoSlot)?;

        let bus_active = self
            .ports()
            .any(|(_, port)| port.address.device == address.device);
        if !bus_active {
            let queue = Arc::clone(&self.completions);
            let on_complete: CompletionFn = Arc::new(move |device, chip_select| {
                // Holds at most one entry per port.
                if queue.push((device, chip_select)).is_err() {
                    tracing::error!(
                        "Completion queue full, dropped completion for {} {}",
                        device,
                        chip_select
                    );
                }
            });
            self.driver
                .init(address.device, on_complete)
                .map_err(|e| {
                    tracing::warn!("Driver init failed for {}: {}", address.device, e);
                    RegistryError::DriverInitFailed(address.device)
                })?;
        }

        let slot = &mut self.slots[index];
        slot.port = Some(Port::new(address, owner, self.link));
        tracing::debug!("Registered port {} in slot {}", address, index);
        Ok(PortHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Unregister a port; returns `false` for a stale handle.
    ///
    /// The bus is closed once no active port uses it.
    pub fn unregister(&mut self, handle: PortHandle) -> bool {
        let Some(slot) = self
            .slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
        else {
            return false;
        };
        let Some(port) = slot.port.take() else {
            return false;
        };
        slot.generation = slot.generation.wrapping_add(1);

        let device = port.address.device;
        let shared = self
            .ports()
            .any(|(_, other)| other.address.device == device);
        if !shared {
            if let Err(e) = self.driver.close(device) {
                tracing::warn!("Failed to close {}: {}", device, e);
            }
        }
        tracing::debug!("Unregistered port {}", port.address);
        true
    }

    fn ports(&self) -> impl Iterator<Item = (usize, &Port)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.port.as_ref().map(|port| (i, port)))
    }

    fn port(&self, handle: PortHandle) -> Option<&Port> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.port.as_ref())
    }

    fn port_mut(&mut self, handle: PortHandle) -> Option<&mut Port> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.port.as_mut())
    }

    fn handle_at(&self, index: usize) -> PortHandle {
        PortHandle {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Handles of every active port
    #[must_use]
    pub fn handles(&self) -> Vec<PortHandle> {
        self.ports().map(|(i, _)| self.handle_at(i)).collect()
    }

    /// Find the handle registered for an address
    #[must_use]
    pub fn find(&self, address: PortAddress) -> Option<PortHandle> {
        self.ports()
            .find(|(_, port)| port.address == address)
            .map(|(i, _)| self.handle_at(i))
    }

    /// Physical address of a port
    #[must_use]
    pub fn address(&self, handle: PortHandle) -> Option<PortAddress> {
        self.port(handle).map(|port| port.address)
    }

    /// Owning network of a port
    #[must_use]
    pub fn owner(&self, handle: PortHandle) -> Option<OwnerKey> {
        self.port(handle).map(|port| port.owner)
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self, handle: PortHandle) -> Option<PortStats> {
        self.port(handle).map(|port| port.stats)
    }

    /// Current session id (the logged-out sentinel outside a session)
    #[must_use]
    pub fn session(&self, handle: PortHandle) -> Option<SessionId> {
        self.port(handle).map(|port| port.session)
    }

    /// Check whether the port holds a session
    #[must_use]
    pub fn is_connected(&self, handle: PortHandle) -> bool {
        self.port(handle).is_some_and(|port| port.connected)
    }

    /// Check whether the link is up
    #[must_use]
    pub fn is_link_available(&self, handle: PortHandle) -> bool {
        self.port(handle).is_some_and(|port| port.link.is_available())
    }

    /// Check whether an exchange is outstanding on the port
    #[must_use]
    pub fn is_in_flight(&self, handle: PortHandle) -> bool {
        self.port(handle).is_some_and(|port| port.in_flight.is_some())
    }

    /// Free receive slots on the port
    #[must_use]
    pub fn free_rx_slots(&self, handle: PortHandle) -> usize {
        self.port(handle).map_or(0, |port| port.rx.free_count())
    }

    /// Log the port in under a manager-issued session id
    pub fn log_in(&mut self, handle: PortHandle, session: SessionId) -> bool {
        self.port_mut(handle).is_some_and(|port| {
            port.session = session;
            port.connected = true;
            true
        })
    }

    /// Drop the port's session and its queued frames
    pub fn log_out(&mut self, handle: PortHandle) {
        if let Some(port) = self.port_mut(handle) {
            port.log_out();
        }
    }

    /// Mark a manager reset as running; link loss then stays silent
    pub fn set_reset_in_progress(&mut self, handle: PortHandle, in_progress: bool) {
        if let Some(port) = self.port_mut(handle) {
            port.reset_in_progress = in_progress;
        }
    }

    /// Append a message to the user frame
    ///
    /// # Errors
    ///
    /// Returns `QueueError` for a stale handle or a full frame.
    pub fn queue_user(&mut self, handle: PortHandle, message: &Message) -> Result<(), QueueError> {
        let port = self.port_mut(handle).ok_or(QueueError::UnknownPort)?;
        message.write_to(&mut port.user)
    }

    /// Append a message to the background frame
    ///
    /// # Errors
    ///
    /// Returns `QueueError` for a stale handle or a full frame.
    pub fn queue_background(
        &mut self,
        handle: PortHandle,
        message: &Message,
    ) -> Result<(), QueueError> {
        let port = self.port_mut(handle).ok_or(QueueError::UnknownPort)?;
        message.write_to(&mut port.background)
    }

    /// Drain completions, then submit this tick's exchanges
    pub fn tick(&mut self, sink: &mut dyn PacketSink) {
        self.service(sink);
        self.multiplex();
    }

    /// Decode every completed exchange.
    ///
    /// Returns the number of frames decoded.
    pub fn service(&mut self, sink: &mut dyn PacketSink) -> usize {
        let mut decoded = 0;
        while let Some((device, chip_select)) = self.completions.pop() {
            let address = PortAddress {
                device,
                chip_select,
            };
            let Some(index) = self
                .ports()
                .find(|(_, port)| port.address == address)
                .map(|(i, _)| i)
            else {
                tracing::trace!("Completion for unregistered port {}", address);
                continue;
            };

            let handle = self.handle_at(index);
            let Some(port) = self.slots[index].port.as_mut() else {
                continue;
            };
            let Some(rx_slot) = port.in_flight.take() else {
                tracing::debug!("Spurious completion on {}", address);
                continue;
            };
            port.has_completed = true;
            if port.rx.mark_ready(rx_slot) {
                decode(handle, port, rx_slot, sink);
                decoded += 1;
            }
        }
        decoded
    }

    /// Submit at most one exchange per idle bus
    pub fn multiplex(&mut self) {
        let devices: BTreeSet<DeviceId> = self.ports().map(|(_, p)| p.address.device).collect();

        for device in devices {
            let on_bus: Vec<usize> = self
                .ports()
                .filter(|(_, port)| port.address.device == device)
                .map(|(i, _)| i)
                .collect();

            let busy = on_bus
                .iter()
                .any(|&i| self.slots[i].port.as_ref().is_some_and(|p| p.in_flight.is_some()));
            if busy {
                continue;
            }

            let next = on_bus
                .iter()
                .copied()
                .find(|&i| self.slots[i].port.as_ref().is_some_and(|p| !p.transmitted));
            let Some(index) = next else {
                self.clear_transmitted(&on_bus);
                continue;
            };

            // A failed attempt still counts as this endpoint's turn.
            if !self.transmit(index) {
                if let Some(port) = self.slots[index].port.as_mut() {
                    port.transmitted = true;
                }
            }
            let round_done = on_bus
                .iter()
                .all(|&i| self.slots[i].port.as_ref().is_none_or(|p| p.transmitted));
            if round_done {
                self.clear_transmitted(&on_bus);
            }
        }
    }

    fn clear_transmitted(&mut self, indices: &[usize]) {
        for &i in indices {
            if let Some(port) = self.slots[i].port.as_mut() {
                port.transmitted = false;
            }
        }
    }

    fn transmit(&mut self, index: usize) -> bool {
        let Self { driver, slots, .. } = self;
        let Some(port) = slots[index].port.as_mut() else {
            return false;
        };

        let Some(rx_slot) = port.rx.allocate() else {
            port.stats.alloc_failures = port.stats.alloc_failures.wrapping_add(1);
            tracing::warn!("No free receive slot on {}, tick dropped", port.address);
            return false;
        };

        let class = port.select_class();
        let frame = match class {
            TrafficClass::Idle => &mut port.idle,
            TrafficClass::User => &mut port.user,
            TrafficClass::Background => &mut port.background,
        };
        let tx = frame.seal(port.session);
        let Some(rx) = port.rx.buffer_mut(rx_slot) else {
            port.rx.release(rx_slot);
            return false;
        };

        tracing::trace!(
            "TX {} {:?} header {}",
            port.address,
            class,
            hex::encode(&tx[..FRAME_HEADER_SIZE])
        );

        let address = port.address;
        if let Err(e) = driver.transmit(address.device, address.chip_select, tx, rx) {
            port.rx.release(rx_slot);
            port.stats.tx_errors = port.stats.tx_errors.wrapping_add(1);
            tracing::warn!("Transmit failed on {}: {}", address, e);
            return false;
        }

        port.in_flight = Some(rx_slot);
        port.transmitted = true;
        let stats = &mut port.stats;
        stats.tx_frames = stats.tx_frames.wrapping_add(1);
        match class {
            TrafficClass::Idle => {
                stats.idle_frames_sent = stats.idle_frames_sent.wrapping_add(1);
            }
            TrafficClass::User => {
                stats.user_frames_sent = stats.user_frames_sent.wrapping_add(1);
                port.user.clear();
                port.previous_was_user = true;
            }
            TrafficClass::Background => {
                stats.background_frames_sent = stats.background_frames_sent.wrapping_add(1);
                port.background.clear();
                port.previous_was_user = false;
            }
        }
        true
    }
}

/// Classify one received frame, update counters, dispatch its messages
fn decode(handle: PortHandle, port: &mut Port, rx_slot: usize, sink: &mut dyn PacketSink) {
    let mut messages = Vec::new();
    let mut route = Route::LoggedOut;

    if let Some(raw) = port.rx.frame(rx_slot) {
        let stats = &mut port.stats;
        stats.rx_frames = stats.rx_frames.wrapping_add(1);

        match parse_frame(raw) {
            Ok(FrameKind::Idle { session }) if session == port.session => {
                stats.valid_frames = stats.valid_frames.wrapping_add(1);
                port.link.record_valid_idle();
            }
            Ok(FrameKind::Idle { session }) if session == SessionId::INVALID => {
                stats.rx_errors = stats.rx_errors.wrapping_add(1);
                port.link.record_error();
            }
            Ok(FrameKind::Idle { .. }) => {
                stats.logged_out_frames = stats.logged_out_frames.wrapping_add(1);
                port.link.record_logged_out();
            }
            Ok(FrameKind::Data { session, payload }) if session == SessionId::LOGGED_OUT => {
                stats.logged_out_frames = stats.logged_out_frames.wrapping_add(1);
                port.link.record_logged_out();
                collect(payload, stats, &mut messages);
            }
            Ok(FrameKind::Data { session, .. }) if session != port.session => {
                tracing::debug!("Stale frame from session {} on {}", session, port.address);
                stats.stale_frames = stats.stale_frames.wrapping_add(1);
                stats.logged_out_frames = stats.logged_out_frames.wrapping_add(1);
                port.link.record_logged_out();
            }
            Ok(FrameKind::Data { payload, .. }) => {
                stats.valid_frames = stats.valid_frames.wrapping_add(1);
                port.link.record_valid_data();
                collect(payload, stats, &mut messages);
                route = Route::LoggedIn;
            }
            Err(e) => {
                tracing::debug!("Discarding frame on {}: {}", port.address, e);
                stats.rx_errors = stats.rx_errors.wrapping_add(1);
                port.link.record_error();
            }
        }
    }
    port.rx.release(rx_slot);

    if let Some(transition) = port.link.evaluate(port.connected) {
        let report = LinkReport {
            transition,
            was_connected: port.connected,
            reset_in_progress: port.reset_in_progress,
        };
        match transition {
            LinkTransition::Lost => {
                tracing::info!("Link lost on {}", port.address);
                port.stats.link_down_count = port.stats.link_down_count.wrapping_add(1);
                port.log_out();
            }
            LinkTransition::Established => {
                tracing::info!("Link up on {}", port.address);
                port.stats.link_up_count = port.stats.link_up_count.wrapping_add(1);
                port.reset_in_progress = false;
            }
        }
        sink.on_link(handle, report);
    }

    for message in messages {
        match route {
            Route::LoggedIn => sink.on_logged_in(handle, message),
            Route::LoggedOut if message.is_session_message() => {
                sink.on_logged_out(handle, message);
            }
            Route::LoggedOut => {
                tracing::debug!(
                    "Dropping 0x{:02X} received outside a session on {}",
                    message.id(),
                    port.address
                );
                port.stats.unknown_packets = port.stats.unknown_packets.wrapping_add(1);
            }
        }
    }
}

fn collect(payload: &[u8], stats: &mut PortStats, out: &mut Vec<Message>) {
    for packet in split(payload) {
        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("{}", e);
                stats.truncated_packets = stats.truncated_packets.wrapping_add(1);
                continue;
            }
        };
        match Message::decode(packet) {
            Ok(message) => out.push(message),
            Err(e) => {
                tracing::debug!("Skipping sub-packet: {}", e);
                stats.unknown_packets = stats.unknown_packets.wrapping_add(1);
            }
        }
    }
}
