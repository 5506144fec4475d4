//! Scripted physical driver for host-side simulation.
//!
//! `ScriptedDriver` plays the role of the SPI peripheral: every exchange
//! records the transmitted bytes, fills the receive buffer from a per-link
//! queue (or a fallback frame), and reports completion either immediately or
//! when the test releases it. A responder closure can look at each
//! transmitted frame and queue replies for later exchanges, which is how a
//! simulated manager answers a half-duplex, master-polled link.

use crate::driver::{
    ChipSelect, CompletionFn, DeviceId, PhysicalDriver, TransportError, TransportResult,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Reply generator: sees every transmitted frame, returns frames to queue
/// on the same link for subsequent exchanges.
pub type Responder = Box<dyn FnMut(DeviceId, ChipSelect, &[u8]) -> Vec<Vec<u8>> + Send>;

/// One recorded exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Bus used
    pub device: DeviceId,
    /// Chip select used
    pub chip_select: ChipSelect,
    /// Bytes clocked out
    pub tx: Vec<u8>,
}

#[derive(Default)]
struct ScriptState {
    callbacks: BTreeMap<DeviceId, CompletionFn>,
    init_calls: Vec<DeviceId>,
    close_calls: Vec<DeviceId>,
    sent: Vec<Exchange>,
    rx_queues: BTreeMap<(DeviceId, ChipSelect), VecDeque<Vec<u8>>>,
    fallback: BTreeMap<(DeviceId, ChipSelect), Vec<u8>>,
    pending: VecDeque<(DeviceId, ChipSelect)>,
    auto_complete: bool,
    fail_init: BTreeSet<DeviceId>,
    fail_transmits: u32,
    broken_links: BTreeSet<(DeviceId, ChipSelect)>,
    responder: Option<Responder>,
}

fn lock(state: &Mutex<ScriptState>) -> MutexGuard<'_, ScriptState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted driver (owned by the link layer)
pub struct ScriptedDriver {
    state: Arc<Mutex<ScriptState>>,
}

/// Control handle (kept by the simulation or test)
#[derive(Clone)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedDriver {
    /// Create a driver and its control handle.
    ///
    /// Completions are deferred until [`ScriptHandle::complete_all`] unless
    /// auto-completion is switched on.
    #[must_use]
    pub fn new() -> (Self, ScriptHandle) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            ScriptHandle { state },
        )
    }
}

impl PhysicalDriver for ScriptedDriver {
    fn init(&mut self, device: DeviceId, on_complete: CompletionFn) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.init_calls.push(device);
        if state.fail_init.contains(&device) {
            return Err(TransportError::InitFailed(device));
        }
        state.callbacks.insert(device, on_complete);
        Ok(())
    }

    fn transmit(
        &mut self,
        device: DeviceId,
        chip_select: ChipSelect,
        tx: &[u8],
        rx: &mut [u8],
    ) -> TransportResult<()> {
        let completion = {
            let mut state = lock(&self.state);
            let Some(callback) = state.callbacks.get(&device).cloned() else {
                return Err(TransportError::NotInitialized(device));
            };
            if tx.len() != rx.len() {
                return Err(TransportError::LengthMismatch {
                    tx: tx.len(),
                    rx: rx.len(),
                });
            }
            let failed = if state.broken_links.contains(&(device, chip_select)) {
                true
            } else if state.fail_transmits > 0 {
                state.fail_transmits -= 1;
                true
            } else {
                false
            };
            if failed {
                return Err(TransportError::TransmitFailed {
                    device,
                    chip_select,
                });
            }

            state.sent.push(Exchange {
                device,
                chip_select,
                tx: tx.to_vec(),
            });

            let link = (device, chip_select);
            let queued = state.rx_queues.get_mut(&link).and_then(VecDeque::pop_front);
            let reply = queued.or_else(|| state.fallback.get(&link).cloned());
            rx.fill(0);
            if let Some(reply) = reply {
                let n = reply.len().min(rx.len());
                rx[..n].copy_from_slice(&reply[..n]);
            }

            if let Some(mut responder) = state.responder.take() {
                let replies = responder(device, chip_select, tx);
                state.responder = Some(responder);
                state.rx_queues.entry(link).or_default().extend(replies);
            }

            if state.auto_complete {
                Some(callback)
            } else {
                state.pending.push_back(link);
                None
            }
        };

        // Called without the script lock held, like an interrupt firing
        // after the exchange.
        if let Some(callback) = completion {
            callback(device, chip_select);
        }
        Ok(())
    }

    fn close(&mut self, device: DeviceId) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.close_calls.push(device);
        state.callbacks.remove(&device);
        Ok(())
    }
}

impl ScriptHandle {
    /// Report completion for every exchange still outstanding.
    ///
    /// Returns the number of completions delivered.
    pub fn complete_all(&self) -> usize {
        let delivered: Vec<_> = {
            let mut state = lock(&self.state);
            let pending: Vec<_> = state.pending.drain(..).collect();
            pending
                .into_iter()
                .filter_map(|(device, cs)| {
                    state
                        .callbacks
                        .get(&device)
                        .cloned()
                        .map(|cb| (cb, device, cs))
                })
                .collect()
        };
        let count = delivered.len();
        for (callback, device, cs) in delivered {
            callback(device, cs);
        }
        count
    }

    /// Number of exchanges awaiting completion
    #[must_use]
    pub fn pending_completions(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Report completion synchronously inside `transmit`
    pub fn set_auto_complete(&self, enabled: bool) {
        lock(&self.state).auto_complete = enabled;
    }

    /// Queue a frame to be clocked in on a future exchange of this link
    pub fn queue_rx(&self, device: DeviceId, chip_select: ChipSelect, frame: Vec<u8>) {
        lock(&self.state)
            .rx_queues
            .entry((device, chip_select))
            .or_default()
            .push_back(frame);
    }

    /// Frame clocked in when the link's queue is empty (all zeros if unset)
    pub fn set_fallback(&self, device: DeviceId, chip_select: ChipSelect, frame: Vec<u8>) {
        lock(&self.state)
            .fallback
            .insert((device, chip_select), frame);
    }

    /// Install a reply generator
    pub fn set_responder(&self, responder: Responder) {
        lock(&self.state).responder = Some(responder);
    }

    /// Make the next `n` transmit calls fail
    pub fn fail_next_transmits(&self, n: u32) {
        lock(&self.state).fail_transmits = n;
    }

    /// Make every transmit on one chip select fail until cleared
    pub fn set_link_broken(&self, device: DeviceId, chip_select: ChipSelect, broken: bool) {
        let mut state = lock(&self.state);
        if broken {
            state.broken_links.insert((device, chip_select));
        } else {
            state.broken_links.remove(&(device, chip_select));
        }
    }

    /// Make `init` fail for a device
    pub fn fail_init(&self, device: DeviceId) {
        lock(&self.state).fail_init.insert(device);
    }

    /// All exchanges recorded so far
    #[must_use]
    pub fn sent(&self) -> Vec<Exchange> {
        lock(&self.state).sent.clone()
    }

    /// Drain the recorded exchanges
    pub fn take_sent(&self) -> Vec<Exchange> {
        std::mem::take(&mut lock(&self.state).sent)
    }

    /// Devices passed to `init`, in call order
    #[must_use]
    pub fn init_calls(&self) -> Vec<DeviceId> {
        lock(&self.state).init_calls.clone()
    }

    /// Devices passed to `close`, in call order
    #[must_use]
    pub fn close_calls(&self) -> Vec<DeviceId> {
        lock(&self.state).close_calls.clone()
    }
}
