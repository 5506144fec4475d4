//! Per-port receive buffer pool.
//!
//! Each port owns [`RX_SLOTS_PER_PORT`] frame-sized receive slots. A slot is
//! handed to the driver when an exchange is submitted, flagged once the
//! completion arrives, and returned (zeroed) after decode:
//!
//! ```text
//! Free ──allocate──▶ InUse ──mark_ready──▶ ReadyForProcessing ──release──▶ Free
//! ```

use crate::frame::RawFrame;
use crate::{FRAME_SIZE, RX_SLOTS_PER_PORT};

/// Receive slot lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Available for the next exchange
    Free,
    /// Submitted to the driver
    InUse,
    /// Completion signalled; awaiting decode
    ReadyForProcessing,
}

struct RxSlot {
    state: SlotState,
    data: Box<RawFrame>,
}

/// Fixed pool of receive slots
pub struct RxPool {
    slots: [RxSlot; RX_SLOTS_PER_PORT],
}

impl RxPool {
    /// Create a pool with every slot free
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| RxSlot {
                state: SlotState::Free,
                data: Box::new([0u8; FRAME_SIZE]),
            }),
        }
    }

    /// Claim a free slot for a new exchange
    pub fn allocate(&mut self) -> Option<usize> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::Free)?;
        self.slots[index].state = SlotState::InUse;
        Some(index)
    }

    /// Receive buffer of a slot handed to the driver
    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut RawFrame> {
        self.slots
            .get_mut(index)
            .filter(|slot| slot.state == SlotState::InUse)
            .map(|slot| &mut *slot.data)
    }

    /// Flag a submitted slot as complete.
    ///
    /// Returns `false` if the slot was not in flight.
    pub fn mark_ready(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) if slot.state == SlotState::InUse => {
                slot.state = SlotState::ReadyForProcessing;
                true
            }
            _ => false,
        }
    }

    /// Received bytes of a completed slot
    #[must_use]
    pub fn frame(&self, index: usize) -> Option<&RawFrame> {
        self.slots
            .get(index)
            .filter(|slot| slot.state == SlotState::ReadyForProcessing)
            .map(|slot| &*slot.data)
    }

    /// Zero a slot and return it to the pool
    pub fn release(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.data.fill(0);
            slot.state = SlotState::Free;
        }
    }

    /// Current state of a slot
    #[must_use]
    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|slot| slot.state)
    }

    /// Slots available for allocation
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Free)
            .count()
    }
}

impl Default for RxPool {
    fn default() -> Self {
        Self::new()
    }
}
