//! Network locks.
//!
//! Every non-blocking network API call takes its network's lock and holds
//! it until the call's completion is delivered. A watchdog force-releases a
//! lock held past its deadline so a lost completion cannot wedge the
//! network.

use super::event::Api;
use crate::error::ApiError;
use crate::request::elapsed_ms;
use std::sync::atomic::{AtomicBool, Ordering};

/// Non-blocking mutual exclusion primitive
pub trait Lock: Send + Sync {
    /// Take the lock; `false` if already held
    fn try_acquire(&self) -> bool;

    /// Give the lock back
    fn release(&self);
}

/// Lock backed by an atomic flag
#[derive(Debug, Default)]
pub struct FlagLock {
    held: AtomicBool,
}

impl FlagLock {
    /// Create an unheld lock
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Check whether the lock is held
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl Lock for FlagLock {
    fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// Scoped hold on a [`Lock`], released on drop
pub struct LockGuard<'a> {
    lock: &'a dyn Lock,
}

impl<'a> LockGuard<'a> {
    /// Take the lock for the guard's lifetime
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Busy` if the lock is held.
    pub fn acquire(lock: &'a dyn Lock) -> Result<Self, ApiError> {
        if lock.try_acquire() {
            Ok(Self { lock })
        } else {
            Err(ApiError::Busy)
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Per-network command lock with its watchdog
pub(crate) struct NetworkLock {
    lock: Box<dyn Lock>,
    holder: Option<(Api, u32)>,
    watchdog_ms: u32,
}

impl NetworkLock {
    pub(crate) fn new(lock: Box<dyn Lock>, watchdog_ms: u32) -> Self {
        Self {
            lock,
            holder: None,
            watchdog_ms,
        }
    }

    pub(crate) fn acquire(&mut self, api: Api, now: u32) -> Result<(), ApiError> {
        if !self.lock.try_acquire() {
            return Err(ApiError::Busy);
        }
        self.holder = Some((api, now));
        Ok(())
    }

    pub(crate) fn release(&mut self) {
        if self.holder.take().is_some() {
            self.lock.release();
        }
    }

    pub(crate) fn holder(&self) -> Option<Api> {
        self.holder.map(|(api, _)| api)
    }

    /// Force-release a lock held past the watchdog; returns the holder
    pub(crate) fn check_watchdog(&mut self, now: u32) -> Option<Api> {
        let (api, since) = self.holder?;
        if elapsed_ms(now, since) <= self.watchdog_ms {
            return None;
        }
        tracing::warn!("{:?} held the network lock past {} ms, releasing", api, self.watchdog_ms);
        self.release();
        Some(api)
    }
}
