//! Single-outstanding request engine.
//!
//! Every command sent to a manager goes through one [`RequestEngine`] slot:
//! the slot hands out a correlation token, remembers when it was armed and
//! holds the closure that re-issues the request when the timeout expires.
//! Responses are accepted only against the valid token.

use crate::error::RequestError;

/// Default number of re-issues before a request expires
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// Differences this close to the counter wrap are clock jitter, not time
const JITTER_MS: u32 = 5;

/// Result of [`RequestEngine::poll_timeout`]
pub enum TimeoutOutcome<F> {
    /// Nothing outstanding, or still within the timeout
    Waiting,
    /// Timed out; re-issue the request with this closure
    Retry(F),
    /// Timed out past the retry ceiling
    Expired,
}

impl<F> std::fmt::Debug for TimeoutOutcome<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => f.write_str("Waiting"),
            Self::Retry(_) => f.write_str("Retry(..)"),
            Self::Expired => f.write_str("Expired"),
        }
    }
}

/// Elapsed milliseconds between two wrapping timestamps.
///
/// A `now` slightly behind `since` (within the jitter window) reads as zero.
#[must_use]
pub fn elapsed_ms(now: u32, since: u32) -> u32 {
    let elapsed = now.wrapping_sub(since);
    if elapsed > u32::MAX - JITTER_MS {
        0
    } else {
        elapsed
    }
}

/// One request slot
pub struct RequestEngine<F> {
    token: u16,
    armed_at: u32,
    timeout_ms: u32,
    valid: bool,
    retries: u8,
    max_retries: u8,
    retry: Option<F>,
}

impl<F> RequestEngine<F> {
    /// Create an idle slot
    #[must_use]
    pub fn new(max_retries: u8) -> Self {
        Self {
            token: 0,
            armed_at: 0,
            timeout_ms: 0,
            valid: false,
            retries: 0,
            max_retries,
            retry: None,
        }
    }

    /// Reset the retry counter; called once per API call, never on retry
    pub fn start(&mut self) {
        self.retries = 0;
    }

    /// Arm the slot and return the request's token.
    ///
    /// # Errors
    ///
    /// `RequestError::InvalidParameter` if the timeout is zero or too close
    /// to the clock wrap, or a request is already outstanding.
    pub fn arm(&mut self, now: u32, timeout_ms: u32, retry: F) -> Result<u16, RequestError> {
        if timeout_ms == 0 || timeout_ms > u32::MAX / 2 || self.valid {
            return Err(RequestError::InvalidParameter);
        }
        self.token = self.token.wrapping_add(1);
        self.armed_at = now;
        self.timeout_ms = timeout_ms;
        self.retry = Some(retry);
        self.valid = true;
        Ok(self.token)
    }

    /// Accept a response.
    ///
    /// With `clear_on_match` false the slot stays armed (interim response).
    ///
    /// # Errors
    ///
    /// `RequestError::Fail` if nothing is outstanding or the token differs;
    /// the slot is left untouched.
    pub fn match_and_consume(
        &mut self,
        token: u16,
        clear_on_match: bool,
    ) -> Result<(), RequestError> {
        if !self.valid || token != self.token {
            return Err(RequestError::Fail);
        }
        if clear_on_match {
            self.valid = false;
            self.retry = None;
        }
        Ok(())
    }

    /// Check the outstanding request against the clock
    pub fn poll_timeout(&mut self, now: u32) -> TimeoutOutcome<F> {
        if !self.valid || elapsed_ms(now, self.armed_at) <= self.timeout_ms {
            return TimeoutOutcome::Waiting;
        }

        self.valid = false;
        // Rollover is harmless: start() resets before the counter can matter.
        self.retries = self.retries.wrapping_add(1);
        let retry = self.retry.take();
        match retry {
            Some(retry) if self.retries <= self.max_retries => {
                tracing::debug!(
                    "Request {} timed out, retry {}/{}",
                    self.token,
                    self.retries,
                    self.max_retries
                );
                TimeoutOutcome::Retry(retry)
            }
            _ => {
                tracing::debug!("Request {} expired", self.token);
                TimeoutOutcome::Expired
            }
        }
    }

    /// Drop the outstanding request
    pub fn cancel(&mut self) {
        self.valid = false;
        self.retry = None;
    }

    /// Check whether a request is outstanding
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Token of the latest request
    #[must_use]
    pub fn token(&self) -> u16 {
        self.token
    }

    /// Timeouts since the last `start`
    #[must_use]
    pub fn retries(&self) -> u8 {
        self.retries
    }
}

impl<F> Default for RequestEngine<F> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}
