//! Periodic alarm that drives the polling tick.
//!
//! On target hardware this is a timer interrupt. On a host the
//! [`TokioAlarm`] runs the callback from a tokio task on a fixed interval.

use crate::driver::{TransportError, TransportResult};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Alarm callback, invoked once per period
pub type AlarmFn = Box<dyn FnMut() + Send>;

/// Periodic alarm abstraction
pub trait PeriodicAlarm {
    /// Start invoking `on_alarm` every `period`.
    ///
    /// # Errors
    /// Returns `TransportError` if the alarm is already running or the
    /// period is zero.
    fn start(&mut self, period: Duration, on_alarm: AlarmFn) -> TransportResult<()>;

    /// Stop the alarm. Stopping an idle alarm is a no-op.
    fn stop(&mut self);

    /// Check whether the alarm is running
    fn is_running(&self) -> bool;
}

/// Alarm backed by a tokio interval task
#[derive(Debug, Default)]
pub struct TokioAlarm {
    task: Option<JoinHandle<()>>,
}

impl TokioAlarm {
    /// Create an idle alarm
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeriodicAlarm for TokioAlarm {
    fn start(&mut self, period: Duration, mut on_alarm: AlarmFn) -> TransportResult<()> {
        if self.is_running() {
            return Err(TransportError::Other("alarm already running".to_string()));
        }
        if period.is_zero() {
            return Err(TransportError::Other("alarm period must be non-zero".to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Other(format!("no tokio runtime: {e}")))?;

        self.task = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // A late tick must not be replayed as a burst; the link is polled
            // at most once per period.
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                on_alarm();
            }
        }));

        tracing::debug!("Periodic alarm started: {:?}", period);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Periodic alarm stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TokioAlarm {
    fn drop(&mut self) {
        self.stop();
    }
}
