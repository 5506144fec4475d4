//! Physical driver abstraction.
//!
//! The link layer never touches SPI registers directly. Every exchange goes
//! through a `PhysicalDriver`, which performs one full-duplex transaction per
//! call and reports completion asynchronously through the callback handed to
//! it at `init` time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Physical bus identifier (one SPI peripheral).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u8);

/// Chip-select line on a physical bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChipSelect(pub u8);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spi{}", self.0)
    }
}

impl fmt::Display for ChipSelect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cs{}", self.0)
    }
}

/// Transfer-complete callback.
///
/// Invoked by the driver (possibly from interrupt context) once per
/// submitted exchange. Implementations must do no more than record the
/// completion.
pub type CompletionFn = Arc<dyn Fn(DeviceId, ChipSelect) + Send + Sync>;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Peripheral initialisation failed
    #[error("failed to initialise {0}")]
    InitFailed(DeviceId),

    /// Peripheral was never initialised
    #[error("{0} is not initialised")]
    NotInitialized(DeviceId),

    /// The exchange could not be started
    #[error("transmit failed on {device}/{chip_select}")]
    TransmitFailed {
        /// Bus the exchange was submitted to
        device: DeviceId,
        /// Chip select of the exchange
        chip_select: ChipSelect,
    },

    /// Transmit and receive buffers differ in length
    #[error("buffer length mismatch: tx {tx}, rx {rx}")]
    LengthMismatch {
        /// Transmit buffer length
        tx: usize,
        /// Receive buffer length
        rx: usize,
    },

    /// Closing the peripheral failed
    #[error("failed to close {0}")]
    CloseFailed(DeviceId),

    /// Driver-specific error
    #[error("transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Full-duplex physical driver.
///
/// One exchange clocks `tx` out while filling `rx`. The exchange is not
/// finished until the driver invokes the completion callback registered in
/// [`PhysicalDriver::init`]; callers must not reuse `rx` before that.
pub trait PhysicalDriver: Send {
    /// Initialise a bus and register its transfer-complete callback.
    ///
    /// # Errors
    /// Returns `TransportError::InitFailed` if the peripheral cannot be set up.
    fn init(&mut self, device: DeviceId, on_complete: CompletionFn) -> TransportResult<()>;

    /// Start one exchange of `tx.len()` bytes.
    ///
    /// # Errors
    /// Returns `TransportError` if the exchange could not be started. No
    /// completion is reported for a failed submission.
    fn transmit(
        &mut self,
        device: DeviceId,
        chip_select: ChipSelect,
        tx: &[u8],
        rx: &mut [u8],
    ) -> TransportResult<()>;

    /// Release a bus.
    ///
    /// # Errors
    /// Returns `TransportError::CloseFailed` if the peripheral refuses.
    fn close(&mut self, device: DeviceId) -> TransportResult<()>;
}
