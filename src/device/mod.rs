//! The narrow byte-level transport the [`Fsm`](crate::fsm::Fsm) drives.
//!
//! [`Device`] is deliberately minimal: open/close, a single blocking
//! read-with-timeout, a non-blocking single-byte write, and a flush. The two
//! concrete transports are [`SerialDevice`] (a POSIX tty) and [`TcpDevice`]
//! (a TCP client, for a remote proxy that owns the physical bus).

use std::time::Duration;

mod serial;
pub use serial::SerialDevice;

mod tcp;
pub use tcp::TcpDevice;

/// Errors a [`Device`] can surface. `Io` isn't `Eq`/`Clone` because
/// [`std::io::Error`] isn't either; every other variant is.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to open device")]
    OpenFailed,
    #[error("device is closed")]
    Closed,
    #[error("read timed out")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A byte-level transport for one end of the eBUS wire.
///
/// Implementations do not interpret eBUS framing at all; they only move
/// bytes. Escaping happens above this boundary, in [`Sequence`](crate::Sequence).
pub trait Device: Send {
    /// Opens the underlying transport.
    fn open(&mut self) -> Result<(), DeviceError>;

    /// Closes the transport. Idempotent.
    fn close(&mut self);

    /// Whether the transport is currently open.
    fn is_open(&self) -> bool;

    /// Reads one byte, blocking for at most `timeout`.
    fn read_byte(&mut self, timeout: Duration) -> Result<u8, DeviceError>;

    /// Writes one byte without waiting for it to drain.
    fn write_byte(&mut self, byte: u8) -> Result<(), DeviceError>;

    /// Drains any buffered input. Used on error recovery and to detect a
    /// pre-existing collision before arbitrating.
    fn flush_input(&mut self) -> Result<(), DeviceError>;

    /// Best-effort check that the device is still present (e.g. the tty
    /// node still exists). Transports without a meaningful notion of
    /// presence (a TCP socket) report `true` unconditionally.
    fn check_present(&self) -> bool {
        true
    }
}
