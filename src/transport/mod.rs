// SPDX-License-Identifier: MPL-2.0

//! Transport gate abstraction for the session processing loop
//!
//! The session core never touches sockets directly: it consumes a connected
//! transport through the [`InputGate`]/[`OutputGate`] pair returned by a
//! [`TransportConnector`]. The receive half is exclusively owned by the
//! processing thread; the transmit half lives behind the session's transmit
//! lock so application threads can publish concurrently with the loop.

use std::io;
use std::time::Duration;

pub mod tcp;

pub use tcp::TcpConnector;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    Closed,
}

/// Result of waiting for input readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Bytes are pending on the receive path.
    Readable,
    /// The timeout elapsed with nothing to read. Not an error.
    TimedOut,
}

/// Result of a non-blocking receive.
///
/// `WouldBlock` is deliberately distinct from both an error and `Closed`:
/// payload draining relies on the distinction to wait for more bytes instead
/// of giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// `n` bytes were copied into the caller's buffer.
    Data(usize),
    /// No bytes are currently available.
    WouldBlock,
    /// The peer closed the stream.
    Closed,
}

/// Factory for connected transport gates.
///
/// Each call establishes a fresh connection to the broker endpoint. A failed
/// or abandoned attempt must leave nothing half-open: dropping the returned
/// gates (or calling [`OutputGate::shutdown`]) tears the connection down.
pub trait TransportConnector: Send {
    fn connect(&mut self) -> Result<(Box<dyn InputGate>, Box<dyn OutputGate>), TransportError>;
}

/// Receive half of a connected transport.
pub trait InputGate: Send {
    /// Wait up to `timeout` for the stream to become readable.
    fn poll_readable(&mut self, timeout: Duration) -> Result<Readiness, TransportError>;

    /// Receive whatever is currently pending, without blocking indefinitely.
    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome, TransportError>;
}

/// Transmit half of a connected transport.
pub trait OutputGate: Send {
    /// Write the full buffer to the stream, blocking as needed.
    fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Explicitly abort the connection. Safe to call more than once.
    fn shutdown(&mut self);
}
