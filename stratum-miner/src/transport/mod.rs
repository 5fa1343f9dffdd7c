//! Byte-stream transports for pool connections.
//!
//! The pool manager drives every connection from a single IO thread, so the
//! abstractions here are non-blocking: sends and receives move whatever the
//! socket will take right now and report zero otherwise. Readiness is
//! collected for all connections at once by [`Network::sleep_until_ready`],
//! the only place the IO thread blocks.
//!
//! [`tcp::TcpNetwork`] is the production implementation. Tests use the
//! scripted in-memory network in `mock`.

pub mod tcp;

#[cfg(test)]
pub mod mock;

use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

use thiserror::Error;

pub use tcp::TcpNetwork;

/// Reasons a connection could not even be started.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Host name lookup failed
    #[error("Failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Lookup succeeded but produced nothing we can connect to
    #[error("No routes to {0}")]
    NoRoutes(String),

    /// Socket could not be created
    #[error("Failed to create socket: {0}")]
    Socket(#[source] io::Error),

    /// The connect call failed outright
    #[error("Connect failed: {0}")]
    Connect(#[source] io::Error),
}

/// A non-blocking byte stream.
pub trait Transport: Send {
    /// Send as much of `data` as possible, returning the byte count.
    ///
    /// Returns 0 when nothing could be sent, including after failure.
    fn send(&mut self, data: &[u8]) -> usize;

    /// Receive into `buf`, returning the byte count or 0 if nothing is pending.
    fn receive(&mut self, buf: &mut [u8]) -> usize;

    /// False once the stream has failed or been closed by the peer.
    fn works(&self) -> bool;

    /// Whether the connection attempt has completed.
    ///
    /// Called after the stream is reported writable; may update `works()`.
    fn connected(&mut self) -> bool;

    /// Descriptor to poll, if the transport is backed by one.
    fn poll_fd(&self) -> Option<BorrowedFd<'_>>;
}

/// One transport's interest in, and resulting, readiness.
pub struct WaitEntry<'a> {
    pub transport: &'a dyn Transport,
    pub read: bool,
    pub write: bool,
    pub readable: bool,
    pub writable: bool,
}

impl<'a> WaitEntry<'a> {
    pub fn new(transport: &'a dyn Transport, read: bool, write: bool) -> Self {
        Self {
            transport,
            read,
            write,
            readable: false,
            writable: false,
        }
    }
}

/// Connection factory and readiness multiplexer.
pub trait Network {
    /// Start a non-blocking connection to `host` on `service` (port or name).
    fn begin_connection(
        &mut self,
        host: &str,
        service: &str,
    ) -> Result<Box<dyn Transport>, TransportError>;

    /// Block until at least one entry is ready or `timeout` passes.
    ///
    /// Fills in `readable`/`writable` and returns how many entries woke.
    fn sleep_until_ready(&mut self, entries: &mut [WaitEntry<'_>], timeout: Duration) -> usize;
}
