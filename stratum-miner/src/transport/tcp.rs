//! Non-blocking TCP transport.
//!
//! Sockets are created non-blocking with rustix and connected asynchronously:
//! `connect` returns `EINPROGRESS`, the socket later polls writable, and
//! `connected()` checks the pending socket error to see how the attempt
//! ended. Readiness for all sockets is gathered with a single `poll(2)`.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use rustix::event::{poll, PollFd, PollFlags, Timespec};
use rustix::io::Errno;
use rustix::net::{AddressFamily, SendFlags, SocketFlags, SocketType};

use super::{Network, Transport, TransportError, WaitEntry};
use crate::tracing::prelude::*;

/// Service names pools commonly use instead of a port number.
const WELL_KNOWN_SERVICES: &[(&str, u16)] = &[("http", 80), ("https", 443)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    Connecting,
    Connected,
    Failed,
}

/// A TCP stream driven without blocking.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    state: TcpState,
}

impl TcpTransport {
    /// Start connecting to `addr`.
    pub fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        let family = if addr.is_ipv4() {
            AddressFamily::INET
        } else {
            AddressFamily::INET6
        };
        let fd = rustix::net::socket_with(
            family,
            SocketType::STREAM,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            None,
        )
        .map_err(|e| TransportError::Socket(e.into()))?;

        let state = match rustix::net::connect(&fd, &addr) {
            Ok(()) => TcpState::Connected,
            Err(Errno::INPROGRESS) | Err(Errno::AGAIN) => TcpState::Connecting,
            Err(e) => return Err(TransportError::Connect(e.into())),
        };
        trace!(peer = %addr, "Connection started");

        Ok(Self {
            stream: TcpStream::from(fd),
            peer: addr,
            state,
        })
    }

    fn fail(&mut self, error: io::Error) {
        if self.state != TcpState::Failed {
            debug!(peer = %self.peer, error = %error, "Connection failed");
            self.state = TcpState::Failed;
        }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> usize {
        if self.state != TcpState::Connected || data.is_empty() {
            return 0;
        }
        match rustix::net::send(&self.stream, data, SendFlags::NOSIGNAL) {
            Ok(n) => n,
            Err(Errno::AGAIN) | Err(Errno::INTR) => 0,
            Err(e) => {
                self.fail(e.into());
                0
            }
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        if self.state != TcpState::Connected || buf.is_empty() {
            return 0;
        }
        match rustix::io::read(&self.stream, buf) {
            Ok(0) => {
                self.fail(io::Error::from(io::ErrorKind::UnexpectedEof));
                0
            }
            Ok(n) => n,
            Err(Errno::AGAIN) | Err(Errno::INTR) => 0,
            Err(e) => {
                self.fail(e.into());
                0
            }
        }
    }

    fn works(&self) -> bool {
        self.state != TcpState::Failed
    }

    fn connected(&mut self) -> bool {
        if self.state == TcpState::Connecting {
            match self.stream.take_error() {
                Ok(Some(e)) | Err(e) => self.fail(e),
                Ok(None) => {
                    // Still in progress if the peer is not known yet
                    if self.stream.peer_addr().is_ok() {
                        self.state = TcpState::Connected;
                    }
                }
            }
        }
        self.state == TcpState::Connected
    }

    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.stream.as_fd())
    }
}

/// Resolve `host` and `service` to socket addresses.
pub fn resolve(host: &str, service: &str) -> Result<Vec<SocketAddr>, TransportError> {
    let port = match service.parse::<u16>() {
        Ok(port) => port,
        Err(_) => WELL_KNOWN_SERVICES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(service))
            .map(|(_, port)| *port)
            .ok_or_else(|| TransportError::Resolve {
                host: host.to_string(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown service {}", service),
                ),
            })?,
    };

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();
    Ok(addrs)
}

/// Real network access through the operating system.
#[derive(Debug, Default)]
pub struct TcpNetwork;

impl TcpNetwork {
    pub fn new() -> Self {
        Self
    }
}

impl Network for TcpNetwork {
    fn begin_connection(
        &mut self,
        host: &str,
        service: &str,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let addrs = resolve(host, service)?;
        let mut last_error = None;
        for addr in addrs {
            match TcpTransport::connect(addr) {
                Ok(transport) => return Ok(Box::new(transport)),
                Err(TransportError::Connect(e))
                    if matches!(
                        Errno::from_io_error(&e),
                        Some(Errno::NETUNREACH) | Some(Errno::HOSTUNREACH)
                    ) =>
                {
                    last_error = Some(TransportError::NoRoutes(host.to_string()));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::NoRoutes(host.to_string())))
    }

    fn sleep_until_ready(&mut self, entries: &mut [WaitEntry<'_>], timeout: Duration) -> usize {
        let mut fds = Vec::with_capacity(entries.len());
        let mut owners = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let Some(fd) = entry.transport.poll_fd() else {
                continue;
            };
            let mut flags = PollFlags::empty();
            if entry.read {
                flags |= PollFlags::IN;
            }
            if entry.write {
                flags |= PollFlags::OUT;
            }
            fds.push(PollFd::from_borrowed_fd(fd, flags));
            owners.push(index);
        }

        if fds.is_empty() {
            std::thread::sleep(timeout);
            return 0;
        }
        let timeout = Timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };

        match poll(&mut fds, Some(&timeout)) {
            Ok(_) => {}
            Err(Errno::INTR) => return 0,
            Err(e) => {
                warn!(error = %e, "poll failed");
                return 0;
            }
        }

        let mut woken = 0;
        for (fd, &index) in fds.iter().zip(&owners) {
            let revents = fd.revents();
            let entry = &mut entries[index];
            // Errors and hangups surface through the next read or connect check
            let failed = revents.intersects(PollFlags::ERR | PollFlags::HUP);
            entry.readable = revents.contains(PollFlags::IN) || (failed && entry.read);
            entry.writable = revents.contains(PollFlags::OUT) || (failed && entry.write);
            if entry.readable || entry.writable {
                woken += 1;
            }
        }
        woken
    }
}
