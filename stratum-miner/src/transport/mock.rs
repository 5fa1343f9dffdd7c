//! Scripted in-memory network for tests.
//!
//! Each transport handed out by [`MockNetwork`] is backed by a [`MockPipe`]
//! that the test keeps a handle to, so it can play the pool side: push
//! inbound bytes, inspect what was sent, finish or fail the connection.

use std::collections::VecDeque;
use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Network, Transport, TransportError, WaitEntry};

/// How the next `begin_connection` call should end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Transport created, connection completes on the first check.
    Connect,
    /// Transport created, connection stays pending until the test completes it.
    Pending,
    NoRoutes,
    Resolve,
    Socket,
    Refused,
}

#[derive(Debug, Default)]
pub struct PipeState {
    pub inbound: VecDeque<u8>,
    pub sent: Vec<u8>,
    pub connected: bool,
    pub failed: bool,
    /// Maximum bytes accepted per send call
    pub send_limit: Option<usize>,
}

/// Test-side handle to one transport.
#[derive(Debug, Clone, Default)]
pub struct MockPipe(Arc<Mutex<PipeState>>);

impl MockPipe {
    pub fn push_inbound(&self, data: &str) {
        self.0.lock().inbound.extend(data.as_bytes());
    }

    /// Everything sent so far, split into lines.
    pub fn sent_lines(&self) -> Vec<String> {
        let state = self.0.lock();
        String::from_utf8_lossy(&state.sent)
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent_lines()
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn complete_connect(&self) {
        self.0.lock().connected = true;
    }

    pub fn fail(&self) {
        self.0.lock().failed = true;
    }

    pub fn set_send_limit(&self, limit: Option<usize>) {
        self.0.lock().send_limit = limit;
    }
}

pub struct MockTransport {
    pipe: MockPipe,
}

impl Transport for MockTransport {
    fn send(&mut self, data: &[u8]) -> usize {
        let mut state = self.pipe.0.lock();
        if state.failed || !state.connected {
            return 0;
        }
        let n = state.send_limit.map_or(data.len(), |limit| limit.min(data.len()));
        state.sent.extend_from_slice(&data[..n]);
        n
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        let mut state = self.pipe.0.lock();
        if state.failed {
            return 0;
        }
        let n = buf.len().min(state.inbound.len());
        for (dst, src) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn works(&self) -> bool {
        !self.pipe.0.lock().failed
    }

    fn connected(&mut self) -> bool {
        let state = self.pipe.0.lock();
        state.connected && !state.failed
    }

    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    script: VecDeque<ConnectOutcome>,
    attempts: Vec<(String, String)>,
    pipes: Vec<MockPipe>,
    sleeps: usize,
}

/// Network whose connection outcomes are scripted by the test.
///
/// Unscripted attempts connect successfully.
#[derive(Debug, Clone, Default)]
pub struct MockNetwork(Arc<Mutex<NetworkState>>);

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, outcome: ConnectOutcome) {
        self.0.lock().script.push_back(outcome);
    }

    /// Host and service of every connection attempt, in order.
    pub fn attempts(&self) -> Vec<(String, String)> {
        self.0.lock().attempts.clone()
    }

    /// Pipe of the `index`th transport created.
    pub fn pipe(&self, index: usize) -> MockPipe {
        self.0.lock().pipes[index].clone()
    }

    pub fn pipe_count(&self) -> usize {
        self.0.lock().pipes.len()
    }

    pub fn sleeps(&self) -> usize {
        self.0.lock().sleeps
    }
}

impl Network for MockNetwork {
    fn begin_connection(
        &mut self,
        host: &str,
        service: &str,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.0.lock();
        state.attempts.push((host.to_string(), service.to_string()));
        let outcome = state.script.pop_front().unwrap_or(ConnectOutcome::Connect);
        let refused = || io::Error::from(io::ErrorKind::ConnectionRefused);
        match outcome {
            ConnectOutcome::Connect | ConnectOutcome::Pending => {
                let pipe = MockPipe::default();
                pipe.0.lock().connected = outcome == ConnectOutcome::Connect;
                state.pipes.push(pipe.clone());
                Ok(Box::new(MockTransport { pipe }))
            }
            ConnectOutcome::NoRoutes => Err(TransportError::NoRoutes(host.to_string())),
            ConnectOutcome::Resolve => Err(TransportError::Resolve {
                host: host.to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            }),
            ConnectOutcome::Socket => Err(TransportError::Socket(refused())),
            ConnectOutcome::Refused => Err(TransportError::Connect(refused())),
        }
    }

    fn sleep_until_ready(&mut self, entries: &mut [WaitEntry<'_>], _timeout: Duration) -> usize {
        self.0.lock().sleeps += 1;
        let mut woken = 0;
        for entry in entries.iter_mut() {
            // Without a descriptor every interest is reported ready
            entry.readable = entry.read;
            entry.writable = entry.write;
            if entry.readable || entry.writable {
                woken += 1;
            }
        }
        woken
    }
}
