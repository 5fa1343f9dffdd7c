//! One live pool connection: a transport paired with a protocol session.

use std::time::Instant;

use crate::stratum::{ProtocolSession, SessionEvent, StratumError};
use crate::tracing::prelude::*;
use crate::transport::Transport;

/// Initial receive buffer size.
const RECV_BUFFER_INITIAL: usize = 4096;

/// Receive buffer growth step when a line does not fit.
const RECV_BUFFER_GROWTH: usize = 2048;

/// What one refresh of a connection produced.
#[derive(Debug, Default)]
pub struct RefreshEvents {
    /// The current job differs from the one before the refresh
    pub new_work: bool,
    /// The share difficulty changed
    pub diff_changed: bool,
    pub bytes_received: usize,
    /// The transport stopped working
    pub conn_failed: bool,
    /// Protocol violation; the connection must be closed
    pub violation: Option<StratumError>,
    pub session: Vec<SessionEvent>,
}

/// A connected transport and the session speaking over it.
pub struct PoolConnection {
    transport: Box<dyn Transport>,
    session: ProtocolSession,
    /// Bytes of the front outbound line already sent
    send_offset: usize,
    recv_buf: Vec<u8>,
    recv_len: usize,
    connected_at: Instant,
}

impl PoolConnection {
    pub fn new(transport: Box<dyn Transport>, session: ProtocolSession, now: Instant) -> Self {
        Self {
            transport,
            session,
            send_offset: 0,
            recv_buf: vec![0; RECV_BUFFER_INITIAL],
            recv_len: 0,
            connected_at: now,
        }
    }

    pub fn session(&self) -> &ProtocolSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ProtocolSession {
        &mut self.session
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Whether outgoing data is waiting for the socket.
    pub fn wants_write(&self) -> bool {
        self.session.outbound_len() > 0
    }

    /// Current receive buffer capacity.
    pub fn recv_capacity(&self) -> usize {
        self.recv_buf.len()
    }

    /// Move pending data in both directions and dispatch complete lines.
    pub fn refresh(&mut self, readable: bool, writable: bool, now: Instant) -> RefreshEvents {
        let mut events = RefreshEvents::default();
        let previous_job = self.session.job().cloned();
        let previous_diff = self.session.work_diff();

        if writable {
            self.flush();
        }
        if readable {
            events.bytes_received = self.fill();
            if let Err(e) = self.process_lines(now, &mut events.session) {
                events.violation = Some(e);
            }
        }
        // Replies queued while dispatching go out right away
        if writable && events.violation.is_none() {
            self.flush();
        }

        events.new_work = self.session.job() != previous_job.as_ref();
        events.diff_changed = self.session.work_diff() != previous_diff;
        events.conn_failed = !self.transport.works();
        events
    }

    fn flush(&mut self) {
        while let Some(line) = self.session.next_outbound() {
            let sent = self.transport.send(&line[self.send_offset..]);
            if sent == 0 {
                break;
            }
            self.send_offset += sent;
            if self.send_offset == line.len() {
                self.send_offset = 0;
                self.session.outbound_sent();
            }
        }
    }

    fn fill(&mut self) -> usize {
        let mut total = 0;
        loop {
            if self.recv_len == self.recv_buf.len() {
                let size = self.recv_buf.len() + RECV_BUFFER_GROWTH;
                trace!(size, "Growing receive buffer");
                self.recv_buf.resize(size, 0);
            }
            let n = self.transport.receive(&mut self.recv_buf[self.recv_len..]);
            if n == 0 {
                break;
            }
            self.recv_len += n;
            total += n;
        }
        total
    }

    fn process_lines(
        &mut self,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), StratumError> {
        let mut start = 0;
        let result = loop {
            let Some(pos) = self.recv_buf[start..self.recv_len]
                .iter()
                .position(|&b| b == b'\n')
            else {
                break Ok(());
            };
            let end = start + pos;
            let raw = &self.recv_buf[start..end];
            start = end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line.to_string(),
                Err(_) => break Err(StratumError::InvalidMessage("line is not UTF-8".to_string())),
            };
            trace!(rx = %line, "Received");
            match self.session.dispatch_incoming(&line, now) {
                Ok(new) => events.extend(new),
                Err(e) => break Err(e),
            }
        };

        self.recv_buf.copy_within(start..self.recv_len, 0);
        self.recv_len -= start;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::{AuthFailurePolicy, SessionSettings};
    use crate::transport::mock::MockNetwork;
    use crate::transport::Network;
    use crate::work::{DiffMode, DiffMultipliers, MerkleMode};
    use serde_json::json;

    const SUBSCRIBE_REPLY: &str = "{\"id\":\"1\",\"result\":[[[\"mining.notify\",\"ae68\"]],\"f8002222\",4],\"error\":null}\n";

    fn connection() -> (PoolConnection, crate::transport::mock::MockPipe) {
        let mut network = MockNetwork::new();
        let transport = network.begin_connection("pool", "3333").unwrap();
        let session = ProtocolSession::new(SessionSettings {
            user_agent: "stratum-miner/test".to_string(),
            multipliers: DiffMultipliers::default(),
            merkle_mode: MerkleMode::Sha256d,
            diff_mode: DiffMode::Btc,
            auth_failure_policy: AuthFailurePolicy::DisableWorker,
        })
        .unwrap();
        (PoolConnection::new(transport, session, Instant::now()), network.pipe(0))
    }

    #[test]
    fn test_subscribe_sent_on_write() {
        let (mut conn, pipe) = connection();
        assert!(conn.wants_write());
        conn.refresh(false, true, Instant::now());
        assert_eq!(
            pipe.sent_json(),
            vec![json!({"id": "1", "method": "mining.subscribe", "params": []})]
        );
        assert!(!conn.wants_write());
    }

    #[test]
    fn test_partial_sends_keep_order() {
        let (mut conn, pipe) = connection();
        conn.session_mut().authorize("alice", "x").unwrap();
        pipe.set_send_limit(Some(7));

        conn.refresh(false, true, Instant::now());
        assert!(!conn.wants_write());
        let sent = pipe.sent_json();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["method"], "mining.subscribe");
        assert_eq!(sent[1]["method"], "mining.authorize");
        assert_eq!(sent[1]["params"], json!(["alice", "x"]));
    }

    #[test]
    fn test_split_lines_are_reassembled() {
        let (mut conn, pipe) = connection();
        conn.refresh(false, true, Instant::now());

        let (head, tail) = SUBSCRIBE_REPLY.split_at(20);
        pipe.push_inbound(head);
        let events = conn.refresh(true, false, Instant::now());
        assert_eq!(events.bytes_received, 20);
        assert!(events.session.is_empty());
        assert!(conn.session().subscription().is_none());

        pipe.push_inbound(tail);
        let events = conn.refresh(true, false, Instant::now());
        assert!(events.violation.is_none());
        assert_eq!(
            events.session,
            vec![SessionEvent::Subscribed { extranonce2_size: 4 }]
        );
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let (mut conn, pipe) = connection();
        conn.refresh(false, true, Instant::now());
        pipe.push_inbound("\r\n\n");
        pipe.push_inbound(&SUBSCRIBE_REPLY.replace('\n', "\r\n"));
        let events = conn.refresh(true, false, Instant::now());
        assert!(events.violation.is_none());
        assert_eq!(events.session.len(), 1);
    }

    #[test]
    fn test_buffer_grows_for_long_line() {
        let (mut conn, pipe) = connection();
        conn.refresh(false, true, Instant::now());

        let padding = "x".repeat(RECV_BUFFER_INITIAL * 2);
        let line = format!(
            "{{\"id\":null,\"method\":\"mining.unknown\",\"params\":[\"{}\"]}}\n",
            padding
        );
        pipe.push_inbound(&line);
        let events = conn.refresh(true, false, Instant::now());
        assert!(events.violation.is_none());
        assert_eq!(events.bytes_received, line.len());
        assert!(conn.recv_capacity() > RECV_BUFFER_INITIAL);
        assert_eq!((conn.recv_capacity() - RECV_BUFFER_INITIAL) % RECV_BUFFER_GROWTH, 0);
    }

    #[test]
    fn test_violation_reported() {
        let (mut conn, pipe) = connection();
        pipe.push_inbound("this is not json\n");
        let events = conn.refresh(true, false, Instant::now());
        assert!(matches!(events.violation, Some(StratumError::Json(_))));
    }

    #[test]
    fn test_new_work_and_diff_flags() {
        let (mut conn, pipe) = connection();
        conn.refresh(false, true, Instant::now());
        pipe.push_inbound(SUBSCRIBE_REPLY);
        pipe.push_inbound("{\"id\":null,\"method\":\"mining.set_difficulty\",\"params\":[2]}\n");
        let events = conn.refresh(true, false, Instant::now());
        assert!(events.diff_changed);
        assert!(!events.new_work);

        pipe.push_inbound("{\"id\":null,\"method\":\"mining.set_difficulty\",\"params\":[2]}\n");
        let events = conn.refresh(true, false, Instant::now());
        assert!(!events.diff_changed);
    }

    #[test]
    fn test_failed_transport() {
        let (mut conn, pipe) = connection();
        pipe.fail();
        let events = conn.refresh(true, true, Instant::now());
        assert!(events.conn_failed);
    }

    #[test]
    fn test_get_version_answered_same_refresh() {
        let (mut conn, pipe) = connection();
        pipe.push_inbound("{\"id\":7,\"method\":\"client.get_version\",\"params\":[]}\n");
        conn.refresh(true, true, Instant::now());
        let sent = pipe.sent_json();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[1],
            json!({"id": 7, "result": "stratum-miner/test", "error": null})
        );
    }
}
