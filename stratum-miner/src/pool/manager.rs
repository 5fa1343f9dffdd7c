//! Pool lifecycle: connecting, activation by algorithm, reconnection.
//!
//! The manager runs on the IO thread. One loop iteration is:
//!
//! 1. [`PoolManager::wait`] blocks until some connection is ready or the
//!    timeout passes, returning the [`Readiness`] observed.
//! 2. [`PoolManager::refresh`] moves data for the ready connections, turns
//!    completed connects into sessions, tears down failed ones and retries
//!    pools whose reconnection time has come.
//!
//! Everything of interest to the rest of the miner comes back as
//! [`PoolEvent`]s; the manager itself never talks to worker threads.
//!
//! Reconnection: a connect attempt that fails is retried after four times the
//! base delay, a connection that was live and then failed after the base
//! delay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use slotmap::SlotMap;

use super::connection::{PoolConnection, RefreshEvents};
use super::{ConnectionEvent, Endpoint, PoolId, PoolStats};
use crate::config::{Credentials, PoolConfig};
use crate::dispatch::{NonceOrigin, VerifiedNonceBatch};
use crate::stratum::{
    AuthFailurePolicy, ProtocolSession, SessionEvent, SessionSettings, SessionState,
    StratumError, StratumResult,
};
use crate::tracing::prelude::*;
use crate::transport::{Network, Transport, TransportError, WaitEntry};
use crate::work::{WorkDiff, WorkFactory};

/// Failed connect attempts wait this many base delays.
const FAILED_CONNECT_FACTOR: u32 = 4;

/// Settings shared by every pool.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub reconnect_delay: Duration,
    pub user_agent: String,
    pub auth_failure_policy: AuthFailurePolicy,
}

/// Something the rest of the miner should know about.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Connection {
        pool: PoolId,
        event: ConnectionEvent,
    },
    /// The pool has a new job
    NewWork {
        pool: PoolId,
        factory: Arc<WorkFactory>,
        diff: WorkDiff,
    },
    /// Same job, new share difficulty
    DiffChanged { pool: PoolId, diff: WorkDiff },
    /// The pool has no usable work any more
    NoWork { pool: PoolId },
}

/// What became of one verified batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Submission {
    /// Shares queued to the pool
    pub sent: usize,
    /// Shares dropped because their job was gone
    pub stale: usize,
}

/// Which pools woke up, and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness(Vec<(PoolId, bool, bool)>);

impl Readiness {
    fn get(&self, pool: PoolId) -> (bool, bool) {
        self.0
            .iter()
            .find(|(id, _, _)| *id == pool)
            .map_or((false, false), |&(_, r, w)| (r, w))
    }
}

enum Link {
    Idle,
    Connecting(Box<dyn Transport>),
    Live(PoolConnection),
}

struct Pool {
    config: PoolConfig,
    endpoint: Endpoint,
    credentials: Vec<Credentials>,
    link: Link,
    /// Pool uses the active algorithm
    enabled: bool,
    next_attempt: Option<Instant>,
    activated_at: Option<Instant>,
    factory: Option<Arc<WorkFactory>>,
    stats: PoolStats,
}

impl Pool {
    fn session_settings(&self, settings: &ManagerSettings) -> SessionSettings {
        SessionSettings {
            user_agent: settings.user_agent.clone(),
            multipliers: self.config.diff_multipliers,
            merkle_mode: self.config.merkle_mode,
            diff_mode: self.config.diff_mode,
            auth_failure_policy: settings.auth_failure_policy,
        }
    }
}

/// All configured pools and their connections.
pub struct PoolManager<N: Network> {
    network: N,
    settings: ManagerSettings,
    pools: SlotMap<PoolId, Pool>,
}

impl<N: Network> PoolManager<N> {
    pub fn new(network: N, settings: ManagerSettings) -> Self {
        Self {
            network,
            settings,
            pools: SlotMap::new(),
        }
    }

    /// Add a pool; it stays idle until an [`activate`](Self::activate) for
    /// its algorithm.
    pub fn add_pool(&mut self, config: &PoolConfig) -> StratumResult<PoolId> {
        let endpoint = Endpoint::parse(&config.url)?;
        Ok(self.pools.insert(Pool {
            config: config.clone(),
            endpoint,
            credentials: config.all_credentials(),
            link: Link::Idle,
            enabled: false,
            next_attempt: None,
            activated_at: None,
            factory: None,
            stats: PoolStats::default(),
        }))
    }

    pub fn pool_ids(&self) -> Vec<PoolId> {
        self.pools.keys().collect()
    }

    pub fn name(&self, pool: PoolId) -> Option<&str> {
        self.pools.get(pool).map(|p| p.config.name.as_str())
    }

    pub fn share_multiplier(&self, pool: PoolId) -> Option<f64> {
        self.pools.get(pool).map(|p| p.config.diff_multipliers.share)
    }

    pub fn stats(&self, pool: PoolId) -> Option<&PoolStats> {
        self.pools.get(pool).map(|p| &p.stats)
    }

    /// Session of a live pool.
    pub fn session(&self, pool: PoolId) -> Option<&ProtocolSession> {
        match &self.pools.get(pool)?.link {
            Link::Live(conn) => Some(conn.session()),
            _ => None,
        }
    }

    /// Protocol state of `pool`; pools without a live session are
    /// disconnected.
    pub fn session_state(&self, pool: PoolId) -> SessionState {
        self.session(pool)
            .map_or(SessionState::Disconnected, ProtocolSession::state)
    }

    pub fn is_connecting(&self, pool: PoolId) -> bool {
        matches!(self.pools.get(pool).map(|p| &p.link), Some(Link::Connecting(_)))
    }

    pub fn next_attempt(&self, pool: PoolId) -> Option<Instant> {
        self.pools.get(pool)?.next_attempt
    }

    /// Earliest scheduled reconnection.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.pools.values().filter_map(|p| p.next_attempt).min()
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.settings.reconnect_delay
    }

    /// Change the base delay, shifting already scheduled attempts by the
    /// difference.
    pub fn set_reconnect_delay(&mut self, delay: Duration) {
        let old = self.settings.reconnect_delay;
        self.settings.reconnect_delay = delay;
        for pool in self.pools.values_mut() {
            if let Some(at) = pool.next_attempt {
                pool.next_attempt = Some(if delay >= old {
                    at + (delay - old)
                } else {
                    at.checked_sub(old - delay).unwrap_or(at)
                });
            }
        }
    }

    /// Connect every idle pool using `algo` and close every pool that
    /// does not.
    pub fn activate(&mut self, algo: &str, now: Instant) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        let ids: Vec<PoolId> = self.pools.keys().collect();
        for id in ids {
            let Some(pool) = self.pools.get_mut(id) else {
                continue;
            };
            if !pool.config.algo.eq_ignore_ascii_case(algo) {
                pool.enabled = false;
                pool.next_attempt = None;
                if !matches!(pool.link, Link::Idle) {
                    info!(pool = %pool.config.name, algo = %pool.config.algo, "Deactivating pool");
                    self.disconnect(id, now, ConnectionEvent::Closing, None, &mut events);
                }
                continue;
            }
            pool.enabled = true;
            if matches!(pool.link, Link::Idle) {
                self.begin_connection(id, now, &mut events);
            }
        }
        events
    }

    /// Wait up to `timeout` for any connection to become ready.
    pub fn wait(&mut self, timeout: Duration) -> Readiness {
        let Self { network, pools, .. } = self;
        let mut ids = Vec::new();
        let mut entries = Vec::new();
        for (id, pool) in pools.iter() {
            match &pool.link {
                Link::Idle => {}
                Link::Connecting(transport) => {
                    ids.push(id);
                    entries.push(WaitEntry::new(transport.as_ref(), false, true));
                }
                Link::Live(conn) => {
                    ids.push(id);
                    entries.push(WaitEntry::new(conn.transport(), true, conn.wants_write()));
                }
            }
        }
        network.sleep_until_ready(&mut entries, timeout);
        Readiness(
            ids.into_iter()
                .zip(entries)
                .filter(|(_, e)| e.readable || e.writable)
                .map(|(id, e)| (id, e.readable, e.writable))
                .collect(),
        )
    }

    /// Act on `readiness`, then retry pools that are due.
    pub fn refresh(&mut self, readiness: &Readiness, now: Instant) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        let ids: Vec<PoolId> = self.pools.keys().collect();
        for id in ids {
            let (readable, writable) = readiness.get(id);
            self.refresh_pool(id, readable, writable, now, &mut events);
        }
        events.extend(self.attempt_reconnections(now));
        events
    }

    /// Start a connection for every enabled pool whose retry time has come.
    pub fn attempt_reconnections(&mut self, now: Instant) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        let due: Vec<PoolId> = self
            .pools
            .iter()
            .filter(|(_, p)| p.enabled && matches!(p.link, Link::Idle))
            .filter(|(_, p)| p.next_attempt.is_some_and(|at| at <= now))
            .map(|(id, _)| id)
            .collect();
        for id in due {
            self.begin_connection(id, now, &mut events);
        }
        events
    }

    /// Submit the accepted nonces of `batch`.
    ///
    /// Nonces for a job the pool has replaced are dropped and reported as
    /// stale, so the caller can charge them to the device in `batch`.
    pub fn send_results(&mut self, origin: &NonceOrigin, batch: &VerifiedNonceBatch) -> Submission {
        let Some(pool) = self.pools.get_mut(origin.pool) else {
            return Submission::default();
        };
        pool.stats.shares.discarded += batch.discarded as u64;
        pool.stats.shares.hw_errors += batch.wrong as u64;
        if batch.wrong > 0 {
            warn!(
                pool = %pool.config.name,
                device = batch.device,
                wrong = batch.wrong,
                "Hardware errors"
            );
        }
        if batch.accepted.is_empty() {
            return Submission::default();
        }

        let count = batch.accepted.len();
        let stale = Submission {
            sent: 0,
            stale: count,
        };
        let Link::Live(conn) = &mut pool.link else {
            debug!(pool = %pool.config.name, job = %origin.job, "Results for disconnected pool");
            pool.stats.shares.stale += count as u64;
            return stale;
        };
        let session = conn.session_mut();
        let ntime = session.get_job_network_time(&origin.job);
        if ntime == 0 {
            info!(
                pool = %pool.config.name,
                job = %origin.job,
                device = batch.device,
                shares = count,
                "Stale shares dropped"
            );
            pool.stats.shares.stale += count as u64;
            return stale;
        }

        let mut sent = 0;
        for found in &batch.accepted {
            match session.send_share(&origin.job, ntime, batch.nonce2, found.nonce) {
                Ok(id) => {
                    sent += 1;
                    pool.stats.shares.sent += 1;
                    info!(
                        pool = %pool.config.name,
                        id,
                        device = batch.device,
                        hash = %hex::encode(found.hash_slice),
                        diff = found.share_diff,
                        target = batch.target_diff,
                        "Share found"
                    );
                    if found.block {
                        info!(pool = %pool.config.name, job = %origin.job, "Block candidate submitted");
                    }
                }
                Err(StratumError::NoWorker) => {
                    warn!(pool = %pool.config.name, "No authorized worker to submit shares");
                    break;
                }
                Err(e) => {
                    warn!(pool = %pool.config.name, error = %e, "Cannot submit share");
                }
            }
        }
        Submission { sent, stale: 0 }
    }

    /// Close every connection.
    pub fn shutdown(&mut self, now: Instant) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        let ids: Vec<PoolId> = self.pools.keys().collect();
        for id in ids {
            if let Some(pool) = self.pools.get_mut(id) {
                pool.enabled = false;
                pool.next_attempt = None;
                if !matches!(pool.link, Link::Idle) {
                    self.disconnect(id, now, ConnectionEvent::Closing, None, &mut events);
                }
            }
        }
        events
    }

    /// Log one line per pool.
    pub fn log_status(&self, now: Instant) {
        for pool in self.pools.values() {
            let state = match &pool.link {
                Link::Idle => "idle",
                Link::Connecting(_) => "connecting",
                Link::Live(conn) => match conn.session().state() {
                    SessionState::Ready => "ready",
                    _ => "handshaking",
                },
            };
            let connected = pool.stats.connected_time
                + pool
                    .activated_at
                    .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
            let s = &pool.stats.shares;
            info!(
                pool = %pool.config.name,
                state,
                activations = pool.stats.activations,
                attempts = pool.stats.activation_attempts,
                connected_secs = connected.as_secs(),
                sent = s.sent,
                accepted = s.accepted,
                rejected = s.rejected,
                stale = s.stale,
                hw_errors = s.hw_errors,
                "Pool status"
            );
        }
    }

    fn begin_connection(&mut self, id: PoolId, now: Instant, events: &mut Vec<PoolEvent>) {
        let delay = self.settings.reconnect_delay;
        let Some(pool) = self.pools.get_mut(id) else {
            return;
        };
        pool.stats.activation_attempts += 1;
        let endpoint = &pool.endpoint;
        match self.network.begin_connection(&endpoint.host, endpoint.port()) {
            Ok(transport) => {
                info!(pool = %pool.config.name, host = %endpoint.host, port = endpoint.port(), "Connecting");
                pool.link = Link::Connecting(transport);
                pool.next_attempt = None;
                events.push(PoolEvent::Connection {
                    pool: id,
                    event: ConnectionEvent::Connecting,
                });
            }
            Err(e) => {
                warn!(pool = %pool.config.name, error = %e, "Connection attempt failed");
                pool.next_attempt = Some(now + delay * FAILED_CONNECT_FACTOR);
                events.push(PoolEvent::Connection {
                    pool: id,
                    event: connect_error_event(&e),
                });
            }
        }
    }

    fn refresh_pool(
        &mut self,
        id: PoolId,
        readable: bool,
        writable: bool,
        now: Instant,
        events: &mut Vec<PoolEvent>,
    ) {
        let delay = self.settings.reconnect_delay;
        let Some(pool) = self.pools.get_mut(id) else {
            return;
        };

        if let Link::Connecting(transport) = &mut pool.link {
            if !transport.works() {
                warn!(pool = %pool.config.name, "Connection failed while connecting");
                self.disconnect(
                    id,
                    now,
                    ConnectionEvent::FailedConnect,
                    Some(delay * FAILED_CONNECT_FACTOR),
                    events,
                );
                return;
            }
            if !(writable && transport.connected()) {
                return;
            }
            if let Err(e) = self.go_live(id, now, events) {
                error!(error = %e, "Cannot start session");
                self.disconnect(id, now, ConnectionEvent::Closing, Some(delay), events);
                return;
            }
        } else if !(readable || writable) {
            return;
        }

        let Some(pool) = self.pools.get_mut(id) else {
            return;
        };
        let Link::Live(conn) = &mut pool.link else {
            return;
        };
        let refreshed = conn.refresh(readable, writable, now);
        self.handle_refresh(id, refreshed, now, events);
    }

    fn go_live(&mut self, id: PoolId, now: Instant, events: &mut Vec<PoolEvent>) -> StratumResult<()> {
        let Some(pool) = self.pools.get_mut(id) else {
            return Ok(());
        };
        let Link::Connecting(transport) = std::mem::replace(&mut pool.link, Link::Idle) else {
            return Ok(());
        };
        let mut session = ProtocolSession::new(pool.session_settings(&self.settings))?;
        for credentials in &pool.credentials {
            session.authorize(&credentials.user, &credentials.pass)?;
        }
        info!(pool = %pool.config.name, workers = pool.credentials.len(), "Connected");
        pool.link = Link::Live(PoolConnection::new(transport, session, now));
        pool.stats.activations += 1;
        pool.activated_at = Some(now);
        events.push(PoolEvent::Connection {
            pool: id,
            event: ConnectionEvent::Ready,
        });
        Ok(())
    }

    fn handle_refresh(
        &mut self,
        id: PoolId,
        refreshed: RefreshEvents,
        now: Instant,
        events: &mut Vec<PoolEvent>,
    ) {
        let delay = self.settings.reconnect_delay;
        let policy = self.settings.auth_failure_policy;
        let Some(pool) = self.pools.get_mut(id) else {
            return;
        };

        let mut all_failed = false;
        for event in &refreshed.session {
            match event {
                SessionEvent::ShareResult {
                    id: request,
                    worker,
                    accepted,
                    reason,
                } => {
                    if *accepted {
                        pool.stats.shares.accepted += 1;
                        info!(pool = %pool.config.name, id = request, worker = %worker, "Share accepted");
                    } else {
                        pool.stats.shares.rejected += 1;
                        warn!(
                            pool = %pool.config.name,
                            id = request,
                            worker = %worker,
                            reason = reason.as_deref().unwrap_or("none"),
                            "Share rejected"
                        );
                    }
                }
                SessionEvent::AllWorkersFailed => all_failed = true,
                _ => {}
            }
        }

        if let Some(violation) = refreshed.violation {
            error!(pool = %pool.config.name, error = %violation, "Protocol violation, closing");
            self.disconnect(id, now, ConnectionEvent::Closing, Some(delay), events);
            return;
        }
        if refreshed.conn_failed {
            warn!(pool = %pool.config.name, "Connection lost");
            self.disconnect(id, now, ConnectionEvent::Failed, Some(delay), events);
            return;
        }
        if all_failed && policy == AuthFailurePolicy::DisableWorker {
            warn!(pool = %pool.config.name, "Every worker failed authorization, closing");
            self.disconnect(id, now, ConnectionEvent::Closing, Some(delay), events);
            return;
        }

        let Link::Live(conn) = &pool.link else {
            return;
        };
        let session = conn.session();
        if refreshed.new_work {
            match session.gen_work() {
                Ok(factory) => {
                    let factory = Arc::new(factory);
                    if !factory.restart() {
                        if let Some(previous) = &pool.factory {
                            factory.continuing(previous);
                        }
                    }
                    pool.factory = Some(Arc::clone(&factory));
                    events.push(PoolEvent::NewWork {
                        pool: id,
                        factory,
                        diff: session.work_diff(),
                    });
                }
                Err(e) => warn!(pool = %pool.config.name, error = %e, "Cannot build work"),
            }
        } else if refreshed.diff_changed {
            events.push(PoolEvent::DiffChanged {
                pool: id,
                diff: session.work_diff(),
            });
        }
    }

    /// Drop the link of `id` and optionally schedule a retry after `retry`.
    fn disconnect(
        &mut self,
        id: PoolId,
        now: Instant,
        event: ConnectionEvent,
        retry: Option<Duration>,
        events: &mut Vec<PoolEvent>,
    ) {
        let Some(pool) = self.pools.get_mut(id) else {
            return;
        };
        let was_live = matches!(pool.link, Link::Live(_));
        pool.link = Link::Idle;
        pool.factory = None;
        if let Some(at) = pool.activated_at.take() {
            pool.stats.connected_time += now.saturating_duration_since(at);
            pool.stats.last_disconnect = Some(now);
        }
        pool.next_attempt = retry.map(|d| now + d);

        events.push(PoolEvent::Connection { pool: id, event });
        if was_live {
            events.push(PoolEvent::NoWork { pool: id });
        }
    }
}

fn connect_error_event(error: &TransportError) -> ConnectionEvent {
    match error {
        TransportError::Resolve { .. } => ConnectionEvent::FailedResolve,
        TransportError::NoRoutes(_) => ConnectionEvent::NoRoutes,
        TransportError::Socket(_) => ConnectionEvent::BadSocket,
        TransportError::Connect(_) => ConnectionEvent::FailedConnect,
    }
}
