//! Per-connection stratum protocol state.
//!
//! A [`ProtocolSession`] exists for as long as one transport connection is
//! live. It never touches the socket: outgoing lines accumulate in an
//! outbound queue that the owning pool connection drains, and incoming lines
//! are handed to [`ProtocolSession::dispatch_incoming`], which returns the
//! resulting [`SessionEvent`]s or a protocol violation.
//!
//! Replies are routed by remembering the kind of request each id was issued
//! for. Every id placed in the outstanding map is removed exactly once, by its
//! reply or by [`ProtocolSession::cancel_request`].

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{StratumError, StratumResult};
use super::messages::{
    to_line, ClientReply, ClientRequest, Incoming, MiningJob, PoolErrorReply, RequestKind,
    ServerMethod, SubmitParams, SubscribeReply,
};
use crate::tracing::prelude::*;
use crate::work::{DiffMode, DiffMultipliers, Extranonce2, MerkleMode, WorkDiff, WorkError, WorkFactory};

/// Difficulty assumed until the pool sends `mining.set_difficulty`.
pub const DEFAULT_DIFFICULTY: f64 = 16.0;

/// What to do when the pool rejects a worker's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthFailurePolicy {
    /// Mark that worker failed and keep the session.
    #[default]
    DisableWorker,
    /// Treat the rejection as a protocol violation.
    FatalSession,
}

/// Connection-level protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection, so no session
    Disconnected,
    Subscribing,
    Subscribed,
    Authorizing,
    Ready,
}

/// Authorization status of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Pending,
    Accepted,
    /// No authorize reply, but the pool answered a share
    Inferred,
    NotRequired,
    Failed,
}

/// Share counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareCounts {
    pub sent: u64,
    pub accepted: u64,
    pub rejected: u64,
}

/// One set of credentials on this connection.
#[derive(Debug, Clone)]
pub struct Worker {
    pub name: String,
    pub status: AuthStatus,
    /// Id of the authorize request
    pub request_id: u64,
    pub shares: ShareCounts,
}

/// Notable outcomes of dispatching one incoming line.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Subscribed {
        extranonce2_size: u8,
    },
    WorkerAuthorized {
        worker: String,
        status: AuthStatus,
    },
    /// Every worker on this connection failed authorization.
    AllWorkersFailed,
    NewJob {
        job_id: String,
        clean: bool,
    },
    DifficultyChanged(f64),
    /// `client.get_version` was answered.
    VersionQueried,
    ShareResult {
        id: u64,
        worker: String,
        accepted: bool,
        reason: Option<String>,
    },
    /// A request was answered with an error.
    RequestFailed {
        id: u64,
        kind: RequestKind,
        error: PoolErrorReply,
    },
}

/// Job or difficulty update from the pool.
#[derive(Debug, Clone)]
enum Notice {
    Job(MiningJob),
    Difficulty(f64),
}

/// Per-pool settings the session needs.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Answer to `client.get_version`
    pub user_agent: String,
    pub multipliers: DiffMultipliers,
    pub merkle_mode: MerkleMode,
    pub diff_mode: DiffMode,
    pub auth_failure_policy: AuthFailurePolicy,
}

/// Stratum protocol state machine for one connection.
#[derive(Debug)]
pub struct ProtocolSession {
    settings: SessionSettings,
    next_id: u64,
    pending: HashMap<u64, RequestKind>,
    /// Submit id to index into `workers`
    submitted: HashMap<u64, usize>,
    outbound: VecDeque<String>,
    subscription: Option<SubscribeReply>,
    workers: Vec<Worker>,
    job: Option<MiningJob>,
    difficulty: f64,
    work_diff: WorkDiff,
    last_job_at: Option<Instant>,
    error_count: u64,
    /// Notices received before the subscribe reply, applied once it arrives
    deferred: Vec<Notice>,
}

impl ProtocolSession {
    /// Create a session and queue `mining.subscribe`.
    pub fn new(settings: SessionSettings) -> StratumResult<Self> {
        let work_diff = WorkDiff::new(DEFAULT_DIFFICULTY, &settings.multipliers, settings.diff_mode);
        let mut session = Self {
            settings,
            next_id: 1,
            pending: HashMap::new(),
            submitted: HashMap::new(),
            outbound: VecDeque::new(),
            subscription: None,
            workers: Vec::new(),
            job: None,
            difficulty: DEFAULT_DIFFICULTY,
            work_diff,
            last_job_at: None,
            error_count: 0,
            deferred: Vec::new(),
        };
        session.push_request(RequestKind::Subscribe, json!([]))?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        if self.subscription.is_none() {
            SessionState::Subscribing
        } else if self.workers.is_empty() {
            SessionState::Subscribed
        } else if self
            .workers
            .iter()
            .any(|w| w.status == AuthStatus::Pending)
        {
            SessionState::Authorizing
        } else {
            SessionState::Ready
        }
    }

    /// Queue `mining.authorize` for `user`, unless it is already known.
    ///
    /// Returns the request id, or `None` if the user already has an entry.
    pub fn authorize(&mut self, user: &str, pass: &str) -> StratumResult<Option<u64>> {
        if self.workers.iter().any(|w| w.name == user) {
            return Ok(None);
        }
        let id = self.push_request(RequestKind::Authorize, json!([user, pass]))?;
        self.workers.push(Worker {
            name: user.to_string(),
            status: AuthStatus::Pending,
            request_id: id,
            shares: ShareCounts::default(),
        });
        Ok(Some(id))
    }

    /// Queue `mining.submit` for a share on the current job.
    ///
    /// The share goes out under the first worker that has not failed
    /// authorization.
    pub fn send_share(
        &mut self,
        job: &str,
        ntime: u32,
        nonce2: Extranonce2,
        nonce: u32,
    ) -> StratumResult<u64> {
        if self.get_job_network_time(job) == 0 {
            return Err(StratumError::StaleJob(job.to_string()));
        }
        let index = self
            .workers
            .iter()
            .position(|w| w.status != AuthStatus::Failed)
            .ok_or(StratumError::NoWorker)?;

        let params = SubmitParams {
            username: self.workers[index].name.clone(),
            job_id: job.to_string(),
            extranonce2: nonce2,
            ntime,
            nonce,
        };
        let id = self.push_request(RequestKind::Submit, params.to_stratum_json())?;
        self.submitted.insert(id, index);
        self.workers[index].shares.sent += 1;
        Ok(id)
    }

    /// The current job's ntime, or 0 if `job` is not the current job.
    pub fn get_job_network_time(&self, job: &str) -> u32 {
        match &self.job {
            Some(current) if current.job_id == job => current.ntime,
            _ => 0,
        }
    }

    /// Process one incoming line.
    pub fn dispatch_incoming(
        &mut self,
        line: &str,
        now: Instant,
    ) -> StratumResult<Vec<SessionEvent>> {
        match Incoming::parse(line)? {
            Incoming::Request { id, method, params } => self.handle_request(id, &method, &params, now),
            Incoming::Reply { id, result, error } => self.handle_reply(id, &result, error, now),
        }
    }

    /// Remove `id` from the outstanding requests, returning what it was for.
    ///
    /// An error reply to a submit counts as a rejected share.
    pub fn request_reply_received(&mut self, id: u64, error: bool) -> StratumResult<RequestKind> {
        let kind = self
            .pending
            .remove(&id)
            .ok_or(StratumError::UnknownReplyId(id))?;
        if error {
            self.error_count += 1;
        }
        Ok(kind)
    }

    /// Forget an outstanding request without waiting for its reply.
    pub fn cancel_request(&mut self, id: u64) -> bool {
        self.submitted.remove(&id);
        self.pending.remove(&id).is_some()
    }

    pub fn is_outstanding(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn outstanding_count(&self) -> usize {
        self.pending.len()
    }

    /// Next line waiting to be sent.
    pub fn next_outbound(&self) -> Option<&[u8]> {
        self.outbound.front().map(|line| line.as_bytes())
    }

    /// The line returned by `next_outbound` has been fully sent.
    pub fn outbound_sent(&mut self) {
        self.outbound.pop_front();
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn subscription(&self) -> Option<&SubscribeReply> {
        self.subscription.as_ref()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Authorization status of `name`; unknown workers count as failed.
    pub fn auth_status(&self, name: &str) -> AuthStatus {
        self.workers
            .iter()
            .find(|w| w.name == name)
            .map_or(AuthStatus::Failed, |w| w.status)
    }

    pub fn job(&self) -> Option<&MiningJob> {
        self.job.as_ref()
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    /// Current difficulty with the target derived from it.
    pub fn work_diff(&self) -> WorkDiff {
        self.work_diff
    }

    pub fn last_job_at(&self) -> Option<Instant> {
        self.last_job_at
    }

    /// Number of error replies received.
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Build a work factory for the current job.
    pub fn gen_work(&self) -> Result<WorkFactory, WorkError> {
        let subscription = self.subscription.as_ref().ok_or(WorkError::NotSubscribed)?;
        let job = self.job.as_ref().ok_or(WorkError::NoJob)?;
        if self.difficulty <= 0.0 {
            return Err(WorkError::InvalidDifficulty(self.difficulty));
        }
        WorkFactory::new(
            job,
            &subscription.extranonce1,
            subscription.extranonce2_size,
            self.settings.merkle_mode,
        )
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        id
    }

    fn push_request(&mut self, kind: RequestKind, params: Value) -> StratumResult<u64> {
        let id = self.next_id();
        let line = to_line(&ClientRequest {
            id: id.to_string(),
            method: kind.method(),
            params,
        })?;
        trace!(tx = %line.trim_end(), "Queued request");
        self.outbound.push_back(line);
        self.pending.insert(id, kind);
        Ok(id)
    }

    fn handle_request(
        &mut self,
        id: Value,
        method: &str,
        params: &[Value],
        now: Instant,
    ) -> StratumResult<Vec<SessionEvent>> {
        let Some(method) = ServerMethod::from_name(method) else {
            warn!(method = %method, "Unknown server method");
            return Ok(Vec::new());
        };

        match method {
            ServerMethod::Notify => {
                let job = MiningJob::from_stratum_params(params)
                    .map_err(|e| StratumError::InvalidMessage(format!("mining.notify: {}", e)))?;
                Ok(self.notice(Notice::Job(job), now))
            }
            ServerMethod::SetDifficulty => {
                let difficulty = params.first().and_then(Value::as_f64).ok_or_else(|| {
                    StratumError::InvalidMessage("mining.set_difficulty param not a number".to_string())
                })?;
                if difficulty <= 0.0 {
                    warn!(difficulty, "Ignoring non-positive difficulty");
                    return Ok(Vec::new());
                }
                Ok(self.notice(Notice::Difficulty(difficulty), now))
            }
            ServerMethod::GetVersion => {
                let line = to_line(&ClientReply {
                    id,
                    result: Value::String(self.settings.user_agent.clone()),
                    error: Value::Null,
                })?;
                trace!(tx = %line.trim_end(), "Queued reply");
                self.outbound.push_back(line);
                Ok(vec![SessionEvent::VersionQueried])
            }
        }
    }

    /// Apply `notice`, or hold it until the subscription exists. A job is
    /// meaningless without the extranonce1 the subscribe reply carries.
    fn notice(&mut self, notice: Notice, now: Instant) -> Vec<SessionEvent> {
        if self.subscription.is_none() {
            debug!(?notice, "Holding notice until subscribed");
            self.deferred.push(notice);
            return Vec::new();
        }
        self.apply_notice(notice, now)
    }

    fn apply_notice(&mut self, notice: Notice, now: Instant) -> Vec<SessionEvent> {
        match notice {
            Notice::Job(job) => {
                debug!(job = %job.job_id, clean = job.clean_jobs, ntime = job.ntime, "New job");
                let event = SessionEvent::NewJob {
                    job_id: job.job_id.clone(),
                    clean: job.clean_jobs,
                };
                self.job = Some(job);
                self.last_job_at = Some(now);
                vec![event]
            }
            Notice::Difficulty(difficulty) => {
                debug!(difficulty, "Difficulty changed");
                self.difficulty = difficulty;
                self.work_diff =
                    WorkDiff::new(difficulty, &self.settings.multipliers, self.settings.diff_mode);
                vec![SessionEvent::DifficultyChanged(difficulty)]
            }
        }
    }

    fn handle_reply(
        &mut self,
        id: u64,
        result: &Value,
        error: Option<PoolErrorReply>,
        now: Instant,
    ) -> StratumResult<Vec<SessionEvent>> {
        let kind = self.request_reply_received(id, error.is_some())?;
        let mut events = Vec::new();
        if let Some(error) = &error {
            debug!(id, method = kind.method(), error = %error, "Request failed");
            events.push(SessionEvent::RequestFailed {
                id,
                kind,
                error: error.clone(),
            });
        }

        match kind {
            RequestKind::Subscribe => {
                if let Some(error) = error {
                    return Err(StratumError::InvalidMessage(format!(
                        "subscription refused: {}",
                        error
                    )));
                }
                let reply = SubscribeReply::from_result(result)
                    .map_err(|e| StratumError::InvalidMessage(format!("mining.subscribe: {}", e)))?;
                Extranonce2::check_size(reply.extranonce2_size).map_err(|e| {
                    StratumError::InvalidMessage(format!("mining.subscribe: {}", e))
                })?;
                debug!(
                    extranonce1 = %hex::encode(&reply.extranonce1),
                    extranonce2_size = reply.extranonce2_size,
                    "Subscribed"
                );
                events.push(SessionEvent::Subscribed {
                    extranonce2_size: reply.extranonce2_size,
                });
                self.subscription = Some(reply);
                for notice in std::mem::take(&mut self.deferred) {
                    events.extend(self.apply_notice(notice, now));
                }
            }
            RequestKind::Authorize => {
                let status = match (&error, result) {
                    (Some(_), _) => AuthStatus::Failed,
                    (None, Value::Null) => AuthStatus::NotRequired,
                    (None, Value::Bool(true)) => AuthStatus::Accepted,
                    (None, Value::Bool(false)) => AuthStatus::Failed,
                    (None, other) => {
                        return Err(StratumError::InvalidMessage(format!(
                            "mining.authorize result not a bool: {}",
                            other
                        )))
                    }
                };
                events.extend(self.worker_authorized(id, status)?);
            }
            RequestKind::Submit => {
                let accepted = match (&error, result) {
                    (Some(_), _) => false,
                    (None, Value::Bool(accepted)) => *accepted,
                    (None, other) => {
                        return Err(StratumError::InvalidMessage(format!(
                            "mining.submit result not a bool: {}",
                            other
                        )))
                    }
                };
                if let Some(index) = self.submitted.remove(&id) {
                    let worker = &mut self.workers[index];
                    if accepted {
                        worker.shares.accepted += 1;
                    } else {
                        worker.shares.rejected += 1;
                    }
                    if worker.status == AuthStatus::Pending {
                        worker.status = AuthStatus::Inferred;
                    }
                    events.push(SessionEvent::ShareResult {
                        id,
                        worker: worker.name.clone(),
                        accepted,
                        reason: error.map(|e| e.message),
                    });
                }
            }
        }
        Ok(events)
    }

    fn worker_authorized(
        &mut self,
        id: u64,
        status: AuthStatus,
    ) -> StratumResult<Vec<SessionEvent>> {
        let Some(worker) = self.workers.iter_mut().find(|w| w.request_id == id) else {
            return Ok(Vec::new());
        };
        worker.status = status;
        let name = worker.name.clone();

        if status != AuthStatus::Failed {
            info!(worker = %name, status = ?status, "Worker authorized");
            return Ok(vec![SessionEvent::WorkerAuthorized { worker: name, status }]);
        }

        warn!(worker = %name, "Worker failed authorization");
        if self.settings.auth_failure_policy == AuthFailurePolicy::FatalSession {
            return Err(StratumError::AuthorizationFailed(name));
        }
        let mut events = vec![SessionEvent::WorkerAuthorized { worker: name, status }];
        if self.workers.iter().all(|w| w.status == AuthStatus::Failed) {
            events.push(SessionEvent::AllWorkersFailed);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const SUBSCRIBE_REPLY: &str = r#"{"id":"1","result":[[["mining.notify","ae6812eb4cd7735a302a8a9dd95cf71f"]],"f8002222",4],"error":null}"#;

    const NOTIFY: &str = r#"{"id":null,"method":"mining.notify","params":["bf","4d16b6f85af6e2198f44ae2a6de67f78487ae5611b77c6c0440b921e00000000","01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff20020862062f503253482f04b8864e5008","072f736c7573682f000000000100f2052a010000001976a914d23fcdf86f7e756a64a7a9688ef9903327048ed988ac00000000",[],"00000002","1c2ac4af","504e86b9",false]}"#;

    fn settings() -> SessionSettings {
        SessionSettings {
            user_agent: "stratum-miner/test".to_string(),
            multipliers: DiffMultipliers::default(),
            merkle_mode: MerkleMode::Sha256d,
            diff_mode: DiffMode::Btc,
            auth_failure_policy: AuthFailurePolicy::DisableWorker,
        }
    }

    fn drain(session: &mut ProtocolSession) -> Vec<Value> {
        let mut lines = Vec::new();
        while let Some(line) = session.next_outbound() {
            let text = std::str::from_utf8(line).unwrap();
            assert!(text.ends_with('\n'));
            lines.push(serde_json::from_str(text).unwrap());
            session.outbound_sent();
        }
        lines
    }

    fn subscribed() -> ProtocolSession {
        let mut session = ProtocolSession::new(settings()).unwrap();
        drain(&mut session);
        session
            .dispatch_incoming(SUBSCRIBE_REPLY, Instant::now())
            .unwrap();
        session
    }

    #[test]
    fn test_new_session_queues_subscribe() {
        let mut session = ProtocolSession::new(settings()).unwrap();
        assert_eq!(session.state(), SessionState::Subscribing);
        assert!(session.is_outstanding(1));
        let lines = drain(&mut session);
        assert_eq!(
            lines,
            vec![json!({"id": "1", "method": "mining.subscribe", "params": []})]
        );
    }

    #[test]
    fn test_subscribe_then_authorize_scenario() {
        let mut session = ProtocolSession::new(settings()).unwrap();
        drain(&mut session);
        let events = session
            .dispatch_incoming(SUBSCRIBE_REPLY, Instant::now())
            .unwrap();
        assert_eq!(events, vec![SessionEvent::Subscribed { extranonce2_size: 4 }]);
        assert_eq!(session.state(), SessionState::Subscribed);
        let sub = session.subscription().unwrap();
        assert_eq!(sub.session_id.as_deref(), Some("ae6812eb4cd7735a302a8a9dd95cf71f"));
        assert_eq!(sub.extranonce1, vec![0xf8, 0x00, 0x22, 0x22]);
        assert_eq!(session.outstanding_count(), 0);

        let id = session.authorize("alice", "x").unwrap().unwrap();
        assert_eq!(session.outstanding_count(), 1);
        assert!(session.is_outstanding(id));
        assert_eq!(session.state(), SessionState::Authorizing);
        let lines = drain(&mut session);
        assert_eq!(
            lines,
            vec![json!({"id": id.to_string(), "method": "mining.authorize", "params": ["alice", "x"]})]
        );

        let reply = format!(r#"{{"id":"{}","error":null,"result":true}}"#, id);
        let events = session.dispatch_incoming(&reply, Instant::now()).unwrap();
        assert_eq!(
            events,
            vec![SessionEvent::WorkerAuthorized {
                worker: "alice".to_string(),
                status: AuthStatus::Accepted,
            }]
        );
        assert_eq!(session.auth_status("alice"), AuthStatus::Accepted);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.outstanding_count(), 0);
    }

    #[test]
    fn test_authorize_is_idempotent_per_user() {
        let mut session = subscribed();
        assert!(session.authorize("alice", "x").unwrap().is_some());
        assert!(session.authorize("alice", "y").unwrap().is_none());
        assert_eq!(session.outstanding_count(), 1);
        assert_eq!(session.outbound_len(), 1);
        assert_eq!(session.workers().len(), 1);
    }

    #[test]
    fn test_request_ids_strictly_increase() {
        let mut session = subscribed();
        let mut last = 1;
        let mut seen = HashSet::new();
        for i in 0..20 {
            let id = session.authorize(&format!("w{}", i), "x").unwrap().unwrap();
            assert!(id > last);
            assert_ne!(id, 0);
            assert!(seen.insert(id));
            assert!(session.is_outstanding(id));
            last = id;
        }
        assert_eq!(session.outstanding_count(), 20);
    }

    #[test]
    fn test_id_counter_skips_zero_on_wrap() {
        let mut session = subscribed();
        session.next_id = u64::MAX;
        assert_eq!(session.authorize("a", "x").unwrap(), Some(u64::MAX));
        assert_eq!(session.authorize("b", "x").unwrap(), Some(1));
    }

    #[test]
    fn test_auth_null_result_means_not_required() {
        let mut session = subscribed();
        let id = session.authorize("bob", "x").unwrap().unwrap();
        let reply = format!(r#"{{"id":{},"result":null,"error":null}}"#, id);
        session.dispatch_incoming(&reply, Instant::now()).unwrap();
        assert_eq!(session.auth_status("bob"), AuthStatus::NotRequired);
    }

    #[test]
    fn test_all_workers_failed() {
        let mut session = subscribed();
        let a = session.authorize("a", "x").unwrap().unwrap();
        let b = session.authorize("b", "x").unwrap().unwrap();

        let reply = format!(r#"{{"id":"{}","result":false,"error":null}}"#, a);
        let events = session.dispatch_incoming(&reply, Instant::now()).unwrap();
        assert!(!events.contains(&SessionEvent::AllWorkersFailed));

        let reply = format!(r#"{{"id":"{}","result":null,"error":[24,"Unauthorized",null]}}"#, b);
        let events = session.dispatch_incoming(&reply, Instant::now()).unwrap();
        assert!(events.contains(&SessionEvent::AllWorkersFailed));
        assert_eq!(session.auth_status("b"), AuthStatus::Failed);
        assert_eq!(session.error_count(), 1);
        assert_eq!(session.outstanding_count(), 0);
    }

    #[test]
    fn test_fatal_auth_policy() {
        let mut settings = settings();
        settings.auth_failure_policy = AuthFailurePolicy::FatalSession;
        let mut session = ProtocolSession::new(settings).unwrap();
        session.dispatch_incoming(SUBSCRIBE_REPLY, Instant::now()).unwrap();
        let id = session.authorize("a", "x").unwrap().unwrap();
        let reply = format!(r#"{{"id":"{}","result":false,"error":null}}"#, id);
        let err = session.dispatch_incoming(&reply, Instant::now()).unwrap_err();
        assert!(matches!(err, StratumError::AuthorizationFailed(name) if name == "a"));
        assert!(!session.is_outstanding(id));
    }

    #[test]
    fn test_unknown_reply_id_is_violation() {
        let mut session = subscribed();
        let err = session
            .dispatch_incoming(r#"{"id":"99","result":true,"error":null}"#, Instant::now())
            .unwrap_err();
        assert!(matches!(err, StratumError::UnknownReplyId(99)));
    }

    #[test]
    fn test_reply_id_removed_exactly_once() {
        let mut session = subscribed();
        let id = session.authorize("a", "x").unwrap().unwrap();
        let reply = format!(r#"{{"id":"{}","result":true,"error":null}}"#, id);
        session.dispatch_incoming(&reply, Instant::now()).unwrap();
        assert!(matches!(
            session.dispatch_incoming(&reply, Instant::now()),
            Err(StratumError::UnknownReplyId(_))
        ));
    }

    #[test]
    fn test_cancel_request() {
        let mut session = subscribed();
        let id = session.authorize("a", "x").unwrap().unwrap();
        assert!(session.cancel_request(id));
        assert!(!session.cancel_request(id));
        assert_eq!(session.outstanding_count(), 0);
    }

    #[test]
    fn test_notify_and_job_network_time() {
        let mut session = subscribed();
        assert_eq!(session.get_job_network_time("bf"), 0);
        let now = Instant::now();
        let events = session.dispatch_incoming(NOTIFY, now).unwrap();
        assert_eq!(
            events,
            vec![SessionEvent::NewJob {
                job_id: "bf".to_string(),
                clean: false,
            }]
        );
        assert_eq!(session.get_job_network_time("bf"), 0x504e86b9);
        assert_eq!(session.get_job_network_time("be"), 0);
        assert_eq!(session.get_job_network_time(""), 0);
        assert_eq!(session.last_job_at(), Some(now));
    }

    #[test]
    fn test_malformed_notify_is_violation() {
        let mut session = subscribed();
        let err = session
            .dispatch_incoming(r#"{"id":null,"method":"mining.notify","params":["bf"]}"#, Instant::now())
            .unwrap_err();
        assert!(matches!(err, StratumError::InvalidMessage(_)));
        assert!(session.job().is_none());
    }

    #[test]
    fn test_set_difficulty() {
        let mut session = subscribed();
        assert_eq!(session.difficulty(), DEFAULT_DIFFICULTY);
        let events = session
            .dispatch_incoming(r#"{"id":null,"method":"mining.set_difficulty","params":[512]}"#, Instant::now())
            .unwrap();
        assert_eq!(events, vec![SessionEvent::DifficultyChanged(512.0)]);
        assert_eq!(session.work_diff().share_diff, 512.0);
        assert_eq!(
            session.work_diff().target,
            crate::work::Target::from_difficulty(512.0, 1.0)
        );

        let events = session
            .dispatch_incoming(r#"{"id":null,"method":"mining.set_difficulty","params":[0]}"#, Instant::now())
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(session.difficulty(), 512.0);
    }

    #[test]
    fn test_neoscrypt_difficulty_uses_pow2_target() {
        let mut session = ProtocolSession::new(SessionSettings {
            multipliers: DiffMultipliers {
                stratum: 1.0 / 65536.0,
                one: 1.0,
                share: 1.0,
            },
            diff_mode: DiffMode::NeoScrypt,
            ..settings()
        })
        .unwrap();
        session.dispatch_incoming(SUBSCRIBE_REPLY, Instant::now()).unwrap();
        session
            .dispatch_incoming(r#"{"id":null,"method":"mining.set_difficulty","params":[65536]}"#, Instant::now())
            .unwrap();
        let diff = session.work_diff();
        assert_eq!(diff.share_diff, 1.0);
        assert_eq!(diff.target, crate::work::Target::from_difficulty_pow2(1.0, 1.0));
        assert_eq!(diff.target.words(), &[0x0000_0000_FFFF_0000, 0, 0, 0]);
    }

    #[test]
    fn test_notices_before_subscribe_reply_are_held() {
        let mut session = ProtocolSession::new(settings()).unwrap();
        drain(&mut session);
        let events = session.dispatch_incoming(NOTIFY, Instant::now()).unwrap();
        assert!(events.is_empty());
        let events = session
            .dispatch_incoming(r#"{"id":null,"method":"mining.set_difficulty","params":[8]}"#, Instant::now())
            .unwrap();
        assert!(events.is_empty());
        assert!(session.job().is_none());
        assert_eq!(session.difficulty(), DEFAULT_DIFFICULTY);
        assert_eq!(session.gen_work().unwrap_err(), WorkError::NotSubscribed);

        let events = session
            .dispatch_incoming(SUBSCRIBE_REPLY, Instant::now())
            .unwrap();
        assert_eq!(
            events,
            vec![
                SessionEvent::Subscribed { extranonce2_size: 4 },
                SessionEvent::NewJob {
                    job_id: "bf".to_string(),
                    clean: false
                },
                SessionEvent::DifficultyChanged(8.0),
            ]
        );
        assert_eq!(session.difficulty(), 8.0);
        assert_eq!(session.gen_work().unwrap().job(), "bf");
    }

    #[test]
    fn test_get_version_reply_echoes_id() {
        let mut session = subscribed();
        let events = session
            .dispatch_incoming(r#"{"id":"7","method":"client.get_version","params":[]}"#, Instant::now())
            .unwrap();
        assert_eq!(events, vec![SessionEvent::VersionQueried]);
        let lines = drain(&mut session);
        assert_eq!(
            lines,
            vec![json!({"id": "7", "result": "stratum-miner/test", "error": null})]
        );
        assert_eq!(session.outstanding_count(), 0);
    }

    #[test]
    fn test_unknown_method_ignored() {
        let mut session = subscribed();
        let events = session
            .dispatch_incoming(r#"{"id":5,"method":"client.reconnect","params":[]}"#, Instant::now())
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_non_numeric_server_id_is_violation() {
        let mut session = subscribed();
        assert!(session
            .dispatch_incoming(r#"{"id":"abc","method":"client.get_version","params":[]}"#, Instant::now())
            .is_err());
    }

    #[test]
    fn test_send_share_requires_current_job() {
        let mut session = subscribed();
        session.authorize("alice", "x").unwrap();
        let nonce2 = Extranonce2::new(1, 4).unwrap();
        assert!(matches!(
            session.send_share("bf", 0x504e86b9, nonce2, 1),
            Err(StratumError::StaleJob(_))
        ));

        session.dispatch_incoming(NOTIFY, Instant::now()).unwrap();
        drain(&mut session);
        let id = session.send_share("bf", 0x504e86b9, nonce2, 0xb2957c02).unwrap();
        assert!(session.is_outstanding(id));
        assert_eq!(
            drain(&mut session),
            vec![json!({
                "id": id.to_string(),
                "method": "mining.submit",
                "params": ["alice", "bf", "00000001", "504e86b9", "b2957c02"]
            })]
        );
        assert_eq!(session.workers()[0].shares.sent, 1);
    }

    #[test]
    fn test_send_share_skips_failed_workers() {
        let mut session = subscribed();
        let a = session.authorize("a", "x").unwrap().unwrap();
        session.authorize("b", "x").unwrap();
        let reply = format!(r#"{{"id":"{}","result":false,"error":null}}"#, a);
        session.dispatch_incoming(&reply, Instant::now()).unwrap();
        session.dispatch_incoming(NOTIFY, Instant::now()).unwrap();

        session
            .send_share("bf", 1, Extranonce2::new(0, 4).unwrap(), 0)
            .unwrap();
        assert_eq!(session.workers()[0].shares.sent, 0);
        assert_eq!(session.workers()[1].shares.sent, 1);
    }

    #[test]
    fn test_send_share_without_workers() {
        let mut session = subscribed();
        session.dispatch_incoming(NOTIFY, Instant::now()).unwrap();
        assert!(matches!(
            session.send_share("bf", 1, Extranonce2::new(0, 4).unwrap(), 0),
            Err(StratumError::NoWorker)
        ));
    }

    #[test]
    fn test_share_replies_update_counters() {
        let mut session = subscribed();
        session.authorize("alice", "x").unwrap();
        session.dispatch_incoming(NOTIFY, Instant::now()).unwrap();
        let nonce2 = Extranonce2::new(0, 4).unwrap();
        let ok = session.send_share("bf", 1, nonce2, 1).unwrap();
        let bad = session.send_share("bf", 1, nonce2, 2).unwrap();

        let events = session
            .dispatch_incoming(&format!(r#"{{"id":{},"result":true,"error":null}}"#, ok), Instant::now())
            .unwrap();
        assert_eq!(
            events,
            vec![SessionEvent::ShareResult {
                id: ok,
                worker: "alice".to_string(),
                accepted: true,
                reason: None,
            }]
        );
        // Share answered before the authorization reply
        assert_eq!(session.auth_status("alice"), AuthStatus::Inferred);

        let events = session
            .dispatch_incoming(
                &format!(r#"{{"id":{},"result":null,"error":{{"code":23,"message":"Low difficulty"}}}}"#, bad),
                Instant::now(),
            )
            .unwrap();
        assert!(events.contains(&SessionEvent::ShareResult {
            id: bad,
            worker: "alice".to_string(),
            accepted: false,
            reason: Some("Low difficulty".to_string()),
        }));
        let shares = session.workers()[0].shares;
        assert_eq!(shares, ShareCounts { sent: 2, accepted: 1, rejected: 1 });
        assert_eq!(session.error_count(), 1);
    }

    #[test]
    fn test_subscribe_error_is_violation() {
        let mut session = ProtocolSession::new(settings()).unwrap();
        let err = session
            .dispatch_incoming(r#"{"id":1,"result":null,"error":[20,"Busy",null]}"#, Instant::now())
            .unwrap_err();
        assert!(matches!(err, StratumError::InvalidMessage(_)));
        assert_eq!(session.outstanding_count(), 0);
    }

    #[test]
    fn test_gen_work() {
        let mut session = ProtocolSession::new(settings()).unwrap();
        assert_eq!(session.gen_work().unwrap_err(), WorkError::NotSubscribed);
        session.dispatch_incoming(SUBSCRIBE_REPLY, Instant::now()).unwrap();
        assert_eq!(session.gen_work().unwrap_err(), WorkError::NoJob);
        session.dispatch_incoming(NOTIFY, Instant::now()).unwrap();
        let factory = session.gen_work().unwrap();
        assert_eq!(factory.job(), "bf");
        assert_eq!(factory.nonce2_size(), 4);
        assert!(!factory.restart());
    }
}
