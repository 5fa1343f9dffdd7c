//! Worker threads driving compute dispatchers.
//!
//! Each worker owns one [`ComputeDispatcher`] for its whole life and runs a
//! pump loop:
//!
//! - With no work cached, ask the registry for some; sleep if there is none.
//! - Every validation interval, check the cached work is still the pool's
//!   current work (by generation) and drop it if not.
//! - Feed a new header and target to the dispatcher when needed.
//! - Tick the dispatcher and act on the outcome.
//!
//! Workers never touch pool connections. Results leave through the
//! [`ResultsQueue`], and stale work is noticed at the next validation rather
//! than by interrupting the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::policy::PoolSelectionPolicy;
use super::registry::{PoolRegistry, ResultsQueue, WorkSnapshot};
use super::verify::{check_results, ScanRecord};
use super::{BlockVerifier, ComputeDispatcher, DispatchError, NonceOrigin, Tick};
use crate::tracing::prelude::*;
use crate::work::{AlgoParams, WorkDiff, WorkError};

/// A running worker that has not reported for this long is unresponsive.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// A worker that has not built a header for this long is reported as idle.
pub const WORK_GENERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Builds a dispatcher on its worker thread.
pub type DispatcherBuilder =
    Box<dyn FnOnce() -> Result<Box<dyn ComputeDispatcher>, DispatchError> + Send>;

/// Lifecycle of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerStatus {
    Created,
    Running,
    /// No pool has work
    Sleeping,
    /// The dispatcher could not be built; the device is excluded
    InitFailed,
    /// The worker stopped on a device error
    Failed,
}

/// What a worker reports about itself.
#[derive(Debug, Clone)]
pub struct WorkerHealth {
    pub status: MinerStatus,
    /// Why the worker stopped
    pub message: Option<String>,
    pub last_update: Instant,
    pub last_work_generated: Option<Instant>,
    pub scans: u64,
    pub accepted: u64,
    pub discarded: u64,
    pub hw_errors: u64,
    /// Shares dropped at submission because the pool had moved on
    pub stale: u64,
}

impl WorkerHealth {
    fn new(now: Instant) -> Self {
        Self {
            status: MinerStatus::Created,
            message: None,
            last_update: now,
            last_work_generated: None,
            scans: 0,
            accepted: 0,
            discarded: 0,
            hw_errors: 0,
            stale: 0,
        }
    }

    pub fn has_failed(&self) -> bool {
        matches!(self.status, MinerStatus::InitFailed | MinerStatus::Failed)
    }

    /// A running worker that stopped updating.
    pub fn is_unresponsive(&self, now: Instant) -> bool {
        self.status == MinerStatus::Running
            && now.saturating_duration_since(self.last_update) > HEARTBEAT_TIMEOUT
    }

    /// A running worker that has not produced a header recently.
    pub fn is_idle(&self, now: Instant) -> bool {
        self.status == MinerStatus::Running
            && self
                .last_work_generated
                .is_some_and(|at| now.saturating_duration_since(at) > WORK_GENERATION_TIMEOUT)
    }
}

/// Summary of every worker's health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub total: usize,
    pub failed: Vec<usize>,
    pub unresponsive: Vec<usize>,
    pub idle: Vec<usize>,
    /// `(worker, stale shares)` for every worker with any
    pub stale: Vec<(usize, u64)>,
}

impl HealthReport {
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.failed.len() == self.total
    }
}

/// Pacing of one worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Sleep when no pool has work
    pub sleep_interval: Duration,
    /// How often cached work is checked against the registry
    pub validation_interval: Duration,
    /// Longest single wait for the device
    pub device_wait: Duration,
}

impl WorkerSettings {
    /// Staggered defaults so workers do not wake in lockstep.
    pub fn for_index(index: usize) -> Self {
        let index = index as u64;
        Self {
            sleep_interval: Duration::from_millis(500 + 50 * index),
            validation_interval: Duration::from_millis(100 + 10 * index),
            device_wait: Duration::from_millis(100),
        }
    }
}

/// Everything workers share.
#[derive(Clone)]
pub struct EngineContext {
    pub registry: Arc<PoolRegistry>,
    pub results: Arc<ResultsQueue>,
    pub policy: Arc<dyn PoolSelectionPolicy>,
    pub verifier: Arc<dyn BlockVerifier>,
    pub algo: AlgoParams,
}

struct WorkerHandle {
    health: Arc<Mutex<WorkerHealth>>,
    thread: Option<JoinHandle<()>>,
}

/// Owns the worker threads.
pub struct DispatchEngine {
    context: EngineContext,
    shutdown: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
}

impl DispatchEngine {
    pub fn new(context: EngineContext) -> Self {
        Self {
            context,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    /// Start a worker with the default pacing for its index.
    pub fn spawn(&mut self, build: DispatcherBuilder) -> std::io::Result<usize> {
        let settings = WorkerSettings::for_index(self.workers.len());
        self.spawn_with(build, settings)
    }

    /// Start a worker, returning its index.
    pub fn spawn_with(
        &mut self,
        build: DispatcherBuilder,
        settings: WorkerSettings,
    ) -> std::io::Result<usize> {
        let index = self.workers.len();
        let health = Arc::new(Mutex::new(WorkerHealth::new(Instant::now())));
        let context = self.context.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let thread_health = Arc::clone(&health);

        let thread = thread::Builder::new()
            .name(format!("miner-{}", index))
            .spawn(move || run(index, build, settings, context, thread_health, shutdown))?;

        self.workers.push(WorkerHandle {
            health,
            thread: Some(thread),
        });
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn health(&self, index: usize) -> Option<WorkerHealth> {
        self.workers.get(index).map(|w| w.health.lock().clone())
    }

    /// Charge `count` stale shares to worker `index`.
    pub fn record_stale(&self, index: usize, count: u64) {
        if let Some(worker) = self.workers.get(index) {
            worker.health.lock().stale += count;
        }
    }

    pub fn report(&self, now: Instant) -> HealthReport {
        let mut report = HealthReport {
            total: self.workers.len(),
            ..Default::default()
        };
        for (index, worker) in self.workers.iter().enumerate() {
            let health = worker.health.lock();
            if health.stale > 0 {
                report.stale.push((index, health.stale));
            }
            if health.has_failed() {
                report.failed.push(index);
            } else if health.is_unresponsive(now) {
                report.unresponsive.push(index);
            } else if health.is_idle(now) {
                report.idle.push(index);
            }
        }
        report
    }

    /// Ask every worker to stop and wait for them.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for (index, worker) in self.workers.iter_mut().enumerate() {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!(worker = index, "Worker thread panicked");
                }
            }
        }
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    index: usize,
    build: DispatcherBuilder,
    settings: WorkerSettings,
    context: EngineContext,
    health: Arc<Mutex<WorkerHealth>>,
    shutdown: Arc<AtomicBool>,
) {
    let dispatcher = match build() {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(worker = index, error = %e, "Worker failed to initialize");
            let mut health = health.lock();
            health.status = MinerStatus::InitFailed;
            health.message = Some(e.to_string());
            return;
        }
    };
    info!(worker = index, device = dispatcher.name(), "Worker started");
    {
        let mut health = health.lock();
        health.status = MinerStatus::Running;
        health.last_update = Instant::now();
    }

    let mut pump = Pump::new(index, settings, dispatcher);
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = pump.step(&context, &health) {
            error!(worker = index, error = %e, "Worker stopped");
            let mut health = health.lock();
            health.status = MinerStatus::Failed;
            health.message = Some(e.to_string());
            return;
        }
        let mut health = health.lock();
        if health.status == MinerStatus::Running {
            health.last_update = Instant::now();
        }
    }
    debug!(worker = index, "Worker exiting");
}

/// Per-thread dispatch state.
struct Pump {
    index: usize,
    settings: WorkerSettings,
    dispatcher: Box<dyn ComputeDispatcher>,
    work: Option<WorkSnapshot>,
    validated_at: Instant,
    diff: WorkDiff,
    /// The target has not been given to the dispatcher yet
    diff_dirty: bool,
    started: bool,
    in_flight: Vec<ScanRecord>,
    /// Template for records of target-only feeds
    last_record: Option<ScanRecord>,
}

impl Pump {
    fn new(index: usize, settings: WorkerSettings, dispatcher: Box<dyn ComputeDispatcher>) -> Self {
        Self {
            index,
            settings,
            dispatcher,
            work: None,
            validated_at: Instant::now(),
            diff: WorkDiff::default(),
            diff_dirty: false,
            started: false,
            in_flight: Vec::new(),
            last_record: None,
        }
    }

    fn step(
        &mut self,
        context: &EngineContext,
        health: &Mutex<WorkerHealth>,
    ) -> Result<(), DispatchError> {
        let mut new_work = false;

        if self.work.is_none() {
            let Some(snapshot) = context.registry.select(context.policy.as_ref()) else {
                health.lock().status = MinerStatus::Sleeping;
                thread::sleep(self.settings.sleep_interval);
                health.lock().status = MinerStatus::Running;
                return Ok(());
            };
            debug!(worker = self.index, job = snapshot.factory.job(), "Picked up work");
            if snapshot.diff != self.diff {
                self.diff = snapshot.diff;
                self.diff_dirty = true;
            }
            self.work = Some(snapshot);
            self.validated_at = Instant::now();
            new_work = true;
        }

        if self.validated_at.elapsed() > self.settings.validation_interval {
            let Some(work) = &self.work else {
                return Ok(());
            };
            match context.registry.current(work.pool) {
                Some((generation, _, diff)) if generation == work.generation => {
                    self.validated_at = Instant::now();
                    if diff != self.diff {
                        self.diff = diff;
                        self.diff_dirty = true;
                    }
                }
                _ => {
                    debug!(worker = self.index, job = work.factory.job(), "Work superseded");
                    self.dispatcher.cancel();
                    self.started = false;
                    self.work = None;
                    return Ok(());
                }
            }
        }

        if !self.started {
            self.feed(context, health, new_work);
        }

        match self.dispatcher.tick()? {
            Tick::Dispatched => self.started = true,
            Tick::Exhausted => self.feed(context, health, true),
            Tick::Working => {
                let dispatcher = &self.dispatcher;
                self.in_flight.retain(|record| dispatcher.is_in_flight(&record.header));
                self.dispatcher.wait(self.settings.device_wait)?;
            }
            Tick::Results => self.collect(context, health),
        }
        Ok(())
    }

    /// Give the dispatcher a new header and/or target.
    fn feed(&mut self, context: &EngineContext, health: &Mutex<WorkerHealth>, new_work: bool) {
        let Some(work) = &self.work else {
            return;
        };
        let mut record = None;

        if new_work {
            match work.factory.make_nonced_header(&context.algo) {
                Ok(built) => {
                    let header = built.hashed_header();
                    self.dispatcher.set_header(&header);
                    health.lock().last_work_generated = Some(Instant::now());
                    record = Some(ScanRecord {
                        origin: NonceOrigin {
                            pool: work.pool,
                            job: built.job,
                        },
                        network_diff: built.network_diff,
                        target_diff: self.diff.share_diff,
                        share_mul: work.share_mul,
                        nonce2: built.nonce2,
                        header,
                    });
                }
                Err(WorkError::Nonce2Exhausted(job)) => {
                    warn!(worker = self.index, job = %job, "Extranonce2 exhausted, waiting for new work");
                    self.dispatcher.cancel();
                    self.started = false;
                    self.work = None;
                    return;
                }
                Err(e) => {
                    warn!(worker = self.index, error = %e, "Cannot build header");
                    self.work = None;
                    return;
                }
            }
        }

        if self.diff_dirty {
            self.dispatcher.set_target(self.diff.target.high());
            self.diff_dirty = false;
            if record.is_none() {
                record = self.last_record.clone().map(|mut r| {
                    r.target_diff = self.diff.share_diff;
                    r
                });
            }
        }

        if let Some(record) = record {
            let dispatcher = &self.dispatcher;
            self.in_flight.retain(|r| dispatcher.is_in_flight(&r.header));
            self.last_record = Some(record.clone());
            self.in_flight.push(record);
        }
    }

    /// Verify a completed scan and queue anything worth submitting.
    fn collect(&mut self, context: &EngineContext, health: &Mutex<WorkerHealth>) {
        let mined = self.dispatcher.results();
        health.lock().scans += 1;
        if mined.nonces.is_empty() {
            return;
        }
        self.started = false;

        // The latest record for a header carries the latest target
        let Some(record) = self.in_flight.iter().rev().find(|r| r.header == mined.header) else {
            warn!(worker = self.index, nonces = mined.nonces.len(), "Results for unknown header");
            return;
        };
        let batch = check_results(context.verifier.as_ref(), &mined.nonces, record, self.index);

        {
            let mut health = health.lock();
            health.accepted += batch.accepted.len() as u64;
            health.discarded += batch.discarded as u64;
            health.hw_errors += batch.wrong as u64;
        }
        if batch.wrong > 0 {
            warn!(worker = self.index, wrong = batch.wrong, "Device produced bad results");
        }
        if batch.total() > 0 {
            context.results.push(record.origin.clone(), batch);
        }
    }
}
