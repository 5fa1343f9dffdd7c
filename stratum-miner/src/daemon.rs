//! Daemon lifecycle: startup, the IO loop and graceful shutdown.
//!
//! The calling thread owns the [`PoolManager`] and does all network IO.
//! Hashing happens on the worker threads of the [`DispatchEngine`]; the two
//! sides meet only in the [`PoolRegistry`] and the [`ResultsQueue`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::config::Config;
use crate::cpu::{CpuDispatcher, Sha256dVerifier};
use crate::dispatch::policy::FirstPoolWithWork;
use crate::dispatch::registry::{PoolRegistry, ResultsQueue};
use crate::dispatch::worker::{DispatchEngine, DispatcherBuilder, EngineContext};
use crate::dispatch::{ComputeDispatcher, DispatchError};
use crate::pool::{ManagerSettings, PoolEvent, PoolManager};
use crate::tracing::prelude::*;
use crate::transport::tcp::TcpNetwork;
use crate::transport::Network;

/// Longest single wait for network activity.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often pool status and worker health are logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_: nix::libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// Route SIGINT and SIGTERM to [`SHUTDOWN_REQUESTED`] and ignore SIGPIPE,
/// which would otherwise kill us when a pool hangs up mid-write.
fn install_signal_handlers() -> nix::Result<()> {
    let stop = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        signal::sigaction(Signal::SIGINT, &stop)?;
        signal::sigaction(Signal::SIGTERM, &stop)?;
        signal::sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

/// Mirror pool events into the registry the workers read from.
fn apply_events(registry: &PoolRegistry, events: Vec<PoolEvent>) {
    for event in events {
        match event {
            PoolEvent::Connection { pool, event } => {
                debug!(?pool, ?event, "Connection event");
            }
            PoolEvent::NewWork {
                pool,
                factory,
                diff,
            } => registry.set_work(pool, factory, diff),
            PoolEvent::DiffChanged { pool, diff } => registry.set_diff(pool, diff),
            PoolEvent::NoWork { pool } => registry.clear_work(pool),
        }
    }
}

/// The main daemon that coordinates all mining operations.
pub struct Daemon {
    config_path: PathBuf,
}

impl Daemon {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// Run until SIGINT or SIGTERM.
    pub fn run(self) -> anyhow::Result<()> {
        let config = Config::load(&self.config_path)
            .with_context(|| format!("loading {}", self.config_path.display()))?;
        install_signal_handlers().context("installing signal handlers")?;

        let algo = config
            .algo_params(&config.algorithm)
            .with_context(|| format!("no parameters for algorithm {}", config.algorithm))?;

        let mut manager = PoolManager::new(
            TcpNetwork::new(),
            ManagerSettings {
                reconnect_delay: config.reconnect_delay(),
                user_agent: config.user_agent.clone(),
                auth_failure_policy: config.auth_failure_policy,
            },
        );
        let registry = Arc::new(PoolRegistry::new());
        for pool_config in &config.pools {
            let id = manager
                .add_pool(pool_config)
                .with_context(|| format!("adding pool {}", pool_config.name))?;
            registry.register(id, pool_config.diff_multipliers.share);
        }

        let results = Arc::new(ResultsQueue::new());
        let mut engine = DispatchEngine::new(EngineContext {
            registry: Arc::clone(&registry),
            results: Arc::clone(&results),
            policy: Arc::new(FirstPoolWithWork),
            verifier: Arc::new(Sha256dVerifier),
            algo,
        });
        for index in 0..config.cpu_workers {
            let build: DispatcherBuilder =
                Box::new(move || -> Result<Box<dyn ComputeDispatcher>, DispatchError> {
                    Ok(Box::new(CpuDispatcher::new(format!("cpu{}", index))))
                });
            engine.spawn(build).context("spawning worker thread")?;
        }
        if engine.is_empty() {
            bail!("no workers configured");
        }

        info!(
            algorithm = %config.algorithm,
            pools = config.pools.len(),
            workers = engine.len(),
            "Started."
        );
        apply_events(&registry, manager.activate(&config.algorithm, Instant::now()));

        self.serve(&mut manager, &registry, &results, &engine);

        trace!("Shutting down.");
        apply_events(&registry, manager.shutdown(Instant::now()));
        engine.shutdown();
        info!("Exiting.");
        Ok(())
    }

    fn serve<N: Network>(
        &self,
        manager: &mut PoolManager<N>,
        registry: &PoolRegistry,
        results: &ResultsQueue,
        engine: &DispatchEngine,
    ) {
        let mut next_status = Instant::now() + STATUS_INTERVAL;
        while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            let timeout = manager
                .next_wakeup()
                .map_or(POLL_INTERVAL, |at| {
                    at.saturating_duration_since(Instant::now())
                })
                .min(POLL_INTERVAL);
            let readiness = manager.wait(timeout);
            let now = Instant::now();
            apply_events(registry, manager.refresh(&readiness, now));

            submit_results(manager, results, engine);

            if now >= next_status {
                next_status = now + STATUS_INTERVAL;
                manager.log_status(now);
                log_health(engine, now);
            }
        }
        info!("Shutdown requested");
    }
}

/// Hand verified batches to their pools, charging stale shares to the
/// worker that found them.
fn submit_results<N: Network>(
    manager: &mut PoolManager<N>,
    results: &ResultsQueue,
    engine: &DispatchEngine,
) {
    for (origin, batch) in results.drain() {
        let submission = manager.send_results(&origin, &batch);
        if submission.stale > 0 {
            engine.record_stale(batch.device, submission.stale as u64);
        }
    }
}

fn log_health(engine: &DispatchEngine, now: Instant) {
    let report = engine.report(now);
    if report.all_failed() {
        error!(workers = report.total, "All workers have failed");
    } else if !report.failed.is_empty() {
        warn!(failed = ?report.failed, total = report.total, "Some workers have failed");
    }
    if !report.unresponsive.is_empty() {
        warn!(workers = ?report.unresponsive, "Workers not responding");
    }
    if !report.idle.is_empty() {
        warn!(workers = ?report.idle, "Workers have not generated work recently");
    }
    if !report.stale.is_empty() {
        info!(stale = ?report.stale, "Stale shares per worker");
    }
}
