//! State shared between the IO thread and the worker threads.
//!
//! The IO thread is the only writer of the [`PoolRegistry`]; workers read it.
//! Each entry carries generation counters bumped on every change, so a worker
//! can tell whether what it cached is still current with one comparison.
//! Locks are only held for the lookup or update itself.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::policy::PoolSelectionPolicy;
use super::{NonceOrigin, VerifiedNonceBatch};
use crate::pool::PoolId;
use crate::work::{WorkDiff, WorkFactory};

/// Latest work published for one pool.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub pool: PoolId,
    pub factory: Option<Arc<WorkFactory>>,
    pub diff: WorkDiff,
    pub share_mul: f64,
    /// Bumped whenever `factory` is replaced or cleared
    pub generation: u64,
    /// Bumped whenever `diff` changes
    pub diff_generation: u64,
}

/// What a worker takes away from the registry.
#[derive(Debug, Clone)]
pub struct WorkSnapshot {
    pub pool: PoolId,
    pub factory: Arc<WorkFactory>,
    pub diff: WorkDiff,
    pub share_mul: f64,
    pub generation: u64,
    pub diff_generation: u64,
}

impl WorkSnapshot {
    fn of(entry: &RegistryEntry) -> Option<Self> {
        Some(Self {
            pool: entry.pool,
            factory: entry.factory.clone()?,
            diff: entry.diff,
            share_mul: entry.share_mul,
            generation: entry.generation,
            diff_generation: entry.diff_generation,
        })
    }
}

/// Per-pool work, in registration order.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    entries: Mutex<Vec<RegistryEntry>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `pool` with no work. Registering twice is a no-op.
    pub fn register(&self, pool: PoolId, share_mul: f64) {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.pool == pool) {
            return;
        }
        entries.push(RegistryEntry {
            pool,
            factory: None,
            diff: WorkDiff::default(),
            share_mul,
            generation: 0,
            diff_generation: 0,
        });
    }

    /// Publish new work for `pool`.
    pub fn set_work(&self, pool: PoolId, factory: Arc<WorkFactory>, diff: WorkDiff) {
        self.update(pool, |entry| {
            entry.factory = Some(factory);
            entry.generation += 1;
            if entry.diff != diff {
                entry.diff = diff;
                entry.diff_generation += 1;
            }
        });
    }

    /// Publish a difficulty change without new work.
    pub fn set_diff(&self, pool: PoolId, diff: WorkDiff) {
        self.update(pool, |entry| {
            if entry.diff != diff {
                entry.diff = diff;
                entry.diff_generation += 1;
            }
        });
    }

    /// Withdraw the work of `pool`.
    pub fn clear_work(&self, pool: PoolId) {
        self.update(pool, |entry| {
            if entry.factory.take().is_some() {
                entry.generation += 1;
            }
        });
    }

    /// Pick work with `policy`, under the lock.
    pub fn select(&self, policy: &dyn PoolSelectionPolicy) -> Option<WorkSnapshot> {
        let entries = self.entries.lock();
        policy.select(&entries).and_then(WorkSnapshot::of)
    }

    pub fn snapshot(&self, pool: PoolId) -> Option<WorkSnapshot> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| e.pool == pool)
            .and_then(WorkSnapshot::of)
    }

    /// Current `(generation, diff_generation, diff)` of `pool`.
    pub fn current(&self, pool: PoolId) -> Option<(u64, u64, WorkDiff)> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| e.pool == pool)
            .map(|e| (e.generation, e.diff_generation, e.diff))
    }

    fn update(&self, pool: PoolId, apply: impl FnOnce(&mut RegistryEntry)) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.pool == pool) {
            apply(entry);
        }
    }
}

/// Verified batches waiting for submission.
#[derive(Debug, Default)]
pub struct ResultsQueue {
    batches: Mutex<VecDeque<(NonceOrigin, VerifiedNonceBatch)>>,
}

impl ResultsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, origin: NonceOrigin, batch: VerifiedNonceBatch) {
        self.batches.lock().push_back((origin, batch));
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<(NonceOrigin, VerifiedNonceBatch)> {
        self.batches.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}
