//! Nonce-finding dispatch engine.
//!
//! One worker thread per compute device. Each thread picks work from the
//! [`registry::PoolRegistry`], which the IO thread keeps current, feeds it
//! to its [`ComputeDispatcher`], verifies whatever nonces come back with a
//! [`BlockVerifier`] and queues the accepted ones for submission.
//!
//! # Result Flow
//!
//! 1. The device reports raw nonces for a header it scanned
//! 2. The worker matches the header against its in-flight records
//! 3. Every nonce is rehashed on the worker thread and classified as wrong,
//!    discarded or accepted
//! 4. Batches with anything in them go to the [`registry::ResultsQueue`],
//!    keyed by pool and job
//! 5. The IO thread drains the queue and submits shares to the owning pool
//!
//! Pools are only ever seen here as a [`PoolId`]; the connections themselves
//! never leave the IO thread.

pub mod policy;
pub mod registry;
pub mod verify;
pub mod worker;

use thiserror::Error;

use crate::pool::PoolId;
use crate::work::factory::HASHED_HEADER_LEN;
use crate::work::Extranonce2;

/// The bytes of a header handed to a device.
pub type Header = [u8; HASHED_HEADER_LEN];

/// Outcome of one [`ComputeDispatcher::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A new scan was started
    Dispatched,
    /// The nonce range of the current header is used up; feed a new one
    Exhausted,
    /// A scan is running; wait for the device
    Working,
    /// A completed scan's results are ready
    Results,
}

/// Raw results of one completed scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedNonces {
    /// The header the scan ran on, as it was given to `set_header`
    pub header: Header,
    /// Nonces with the digest the device computed for each
    pub nonces: Vec<(u32, [u8; 32])>,
}

/// Compute dispatcher failures.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The dispatcher could not be built for its device
    #[error("Initialization failed: {0}")]
    Init(String),

    /// The device failed while working
    #[error("Device error: {0}")]
    Device(String),
}

/// One compute device, driven from a single worker thread.
pub trait ComputeDispatcher: Send {
    /// Human-readable device name for logs
    fn name(&self) -> &str;

    /// Header for the next scan.
    fn set_header(&mut self, header: &Header);

    /// Most significant 64 bits of the share target.
    fn set_target(&mut self, target_high: u64);

    /// Advance the device state machine by one step.
    fn tick(&mut self) -> Result<Tick, DispatchError>;

    /// Take the results announced by [`Tick::Results`].
    fn results(&mut self) -> MinedNonces;

    /// Block until the running scan completes or `timeout` passes.
    fn wait(&mut self, timeout: std::time::Duration) -> Result<(), DispatchError>;

    /// Abandon the current header. Running scans still complete.
    fn cancel(&mut self);

    /// Whether a scan on `header` may still report results.
    fn is_in_flight(&self, header: &Header) -> bool;
}

/// Recomputes a block hash on the host.
pub trait BlockVerifier: Send + Sync {
    /// Hash `header` (in hashing byte order) with `nonce` in place.
    fn hash(&self, header: &Header, nonce: u32) -> [u8; 32];
}

/// Where a batch of results came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NonceOrigin {
    pub pool: PoolId,
    pub job: String,
}

/// An accepted nonce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptedNonce {
    pub nonce: u32,
    /// Four bytes from the most significant non-zero end of the digest
    pub hash_slice: [u8; 4],
    pub share_diff: f64,
    /// Meets network difficulty
    pub block: bool,
}

/// Classified results of one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedNonceBatch {
    /// Device index
    pub device: usize,
    pub nonce2: Extranonce2,
    pub target_diff: f64,
    /// Valid hashes below the share target
    pub discarded: usize,
    /// Digest mismatches
    pub wrong: usize,
    pub accepted: Vec<AcceptedNonce>,
}

impl VerifiedNonceBatch {
    pub fn total(&self) -> usize {
        self.discarded + self.wrong + self.accepted.len()
    }
}
