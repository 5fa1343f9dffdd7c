//! Per-pool counters kept across reconnections.

use std::time::{Duration, Instant};

/// Share outcomes for one pool, kept across reconnections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareStats {
    pub sent: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// Results that arrived after their job was replaced
    pub stale: u64,
    /// Valid hashes under the share target
    pub discarded: u64,
    /// Device results failing verification
    pub hw_errors: u64,
}

/// Per-pool activity bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub activation_attempts: u64,
    pub activations: u64,
    /// Time spent connected, not counting the current connection
    pub connected_time: Duration,
    pub last_disconnect: Option<Instant>,
    pub shares: ShareStats,
}
