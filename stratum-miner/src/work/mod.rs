//! Work-unit construction.
//!
//! A pool job turns into a [`WorkFactory`], which rolls extranonce2 to mint
//! any number of distinct block headers. Difficulty bookkeeping lives in
//! [`target`].

pub mod extranonce2;
pub mod factory;
pub mod target;

#[cfg(test)]
pub(crate) mod test_jobs;

use serde::Deserialize;
use thiserror::Error;

pub use extranonce2::{Extranonce2, Extranonce2Error};
pub use factory::{Work, WorkFactory};
pub use target::{Target, WorkDiff};

/// How the coinbase is hashed into the first merkle leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum MerkleMode {
    #[default]
    #[serde(rename = "SHA256D")]
    Sha256d,
    #[serde(rename = "singleSHA256")]
    SingleSha256,
}

/// How pool difficulty maps to a 256-bit target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiffMode {
    #[default]
    Btc,
    NeoScrypt,
}

/// Per-pool scaling of the difficulties it reports.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct DiffMultipliers {
    /// Applied to `mining.set_difficulty` values.
    pub stratum: f64,
    /// Applied to the difficulty-one target.
    pub one: f64,
    /// Applied to the difficulty of found shares.
    pub share: f64,
}

impl Default for DiffMultipliers {
    fn default() -> Self {
        Self {
            stratum: 1.0,
            one: 1.0,
            share: 1.0,
        }
    }
}

/// Algorithm properties that affect header layout and difficulty decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgoParams {
    /// Big-endian (BTC-style) header words.
    pub big_endian: bool,
    /// Numerator used to decode network difficulty from nbits.
    pub diff_numerator: u64,
}

impl AlgoParams {
    /// Double SHA-256, Bitcoin style.
    pub const SHA256D: AlgoParams = AlgoParams {
        big_endian: true,
        diff_numerator: 0xFFFF,
    };
}

/// Work construction errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkError {
    /// No subscription reply has been received yet.
    #[error("Not subscribed")]
    NotSubscribed,

    /// No job has been received yet.
    #[error("No job available")]
    NoJob,

    /// Pool difficulty is zero or negative.
    #[error("Invalid difficulty: {0}")]
    InvalidDifficulty(f64),

    /// Every extranonce2 value of this job has been used.
    #[error("Extranonce2 space exhausted for job {0}")]
    Nonce2Exhausted(String),

    #[error(transparent)]
    Extranonce2(#[from] Extranonce2Error),
}
