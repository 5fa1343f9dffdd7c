//! Block header construction from a pool job.
//!
//! A `WorkFactory` holds everything a job needs to build headers: the coinbase
//! template with extranonce1 already in place, the merkle branches and a blank
//! 128-byte header. Each call to [`WorkFactory::make_nonced_header`] takes the
//! next extranonce2 value, rebuilds the merkle root and returns a header ready
//! for a compute dispatcher.
//!
//! Factories are shared between worker threads through `Arc`, so the
//! extranonce2 counter is atomic and every header minted from one factory has a
//! distinct extranonce2.

use std::sync::atomic::{AtomicU64, Ordering};

use bitcoin::hashes::{sha256, sha256d, Hash};
use bitcoin::TxMerkleNode;

use super::extranonce2::Extranonce2;
use super::target::network_difficulty;
use super::{AlgoParams, MerkleMode, WorkError};
use crate::stratum::messages::MiningJob;

/// Size of the working header buffer. Only the first 80 bytes are hashed.
pub const HEADER_BUFFER_LEN: usize = 128;

/// Bytes of the header covered by the hash.
pub const HASHED_HEADER_LEN: usize = 80;

/// Offset of the merkle root within the header.
pub const MERKLE_OFFSET: usize = 36;

const NTIME_OFFSET: usize = 68;
const NBITS_OFFSET: usize = 72;
const NONCE_OFFSET: usize = 76;

/// SHA-256 padding for an 80-byte message, plus the trailer hashers expect.
const HEADER_PADDING: [u8; HEADER_BUFFER_LEN - HASHED_HEADER_LEN] = [
    0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x02, 0x00, 0x00,
];

/// A header candidate plus what is needed to submit shares found on it.
#[derive(Debug, Clone)]
pub struct Work {
    pub header: [u8; HEADER_BUFFER_LEN],
    pub nonce2: Extranonce2,
    pub ntime: u32,
    pub job: String,
    pub network_diff: f64,
}

impl Work {
    /// The part of the header covered by the hash.
    pub fn hashed_header(&self) -> [u8; HASHED_HEADER_LEN] {
        let mut header = [0u8; HASHED_HEADER_LEN];
        header.copy_from_slice(&self.header[..HASHED_HEADER_LEN]);
        header
    }
}

/// Mints block headers for one job by rolling extranonce2.
#[derive(Debug)]
pub struct WorkFactory {
    job: String,
    restart: bool,
    ntime: u32,
    coinbase: Vec<u8>,
    nonce2_offset: usize,
    nonce2_size: u8,
    merkle_mode: MerkleMode,
    merkle_branches: Vec<TxMerkleNode>,
    blank_header: [u8; HEADER_BUFFER_LEN],
    nonce2: AtomicU64,
}

impl WorkFactory {
    /// Build a factory for `job` under the given subscription.
    pub fn new(
        job: &MiningJob,
        extranonce1: &[u8],
        nonce2_size: u8,
        merkle_mode: MerkleMode,
    ) -> Result<Self, WorkError> {
        Extranonce2::check_size(nonce2_size)?;

        let nonce2_offset = job.coinbase1.len() + extranonce1.len();
        let mut coinbase = Vec::with_capacity(
            nonce2_offset + nonce2_size as usize + job.coinbase2.len(),
        );
        coinbase.extend_from_slice(&job.coinbase1);
        coinbase.extend_from_slice(extranonce1);
        coinbase.resize(nonce2_offset + nonce2_size as usize, 0);
        coinbase.extend_from_slice(&job.coinbase2);

        Ok(Self {
            job: job.job_id.clone(),
            restart: job.clean_jobs,
            ntime: job.ntime,
            coinbase,
            nonce2_offset,
            nonce2_size,
            merkle_mode,
            merkle_branches: job.merkle_branches.clone(),
            blank_header: blank_header(job),
            nonce2: AtomicU64::new(0),
        })
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Whether the pool asked to abandon previous work.
    pub fn restart(&self) -> bool {
        self.restart
    }

    pub fn nonce2_size(&self) -> u8 {
        self.nonce2_size
    }

    /// The extranonce2 value the next header will use.
    pub fn next_nonce2(&self) -> u64 {
        self.nonce2.load(Ordering::Relaxed)
    }

    /// Carry on from the extranonce2 position of the factory this one replaces.
    ///
    /// Called when the new job does not restart work, so the coinbase window
    /// already searched is not searched again.
    pub fn continuing(&self, previous: &WorkFactory) {
        self.nonce2
            .store(previous.nonce2.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Build the next header, consuming one extranonce2 value.
    pub fn make_nonced_header(&self, algo: &AlgoParams) -> Result<Work, WorkError> {
        let value = self.nonce2.fetch_add(1, Ordering::Relaxed);
        let nonce2 = Extranonce2::new(value, self.nonce2_size)
            .map_err(|_| WorkError::Nonce2Exhausted(self.job.clone()))?;

        let mut coinbase = self.coinbase.clone();
        nonce2.write_be(
            &mut coinbase[self.nonce2_offset..self.nonce2_offset + self.nonce2_size as usize],
        );

        let mut leaf = match self.merkle_mode {
            MerkleMode::Sha256d => sha256d::Hash::hash(&coinbase).to_byte_array(),
            MerkleMode::SingleSha256 => sha256::Hash::hash(&coinbase).to_byte_array(),
        };
        let mut combined = [0u8; 64];
        for branch in &self.merkle_branches {
            combined[..32].copy_from_slice(&leaf);
            combined[32..].copy_from_slice(branch.as_byte_array());
            leaf = sha256d::Hash::hash(&combined).to_byte_array();
        }

        if algo.big_endian {
            swap_words(&mut leaf);
        }

        let mut header = self.blank_header;
        header[MERKLE_OFFSET..MERKLE_OFFSET + 32].copy_from_slice(&leaf);

        if !algo.big_endian {
            // The merkle root is already in hashing order
            swap_words(&mut header[..MERKLE_OFFSET]);
            swap_words(&mut header[NTIME_OFFSET..NONCE_OFFSET]);
        }

        Ok(Work {
            network_diff: network_difficulty(&header, algo),
            header,
            nonce2,
            ntime: self.ntime,
            job: self.job.clone(),
        })
    }
}

/// Header template with a zero merkle root and zero nonce.
fn blank_header(job: &MiningJob) -> [u8; HEADER_BUFFER_LEN] {
    let mut header = [0u8; HEADER_BUFFER_LEN];
    header[0..4].copy_from_slice(&job.version.to_be_bytes());
    header[4..MERKLE_OFFSET].copy_from_slice(&job.prev_hash);
    header[NTIME_OFFSET..NBITS_OFFSET].copy_from_slice(&job.ntime.to_be_bytes());
    header[NBITS_OFFSET..NONCE_OFFSET].copy_from_slice(&job.nbits.to_be_bytes());
    header[HASHED_HEADER_LEN..].copy_from_slice(&HEADER_PADDING);
    header
}

/// Reverse the byte order of every 32-bit word in `bytes`.
pub fn swap_words(bytes: &mut [u8]) {
    for word in bytes.chunks_exact_mut(4) {
        word.reverse();
    }
}
