//! Job fixtures shared by tests across the crate.

use bitcoin::hashes::Hash;
use bitcoin::TxMerkleNode;

use super::{MerkleMode, WorkFactory};
use crate::stratum::messages::MiningJob;

pub const EXTRANONCE1: [u8; 4] = [0xf8, 0x00, 0x22, 0x22];

/// A small job with one merkle branch and Bitcoin-style difficulty bits.
pub fn job(job_id: &str, clean_jobs: bool) -> MiningJob {
    MiningJob {
        job_id: job_id.to_string(),
        prev_hash: [0x11; 32],
        coinbase1: vec![0x01, 0x00, 0x00, 0x00, 0xaa],
        coinbase2: vec![0xbb, 0xcc],
        merkle_branches: vec![TxMerkleNode::from_byte_array([0x22; 32])],
        version: 0x2000_0000,
        nbits: 0x1d00_ffff,
        ntime: 0x5f5e_1000,
        clean_jobs,
    }
}

pub fn factory(job_id: &str) -> WorkFactory {
    WorkFactory::new(&job(job_id, true), &EXTRANONCE1, 4, MerkleMode::Sha256d)
        .expect("fixture job is valid")
}
