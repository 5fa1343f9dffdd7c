//! Software mining: a CPU compute dispatcher and the SHA-256d verifier.
//!
//! The CPU dispatcher scans synchronously, so a scan is complete by the time
//! `tick` reports it dispatched and the next `tick` hands over the results.

use std::time::Duration;

use bitcoin::hashes::{sha256d, Hash};

use crate::dispatch::{BlockVerifier, ComputeDispatcher, DispatchError, Header, MinedNonces, Tick};
use crate::work::factory::swap_words;

/// Nonces hashed per scan by default.
pub const DEFAULT_BATCH: u32 = 1 << 18;

const NONCE_OFFSET: usize = 76;

/// Double SHA-256 over the 80-byte header, Bitcoin style.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256dVerifier;

impl BlockVerifier for Sha256dVerifier {
    fn hash(&self, header: &Header, nonce: u32) -> [u8; 32] {
        let mut header = *header;
        header[NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());
        sha256d::Hash::hash(&header).to_byte_array()
    }
}

/// Scans nonce ranges on the calling thread.
#[derive(Debug)]
pub struct CpuDispatcher {
    name: String,
    batch: u32,
    /// Header as given, in device order
    header: Option<Header>,
    target_high: u64,
    /// Next nonce to try; past `u32::MAX` once the range is used up
    next_nonce: u64,
    completed: Option<MinedNonces>,
}

impl CpuDispatcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_batch(name, DEFAULT_BATCH)
    }

    pub fn with_batch(name: impl Into<String>, batch: u32) -> Self {
        Self {
            name: name.into(),
            batch: batch.max(1),
            header: None,
            target_high: 0,
            next_nonce: 0,
            completed: None,
        }
    }

    fn scan(&mut self, header: Header) -> MinedNonces {
        let mut hashing = header;
        swap_words(&mut hashing);

        let end = (self.next_nonce + self.batch as u64).min(u32::MAX as u64 + 1);
        let mut nonces = Vec::new();
        for nonce in self.next_nonce..end {
            let nonce = nonce as u32;
            let digest = Sha256dVerifier.hash(&hashing, nonce);
            let mut high = [0u8; 8];
            high.copy_from_slice(&digest[24..]);
            if u64::from_le_bytes(high) <= self.target_high {
                nonces.push((nonce, digest));
            }
        }
        self.next_nonce = end;
        MinedNonces { header, nonces }
    }
}

impl ComputeDispatcher for CpuDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_header(&mut self, header: &Header) {
        self.header = Some(*header);
        self.next_nonce = 0;
    }

    fn set_target(&mut self, target_high: u64) {
        self.target_high = target_high;
    }

    fn tick(&mut self) -> Result<Tick, DispatchError> {
        if self.completed.is_some() {
            return Ok(Tick::Results);
        }
        let Some(header) = self.header else {
            return Ok(Tick::Exhausted);
        };
        if self.next_nonce > u32::MAX as u64 {
            return Ok(Tick::Exhausted);
        }
        self.completed = Some(self.scan(header));
        Ok(Tick::Dispatched)
    }

    fn results(&mut self) -> MinedNonces {
        self.completed.take().unwrap_or(MinedNonces {
            header: self.header.unwrap_or([0; 80]),
            nonces: Vec::new(),
        })
    }

    fn wait(&mut self, _timeout: Duration) -> Result<(), DispatchError> {
        Ok(())
    }

    fn cancel(&mut self) {
        self.header = None;
    }

    fn is_in_flight(&self, header: &Header) -> bool {
        self.completed.as_ref().is_some_and(|c| &c.header == header)
    }
}
