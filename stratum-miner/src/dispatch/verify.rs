//! Classification of device-reported nonces.

use super::{AcceptedNonce, BlockVerifier, Header, NonceOrigin, VerifiedNonceBatch};
use crate::work::factory::swap_words;
use crate::work::target::share_difficulty;
use crate::work::Extranonce2;

/// Bytes of digest kept with each accepted nonce.
const HASH_SLICE_LEN: usize = 4;

/// A header given to a device, remembered until its scan completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub origin: NonceOrigin,
    pub network_diff: f64,
    pub target_diff: f64,
    /// Share multiplier of the pool that issued the work
    pub share_mul: f64,
    pub nonce2: Extranonce2,
    pub header: Header,
}

/// Rehash every reported nonce and sort it into wrong, discarded or accepted.
///
/// `scan.header` is in device order; the verifier gets it with every 32-bit
/// word flipped. Difficulties use the multiplier recorded with the scan, so
/// results still count for the pool that issued the header.
pub fn check_results(
    verifier: &dyn BlockVerifier,
    nonces: &[(u32, [u8; 32])],
    scan: &ScanRecord,
    device: usize,
) -> VerifiedNonceBatch {
    let mut header = scan.header;
    swap_words(&mut header);

    let mut batch = VerifiedNonceBatch {
        device,
        nonce2: scan.nonce2,
        target_diff: scan.target_diff,
        discarded: 0,
        wrong: 0,
        accepted: Vec::new(),
    };

    for &(nonce, reported) in nonces {
        let reference = verifier.hash(&header, nonce);
        if reference != reported {
            batch.wrong += 1;
            continue;
        }
        let share_diff = share_difficulty(&reference, scan.share_mul);
        if share_diff <= scan.target_diff {
            batch.discarded += 1;
            continue;
        }
        batch.accepted.push(AcceptedNonce {
            nonce,
            hash_slice: hash_slice(&reference),
            share_diff,
            // M8M squares the multiplier here; share_diff already carries it once
            block: share_diff >= scan.network_diff * scan.share_mul,
        });
    }
    batch
}

/// Most significant non-zero bytes of a little-endian digest, high first.
fn hash_slice(digest: &[u8; 32]) -> [u8; HASH_SLICE_LEN] {
    let top = digest
        .iter()
        .rposition(|&b| b != 0)
        .unwrap_or(0)
        .max(HASH_SLICE_LEN);
    let mut slice = [0u8; HASH_SLICE_LEN];
    for (i, byte) in slice.iter_mut().enumerate() {
        *byte = digest[top - i];
    }
    slice
}
