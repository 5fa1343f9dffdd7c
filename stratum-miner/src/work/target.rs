//! Difficulty and 256-bit target conversions.
//!
//! Stratum pools talk in difficulty, hashing hardware compares against a
//! 256-bit target. Targets are held as four 64-bit words, most significant
//! word first.
//!
//! All conversions go through `f64` on purpose: the constants involved are
//! exactly representable and the pools' own arithmetic is done in doubles,
//! so matching them bit for bit is not possible anyway.

use super::{AlgoParams, DiffMode, DiffMultipliers};

/// Difficulty-one target, `0xFFFF << 208`.
pub const TRUE_DIFF_ONE: f64 =
    26959535291011309493156476344723991336010898738574164086137773096960.0;

const BITS_192: f64 = 6277101735386680763835789423207666416102355444464034512896.0;
const BITS_128: f64 = 340282366920938463463374607431768211456.0;
const BITS_64: f64 = 18446744073709551616.0;

/// Weights of each target word, most significant first.
const WORD_WEIGHTS: [f64; 4] = [BITS_192, BITS_128, BITS_64, 1.0];

/// Offset of the difficulty-bits field within a block header.
const NBITS_OFFSET: usize = 72;

/// A 256-bit target stored as four 64-bit words, most significant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Target([u64; 4]);

impl Target {
    /// The easiest possible target.
    pub const MAX: Target = Target([u64::MAX; 4]);

    pub fn words(&self) -> &[u64; 4] {
        &self.0
    }

    /// Most significant 64 bits, the part compute dispatchers compare against.
    pub fn high(&self) -> u64 {
        self.0[0]
    }

    /// Bitcoin-style target: `one_mul * TRUE_DIFF_ONE / diff`.
    ///
    /// A difficulty of zero is treated as one.
    pub fn from_difficulty(diff: f64, one_mul: f64) -> Self {
        let diff = if diff == 0.0 { 1.0 } else { diff };
        let mut big = one_mul * TRUE_DIFF_ONE / diff;
        let mut words = [0u64; 4];
        for (word, weight) in words.iter_mut().zip(WORD_WEIGHTS) {
            let part = (big / weight).floor();
            // Saturating cast; `part` is never negative in practice
            *word = part as u64;
            big -= *word as f64 * weight;
        }
        Self(words)
    }

    /// Power-of-two target used by NeoScrypt-family pools.
    ///
    /// The difficulty is reduced by 2^32 steps until it fits, then the
    /// 64-bit quotient is placed at the matching 32-bit position.
    pub fn from_difficulty_pow2(diff: f64, one_mul: f64) -> Self {
        let mut diff = if diff <= 0.0 { 1.0 } else { diff };
        let mut k = 6usize;
        while k > 0 && diff > 1.0 {
            diff /= 4294967296.0;
            k -= 1;
        }
        let m = (one_mul * 4294901760.0 / diff) as u64;
        if m == 0 && k == 6 {
            return Self::MAX;
        }

        // Little-endian 32-bit limbs, index 0 least significant
        let mut limbs = [0u32; 8];
        limbs[k] = m as u32;
        limbs[k + 1] = (m >> 32) as u32;

        let mut words = [0u64; 4];
        for (i, pair) in limbs.chunks_exact(2).enumerate() {
            words[3 - i] = (pair[0] as u64) | ((pair[1] as u64) << 32);
        }
        Self(words)
    }

    /// Approximate numeric value of the target.
    pub fn to_f64(&self) -> f64 {
        self.0
            .iter()
            .zip(WORD_WEIGHTS)
            .map(|(&word, weight)| word as f64 * weight)
            .sum()
    }

    /// Difficulty this target corresponds to, inverse of `from_difficulty`.
    pub fn to_difficulty(&self, one_mul: f64) -> f64 {
        one_mul * TRUE_DIFF_ONE / self.to_f64()
    }
}

impl DiffMode {
    /// Build the target for `diff` the way this pool family expects.
    pub fn target(&self, diff: f64, one_mul: f64) -> Target {
        match self {
            DiffMode::Btc => Target::from_difficulty(diff, one_mul),
            DiffMode::NeoScrypt => Target::from_difficulty_pow2(diff, one_mul),
        }
    }
}

/// Share difficulty requested by the pool together with the target implied.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WorkDiff {
    pub share_diff: f64,
    pub target: Target,
}

impl WorkDiff {
    pub fn new(difficulty: f64, multipliers: &DiffMultipliers, mode: DiffMode) -> Self {
        let share_diff = difficulty * multipliers.stratum;
        Self {
            share_diff,
            target: mode.target(share_diff, multipliers.one),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.share_diff != 0.0
    }
}

/// Interpret 32 bytes as a little-endian 256-bit number.
pub fn le_to_f64(bytes: &[u8; 32]) -> f64 {
    let mut words = [0u64; 4];
    for (i, chunk) in bytes.chunks_exact(8).enumerate() {
        let mut le = [0u8; 8];
        le.copy_from_slice(chunk);
        words[3 - i] = u64::from_le_bytes(le);
    }
    Target(words).to_f64()
}

/// Difficulty of a share whose header hashed to `hash`.
pub fn share_difficulty(hash: &[u8; 32], share_mul: f64) -> f64 {
    share_mul * TRUE_DIFF_ONE / le_to_f64(hash)
}

/// Network difficulty implied by the difficulty-bits field of a built header.
///
/// Big-endian algorithms use the compact exponent form; little-endian ones
/// use a simplified power-of-two form with no exponent scaling.
pub fn network_difficulty(header: &[u8], algo: &AlgoParams) -> f64 {
    let mut bits = [0u8; 4];
    bits.copy_from_slice(&header[NBITS_OFFSET..NBITS_OFFSET + 4]);
    let field = u32::from_be_bytes(bits) as u64;

    let (mantissa, numerator) = if algo.big_endian {
        let exponent = header[NBITS_OFFSET] as i32;
        let shift = 8 * (0x1d - exponent);
        (
            field & 0x00FF_FFFF,
            algo.diff_numerator as f64 * 2f64.powi(shift),
        )
    } else {
        let blob = (field & 0xFFFF_FF00) << 8;
        (blob.swap_bytes(), algo.diff_numerator as f64)
    };

    let mantissa = if mantissa == 0 { 1 } else { mantissa };
    numerator / mantissa as f64
}
