//! The miner-controlled part of the coinbase.
//!
//! The subscribe reply fixes how many bytes of the coinbase belong to the
//! miner. Rolling a counter through those bytes changes the merkle root, so
//! one job yields as many distinct headers as the width allows. The counter
//! goes into the coinbase big-endian and into `mining.submit` as zero-padded
//! hex of the full width.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Extranonce2Error {
    #[error("extranonce2 width {0} outside 1..=8 bytes")]
    InvalidSize(u8),

    #[error("extranonce2 {0:#x} does not fit in {1} bytes")]
    ValueTooLarge(u64, u8),
}

/// Counter value paired with the width the pool assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extranonce2 {
    value: u64,
    size: u8,
}

impl Extranonce2 {
    pub fn new(value: u64, size: u8) -> Result<Self, Extranonce2Error> {
        Self::check_size(size)?;
        if value > Self::max_for_size(size) {
            return Err(Extranonce2Error::ValueTooLarge(value, size));
        }
        Ok(Self { value, size })
    }

    /// Reject widths a u64 counter cannot fill.
    pub fn check_size(size: u8) -> Result<(), Extranonce2Error> {
        match size {
            1..=8 => Ok(()),
            _ => Err(Extranonce2Error::InvalidSize(size)),
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    /// Largest counter that fits in `size` bytes.
    pub fn max_for_size(size: u8) -> u64 {
        u64::MAX >> (64 - 8 * u32::from(size.clamp(1, 8)))
    }

    /// Copy the low `size()` bytes, most significant first, into `dest`,
    /// which must be exactly that long.
    pub fn write_be(&self, dest: &mut [u8]) {
        let skip = 8 - usize::from(self.size);
        dest.copy_from_slice(&self.value.to_be_bytes()[skip..]);
    }
}

impl fmt::Display for Extranonce2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = usize::from(self.size) * 2;
        write!(f, "{:0width$x}", self.value, width = width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 4, "00000000"; "zero keeps full width")]
    #[test_case(0x102, 4, "00000102"; "padded")]
    #[test_case(0xab, 1, "ab"; "single byte")]
    #[test_case(u64::MAX, 8, "ffffffffffffffff"; "widest")]
    fn test_submit_hex(value: u64, size: u8, expected: &str) {
        assert_eq!(Extranonce2::new(value, size).unwrap().to_string(), expected);
    }

    #[test_case(0, Err(Extranonce2Error::InvalidSize(0)); "zero width")]
    #[test_case(9, Err(Extranonce2Error::InvalidSize(9)); "too wide")]
    #[test_case(3, Ok(()); "odd width")]
    fn test_check_size(size: u8, expected: Result<(), Extranonce2Error>) {
        assert_eq!(Extranonce2::check_size(size), expected);
    }

    #[test]
    fn test_value_must_fit() {
        assert_eq!(
            Extranonce2::new(0x1_0000, 2),
            Err(Extranonce2Error::ValueTooLarge(0x1_0000, 2))
        );
        let ext = Extranonce2::new(0xffff, 2).unwrap();
        assert_eq!((ext.value(), ext.size()), (0xffff, 2));
    }

    #[test_case(1, 0xff)]
    #[test_case(3, 0xff_ffff)]
    #[test_case(8, u64::MAX)]
    fn test_max_for_size(size: u8, max: u64) {
        assert_eq!(Extranonce2::max_for_size(size), max);
    }

    #[test]
    fn test_coinbase_bytes() {
        let mut buf = [0xee; 3];
        Extranonce2::new(0x0a0b0c, 3).unwrap().write_be(&mut buf);
        assert_eq!(buf, [0x0a, 0x0b, 0x0c]);
    }
}
