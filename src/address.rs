//! Guest address widths.
//!
//! Every machine has a fixed address width: RV32 machines use `u32` addresses and registers,
//! RV64 machines use `u64`. The [`Address`] trait lets memory, decoder and CPU code be written
//! once and monomorphized per width. Internally most bookkeeping (page numbers, segment
//! bounds) is carried as `u64`; conversions back to the guest width truncate, which matches
//! the wrapping behaviour of the guest's own arithmetic.

use std::{
    fmt::{Debug, Display, LowerHex},
    hash::Hash,
};

/// The size of one guest page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Mask selecting the offset inside a page.
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;
/// Number of bits to shift an address by to obtain its page number.
pub const PAGE_SHIFT: u32 = 12;

/// An unsigned guest address type.
///
/// Implemented for `u32` (RV32) and `u64` (RV64).
pub trait Address:
    Copy + Clone + Default + Eq + Ord + Hash + Debug + Display + LowerHex + Send + Sync + 'static
{
    /// Width of the address in bits
    const BITS: u32;
    /// Width of the address in bytes
    const BYTES: usize;

    /// Zero-extends the address to 64 bits.
    fn to_u64(self) -> u64;

    /// Truncates a 64-bit value to this address width.
    fn from_u64(value: u64) -> Self;

    /// Sign-extends the address to a signed 64-bit value.
    fn to_i64(self) -> i64;

    /// Returns `true` for 64-bit machines.
    #[inline]
    #[must_use]
    fn is_64() -> bool {
        Self::BITS == 64
    }

    /// Truncates `value` to this width and zero-extends it back, i.e. wraps it into the
    /// guest address space.
    #[inline]
    #[must_use]
    fn wrap(value: u64) -> u64 {
        Self::from_u64(value).to_u64()
    }
}

impl Address for u32 {
    const BITS: u32 = 32;
    const BYTES: usize = 4;

    #[inline]
    fn to_u64(self) -> u64 {
        u64::from(self)
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn from_u64(value: u64) -> Self {
        value as u32
    }

    #[inline]
    #[allow(clippy::cast_possible_wrap)]
    fn to_i64(self) -> i64 {
        i64::from(self as i32)
    }
}

impl Address for u64 {
    const BITS: u32 = 64;
    const BYTES: usize = 8;

    #[inline]
    fn to_u64(self) -> u64 {
        self
    }

    #[inline]
    fn from_u64(value: u64) -> Self {
        value
    }

    #[inline]
    #[allow(clippy::cast_possible_wrap)]
    fn to_i64(self) -> i64 {
        self as i64
    }
}

/// Returns the page number containing `addr`.
#[inline]
#[must_use]
pub const fn page_number(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// Returns the offset of `addr` inside its page.
#[inline]
#[must_use]
pub const fn page_offset(addr: u64) -> usize {
    (addr & PAGE_MASK) as usize
}

/// Rounds `value` up to the next page boundary, or `None` on overflow.
#[inline]
#[must_use]
pub const fn page_round_up(value: u64) -> Option<u64> {
    match value.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        assert!(!u32::is_64());
        assert!(u64::is_64());
        assert_eq!(u32::BYTES, 4);
        assert_eq!(u64::BYTES, 8);
    }

    #[test]
    fn test_truncation_and_sign() {
        assert_eq!(u32::from_u64(0x1_0000_1234), 0x1234);
        assert_eq!(u32::wrap(0xFFFF_FFFF_FFFF_FFFC), 0xFFFF_FFFC);
        assert_eq!(0xFFFF_FFFFu32.to_i64(), -1);
        assert_eq!(0x7FFF_FFFFu32.to_i64(), 0x7FFF_FFFF);
        assert_eq!(u64::MAX.to_i64(), -1);
    }

    #[test]
    fn test_page_helpers() {
        assert_eq!(page_number(0x1FFF), 1);
        assert_eq!(page_offset(0x1FFF), 0xFFF);
        assert_eq!(page_round_up(0x1001), Some(0x2000));
        assert_eq!(page_round_up(0x2000), Some(0x2000));
        assert_eq!(page_round_up(u64::MAX), None);
    }
}
