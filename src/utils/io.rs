//! Little-endian, bounds-checked reading and writing of guest scalars.
//!
//! Guest memory, decoder-cache records and machine snapshots are all little-endian byte
//! buffers. This module is the single place where typed values are converted to and from
//! those bytes: page buffers are never reinterpreted through pointer casts, every access goes
//! through [`read_le_at`] / [`write_le_at`] and fails with [`crate::Error::OutOfBounds`]
//! instead of reading past a buffer.
//!
//! # Supported Types
//!
//! [`GuestIO`] is implemented for `u8`, `u16`, `u32`, `u64`, `i8`, `i16`, `i32` and `i64`,
//! the widths of RISC-V loads and stores.
//!
//! # Examples
//!
//! ```rust,ignore
//! use crate::utils::io::{read_le_at, write_le_at};
//!
//! let mut record = [0u8; 8];
//! let mut offset = 0;
//! write_le_at(&mut record, &mut offset, 0x1234u16)?;
//! write_le_at(&mut record, &mut offset, 0xdead_beefu32)?;
//!
//! offset = 0;
//! let half: u16 = read_le_at(&record, &mut offset)?;
//! let word: u32 = read_le_at(&record, &mut offset)?;
//! assert_eq!((half, word, offset), (0x1234, 0xdead_beef, 6));
//! ```

use crate::{address::Address, Error::OutOfBounds, Result};

/// A scalar that can be loaded from and stored to guest memory.
///
/// Besides the little-endian byte conversion, each type can be widened to and narrowed from
/// a raw 64-bit pattern. Traps and the CPU use that pattern to pass values of any width
/// through a single `u64`.
pub trait GuestIO: Sized + Copy + Default + PartialEq + std::fmt::Debug + Send + Sync {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Width of the value in bytes
    const SIZE: usize;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;

    /// Zero-extends the bit pattern of the value to 64 bits
    fn to_bits(self) -> u64;

    /// Narrows a 64-bit pattern to this type, keeping the low bits
    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_guest_io {
    ($ty:ty, $unsigned:ty, $size:expr) => {
        impl GuestIO for $ty {
            type Bytes = [u8; $size];
            const SIZE: usize = $size;

            fn from_le_bytes(bytes: Self::Bytes) -> Self {
                <$ty>::from_le_bytes(bytes)
            }

            fn to_le_bytes(self) -> Self::Bytes {
                <$ty>::to_le_bytes(self)
            }

            #[allow(clippy::cast_sign_loss)]
            fn to_bits(self) -> u64 {
                u64::from(self as $unsigned)
            }

            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            fn from_bits(bits: u64) -> Self {
                bits as $unsigned as $ty
            }
        }
    };
}

impl_guest_io!(u8, u8, 1);
impl_guest_io!(i8, u8, 1);
impl_guest_io!(u16, u16, 2);
impl_guest_io!(i16, u16, 2);
impl_guest_io!(u32, u32, 4);
impl_guest_io!(i32, u32, 4);
impl_guest_io!(u64, u64, 8);
impl_guest_io!(i64, u64, 8);

/// Safely reads a value of type `T` in little-endian byte order from the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too short.
pub fn read_le<T: GuestIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at `offset`, advancing the
/// offset by the size of `T`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are not enough bytes after `offset`.
pub fn read_le_at<T: GuestIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let Some(end) = offset.checked_add(T::SIZE) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(bytes) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(bytes))
}

/// Safely writes a value of type `T` in little-endian byte order to the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too short.
pub fn write_le<T: GuestIO>(data: &mut [u8], value: T) -> Result<()> {
    let mut offset = 0_usize;
    write_le_at(data, &mut offset, value)
}

/// Safely writes a value of type `T` in little-endian byte order at `offset`, advancing the
/// offset by the size of `T`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are not enough bytes after `offset`.
pub fn write_le_at<T: GuestIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let Some(end) = offset.checked_add(T::SIZE) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(value.to_le_bytes().as_ref());
    *offset = end;
    Ok(())
}

/// Appends a value of type `T` in little-endian byte order to a growable buffer.
pub fn push_le<T: GuestIO>(out: &mut Vec<u8>, value: T) {
    out.extend_from_slice(value.to_le_bytes().as_ref());
}

/// Appends a guest address with the width of `A`.
#[allow(clippy::cast_possible_truncation)]
pub fn push_address<A: Address>(out: &mut Vec<u8>, addr: u64) {
    if A::is_64() {
        push_le(out, addr);
    } else {
        push_le(out, A::wrap(addr) as u32);
    }
}

/// Reads a guest address with the width of `A` at `offset`, advancing the offset.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are not enough bytes after `offset`.
pub fn read_address<A: Address>(data: &[u8], offset: &mut usize) -> Result<u64> {
    if A::is_64() {
        read_le_at::<u64>(data, offset)
    } else {
        read_le_at::<u32>(data, offset).map(u64::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_le_widths() {
        assert_eq!(read_le::<u8>(&TEST_BUFFER).unwrap(), 0x01);
        assert_eq!(read_le::<u16>(&TEST_BUFFER).unwrap(), 0x0201);
        assert_eq!(read_le::<u32>(&TEST_BUFFER).unwrap(), 0x0403_0201);
        assert_eq!(read_le::<u64>(&TEST_BUFFER).unwrap(), 0x0807_0605_0403_0201);
        assert_eq!(read_le::<i8>(&[0xFF]).unwrap(), -1);
    }

    #[test]
    fn read_le_at_advances() {
        let mut offset = 0;
        assert_eq!(read_le_at::<u16>(&TEST_BUFFER, &mut offset).unwrap(), 0x0201);
        assert_eq!(read_le_at::<u32>(&TEST_BUFFER, &mut offset).unwrap(), 0x0605_0403);
        assert_eq!(offset, 6);
    }

    #[test]
    fn read_out_of_bounds() {
        let mut offset = 6;
        assert!(matches!(
            read_le_at::<u32>(&TEST_BUFFER, &mut offset),
            Err(OutOfBounds)
        ));
        assert_eq!(offset, 6);

        let mut offset = usize::MAX;
        assert!(read_le_at::<u8>(&TEST_BUFFER, &mut offset).is_err());
    }

    #[test]
    fn write_le_at_advances() {
        let mut buffer = [0u8; 8];
        let mut offset = 0;
        write_le_at(&mut buffer, &mut offset, 0xBEEFu16).unwrap();
        write_le_at(&mut buffer, &mut offset, -2i32).unwrap();
        assert_eq!(offset, 6);
        assert_eq!(buffer, [0xEF, 0xBE, 0xFE, 0xFF, 0xFF, 0xFF, 0, 0]);

        assert!(write_le_at(&mut buffer, &mut offset, 0u32).is_err());
    }

    #[test]
    fn bits_roundtrip_sign() {
        assert_eq!((-1i8).to_bits(), 0xFF);
        assert_eq!((-1i32).to_bits(), 0xFFFF_FFFF);
        assert_eq!(i16::from_bits(0x1_8000), i16::MIN);
        assert_eq!(u8::from_bits(0x1234), 0x34);
    }

    #[test]
    fn push_le_appends() {
        let mut out = vec![0xAA];
        push_le(&mut out, 0x0102u16);
        assert_eq!(out, vec![0xAA, 0x02, 0x01]);
    }
}
