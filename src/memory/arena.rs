//! The flat memory arena.
//!
//! An optional single anonymous mapping that backs the low part of the guest address space.
//! Page `n` of the arena holds guest addresses `[n * 4096, (n + 1) * 4096)`, so the read and
//! write fast paths of [`crate::memory::Memory`] can reach any arena byte with a single bounds
//! comparison instead of a page lookup.
//!
//! The mapping is over-allocated by one page so that an access starting in the last arena page
//! never needs a length check. Forks share the arena through `Arc`; it is unmapped when the
//! last machine referring to it is dropped.

use std::sync::RwLock;

use memmap2::MmapMut;

use crate::{address::PAGE_SIZE, utils::io, utils::GuestIO, Result};

/// A contiguous anonymous mapping of guest pages.
pub struct FlatArena {
    pages: u64,
    map: RwLock<MmapMut>,
}

impl std::fmt::Debug for FlatArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatArena")
            .field("pages", &self.pages)
            .finish()
    }
}

impl FlatArena {
    /// Maps an arena of `pages` pages (plus one spare page).
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the anonymous mapping could not be created.
    pub fn new(pages: u64) -> Result<Self> {
        let Some(len) = pages
            .checked_add(1)
            .and_then(|p| usize::try_from(p).ok())
            .and_then(|p| p.checked_mul(PAGE_SIZE))
        else {
            return Err(invalid_program!("Memory arena size overflow", pages));
        };

        let map = MmapMut::map_anon(len)?;
        Ok(FlatArena {
            pages,
            map: RwLock::new(map),
        })
    }

    /// Number of usable pages.
    #[must_use]
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Size of the usable arena in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.pages * PAGE_SIZE as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn page_range(index: u64) -> std::ops::Range<usize> {
        let start = (index as usize) * PAGE_SIZE;
        start..start + PAGE_SIZE
    }

    /// Runs `f` with read access to page `index`.
    pub fn with_page<R>(&self, index: u64, f: impl FnOnce(&[u8]) -> R) -> R {
        let map = read_lock!(self.map);
        f(&map[Self::page_range(index)])
    }

    /// Runs `f` with write access to page `index`.
    pub fn with_page_mut<R>(&self, index: u64, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut map = write_lock!(self.map);
        f(&mut map[Self::page_range(index)])
    }

    /// Copies page `index` into `out`.
    pub fn read_page(&self, index: u64, out: &mut [u8]) {
        self.with_page(index, |bytes| out.copy_from_slice(bytes));
    }

    /// Runs `f` with read access to `len` bytes starting at guest address `addr`.
    ///
    /// Returns `None` if the range leaves the mapping.
    pub fn with_range<R>(&self, addr: u64, len: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let map = read_lock!(self.map);
        let start = usize::try_from(addr).ok()?;
        let end = start.checked_add(len)?;
        if end > map.len() {
            return None;
        }
        Some(f(&map[start..end]))
    }

    /// Runs `f` with write access to `len` bytes starting at guest address `addr`.
    ///
    /// Returns `None` if the range leaves the mapping.
    pub fn with_range_mut<R>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        let mut map = write_lock!(self.map);
        let start = usize::try_from(addr).ok()?;
        let end = start.checked_add(len)?;
        if end > map.len() {
            return None;
        }
        Some(f(&mut map[start..end]))
    }

    /// Reads a little-endian value at guest address `addr`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value leaves the mapping.
    pub fn read<T: GuestIO>(&self, addr: u64) -> Result<T> {
        let map = read_lock!(self.map);
        let mut offset = usize::try_from(addr).map_err(|_| crate::Error::OutOfBounds)?;
        io::read_le_at(&map, &mut offset)
    }

    /// Writes a little-endian value at guest address `addr`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value leaves the mapping.
    pub fn write<T: GuestIO>(&self, addr: u64, value: T) -> Result<()> {
        let mut map = write_lock!(self.map);
        let mut offset = usize::try_from(addr).map_err(|_| crate::Error::OutOfBounds)?;
        io::write_le_at(&mut map, &mut offset, value)
    }

    /// Moves `len` bytes from `src` to `dst` inside the arena (overlap allowed).
    ///
    /// Returns `false` if either range leaves the mapping.
    pub fn copy_within(&self, dst: u64, src: u64, len: usize) -> bool {
        let mut map = write_lock!(self.map);
        let (Ok(dst), Ok(src)) = (usize::try_from(dst), usize::try_from(src)) else {
            return false;
        };
        let fits = |start: usize| start.checked_add(len).is_some_and(|end| end <= map.len());
        if !fits(dst) || !fits(src) {
            return false;
        }
        map.copy_within(src..src + len, dst);
        true
    }
}
