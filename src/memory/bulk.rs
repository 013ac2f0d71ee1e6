//! Bulk transfers between host buffers and guest memory.
//!
//! Every operation walks its range page by page and checks each page's permissions, so a
//! range is never assumed to be contiguous in host memory. The only exception is the flat
//! arena: a range that lies entirely inside the arena fast path is served with a single
//! slice.
//!
//! Ranges that would wrap the guest address space raise [`Error::ProtectionFault`].

use std::borrow::Cow;

use crate::{
    address::{page_number, page_offset, Address, PAGE_SIZE},
    memory::{page::Page, GuestIO, Memory},
    utils::io,
    Error, Result,
};

/// Splits `[addr, addr + len)` into page-bounded pieces of `(address, done, size)`.
fn page_pieces(addr: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize)> {
    let mut done = 0usize;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let current = addr.wrapping_add(done as u64);
        let size = (PAGE_SIZE - page_offset(current)).min(len - done);
        let piece = (current, done, size);
        done += size;
        Some(piece)
    })
}

/// Bytes left in the address space from `addr` to its end.
fn remaining<A: Address>(addr: u64) -> u64 {
    if A::is_64() {
        u64::MAX - addr
    } else {
        (1u64 << 32) - addr
    }
}

/// Fails with a protection fault if `[addr, addr + len)` leaves the address space.
fn check_range<A: Address>(addr: u64, len: usize) -> Result<()> {
    if len as u64 > remaining::<A>(addr) {
        return Err(Error::ProtectionFault { addr });
    }
    Ok(())
}

/// A copy of a guest range, one fragment per page unless the range was contiguous.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Buffer {
    fragments: Vec<Vec<u8>>,
    len: usize,
}

impl Buffer {
    fn push(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
        self.fragments.push(bytes.to_vec());
    }

    /// Returns `true` if the range was read as one contiguous slice.
    #[must_use]
    pub fn is_sequential(&self) -> bool {
        self.fragments.len() <= 1
    }

    /// The fragments in address order.
    pub fn fragments(&self) -> impl Iterator<Item = &[u8]> {
        self.fragments.iter().map(Vec::as_slice)
    }

    /// Total length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Concatenates the fragments.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.fragments.concat()
    }

    /// The contents as text, replacing invalid UTF-8.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_vec()).into_owned()
    }

    /// Copies as many bytes as fit into `dst`, returning the number copied.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for fragment in &self.fragments {
            let n = fragment.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&fragment[..n]);
            copied += n;
            if copied == dst.len() {
                break;
            }
        }
        copied
    }
}

impl<A: Address> Memory<A> {
    fn readable_page(&self, addr: u64) -> Result<Cow<'_, Page>> {
        let page = self.get_pageno(page_number(addr))?;
        if !page.attr.read {
            return Err(Error::ProtectionFault { addr });
        }
        Ok(page)
    }

    fn writable_page(&mut self, addr: u64, init: bool) -> Result<&mut Page> {
        let slot = self.writable_slot(page_number(addr), addr, init)?;
        self.pages
            .slot_mut(slot)
            .ok_or(Error::ProtectionFault { addr })
    }

    /// Fills `len` bytes at `dst` with `value`.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] when a page is not writable.
    pub fn memset(&mut self, dst: u64, value: u8, len: u64) -> Result<()> {
        let dst = A::wrap(dst);
        let len = usize::try_from(len).map_err(|_| Error::ProtectionFault { addr: dst })?;
        check_range::<A>(dst, len)?;

        if let Some(arena) = self.arena_writable(dst, len) {
            if arena
                .with_range_mut(dst, len, |bytes| bytes.fill(value))
                .is_some()
            {
                return Ok(());
            }
        }
        for (addr, _, size) in page_pieces(dst, len) {
            let offset = page_offset(addr);
            self.writable_page(addr, size == PAGE_SIZE)?
                .with_data_mut(|bytes| bytes[offset..offset + size].fill(value));
        }
        Ok(())
    }

    /// Copies `src` into guest memory at `dst`.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] when a page is not writable.
    pub fn memcpy(&mut self, dst: u64, src: &[u8]) -> Result<()> {
        let dst = A::wrap(dst);
        check_range::<A>(dst, src.len())?;

        if let Some(arena) = self.arena_writable(dst, src.len()) {
            if arena
                .with_range_mut(dst, src.len(), |bytes| bytes.copy_from_slice(src))
                .is_some()
            {
                return Ok(());
            }
        }
        for (addr, done, size) in page_pieces(dst, src.len()) {
            let offset = page_offset(addr);
            self.writable_page(addr, size == PAGE_SIZE)?
                .with_data_mut(|bytes| {
                    bytes[offset..offset + size].copy_from_slice(&src[done..done + size]);
                });
        }
        Ok(())
    }

    /// Copies guest memory at `src` into `dst`.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] when a page is not readable.
    pub fn memcpy_out(&self, dst: &mut [u8], src: u64) -> Result<()> {
        let src = A::wrap(src);
        check_range::<A>(src, dst.len())?;

        if let Some(arena) = self.arena_readable(src, dst.len()) {
            if arena
                .with_range(src, dst.len(), |bytes| dst.copy_from_slice(bytes))
                .is_some()
            {
                return Ok(());
            }
        }
        for (addr, done, size) in page_pieces(src, dst.len()) {
            let offset = page_offset(addr);
            self.readable_page(addr)?.with_data(|bytes| {
                dst[done..done + size].copy_from_slice(&bytes[offset..offset + size]);
            });
        }
        Ok(())
    }

    /// Copies `len` bytes from `src` in `other` to `dst` in this memory.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] for unreadable source or unwritable destination pages.
    pub fn copy_from_memory(
        &mut self,
        dst: u64,
        other: &Memory<A>,
        src: u64,
        len: u64,
    ) -> Result<()> {
        let src = A::wrap(src);
        let len = usize::try_from(len).map_err(|_| Error::ProtectionFault { addr: src })?;
        check_range::<A>(src, len)?;

        let mut buffer = [0u8; PAGE_SIZE];
        for (addr, done, size) in page_pieces(src, len) {
            other.memcpy_out(&mut buffer[..size], addr)?;
            self.memcpy(dst.wrapping_add(done as u64), &buffer[..size])?;
        }
        Ok(())
    }

    /// Moves `len` bytes from `src` to `dst` (overlap allowed) when both ranges lie inside the
    /// arena fast path. Returns `false` without touching memory otherwise.
    pub fn try_memmove(&mut self, dst: u64, src: u64, len: u64) -> bool {
        let (dst, src) = (A::wrap(dst), A::wrap(src));
        let Ok(len) = usize::try_from(len) else {
            return false;
        };
        match (self.arena_writable(dst, len), self.arena_readable(src, len)) {
            (Some(arena), Some(_)) => arena.copy_within(dst, src, len),
            _ => false,
        }
    }

    /// Compares `len` bytes at `p1` with `len` bytes at `p2`.
    ///
    /// Returns zero when equal, else the difference of the first differing bytes.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] when a range is unreadable or wraps around.
    pub fn memcmp(&self, p1: u64, p2: u64, len: u64) -> Result<i32> {
        let (p1, p2) = (A::wrap(p1), A::wrap(p2));
        let len = usize::try_from(len).map_err(|_| Error::ProtectionFault { addr: p1 })?;
        check_range::<A>(p1, len)?;
        check_range::<A>(p2, len)?;

        let mut a = [0u8; PAGE_SIZE];
        let mut b = [0u8; PAGE_SIZE];
        let mut done = 0usize;
        while done < len {
            let (x, y) = (p1 + done as u64, p2 + done as u64);
            let chunk = (len - done)
                .min(PAGE_SIZE - page_offset(x))
                .min(PAGE_SIZE - page_offset(y));
            self.memcpy_out(&mut a[..chunk], x)?;
            self.memcpy_out(&mut b[..chunk], y)?;
            if let Some(i) = (0..chunk).find(|&i| a[i] != b[i]) {
                return Ok(i32::from(a[i]) - i32::from(b[i]));
            }
            done += chunk;
        }
        Ok(0)
    }

    /// Compares the host bytes `host` with guest memory at `addr`.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] when the range is unreadable or wraps around.
    pub fn memcmp_host(&self, host: &[u8], addr: u64) -> Result<i32> {
        let addr = A::wrap(addr);
        check_range::<A>(addr, host.len())?;

        let mut guest = [0u8; PAGE_SIZE];
        for (piece, done, size) in page_pieces(addr, host.len()) {
            self.memcpy_out(&mut guest[..size], piece)?;
            let expected = &host[done..done + size];
            if let Some(i) = (0..size).find(|&i| expected[i] != guest[i]) {
                return Ok(i32::from(expected[i]) - i32::from(guest[i]));
            }
        }
        Ok(0)
    }

    /// Zeroes `len` bytes at `dst`, freeing whole pages with default permissions.
    ///
    /// With `ignore_protections` existing pages are zeroed regardless of their permissions
    /// and missing pages are left missing.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] when a page is not writable and protections are
    /// honored.
    pub fn memdiscard(&mut self, dst: u64, len: u64, ignore_protections: bool) -> Result<()> {
        let dst = A::wrap(dst);
        let len = usize::try_from(len).map_err(|_| Error::ProtectionFault { addr: dst })?;
        check_range::<A>(dst, len)?;

        if let Some(arena) = self.arena_writable(dst, len) {
            if arena
                .with_range_mut(dst, len, |bytes| bytes.fill(0))
                .is_some()
            {
                return Ok(());
            }
        }

        for (addr, _, size) in page_pieces(dst, len) {
            let pageno = page_number(addr);
            let Some(page) = self.pages.get_mut(pageno) else {
                continue;
            };
            if !ignore_protections && !page.attr.write && !page.attr.is_cow {
                return Err(Error::ProtectionFault { addr });
            }
            if page.is_cow_page() {
                continue;
            }
            if size == PAGE_SIZE && page.attr.is_default() && !page.has_trap() {
                self.free_pageno(pageno);
            } else if ignore_protections {
                let offset = page_offset(addr);
                page.with_data_mut(|bytes| bytes[offset..offset + size].fill(0));
            } else {
                self.memset(addr, 0, size as u64)?;
            }
        }
        Ok(())
    }

    /// Length of the zero-terminated string at `addr`, at most `maxlen`.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] when a page before the terminator is unreadable.
    pub fn strlen(&self, addr: u64, maxlen: usize) -> Result<usize> {
        let addr = A::wrap(addr);
        let maxlen = maxlen.min(usize::try_from(remaining::<A>(addr)).unwrap_or(usize::MAX));

        if let Some(arena) = self.arena_readable(addr, maxlen) {
            if let Some(len) = arena.with_range(addr, maxlen, |bytes| {
                bytes.iter().position(|b| *b == 0).unwrap_or(maxlen)
            }) {
                return Ok(len);
            }
        }
        for (piece, done, size) in page_pieces(addr, maxlen) {
            let offset = page_offset(piece);
            let found = self
                .readable_page(piece)?
                .with_data(|bytes| bytes[offset..offset + size].iter().position(|b| *b == 0));
            if let Some(pos) = found {
                return Ok(done + pos);
            }
        }
        Ok(maxlen)
    }

    /// Copies the zero-terminated string at `addr`, truncated to `maxlen` bytes.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] when a page of the string is unreadable.
    pub fn memstring(&self, addr: u64, maxlen: usize) -> Result<String> {
        let len = self.strlen(addr, maxlen)?;
        let mut bytes = vec![0u8; len];
        self.memcpy_out(&mut bytes, addr)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Runs `f` on the zero-terminated string at `addr` without copying it out of the arena.
    ///
    /// # Errors
    /// Returns [`Error::FeatureDisabled`] without an arena and [`Error::ProtectionFault`] when
    /// `addr` is outside the arena read fast path.
    pub fn memstring_view<R>(
        &self,
        addr: u64,
        maxlen: usize,
        f: impl FnOnce(&str) -> R,
    ) -> Result<R> {
        let addr = A::wrap(addr);
        let Some(arena) = self.memory_arena() else {
            return Err(Error::FeatureDisabled("memstring_view requires the memory arena"));
        };
        let Some(available) = self.arena_available(addr) else {
            return Err(Error::ProtectionFault { addr });
        };

        arena
            .with_range(addr, maxlen.min(available), |bytes| {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                f(&*String::from_utf8_lossy(&bytes[..end]))
            })
            .ok_or(Error::ProtectionFault { addr })
    }

    /// Bytes readable through the arena fast path from `addr` on.
    fn arena_available(&self, addr: u64) -> Option<usize> {
        let offset = addr.wrapping_sub(super::RWREAD_BEGIN);
        (self.uses_flat_memory_arena() && offset < self.memory_arena_read_boundary())
            .then(|| usize::try_from(self.memory_arena_read_boundary() - offset).ok())
            .flatten()
    }

    /// Copies `len` bytes at `addr` into a [`Buffer`].
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] if `len > maxlen` or a page is unreadable.
    pub fn membuffer(&self, addr: u64, len: usize, maxlen: usize) -> Result<Buffer> {
        let addr = A::wrap(addr);
        if len > maxlen {
            return Err(Error::ProtectionFault { addr });
        }
        let mut buffer = Buffer::default();
        self.gather_buffers(addr, len, |_, bytes| buffer.push(bytes))?;
        Ok(buffer)
    }

    /// Runs `f` on `len` bytes at `addr` as one contiguous slice.
    ///
    /// Ranges spanning pages are gathered into a temporary buffer.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] if `len > maxlen` or a page is unreadable.
    pub fn memview<R>(
        &self,
        addr: u64,
        len: usize,
        maxlen: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let addr = A::wrap(addr);
        if len > maxlen {
            return Err(Error::ProtectionFault { addr });
        }
        if len == 0 {
            return Ok(f(&[]));
        }
        check_range::<A>(addr, len)?;

        if let Some(arena) = self.arena_readable(addr, len) {
            return arena
                .with_range(addr, len, f)
                .ok_or(Error::ProtectionFault { addr });
        }
        let offset = page_offset(addr);
        if offset + len <= PAGE_SIZE {
            return Ok(self
                .readable_page(addr)?
                .with_data(|bytes| f(&bytes[offset..offset + len])));
        }

        let mut gathered = vec![0u8; len];
        self.memcpy_out(&mut gathered, addr)?;
        Ok(f(&gathered))
    }

    /// Runs `f` on `len` writable bytes at `addr` as one contiguous slice.
    ///
    /// Ranges spanning pages are gathered into a temporary buffer that is written back after
    /// `f` returns.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] if `len > maxlen` or a page is not writable.
    pub fn writable_memview<R>(
        &mut self,
        addr: u64,
        len: usize,
        maxlen: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let addr = A::wrap(addr);
        if len > maxlen {
            return Err(Error::ProtectionFault { addr });
        }
        if len == 0 {
            return Ok(f(&mut []));
        }
        check_range::<A>(addr, len)?;

        if let Some(arena) = self.arena_writable(addr, len) {
            return arena
                .with_range_mut(addr, len, f)
                .ok_or(Error::ProtectionFault { addr });
        }
        let offset = page_offset(addr);
        if offset + len <= PAGE_SIZE {
            return Ok(self
                .writable_page(addr, len == PAGE_SIZE)?
                .with_data_mut(|bytes| f(&mut bytes[offset..offset + len])));
        }

        let mut gathered = vec![0u8; len];
        for (piece, done, size) in page_pieces(addr, len) {
            let offset = page_offset(piece);
            self.writable_page(piece, false)?.with_data(|bytes| {
                gathered[done..done + size].copy_from_slice(&bytes[offset..offset + size]);
            });
        }
        let result = f(&mut gathered);
        for (piece, done, size) in page_pieces(addr, len) {
            let offset = page_offset(piece);
            self.writable_page(piece, false)?.with_data_mut(|bytes| {
                bytes[offset..offset + size].copy_from_slice(&gathered[done..done + size]);
            });
        }
        Ok(result)
    }

    /// Reads `count` consecutive values at `addr`, which must be aligned for `T`.
    ///
    /// # Errors
    /// Returns [`Error::MisalignedAccess`] for unaligned addresses and
    /// [`Error::ProtectionFault`] when a page is unreadable.
    pub fn memarray<T: GuestIO>(&self, addr: u64, count: usize) -> Result<Vec<T>> {
        let addr = A::wrap(addr);
        if addr % T::SIZE as u64 != 0 {
            return Err(Error::MisalignedAccess {
                addr,
                size: T::SIZE,
            });
        }
        let len = count
            .checked_mul(T::SIZE)
            .ok_or(Error::ProtectionFault { addr })?;
        self.memview(addr, len, len, |bytes| {
            bytes
                .chunks_exact(T::SIZE)
                .map(io::read_le::<T>)
                .collect::<Result<Vec<T>>>()
        })?
    }

    /// Calls `f` with the address and bytes of each readable piece of `[addr, addr + len)`.
    ///
    /// A range inside the arena is visited as one piece.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] when a page is unreadable.
    pub fn gather_buffers(
        &self,
        addr: u64,
        len: usize,
        mut f: impl FnMut(u64, &[u8]),
    ) -> Result<()> {
        let addr = A::wrap(addr);
        check_range::<A>(addr, len)?;
        if len == 0 {
            return Ok(());
        }
        if let Some(arena) = self.arena_readable(addr, len) {
            if arena.with_range(addr, len, |bytes| f(addr, bytes)).is_some() {
                return Ok(());
            }
        }
        for (piece, _, size) in page_pieces(addr, len) {
            let offset = page_offset(piece);
            self.readable_page(piece)?
                .with_data(|bytes| f(piece, &bytes[offset..offset + size]));
        }
        Ok(())
    }

    /// Calls `f` with the address and bytes of each writable piece of `[addr, addr + len)`.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] when a page is not writable.
    pub fn gather_writable_buffers(
        &mut self,
        addr: u64,
        len: usize,
        mut f: impl FnMut(u64, &mut [u8]),
    ) -> Result<()> {
        let addr = A::wrap(addr);
        check_range::<A>(addr, len)?;
        if len == 0 {
            return Ok(());
        }
        if let Some(arena) = self.arena_writable(addr, len) {
            if arena
                .with_range_mut(addr, len, |bytes| f(addr, bytes))
                .is_some()
            {
                return Ok(());
            }
        }
        for (piece, _, size) in page_pieces(addr, len) {
            let offset = page_offset(piece);
            self.writable_page(piece, size == PAGE_SIZE)?
                .with_data_mut(|bytes| f(piece, &mut bytes[offset..offset + size]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::PageAttributes, test::options};

    fn memory() -> Memory<u64> {
        Memory::new(&options()).unwrap()
    }

    #[test]
    fn test_page_pieces() {
        let pieces: Vec<_> = page_pieces(0x1FF0, 0x1020).collect();
        assert_eq!(
            pieces,
            vec![(0x1FF0, 0, 0x10), (0x2000, 0x10, 0x1000), (0x3000, 0x1010, 0x10)]
        );
        assert_eq!(page_pieces(0x1000, 0).count(), 0);
    }

    #[test]
    fn test_memcpy_across_pages() {
        let mut memory = memory();
        let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        memory.memcpy(0x2F00, &data).unwrap();

        let mut out = vec![0u8; data.len()];
        memory.memcpy_out(&mut out, 0x2F00).unwrap();
        assert_eq!(out, data);
        assert_eq!(memory.pages_active(), 4);
    }

    #[test]
    fn test_memview_gathers() {
        let mut memory = memory();
        memory.memcpy(0x2FFC, b"abcdefgh").unwrap();
        let text = memory
            .memview(0x2FFC, 8, 8, |bytes| bytes.to_vec())
            .unwrap();
        assert_eq!(text, b"abcdefgh");
        assert!(matches!(
            memory.memview(0x2FFC, 9, 8, |_| ()),
            Err(Error::ProtectionFault { addr: 0x2FFC })
        ));
        assert_eq!(memory.memview(0x0, 0, 0, <[u8]>::len).unwrap(), 0);
    }

    #[test]
    fn test_writable_memview_writes_back() {
        let mut memory = memory();
        memory
            .writable_memview(0x2FFE, 4, 4, |bytes| bytes.copy_from_slice(&[1, 2, 3, 4]))
            .unwrap();
        assert_eq!(memory.read::<u32>(0x2FFE).unwrap(), 0x0403_0201);
        assert!(memory.writable_memview(0x10, 4, 4, |_| ()).is_err());
    }

    #[test]
    fn test_memset_and_memcmp() {
        let mut memory = memory();
        memory.memset(0x3000, 0x11, 0x2000).unwrap();
        memory.memset(0x8000, 0x11, 0x2000).unwrap();
        assert_eq!(memory.memcmp(0x3000, 0x8000, 0x2000).unwrap(), 0);

        memory.write::<u8>(0x4800, 0x10).unwrap();
        assert_eq!(memory.memcmp(0x3000, 0x8000, 0x2000).unwrap(), -1);
        assert_eq!(memory.memcmp(0x8000, 0x3000, 0x2000).unwrap(), 1);
        assert!(memory.memcmp(0x3000, u64::MAX - 4, 16).is_err());
        assert_eq!(memory.memcmp_host(&[0x11; 8], 0x3000).unwrap(), 0);
        assert_eq!(memory.memcmp_host(&[0x12], 0x3000).unwrap(), 1);
    }

    #[test]
    fn test_strings() {
        let mut memory = memory();
        memory.memcpy(0x2FFA, b"hello world\0").unwrap();
        assert_eq!(memory.strlen(0x2FFA, 64).unwrap(), 11);
        assert_eq!(memory.memstring(0x2FFA, 64).unwrap(), "hello world");
        assert_eq!(memory.memstring(0x2FFA, 5).unwrap(), "hello");
        assert!(memory.strlen(0x0, 16).is_err());
        assert!(matches!(
            memory.memstring_view(0x2FFA, 16, str::len),
            Err(Error::FeatureDisabled(_))
        ));
    }

    #[test]
    fn test_memstring_view_in_arena() {
        let mut memory = Memory::<u64>::new(&options().with_memory_arena(true)).unwrap();
        memory.memcpy(0x2000, b"arena\0").unwrap();
        let text = memory
            .memstring_view(0x2000, 64, |s| s.to_string())
            .unwrap();
        assert_eq!(text, "arena");
        assert!(memory.memstring_view(0x10, 4, |_| ()).is_err());
    }

    #[test]
    fn test_membuffer_fragments() {
        let mut memory = memory();
        memory.memcpy(0x2FF0, &[7u8; 32]).unwrap();
        let buffer = memory.membuffer(0x2FF0, 32, 64).unwrap();
        assert!(!buffer.is_sequential());
        assert_eq!(buffer.fragments().count(), 2);
        assert_eq!(buffer.to_vec(), vec![7u8; 32]);

        let mut host = [0u8; 8];
        assert_eq!(buffer.copy_to(&mut host), 8);
        assert!(memory.membuffer(0x2FF0, 65, 64).is_err());

        let single = memory.membuffer(0x2FF0, 16, 16).unwrap();
        assert!(single.is_sequential());
        assert_eq!(single.len(), 16);
    }

    #[test]
    fn test_memarray() {
        let mut memory = memory();
        for i in 0..4u64 {
            memory.write::<u32>(0x2000 + i * 4, i as u32 * 10).unwrap();
        }
        assert_eq!(memory.memarray::<u32>(0x2000, 4).unwrap(), vec![0, 10, 20, 30]);
        assert!(matches!(
            memory.memarray::<u32>(0x2002, 1),
            Err(Error::MisalignedAccess { .. })
        ));
    }

    #[test]
    fn test_memdiscard() {
        let mut memory = memory();
        memory.memset(0x3000, 0xFF, 0x1800).unwrap();
        memory.memdiscard(0x3000, 0x1800, false).unwrap();
        assert_eq!(memory.pages_active(), 2);
        assert_eq!(memory.read::<u8>(0x4000).unwrap(), 0);
        assert_eq!(memory.read::<u8>(0x3000).unwrap(), 0);

        memory.memset(0x6000, 0xFF, 16).unwrap();
        memory
            .set_page_attr(0x6000, 1, PageAttributes::read_only())
            .unwrap();
        assert!(memory.memdiscard(0x6000, 16, false).is_err());
        memory.memdiscard(0x6000, 16, true).unwrap();
        assert_eq!(memory.read::<u8>(0x6000).unwrap(), 0);
    }

    #[test]
    fn test_copy_from_memory() {
        let mut source = memory();
        source.memcpy(0x2FF8, b"0123456789abcdef").unwrap();
        let mut target = memory();
        target.copy_from_memory(0x9000, &source, 0x2FF8, 16).unwrap();
        assert_eq!(target.memstring(0x9000, 16).unwrap(), "0123456789abcdef");
    }

    #[test]
    fn test_gather_buffers() {
        let mut memory = memory();
        memory
            .gather_writable_buffers(0x2FFE, 4, |_, bytes| bytes.fill(9))
            .unwrap();
        let mut seen = Vec::new();
        memory
            .gather_buffers(0x2FFE, 4, |addr, bytes| seen.push((addr, bytes.len())))
            .unwrap();
        assert_eq!(seen, vec![(0x2FFE, 2), (0x3000, 2)]);
    }

    #[test]
    fn test_try_memmove_requires_arena() {
        let mut memory = memory();
        assert!(!memory.try_memmove(0x2000, 0x3000, 16));

        let mut memory = Memory::<u64>::new(&options().with_memory_arena(true)).unwrap();
        memory.memcpy(0x3000, b"moved").unwrap();
        assert!(memory.try_memmove(0x2000, 0x3000, 5));
        assert_eq!(memory.memstring(0x2000, 5).unwrap(), "moved");
    }
}
