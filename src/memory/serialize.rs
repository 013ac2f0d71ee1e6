//! Machine snapshots.
//!
//! A snapshot is a [`SnapshotHeader`] followed by one [`SerializedPage`] record per page,
//! each followed by the page bytes unless the page shares the zero buffer. All fields are
//! little-endian; address fields have the width of the machine.
//!
//! ```text
//! +----------------------+  0
//! | header               |
//! |  magic, page counts, |
//! |  layout sizes,       |
//! |  registers, counter, |
//! |  addresses           |
//! +----------------------+  mem_offset
//! | page record | data   |
//! | page record          |  (zero-buffer page, no data)
//! | ...                  |
//! +----------------------+
//! ```

use bitflags::bitflags;
use tracing::debug;

use crate::{
    address::{Address, PAGE_SIZE},
    memory::{
        page::{Page, PageAttributes},
        Memory,
    },
    utils::io::{push_address, push_le, read_address, read_le_at},
    Error, Result,
};

/// Identifies a snapshot.
pub const SNAPSHOT_MAGIC: u64 = 0x9c36_ab93_01ae_d873;

/// Size of an encoded [`SerializedPage`] in bytes.
pub const SERIALIZED_PAGE_SIZE: usize = 20;

/// Size of encoded page attributes in bytes.
pub const SERIALIZED_ATTR_SIZE: usize = 8;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct AttrBits: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXEC = 0x04;
        const IS_COW = 0x08;
        const NON_OWNING = 0x10;
        const DONT_FORK = 0x20;
        const CACHEABLE = 0x40;
    }
}

fn encode_attributes(attr: &PageAttributes) -> [u8; SERIALIZED_ATTR_SIZE] {
    let mut bits = AttrBits::empty();
    bits.set(AttrBits::READ, attr.read);
    bits.set(AttrBits::WRITE, attr.write);
    bits.set(AttrBits::EXEC, attr.exec);
    bits.set(AttrBits::IS_COW, attr.is_cow);
    bits.set(AttrBits::NON_OWNING, attr.non_owning);
    bits.set(AttrBits::DONT_FORK, attr.dont_fork);
    bits.set(AttrBits::CACHEABLE, attr.cacheable);

    let mut out = [0u8; SERIALIZED_ATTR_SIZE];
    out[0] = bits.bits();
    out[1] = attr.user_defined;
    out
}

fn decode_attributes(bytes: &[u8]) -> Result<PageAttributes> {
    if bytes.len() < SERIALIZED_ATTR_SIZE {
        return Err(Error::OutOfBounds);
    }
    let bits = AttrBits::from_bits(bytes[0])
        .ok_or_else(|| malformed_error!("Unknown page attribute bits {:#x}", bytes[0]))?;
    Ok(PageAttributes {
        read: bits.contains(AttrBits::READ),
        write: bits.contains(AttrBits::WRITE),
        exec: bits.contains(AttrBits::EXEC),
        is_cow: bits.contains(AttrBits::IS_COW),
        non_owning: bits.contains(AttrBits::NON_OWNING),
        dont_fork: bits.contains(AttrBits::DONT_FORK),
        cacheable: bits.contains(AttrBits::CACHEABLE),
        user_defined: bytes[1],
    })
}

/// The record preceding each page of a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerializedPage {
    /// Page number
    pub pageno: u64,
    /// Page attributes
    pub attr: PageAttributes,
    /// The page shares the zero buffer and no data follows the record
    pub is_cow_page: bool,
}

impl SerializedPage {
    /// Appends the encoded record to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        push_le(out, self.pageno);
        out.extend_from_slice(&encode_attributes(&self.attr));
        out.push(u8::from(self.is_cow_page));
        out.extend_from_slice(&[0u8; 3]);
    }

    /// Decodes a record at `offset`, advancing it.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] for truncated input and [`Error::Malformed`] for
    /// unknown attribute bits.
    pub fn decode(data: &[u8], offset: &mut usize) -> Result<Self> {
        let pageno = read_le_at::<u64>(data, offset)?;
        let attr = decode_attributes(data.get(*offset..).unwrap_or_default())?;
        *offset += SERIALIZED_ATTR_SIZE;
        let is_cow_page = read_le_at::<u8>(data, offset)? != 0;
        *offset += 3;
        Ok(SerializedPage {
            pageno,
            attr,
            is_cow_page,
        })
    }
}

/// The fixed part of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Number of page records
    pub n_pages: u32,
    /// Number of page records followed by page data
    pub n_datapages: u32,
    /// Offset of the register block
    pub cpu_offset: u16,
    /// Offset of the first page record
    pub mem_offset: u32,
    /// The encoded register file
    pub registers: Vec<u8>,
    /// Instruction counter
    pub counter: u64,
    /// Entry point
    pub start_address: u64,
    /// Initial stack pointer
    pub stack_address: u64,
    /// Next mmap address
    pub mmap_address: u64,
    /// Start of the program break
    pub heap_address: u64,
    /// Return address of guest function calls
    pub exit_address: u64,
}

impl SnapshotHeader {
    /// Size of the encoded header for `registers` bytes of register state.
    #[must_use]
    pub fn encoded_size<A: Address>(registers: usize) -> usize {
        32 + registers + 8 + 5 * A::BYTES
    }

    /// Appends the encoded header to `out`.
    pub fn encode<A: Address>(&self, out: &mut Vec<u8>) {
        push_le(out, SNAPSHOT_MAGIC);
        push_le(out, self.n_pages);
        push_le(out, self.n_datapages);
        push_le(out, self.registers.len() as u16);
        push_le(out, PAGE_SIZE as u16);
        push_le(out, SERIALIZED_ATTR_SIZE as u16);
        push_le(out, SERIALIZED_PAGE_SIZE as u16);
        push_le(out, 0u16);
        push_le(out, self.cpu_offset);
        push_le(out, self.mem_offset);
        out.extend_from_slice(&self.registers);
        push_le(out, self.counter);
        for addr in [
            self.start_address,
            self.stack_address,
            self.mmap_address,
            self.heap_address,
            self.exit_address,
        ] {
            push_address::<A>(out, addr);
        }
    }

    /// Decodes and validates a header carrying `reg_size` bytes of register state.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for a foreign magic value or layout sizes that differ
    /// from this build, and [`Error::OutOfBounds`] for truncated input.
    pub fn decode<A: Address>(data: &[u8], reg_size: usize) -> Result<Self> {
        let mut offset = 0;
        let magic = read_le_at::<u64>(data, &mut offset)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(malformed_error!("Invalid snapshot magic {:#x}", magic));
        }
        let n_pages = read_le_at::<u32>(data, &mut offset)?;
        let n_datapages = read_le_at::<u32>(data, &mut offset)?;

        let expected = [
            ("register block", reg_size),
            ("page", PAGE_SIZE),
            ("attribute", SERIALIZED_ATTR_SIZE),
            ("page record", SERIALIZED_PAGE_SIZE),
        ];
        for (what, size) in expected {
            let found = read_le_at::<u16>(data, &mut offset)?;
            if usize::from(found) != size {
                return Err(malformed_error!(
                    "Snapshot {} size {} does not match {}",
                    what,
                    found,
                    size
                ));
            }
        }
        let _reserved = read_le_at::<u16>(data, &mut offset)?;
        let cpu_offset = read_le_at::<u16>(data, &mut offset)?;
        let mem_offset = read_le_at::<u32>(data, &mut offset)?;

        let registers = data
            .get(offset..offset + reg_size)
            .ok_or(Error::OutOfBounds)?
            .to_vec();
        offset += reg_size;
        let counter = read_le_at::<u64>(data, &mut offset)?;

        Ok(SnapshotHeader {
            n_pages,
            n_datapages,
            cpu_offset,
            mem_offset,
            registers,
            counter,
            start_address: read_address::<A>(data, &mut offset)?,
            stack_address: read_address::<A>(data, &mut offset)?,
            mmap_address: read_address::<A>(data, &mut offset)?,
            heap_address: read_address::<A>(data, &mut offset)?,
            exit_address: read_address::<A>(data, &mut offset)?,
        })
    }
}

impl<A: Address> Memory<A> {
    /// Number of pages and number of pages with data in a snapshot of this address space.
    #[must_use]
    pub fn serialized_page_counts(&self) -> (u32, u32) {
        let pages = self.pages.len() as u32;
        let datapages = self.pages.iter().filter(|(_, p)| !p.is_cow_page()).count() as u32;
        (pages, datapages)
    }

    /// Appends a record (and the data) of every page to `out`, returning the bytes written.
    ///
    /// Restored pages own their data: the written attributes have `is_cow` and
    /// `non_owning` cleared.
    ///
    /// # Errors
    /// Returns [`Error::FeatureDisabled`] when the address space uses a flat arena.
    pub fn serialize_to(&self, out: &mut Vec<u8>) -> Result<usize> {
        if self.uses_flat_memory_arena() {
            return Err(Error::FeatureDisabled(
                "Serialize is incompatible with flat read-write arena",
            ));
        }
        let before = out.len();
        out.reserve(self.pages.len() * (SERIALIZED_PAGE_SIZE + PAGE_SIZE));

        for pageno in self.pages.sorted_pagenos() {
            let Some(page) = self.pages.get(pageno) else {
                continue;
            };
            let mut attr = page.attr;
            attr.is_cow = false;
            attr.non_owning = false;

            let record = SerializedPage {
                pageno,
                attr,
                is_cow_page: page.is_cow_page(),
            };
            record.encode(out);
            if !record.is_cow_page {
                page.with_data(|bytes| out.extend_from_slice(bytes));
            }
        }
        Ok(out.len() - before)
    }

    /// Replaces every page and the well-known addresses with the snapshot in `data`.
    ///
    /// Execute segments are evicted; the caller decodes new ones on demand.
    ///
    /// # Errors
    /// Returns [`Error::InvalidProgram`] when `data` is shorter than the header promises.
    pub fn deserialize_from(&mut self, data: &[u8], header: &SnapshotHeader) -> Result<()> {
        let page_bytes = header.n_pages as usize * SERIALIZED_PAGE_SIZE
            + header.n_datapages as usize * PAGE_SIZE;
        if data.len() < header.mem_offset as usize + page_bytes {
            return Err(invalid_program!(
                "Serialized machine state was invalid",
                data.len()
            ));
        }

        self.pages.clear();
        self.invalidate_reset_cache();
        self.evict_execute_segments();

        let mut offset = header.mem_offset as usize;
        for _ in 0..header.n_pages {
            let record = SerializedPage::decode(data, &mut offset)?;
            let page = if record.is_cow_page {
                let mut page = Page::loaned(Page::cow_page());
                page.attr = record.attr;
                page.attr.non_owning = true;
                page
            } else {
                let bytes = data
                    .get(offset..offset + PAGE_SIZE)
                    .ok_or(Error::OutOfBounds)?;
                offset += PAGE_SIZE;

                let mut page = match &self.arena {
                    Some(arena) if record.pageno < arena.pages() => {
                        Page::arena(record.attr, arena.clone(), record.pageno)
                    }
                    _ => Page::new(record.attr),
                };
                page.with_data_mut(|buffer| buffer.copy_from_slice(bytes));
                page
            };
            self.pages.insert(record.pageno, page);
        }

        self.start_address = A::wrap(header.start_address);
        self.stack_address = A::wrap(header.stack_address);
        self.mmap_address = A::wrap(header.mmap_address);
        self.heap_address = A::wrap(header.heap_address);
        self.exit_address = A::wrap(header.exit_address);
        self.invalidate_reset_cache();

        debug!("Restored {} pages from snapshot", header.n_pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::options;

    fn header_for<A: Address>(memory: &Memory<A>) -> SnapshotHeader {
        let (n_pages, n_datapages) = memory.serialized_page_counts();
        let size = SnapshotHeader::encoded_size::<A>(4);
        SnapshotHeader {
            n_pages,
            n_datapages,
            cpu_offset: 32,
            mem_offset: size as u32,
            registers: vec![1, 2, 3, 4],
            counter: 77,
            start_address: memory.start_address(),
            stack_address: memory.stack_initial(),
            mmap_address: memory.mmap_address(),
            heap_address: memory.heap_address(),
            exit_address: memory.exit_address(),
        }
    }

    #[test]
    fn test_page_record_layout() {
        let mut out = Vec::new();
        SerializedPage {
            pageno: 0x42,
            attr: PageAttributes::read_only(),
            is_cow_page: true,
        }
        .encode(&mut out);
        assert_eq!(out.len(), SERIALIZED_PAGE_SIZE);
        assert_eq!(out[8], 0x41);
        assert_eq!(out[16], 1);

        let mut offset = 0;
        let record = SerializedPage::decode(&out, &mut offset).unwrap();
        assert_eq!(offset, SERIALIZED_PAGE_SIZE);
        assert_eq!(record.pageno, 0x42);
        assert!(!record.attr.write);
    }

    #[test]
    fn test_header_rejects_foreign_layouts() {
        let memory = Memory::<u32>::new(&options()).unwrap();
        let mut out = Vec::new();
        header_for(&memory).encode::<u32>(&mut out);
        assert_eq!(out.len(), SnapshotHeader::encoded_size::<u32>(4));

        assert!(SnapshotHeader::decode::<u32>(&out, 4).is_ok());
        assert!(matches!(
            SnapshotHeader::decode::<u32>(&out, 8),
            Err(Error::Malformed { .. })
        ));
        out[0] ^= 0xFF;
        assert!(matches!(
            SnapshotHeader::decode::<u32>(&out, 4),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_pages_restored() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory.write::<u64>(0x5000, 0xfeed).unwrap();
        memory
            .set_page_attr(0x5000, 1, PageAttributes::read_only())
            .unwrap();
        memory.set_heap_address(0x8_0000);

        let header = header_for(&memory);
        let mut snapshot = Vec::new();
        header.encode::<u64>(&mut snapshot);
        memory.serialize_to(&mut snapshot).unwrap();

        let mut restored = Memory::<u64>::new(&options()).unwrap();
        restored.write::<u64>(0x9000, 1).unwrap();
        let decoded = SnapshotHeader::decode::<u64>(&snapshot, 4).unwrap();
        restored.deserialize_from(&snapshot, &decoded).unwrap();

        assert_eq!(restored.pages_active(), 2);
        assert_eq!(restored.read::<u64>(0x5000).unwrap(), 0xfeed);
        assert!(restored.write::<u64>(0x5000, 0).is_err());
        assert_eq!(restored.read::<u64>(0x9000).unwrap(), 0);
        assert!(restored.read::<u8>(0x10).is_err());
        assert_eq!(restored.heap_address(), 0x8_0000);
    }

    #[test]
    fn test_truncated_snapshot() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory.write::<u8>(0x5000, 1).unwrap();
        let header = header_for(&memory);
        let mut snapshot = Vec::new();
        header.encode::<u64>(&mut snapshot);
        memory.serialize_to(&mut snapshot).unwrap();
        snapshot.truncate(snapshot.len() - 1);

        assert!(matches!(
            memory.deserialize_from(&snapshot, &header),
            Err(Error::InvalidProgram { .. })
        ));
    }

    #[test]
    fn test_arena_snapshots_disabled() {
        let memory = Memory::<u64>::new(&options().with_memory_arena(true)).unwrap();
        assert!(matches!(
            memory.serialize_to(&mut Vec::new()),
            Err(Error::FeatureDisabled(_))
        ));
    }
}
