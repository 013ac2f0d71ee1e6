//! The paged guest address space.
//!
//! [`Memory`] maps page numbers to [`Page`]s and implements every load, store and instruction
//! fetch a machine performs. Pages that are not present in the table are produced on demand:
//!
//! - **Reads** of a missing page go through the read-fault handler, which by default returns
//!   the shared copy-on-write zero page (or an arena window) without inserting anything.
//! - **Writes** to a missing page go through the page-fault handler, which allocates a fresh
//!   page within the machine's page budget and inserts it.
//! - **Writes** to a copy-on-write page go through the page-write handler, which by default
//!   privatizes the page.
//!
//! Page 0 always holds a guard page, so null pointer dereferences fault.
//!
//! # Flat Arena
//!
//! With [`crate::MachineOptions::use_memory_arena`] the low part of the address space is
//! backed by one anonymous mapping. Loads from `[0x1000, arena_end)` and stores to
//! `[max(rodata_end, 0x1000), arena_end)` then skip the page table entirely. Forks share the
//! arena mapping with their source; full copy-on-write isolation between forks holds only for
//! machines without an arena.
//!
//! # Examples
//!
//! ```rust
//! use rvmem::{prelude::*, memory::PageAttributes};
//!
//! let mut memory = Memory::<u64>::new(&MachineOptions::default())?;
//! memory.write::<u32>(0x4000, 0xdead_beef)?;
//! assert_eq!(memory.read::<u32>(0x4000)?, 0xdead_beef);
//!
//! memory.set_page_attr(0x4000, 4096, PageAttributes::read_only())?;
//! assert!(memory.write::<u32>(0x4000, 0).is_err());
//! # Ok::<(), rvmem::Error>(())
//! ```

mod arena;
mod bulk;
mod cache;
mod elf;
mod loader;
mod mmap;
mod page;
mod serialize;
mod table;

use std::{borrow::Cow, cell::Cell, fmt, sync::Arc};

use tracing::{debug, trace, warn};

pub use arena::FlatArena;
pub use bulk::Buffer;
pub use cache::CachedPage;
pub use elf::{
    LoadSegment, ProgramImage, Section, SegmentFlags, Symbol, ELF_FLAG_RVC, ELF_FLAG_RVE,
};
pub use loader::{Callsite, MAX_PROGRAM_HEADERS};
pub use page::{Page, PageAttributes, PageData, PageStorage, PageTrap, TrapEvent, TrapKind};
pub use serialize::{
    SerializedPage, SnapshotHeader, SERIALIZED_ATTR_SIZE, SERIALIZED_PAGE_SIZE, SNAPSHOT_MAGIC,
};
pub use table::PageTable;

pub use crate::utils::io::GuestIO;

use crate::{
    address::{page_number, page_offset, Address, PAGE_SIZE},
    config::MachineOptions,
    decoder::{
        generate_decoder_cache, DecodedExecuteSegment, HandlerRegistry, SegmentHandle, SegmentKey,
        SharedExecuteSegments,
    },
    utils::io,
    Error, Result,
};

/// First address served by the arena read fast path.
pub const RWREAD_BEGIN: u64 = 0x1000;

/// Room reserved for the program break between the heap and the mmap area (16 MiB).
pub const BRK_MAX: u64 = 16 << 20;

/// Maximum number of execute segments besides the main one.
pub const MAX_EXECUTE_SEGMENTS: usize = 16;

/// Creates the page for a write to a missing page number.
///
/// Arguments are the memory, the page number and whether the page will be fully initialized
/// by the caller. The returned page is inserted into the page table.
pub type PageFaultHandler<A> = Arc<dyn Fn(&Memory<A>, u64, bool) -> Result<Page> + Send + Sync>;

/// Produces the page seen by a read of a missing page number. The page is not inserted.
pub type PageReadHandler<A> = Arc<dyn Fn(&Memory<A>, u64) -> Result<Page> + Send + Sync>;

/// Makes a copy-on-write page writable.
pub type PageWriteHandler = Arc<dyn Fn(u64, &mut Page) -> Result<()> + Send + Sync>;

fn default_page_fault_handler<A: Address>() -> PageFaultHandler<A> {
    Arc::new(|memory: &Memory<A>, pageno, _init| memory.default_page_fault(pageno))
}

fn default_page_read_handler<A: Address>() -> PageReadHandler<A> {
    Arc::new(|memory: &Memory<A>, pageno| Ok(memory.default_page_read(pageno)))
}

fn default_page_write_handler() -> PageWriteHandler {
    Arc::new(|_pageno, page: &mut Page| {
        page.make_writable();
        Ok(())
    })
}

/// The address space of one machine.
pub struct Memory<A: Address> {
    pages: PageTable,
    rd_cache: Cell<CachedPage>,
    wr_cache: CachedPage,

    page_fault_handler: PageFaultHandler<A>,
    page_readf_handler: PageReadHandler<A>,
    page_write_handler: PageWriteHandler,
    pages_max: u64,
    alignment_check: bool,

    arena: Option<Arc<FlatArena>>,
    arena_read_boundary: u64,
    arena_write_boundary: u64,
    initial_rodata_end: u64,

    main_exec: Option<SegmentHandle<A>>,
    exec: Vec<Option<SegmentHandle<A>>>,
    shared_segments: Option<Arc<SharedExecuteSegments<A>>>,
    handlers: Arc<HandlerRegistry<A>>,
    compressed: bool,

    image: Option<Arc<ProgramImage>>,
    start_address: u64,
    stack_address: u64,
    exit_address: u64,
    heap_address: u64,
    mmap_address: u64,
}

impl<A: Address> fmt::Debug for Memory<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("bits", &A::BITS)
            .field("pages", &self.pages.len())
            .field("pages_max", &self.pages_max)
            .field("arena", &self.arena)
            .field("execute_segments", &self.execute_segments_count())
            .field("start", &format_args!("{:#x}", self.start_address))
            .field("stack", &format_args!("{:#x}", self.stack_address))
            .field("heap", &format_args!("{:#x}", self.heap_address))
            .field("mmap", &format_args!("{:#x}", self.mmap_address))
            .finish_non_exhaustive()
    }
}

impl<A: Address> Drop for Memory<A> {
    fn drop(&mut self) {
        self.evict_execute_segments();
    }
}

impl<A: Address> Memory<A> {
    /// Creates an empty address space holding only the guard page at 0.
    ///
    /// # Errors
    /// Returns [`Error::OutOfMemory`] if `memory_max` is zero and [`Error::InvalidProgram`] if
    /// the shared segment registry was created for a different instruction width mode.
    pub fn new(options: &MachineOptions<A>) -> Result<Self> {
        let mut memory = Memory::empty(options)?;
        memory.install_shared_page(0, Page::guard_page())?;
        Ok(memory)
    }

    fn empty(options: &MachineOptions<A>) -> Result<Self> {
        if options.memory_max == 0 {
            return Err(Error::OutOfMemory {
                message: "Max memory was zero".to_string(),
                pages: 0,
            });
        }
        if let Some(shared) = &options.shared_segments {
            if shared.is_compressed() != options.compressed_instructions {
                return Err(invalid_program!(
                    "Shared execute segments use a different instruction width mode"
                ));
            }
        }

        let pages_max = options.memory_max / PAGE_SIZE as u64;
        let arena = if options.use_memory_arena {
            match FlatArena::new(pages_max) {
                Ok(arena) => {
                    debug!("Mapped memory arena of {} pages", arena.pages());
                    Some(Arc::new(arena))
                }
                Err(e) => {
                    warn!("Continuing without memory arena: {e}");
                    None
                }
            }
        } else {
            None
        };

        let handlers = options
            .handler_registry()
            .unwrap_or_else(|| Arc::new(HandlerRegistry::new()));

        let mut memory = Memory {
            pages: PageTable::new(),
            rd_cache: Cell::new(CachedPage::EMPTY),
            wr_cache: CachedPage::EMPTY,
            page_fault_handler: options
                .page_fault_handler
                .clone()
                .unwrap_or_else(default_page_fault_handler),
            page_readf_handler: default_page_read_handler(),
            page_write_handler: default_page_write_handler(),
            pages_max,
            alignment_check: options.memory_alignment_check,
            arena,
            arena_read_boundary: 0,
            arena_write_boundary: 0,
            initial_rodata_end: 0,
            main_exec: None,
            exec: Vec::new(),
            shared_segments: options.shared_segments.clone(),
            handlers,
            compressed: options.compressed_instructions,
            image: None,
            start_address: 0,
            stack_address: 0,
            exit_address: 0,
            heap_address: 0,
            mmap_address: 0,
        };
        memory.recompute_arena_boundaries();
        Ok(memory)
    }

    /// Creates a copy-on-write fork of `master`.
    ///
    /// Unless `options.minimal_fork` is set, every page of `master` not marked `dont_fork` is
    /// loaned to the fork; writable pages become copy-on-write on both sides of the loan, so
    /// neither machine observes the other's later writes. Decoded execute segments, fault
    /// handlers and the well-known addresses are shared. The arena is shared when `options`
    /// enables it and `master` has one.
    ///
    /// # Errors
    /// Returns the same errors as [`Memory::new`].
    pub fn fork(master: &Memory<A>, options: &MachineOptions<A>) -> Result<Self> {
        let mut fork = Memory::empty(&MachineOptions {
            use_memory_arena: false,
            shared_segments: None,
            compressed_instructions: master.compressed,
            ..options.clone()
        })?;

        fork.page_fault_handler = master.page_fault_handler.clone();
        fork.page_readf_handler = master.page_readf_handler.clone();
        fork.page_write_handler = master.page_write_handler.clone();
        fork.shared_segments = master.shared_segments.clone();
        fork.handlers = master.handlers.clone();

        if options.minimal_fork {
            fork.install_shared_page(0, Page::guard_page())?;
        } else {
            for (pageno, page) in master.pages.iter() {
                if !page.attr.dont_fork {
                    fork.pages.insert(pageno, page.fork_loan());
                }
            }
            if !fork.pages.contains(0) {
                fork.install_shared_page(0, Page::guard_page())?;
            }
        }

        if options.use_memory_arena {
            fork.arena = master.arena.clone();
            fork.initial_rodata_end = master.initial_rodata_end;
            fork.recompute_arena_boundaries();
        }

        fork.main_exec = master.main_exec.clone();
        fork.exec = master.exec.clone();
        fork.image = master.image.clone();
        fork.start_address = master.start_address;
        fork.stack_address = master.stack_address;
        fork.exit_address = master.exit_address;
        fork.heap_address = master.heap_address;
        fork.mmap_address = master.mmap_address;
        fork.invalidate_reset_cache();

        trace!("Forked memory with {} pages", fork.pages.len());
        Ok(fork)
    }

    // ---------------------------------------------------------------------------------------
    // Typed access
    // ---------------------------------------------------------------------------------------

    fn check_alignment<T: GuestIO>(&self, addr: u64) -> Result<()> {
        if self.alignment_check && addr % T::SIZE as u64 != 0 {
            return Err(Error::MisalignedAccess {
                addr,
                size: T::SIZE,
            });
        }
        Ok(())
    }

    /// Loads a little-endian value.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] for unreadable pages and [`Error::MisalignedAccess`]
    /// for unaligned accesses when alignment checks are enabled.
    pub fn read<T: GuestIO>(&self, addr: u64) -> Result<T> {
        let addr = A::wrap(addr);
        self.check_alignment::<T>(addr)?;

        if let Some(arena) = &self.arena {
            if addr.wrapping_sub(RWREAD_BEGIN) < self.arena_read_boundary {
                return arena.read(addr);
            }
        }
        self.read_paging(addr)
    }

    fn read_paging<T: GuestIO>(&self, addr: u64) -> Result<T> {
        let pageno = page_number(addr);
        let offset = page_offset(addr);
        if offset + T::SIZE > PAGE_SIZE {
            return self.read_straddling(addr);
        }

        if let Some(slot) = self.rd_cache.get().lookup(pageno) {
            if let Some(page) = self.pages.slot(slot) {
                return page.read(offset);
            }
        }

        if let Some(slot) = self.pages.slot_of(pageno) {
            let Some(page) = self.pages.slot(slot) else {
                return Err(Error::ProtectionFault { addr });
            };
            if !page.attr.read {
                return Err(Error::ProtectionFault { addr });
            }
            if page.attr.cacheable {
                self.rd_cache.set(CachedPage::new(pageno, slot));
            } else if let Some(value) = page.trap(offset, TrapKind::Read, T::SIZE, 0) {
                return Ok(T::from_bits(value));
            }
            return page.read(offset);
        }

        let page = self.read_fault(pageno)?;
        if !page.attr.read {
            return Err(Error::ProtectionFault { addr });
        }
        page.read(offset)
    }

    fn read_straddling<T: GuestIO>(&self, addr: u64) -> Result<T> {
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().take(T::SIZE).enumerate() {
            *byte = self.read_paging::<u8>(A::wrap(addr.wrapping_add(i as u64)))?;
        }
        io::read_le(&bytes[..T::SIZE])
    }

    /// Stores a little-endian value.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] for pages that are neither writable nor
    /// copy-on-write, [`Error::OutOfMemory`] when a new page exceeds the budget and
    /// [`Error::MisalignedAccess`] when alignment checks are enabled.
    pub fn write<T: GuestIO>(&mut self, addr: u64, value: T) -> Result<()> {
        let addr = A::wrap(addr);
        self.check_alignment::<T>(addr)?;

        if let Some(arena) = &self.arena {
            if addr.wrapping_sub(self.arena_write_begin()) < self.arena_write_boundary {
                return arena.write(addr, value);
            }
        }
        self.write_paging(addr, value)
    }

    /// Stores a little-endian value through the page table, bypassing the arena fast path.
    ///
    /// # Errors
    /// See [`Memory::write`].
    pub fn write_paging<T: GuestIO>(&mut self, addr: u64, value: T) -> Result<()> {
        let addr = A::wrap(addr);
        self.check_alignment::<T>(addr)?;

        let pageno = page_number(addr);
        let offset = page_offset(addr);
        if offset + T::SIZE > PAGE_SIZE {
            let bytes = value.to_le_bytes();
            for (i, byte) in bytes.as_ref().iter().enumerate() {
                self.write_paging::<u8>(A::wrap(addr.wrapping_add(i as u64)), *byte)?;
            }
            return Ok(());
        }

        if let Some(slot) = self.wr_cache.lookup(pageno) {
            if let Some(page) = self.pages.slot_mut(slot) {
                return page.write(offset, value);
            }
        }

        let slot = self.writable_slot(pageno, addr, false)?;
        let Some(page) = self.pages.slot_mut(slot) else {
            return Err(Error::ProtectionFault { addr });
        };
        if page.attr.cacheable {
            self.wr_cache = CachedPage::new(pageno, slot);
        } else if page.has_trap() {
            page.trap(offset, TrapKind::Write, T::SIZE, value.to_bits());
            return Ok(());
        }
        page.write(offset, value)
    }

    /// Reads, transforms and writes back a value through the writable path.
    ///
    /// The page must be writable (or copy-on-write), but not necessarily readable.
    ///
    /// # Errors
    /// See [`Memory::write`].
    pub fn modify<T: GuestIO>(&mut self, addr: u64, f: impl FnOnce(T) -> T) -> Result<T> {
        let addr = A::wrap(addr);
        self.check_alignment::<T>(addr)?;
        let offset = page_offset(addr);
        if offset + T::SIZE > PAGE_SIZE {
            return Err(Error::MisalignedAccess {
                addr,
                size: T::SIZE,
            });
        }

        if let Some(arena) = &self.arena {
            if addr.wrapping_sub(self.arena_write_begin()) < self.arena_write_boundary {
                let value = f(arena.read(addr)?);
                arena.write(addr, value)?;
                return Ok(value);
            }
        }

        let slot = self.writable_slot(page_number(addr), addr, false)?;
        let Some(page) = self.pages.slot_mut(slot) else {
            return Err(Error::ProtectionFault { addr });
        };
        let value = f(page.read(offset)?);
        page.write(offset, value)?;
        Ok(value)
    }

    // ---------------------------------------------------------------------------------------
    // Page management
    // ---------------------------------------------------------------------------------------

    /// The page table.
    #[must_use]
    pub fn pages(&self) -> &PageTable {
        &self.pages
    }

    /// Number of pages in the page table.
    #[must_use]
    pub fn pages_active(&self) -> usize {
        self.pages.len()
    }

    /// Number of pages that own their buffer.
    #[must_use]
    pub fn owned_pages_active(&self) -> usize {
        self.pages.iter().filter(|(_, p)| !p.attr.non_owning).count()
    }

    /// Page budget derived from `memory_max`.
    #[must_use]
    pub fn pages_max(&self) -> u64 {
        self.pages_max
    }

    /// The page containing `addr`. See [`Memory::get_pageno`].
    ///
    /// # Errors
    /// Propagates errors of the read-fault handler.
    pub fn get_page(&self, addr: u64) -> Result<Cow<'_, Page>> {
        self.get_pageno(page_number(A::wrap(addr)))
    }

    /// The page at `pageno`, or the read-fault handler's page when it is missing.
    ///
    /// No permission is checked.
    ///
    /// # Errors
    /// Propagates errors of the read-fault handler.
    pub fn get_pageno(&self, pageno: u64) -> Result<Cow<'_, Page>> {
        match self.pages.get(pageno) {
            Some(page) => Ok(Cow::Borrowed(page)),
            None => self.read_fault(pageno).map(Cow::Owned),
        }
    }

    /// The page at `pageno`, which must exist and be executable.
    ///
    /// # Errors
    /// Returns [`Error::ExecutionSpaceProtectionFault`] otherwise.
    pub fn get_exec_pageno(&self, pageno: u64) -> Result<&Page> {
        match self.pages.get(pageno) {
            Some(page) if page.attr.exec => Ok(page),
            _ => Err(Error::ExecutionSpaceProtectionFault {
                addr: pageno << crate::address::PAGE_SHIFT,
            }),
        }
    }

    /// The page at `pageno`, which must be readable.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] otherwise.
    pub fn get_readable_pageno(&self, pageno: u64) -> Result<Cow<'_, Page>> {
        let page = self.get_pageno(pageno)?;
        if !page.attr.read {
            return Err(Error::ProtectionFault {
                addr: pageno << crate::address::PAGE_SHIFT,
            });
        }
        Ok(page)
    }

    /// The page at `pageno`, made writable.
    ///
    /// An existing writable page is returned as is. A copy-on-write page is passed to the
    /// page-write handler first. A missing page is created by the page-fault handler, which
    /// receives `init` as a hint that the caller overwrites the whole page.
    ///
    /// # Errors
    /// Returns [`Error::ProtectionFault`] for read-only and guard pages and
    /// [`Error::OutOfMemory`] when the page budget is exhausted.
    pub fn create_writable_pageno(&mut self, pageno: u64, init: bool) -> Result<&mut Page> {
        let addr = pageno << crate::address::PAGE_SHIFT;
        let slot = self.writable_slot(pageno, addr, init)?;
        self.pages
            .slot_mut(slot)
            .ok_or(Error::ProtectionFault { addr })
    }

    fn writable_slot(&mut self, pageno: u64, addr: u64, init: bool) -> Result<usize> {
        if let Some(slot) = self.pages.slot_of(pageno) {
            let handler = self.page_write_handler.clone();
            let Some(page) = self.pages.slot_mut(slot) else {
                return Err(Error::ProtectionFault { addr });
            };
            if page.attr.write {
                return Ok(slot);
            }
            if page.attr.is_cow {
                handler(pageno, page)?;
                self.invalidate_cache(pageno);
                return Ok(slot);
            }
            return Err(Error::ProtectionFault { addr });
        }

        let handler = self.page_fault_handler.clone();
        let page = handler(self, pageno, init)?;
        if !page.attr.write {
            return Err(Error::ProtectionFault { addr });
        }
        let slot = self.pages.insert(pageno, page);
        self.invalidate_cache(pageno);
        Ok(slot)
    }

    fn read_fault(&self, pageno: u64) -> Result<Page> {
        let handler = self.page_readf_handler.clone();
        handler(self, pageno)
    }

    /// The default page-fault policy: an arena window for page numbers inside the arena,
    /// a fresh zeroed page otherwise.
    ///
    /// With an arena, pages outside of it are limited to half the page budget.
    ///
    /// # Errors
    /// Returns [`Error::OutOfMemory`] when the page budget is exhausted.
    pub fn default_page_fault(&self, pageno: u64) -> Result<Page> {
        let budget = match &self.arena {
            Some(arena) => {
                if pageno < arena.pages() {
                    return Ok(Page::arena(PageAttributes::default(), arena.clone(), pageno));
                }
                self.pages_max / 2
            }
            None => self.pages_max,
        };

        let budget = usize::try_from(budget).unwrap_or(usize::MAX);
        if self.pages_active() < budget || self.owned_pages_active() < budget {
            return Ok(Page::new(PageAttributes::default()));
        }
        Err(Error::OutOfMemory {
            message: "Out of memory".to_string(),
            pages: budget as u64,
        })
    }

    /// The default read-fault policy: an arena window for page numbers inside the arena,
    /// the shared zero page otherwise.
    #[must_use]
    pub fn default_page_read(&self, pageno: u64) -> Page {
        match &self.arena {
            Some(arena) if pageno < arena.pages() => {
                Page::arena(PageAttributes::default(), arena.clone(), pageno)
            }
            _ => Page::cow_page().clone(),
        }
    }

    /// Sets the permissions of every page intersecting `[addr, addr + len)`.
    ///
    /// Missing pages are left alone when `attr` has default permissions and created
    /// otherwise.
    ///
    /// # Errors
    /// Returns [`Error::OutOfMemory`] if a page must be created beyond the budget.
    pub fn set_page_attr(&mut self, addr: u64, len: u64, attr: PageAttributes) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let last = addr
            .checked_add(len - 1)
            .ok_or(Error::ProtectionFault { addr })?;
        for pageno in page_number(addr)..=page_number(last) {
            self.set_pageno_attr(pageno, attr)?;
        }
        Ok(())
    }

    /// Sets the permissions of one page.
    ///
    /// # Errors
    /// See [`Memory::set_page_attr`].
    pub fn set_pageno_attr(&mut self, pageno: u64, attr: PageAttributes) -> Result<()> {
        if let Some(page) = self.pages.get_mut(pageno) {
            let trapped = page.has_trap();
            page.attr.apply_regular_attributes(attr);
            if trapped {
                page.attr.cacheable = false;
            }
        } else if !attr.is_default() {
            let handler = self.page_fault_handler.clone();
            let mut page = handler(self, pageno, false)?;
            page.attr.apply_regular_attributes(attr);
            self.pages.insert(pageno, page);
        }
        self.invalidate_cache(pageno);
        Ok(())
    }

    /// Installs a borrowed view of `shared` (usually a singleton) at `pageno`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidProgram`] if an owned page is already installed there.
    pub fn install_shared_page(&mut self, pageno: u64, shared: &Page) -> Result<&Page> {
        if let Some(existing) = self.pages.get(pageno) {
            if !existing.attr.non_owning && !existing.attr.is_cow {
                return Err(invalid_program!(
                    "There is already a page at the given page number",
                    pageno
                ));
            }
        }
        let slot = self.pages.insert(pageno, Page::loaned(shared));
        self.invalidate_cache(pageno);
        self.pages
            .slot(slot)
            .ok_or_else(|| invalid_program!("Shared page vanished", pageno))
    }

    /// Installs host buffers as borrowed pages starting at the page-aligned address `dst`.
    ///
    /// The buffers are never written in place; a store privatizes the page.
    ///
    /// # Errors
    /// Returns [`Error::InvalidProgram`] if `dst` is not page aligned.
    pub fn insert_non_owned_memory(
        &mut self,
        dst: u64,
        data: &[Arc<PageData>],
        attr: PageAttributes,
    ) -> Result<()> {
        if page_offset(dst) != 0 {
            return Err(invalid_program!("Unaligned non-owned memory", dst));
        }
        let first = page_number(dst);
        for (i, buffer) in data.iter().enumerate() {
            let pageno = first + i as u64;
            self.pages.insert(pageno, Page::borrowed(attr, buffer.clone()));
            self.invalidate_cache(pageno);
        }
        Ok(())
    }

    /// Frees the `len / 4096` pages starting at the page of `addr`.
    pub fn free_pages(&mut self, addr: u64, len: u64) {
        let first = page_number(addr);
        for pageno in first..first.saturating_add(len / PAGE_SIZE as u64) {
            self.free_pageno(pageno);
        }
    }

    /// Frees one page. Arena pages are zeroed, page 0 reverts to the guard page.
    pub fn free_pageno(&mut self, pageno: u64) {
        if let Some(page) = self.pages.remove(pageno) {
            if let PageStorage::Arena(arena, index) = page.storage() {
                arena.with_page_mut(*index, |bytes| bytes.fill(0));
            }
        }
        self.invalidate_cache(pageno);
        if pageno == 0 {
            self.pages.insert(0, Page::loaned(Page::guard_page()));
        }
    }

    /// Installs (or with `None` removes) an MMIO trap on the page containing `page_addr`.
    ///
    /// The page is created if missing. Trapped pages are never cached.
    ///
    /// # Errors
    /// Returns [`Error::OutOfMemory`] if the page must be created beyond the budget.
    pub fn trap(&mut self, page_addr: u64, trap: Option<PageTrap>) -> Result<()> {
        let pageno = page_number(A::wrap(page_addr));
        if !self.pages.contains(pageno) {
            let handler = self.page_fault_handler.clone();
            let page = handler(self, pageno, false)?;
            self.pages.insert(pageno, page);
        }
        if let Some(page) = self.pages.get_mut(pageno) {
            page.set_trap(trap);
        }
        self.invalidate_cache(pageno);
        Ok(())
    }

    /// A one-line description of the page containing `addr`.
    ///
    /// # Errors
    /// Propagates errors of the read-fault handler.
    pub fn get_page_info(&self, addr: u64) -> Result<String> {
        let page = self.get_page(addr)?;
        Ok(format!("[0x{:016X}] {}", A::wrap(addr), page.attr))
    }

    /// Replaces the page-fault handler, returning the previous one.
    pub fn set_page_fault_handler(&mut self, handler: PageFaultHandler<A>) -> PageFaultHandler<A> {
        std::mem::replace(&mut self.page_fault_handler, handler)
    }

    /// Replaces the read-fault handler, returning the previous one.
    pub fn set_page_readf_handler(&mut self, handler: PageReadHandler<A>) -> PageReadHandler<A> {
        self.invalidate_reset_cache();
        std::mem::replace(&mut self.page_readf_handler, handler)
    }

    /// Restores the default read-fault handler.
    pub fn reset_page_readf_handler(&mut self) {
        self.invalidate_reset_cache();
        self.page_readf_handler = default_page_read_handler();
    }

    /// Replaces the copy-on-write handler, returning the previous one.
    pub fn set_page_write_handler(&mut self, handler: PageWriteHandler) -> PageWriteHandler {
        std::mem::replace(&mut self.page_write_handler, handler)
    }

    /// Forgets cached lookups of `pageno`.
    pub fn invalidate_cache(&mut self, pageno: u64) {
        if self.rd_cache.get().holds(pageno) {
            self.rd_cache.set(CachedPage::EMPTY);
        }
        if self.wr_cache.holds(pageno) {
            self.wr_cache = CachedPage::EMPTY;
        }
    }

    /// Forgets all cached lookups.
    pub fn invalidate_reset_cache(&mut self) {
        self.rd_cache.set(CachedPage::EMPTY);
        self.wr_cache = CachedPage::EMPTY;
    }

    // ---------------------------------------------------------------------------------------
    // Arena
    // ---------------------------------------------------------------------------------------

    /// Returns `true` if the address space has a flat arena.
    #[must_use]
    pub fn uses_flat_memory_arena(&self) -> bool {
        self.arena.is_some()
    }

    /// The arena, if any.
    #[must_use]
    pub fn memory_arena(&self) -> Option<&Arc<FlatArena>> {
        self.arena.as_ref()
    }

    /// Size of the arena in bytes, zero without an arena.
    #[must_use]
    pub fn memory_arena_size(&self) -> u64 {
        self.arena.as_ref().map_or(0, |arena| arena.size())
    }

    /// Length of the arena read fast path starting at [`RWREAD_BEGIN`].
    #[must_use]
    pub fn memory_arena_read_boundary(&self) -> u64 {
        self.arena_read_boundary
    }

    /// Length of the arena write fast path starting at the end of read-only data.
    #[must_use]
    pub fn memory_arena_write_boundary(&self) -> u64 {
        self.arena_write_boundary
    }

    /// End of the read-only data at the start of the arena.
    #[must_use]
    pub fn initial_rodata_end(&self) -> u64 {
        self.initial_rodata_end
    }

    /// Moves the end of read-only data and recomputes the fast path boundaries.
    pub fn set_initial_rodata_end(&mut self, addr: u64) {
        self.initial_rodata_end = addr;
        self.recompute_arena_boundaries();
    }

    fn arena_write_begin(&self) -> u64 {
        self.initial_rodata_end.max(RWREAD_BEGIN)
    }

    fn recompute_arena_boundaries(&mut self) {
        let size = self.memory_arena_size();
        if size < self.initial_rodata_end {
            self.arena_read_boundary = 0;
            self.arena_write_boundary = 0;
            return;
        }
        self.arena_read_boundary = size.saturating_sub(RWREAD_BEGIN);
        self.arena_write_boundary = size.saturating_sub(self.arena_write_begin());
    }

    /// The arena, if `[addr, addr + len)` lies inside its read fast path.
    fn arena_readable(&self, addr: u64, len: usize) -> Option<&FlatArena> {
        let arena = self.arena.as_deref()?;
        let offset = addr.wrapping_sub(RWREAD_BEGIN);
        (offset < self.arena_read_boundary
            && offset.checked_add(len as u64)? <= self.arena_read_boundary)
            .then_some(arena)
    }

    /// The arena, if `[addr, addr + len)` lies inside its write fast path.
    fn arena_writable(&self, addr: u64, len: usize) -> Option<&FlatArena> {
        let arena = self.arena.as_deref()?;
        let offset = addr.wrapping_sub(self.arena_write_begin());
        (offset < self.arena_write_boundary
            && offset.checked_add(len as u64)? <= self.arena_write_boundary)
            .then_some(arena)
    }

    // ---------------------------------------------------------------------------------------
    // Execute segments
    // ---------------------------------------------------------------------------------------

    /// Returns `true` if segments are decoded with compressed instructions.
    #[must_use]
    pub fn compressed_enabled(&self) -> bool {
        self.compressed
    }

    /// The handler registry execute segments are decoded against.
    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry<A>> {
        &self.handlers
    }

    /// The shared segment registry, if sharing is enabled.
    #[must_use]
    pub fn shared_segments(&self) -> Option<&Arc<SharedExecuteSegments<A>>> {
        self.shared_segments.as_ref()
    }

    /// Decodes `data`, the code at `vaddr`, into a new execute segment.
    ///
    /// With shared segments an identical segment decoded by another machine is reused.
    /// The first segment created becomes the main segment.
    ///
    /// # Errors
    /// Returns [`Error::InvalidProgram`] for misaligned or bogus ranges, decode failures and
    /// when [`MAX_EXECUTE_SEGMENTS`] is exceeded.
    pub fn create_execute_segment(
        &mut self,
        data: &[u8],
        vaddr: u64,
        is_initial: bool,
        is_likely_jit: bool,
    ) -> Result<SegmentHandle<A>> {
        let mut exec = DecodedExecuteSegment::<A>::create(data, vaddr, self.compressed)?;
        exec.set_likely_jit(is_likely_jit);

        let use_main = self.main_exec.is_none();
        if !use_main && self.exec.len() >= MAX_EXECUTE_SEGMENTS {
            return Err(invalid_program!(
                "Max execute segments reached",
                MAX_EXECUTE_SEGMENTS
            ));
        }

        trace!(
            "Decoding {} execute segment {:#x}..{:#x}",
            if is_initial { "initial" } else { "runtime" },
            exec.exec_begin(),
            exec.exec_end()
        );

        let segment = match &self.shared_segments {
            Some(shared) => {
                let key = SegmentKey::from_segment(&exec, self.memory_arena_size());
                let registry = shared.registry().clone();
                shared.get_or_decode(key, move || {
                    generate_decoder_cache(&mut exec, &registry)?;
                    Ok(exec)
                })?
            }
            None => {
                generate_decoder_cache(&mut exec, &self.handlers)?;
                Arc::new(exec)
            }
        };

        if use_main {
            self.main_exec = Some(segment.clone());
        } else {
            self.exec.push(Some(segment.clone()));
        }
        Ok(segment)
    }

    /// The main execute segment.
    #[must_use]
    pub fn main_execute_segment(&self) -> Option<&SegmentHandle<A>> {
        self.main_exec.as_ref()
    }

    /// The execute segment containing `addr`, checking the main segment first.
    #[must_use]
    pub fn exec_segment_for(&self, addr: u64) -> Option<&SegmentHandle<A>> {
        let addr = A::wrap(addr);
        self.main_exec
            .iter()
            .chain(self.exec.iter().flatten())
            .find(|segment| segment.is_within(addr, 2))
    }

    /// Number of live execute segments, including the main segment.
    #[must_use]
    pub fn execute_segments_count(&self) -> usize {
        usize::from(self.main_exec.is_some()) + self.exec.iter().flatten().count()
    }

    fn release_segment(&self, segment: SegmentHandle<A>) {
        if let Some(shared) = &self.shared_segments {
            let key = SegmentKey::from_segment(&segment, self.memory_arena_size());
            drop(segment);
            shared.remove_if_unique(key);
        }
    }

    /// Drops every execute segment. Shared segments no other machine holds are released
    /// from the registry. Calling this again is a no-op.
    pub fn evict_execute_segments(&mut self) {
        if let Some(main) = self.main_exec.take() {
            self.release_segment(main);
        }
        while let Some(slot) = self.exec.pop() {
            if let Some(segment) = slot {
                self.release_segment(segment);
            }
        }
    }

    /// Drops one execute segment.
    ///
    /// The caller should not keep other handles to `segment`, or it stays registered.
    pub fn evict_execute_segment(&mut self, segment: SegmentHandle<A>) {
        if self
            .main_exec
            .as_ref()
            .is_some_and(|main| Arc::ptr_eq(main, &segment))
        {
            self.main_exec = None;
        } else if let Some(index) = self
            .exec
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, &segment)))
        {
            self.exec[index] = None;
            if index + 1 == self.exec.len() {
                self.exec.pop();
            }
        }
        self.release_segment(segment);
    }

    // ---------------------------------------------------------------------------------------
    // Well-known addresses
    // ---------------------------------------------------------------------------------------

    /// The loaded program, if any.
    #[must_use]
    pub fn program(&self) -> Option<&Arc<ProgramImage>> {
        self.image.as_ref()
    }

    /// Entry point of the loaded program.
    #[must_use]
    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    /// Sets the entry point.
    pub fn set_start_address(&mut self, addr: u64) {
        self.start_address = A::wrap(addr);
    }

    /// Initial stack pointer.
    #[must_use]
    pub fn stack_initial(&self) -> u64 {
        self.stack_address
    }

    /// Sets the initial stack pointer.
    pub fn set_stack_initial(&mut self, addr: u64) {
        self.stack_address = A::wrap(addr);
    }

    /// Return address used for guest function calls.
    #[must_use]
    pub fn exit_address(&self) -> u64 {
        self.exit_address
    }

    /// Sets the return address used for guest function calls.
    pub fn set_exit_address(&mut self, addr: u64) {
        self.exit_address = A::wrap(addr);
    }

    /// Start of the program break.
    #[must_use]
    pub fn heap_address(&self) -> u64 {
        self.heap_address
    }

    /// Sets the start of the program break.
    pub fn set_heap_address(&mut self, addr: u64) {
        self.heap_address = A::wrap(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::options;

    #[test]
    fn test_guard_page_at_zero() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        assert_eq!(memory.pages_active(), 1);
        assert_eq!(memory.owned_pages_active(), 0);
        assert!(matches!(
            memory.read::<u32>(0x10),
            Err(Error::ProtectionFault { addr: 0x10 })
        ));
        assert!(matches!(
            memory.write::<u32>(0xFFC, 1),
            Err(Error::ProtectionFault { addr: 0xFFC })
        ));
        assert!(memory.get_exec_pageno(0).is_err());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let result = Memory::<u64>::new(&options().with_memory_max(0));
        assert!(matches!(result, Err(Error::OutOfMemory { .. })));
    }

    #[test]
    fn test_read_of_missing_page_does_not_allocate() {
        let memory = Memory::<u64>::new(&options()).unwrap();
        assert_eq!(memory.read::<u64>(0x5000).unwrap(), 0);
        assert_eq!(memory.pages_active(), 1);
    }

    #[test]
    fn test_write_then_read() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory.write::<u64>(0x2008, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(memory.read::<u64>(0x2008).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(memory.read::<u16>(0x200E).unwrap(), 0x1122);
        assert_eq!(memory.read::<i8>(0x2008).unwrap(), -120);
        assert_eq!(memory.pages_active(), 2);
    }

    #[test]
    fn test_straddling_access() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory.write::<u32>(0x2FFE, 0xAABB_CCDD).unwrap();
        assert_eq!(memory.read::<u32>(0x2FFE).unwrap(), 0xAABB_CCDD);
        assert_eq!(memory.read::<u16>(0x3000).unwrap(), 0xAABB);
        assert_eq!(memory.pages_active(), 3);
    }

    #[test]
    fn test_alignment_check() {
        let mut memory = Memory::<u64>::new(&options().with_alignment_check(true)).unwrap();
        assert!(matches!(
            memory.write::<u32>(0x2002, 1),
            Err(Error::MisalignedAccess { addr: 0x2002, size: 4 })
        ));
        memory.write::<u32>(0x2004, 1).unwrap();
        assert!(memory.read::<u16>(0x2005).is_err());
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut memory = Memory::<u64>::new(&options().with_memory_max(4 * 4096)).unwrap();
        // The guard page counts as active but not as owned
        for page in 1..=4 {
            memory.write::<u8>(page * 4096, 1).unwrap();
        }
        assert!(matches!(
            memory.write::<u8>(0x10_0000, 1),
            Err(Error::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_read_only_page_rejects_writes() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory.write::<u32>(0x3000, 7).unwrap();
        memory
            .set_page_attr(0x3000, 4096, PageAttributes::read_only())
            .unwrap();
        assert!(matches!(
            memory.write::<u32>(0x3000, 8),
            Err(Error::ProtectionFault { addr: 0x3000 })
        ));
        assert_eq!(memory.read::<u32>(0x3000).unwrap(), 7);
    }

    #[test]
    fn test_cache_invalidated_on_attribute_change() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory.write::<u32>(0x3000, 7).unwrap();
        assert_eq!(memory.read::<u32>(0x3000).unwrap(), 7);
        memory
            .set_page_attr(0x3000, 1, PageAttributes::with_permissions(false, true, false))
            .unwrap();
        assert!(memory.read::<u32>(0x3000).is_err());
        memory.write::<u32>(0x3000, 9).unwrap();
    }

    #[test]
    fn test_set_attr_skips_missing_default_pages() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory
            .set_page_attr(0x10000, 8 * 4096, PageAttributes::default())
            .unwrap();
        assert_eq!(memory.pages_active(), 1);
        memory
            .set_page_attr(0x10000, 8 * 4096, PageAttributes::exec_only())
            .unwrap();
        assert_eq!(memory.pages_active(), 9);
    }

    #[test]
    fn test_install_shared_page_conflict() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory.write::<u8>(0x7000, 1).unwrap();
        assert!(matches!(
            memory.install_shared_page(7, Page::host_page()),
            Err(Error::InvalidProgram { .. })
        ));
        let page = memory.install_shared_page(8, Page::host_page()).unwrap();
        assert!(page.attr.exec);
        assert!(memory.get_exec_pageno(8).is_ok());
    }

    #[test]
    fn test_free_pages() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory.memset(0x4000, 0xAA, 3 * 4096).unwrap();
        assert_eq!(memory.pages_active(), 4);
        memory.free_pages(0x4000, 2 * 4096);
        assert_eq!(memory.pages_active(), 2);
        assert_eq!(memory.read::<u8>(0x4000).unwrap(), 0);
        assert_eq!(memory.read::<u8>(0x6000).unwrap(), 0xAA);

        memory.free_pageno(0);
        assert!(memory.read::<u8>(0).is_err());
    }

    #[test]
    fn test_non_owned_memory_privatized_on_write() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        let mut data = PageData::default();
        data.buffer[0] = 0x42;
        let shared = Arc::new(data);

        memory
            .insert_non_owned_memory(0x8000, &[shared.clone()], PageAttributes::default())
            .unwrap();
        assert_eq!(memory.read::<u8>(0x8000).unwrap(), 0x42);
        memory.write::<u8>(0x8000, 0x43).unwrap();
        assert_eq!(memory.read::<u8>(0x8000).unwrap(), 0x43);
        assert_eq!(shared.buffer[0], 0x42);

        assert!(memory
            .insert_non_owned_memory(0x8001, &[shared], PageAttributes::default())
            .is_err());
    }

    #[test]
    fn test_page_info() {
        let memory = Memory::<u64>::new(&options()).unwrap();
        assert_eq!(
            memory.get_page_info(0x10).unwrap(),
            "[0x0000000000000010] Readable: [ ]  Writable: [ ]  Executable: [ ]"
        );
    }

    #[test]
    fn test_custom_fault_handlers() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        let previous = memory.set_page_readf_handler(Arc::new(|_: &Memory<u64>, pageno| {
            let mut page = Page::new(PageAttributes::read_only());
            page.write::<u64>(0, pageno)?;
            Ok(page)
        }));
        assert_eq!(memory.read::<u64>(0x9000).unwrap(), 9);
        memory.set_page_readf_handler(previous);
        assert_eq!(memory.read::<u64>(0x9000).unwrap(), 0);

        memory.set_page_fault_handler(Arc::new(|_: &Memory<u64>, _, _| {
            Err(Error::OutOfMemory {
                message: "no pages".to_string(),
                pages: 0,
            })
        }));
        assert!(matches!(
            memory.write::<u8>(0x9000, 1),
            Err(Error::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_traps() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let mut memory = Memory::<u64>::new(&options()).unwrap();
        let stored = Arc::new(AtomicU64::new(0));
        let sink = stored.clone();
        memory
            .trap(
                0xA000,
                Some(Arc::new(move |_: &Page, event: TrapEvent| match event.kind {
                    TrapKind::Read => Some(0x1234),
                    TrapKind::Write => {
                        sink.store(event.value, Ordering::SeqCst);
                        None
                    }
                    TrapKind::Exec => None,
                })),
            )
            .unwrap();

        assert_eq!(memory.read::<u32>(0xA010).unwrap(), 0x1234);
        memory.write::<u16>(0xA020, 0xBEEF).unwrap();
        assert_eq!(stored.load(Ordering::SeqCst), 0xBEEF);
        // The store was consumed by the trap
        memory.trap(0xA000, None).unwrap();
        assert_eq!(memory.read::<u16>(0xA020).unwrap(), 0);
    }

    #[test]
    fn test_modify() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory.write::<u32>(0x2000, 41).unwrap();
        assert_eq!(memory.modify::<u32>(0x2000, |v| v + 1).unwrap(), 42);
        assert_eq!(memory.read::<u32>(0x2000).unwrap(), 42);
    }

    #[test]
    fn test_rv32_wraps_addresses() {
        let mut memory = Memory::<u32>::new(&options()).unwrap();
        memory.write::<u32>(0x1_0000_2000, 5).unwrap();
        assert_eq!(memory.read::<u32>(0x2000).unwrap(), 5);
    }

    #[test]
    fn test_arena_fast_path() {
        let mut memory = Memory::<u64>::new(&options().with_memory_arena(true)).unwrap();
        assert!(memory.uses_flat_memory_arena());
        let size = memory.memory_arena_size();
        assert_eq!(size, 64 << 20);
        assert_eq!(memory.memory_arena_read_boundary(), size - RWREAD_BEGIN);
        assert_eq!(memory.memory_arena_write_boundary(), size - RWREAD_BEGIN);

        memory.write::<u64>(0x1000, 99).unwrap();
        assert_eq!(memory.read::<u64>(0x1000).unwrap(), 99);
        // The arena is not tracked by the page table
        assert_eq!(memory.pages_active(), 1);
        // Page 0 is still guarded
        assert!(memory.read::<u8>(0x0).is_err());

        memory.set_initial_rodata_end(0x3000);
        assert_eq!(memory.memory_arena_write_boundary(), size - 0x3000);
        assert_eq!(memory.memory_arena_read_boundary(), size - RWREAD_BEGIN);
    }

    #[test]
    fn test_execute_segment_slots() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        // addi a0, a0, 1 ; ret
        let code = [0x13, 0x05, 0x15, 0x00, 0x67, 0x80, 0x00, 0x00];
        let main = memory.create_execute_segment(&code, 0x1000, true, false).unwrap();
        assert!(Arc::ptr_eq(memory.main_execute_segment().unwrap(), &main));

        for i in 0..MAX_EXECUTE_SEGMENTS as u64 {
            memory
                .create_execute_segment(&code, 0x10_0000 + i * 0x1000, false, true)
                .unwrap();
        }
        assert_eq!(memory.execute_segments_count(), MAX_EXECUTE_SEGMENTS + 1);
        assert!(matches!(
            memory.create_execute_segment(&code, 0x90_0000, false, false),
            Err(Error::InvalidProgram { .. })
        ));

        let found = memory.exec_segment_for(0x10_1004).unwrap();
        assert_eq!(found.exec_begin(), 0x10_1000);
        assert!(found.is_likely_jit());
        assert!(memory.exec_segment_for(0x5000).is_none());

        let last = memory.exec_segment_for(0x10_F000).unwrap().clone();
        memory.evict_execute_segment(last);
        assert_eq!(memory.execute_segments_count(), MAX_EXECUTE_SEGMENTS);

        memory.evict_execute_segments();
        memory.evict_execute_segments();
        assert_eq!(memory.execute_segments_count(), 0);
    }

    #[test]
    fn test_shared_mode_mismatch() {
        let shared = Arc::new(SharedExecuteSegments::<u64>::new(true));
        let mut options = options().with_shared_segments(shared);
        options.compressed_instructions = false;
        assert!(matches!(
            Memory::new(&options),
            Err(Error::InvalidProgram { .. })
        ));
    }

    #[test]
    fn test_fork_minimal() {
        let mut master = Memory::<u64>::new(&options()).unwrap();
        master.write::<u32>(0x2000, 1).unwrap();
        let fork = Memory::fork(&master, &options().with_minimal_fork(true)).unwrap();
        assert_eq!(fork.pages_active(), 1);
        assert_eq!(fork.read::<u32>(0x2000).unwrap(), 0);
        assert!(fork.read::<u32>(0x10).is_err());
    }

    #[test]
    fn test_fork_skips_dont_fork_pages() {
        let mut master = Memory::<u64>::new(&options()).unwrap();
        master.write::<u32>(0x2000, 1).unwrap();
        master.write::<u32>(0x3000, 2).unwrap();
        master
            .set_pageno_attr(
                3,
                PageAttributes {
                    dont_fork: true,
                    ..PageAttributes::default()
                },
            )
            .unwrap();
        let fork = Memory::fork(&master, &options()).unwrap();
        assert_eq!(fork.read::<u32>(0x2000).unwrap(), 1);
        assert_eq!(fork.read::<u32>(0x3000).unwrap(), 0);
        assert_eq!(fork.owned_pages_active(), 0);
    }
}
