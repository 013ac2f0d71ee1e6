//! Program loading and symbol lookup.
//!
//! [`Memory::load_program`] validates the loadable segments of a [`ProgramImage`], copies
//! them into pages with their permissions, lays out heap, mmap area and stack, installs the
//! exit trampoline and decodes one initial execute segment per executable segment.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::{
    address::{page_number, page_round_up, Address, PAGE_SIZE},
    config::MachineOptions,
    memory::{
        elf::{LoadSegment, ProgramImage, SegmentFlags, Symbol},
        page::{Page, PageAttributes},
        Memory, BRK_MAX,
    },
    Result,
};

/// Upper bound (exclusive) on the number of loadable segments of a program.
pub const MAX_PROGRAM_HEADERS: usize = 16;

/// The function symbol covering (or preceding) an address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Callsite {
    /// Symbol name
    pub name: String,
    /// Address of the symbol
    pub address: u64,
    /// Distance from the symbol to the looked up address
    pub offset: u64,
    /// Size of the symbol
    pub size: u64,
}

impl<A: Address> Memory<A> {
    /// Loads `image` into this address space.
    ///
    /// Validates and copies every loadable segment, applies its permissions and derives the
    /// heap, mmap, stack and exit addresses. Executable segments are decoded into initial
    /// execute segments; the first becomes the main segment.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidProgram`] for rejected segment layouts and
    /// permissions, and propagates page budget and decode errors.
    pub fn load_program(
        &mut self,
        image: Arc<ProgramImage>,
        options: &MachineOptions<A>,
    ) -> Result<()> {
        let segments = &image.segments;
        if segments.is_empty() {
            return Err(invalid_program!("ELF with no program-headers"));
        }
        if segments.len() >= MAX_PROGRAM_HEADERS {
            return Err(invalid_program!(
                "ELF with too many program-headers",
                segments.len()
            ));
        }
        for (i, segment) in segments.iter().enumerate() {
            for previous in &segments[..i] {
                if previous.vaddr < segment.vaddr.wrapping_add(segment.filesz)
                    && previous.vaddr.wrapping_add(previous.filesz) > segment.vaddr
                {
                    return Err(invalid_program!("Overlapping ELF segments", segment.vaddr));
                }
            }
        }
        if image.is_dynamic {
            warn!(
                "Loading position independent program at its link address {:#x}",
                image.entry
            );
        }

        if !self.pages.contains(0) {
            self.install_shared_page(0, Page::guard_page())?;
        }
        self.start_address = A::wrap(image.entry);
        self.heap_address = 0;

        for segment in segments {
            if options.load_program {
                self.load_segment(&image, segment, options)?;
            }
            let end = A::wrap(segment.vaddr.wrapping_add(segment.memsz));
            let end = page_round_up(end).map_or(end, A::wrap);
            if self.heap_address < end {
                self.heap_address = end;
            }
        }

        self.mmap_address = self.mmap_start();
        self.stack_address = A::wrap(self.mmap_allocate(options.stack_size)? + options.stack_size);

        self.exit_address = match image.symbol_by_name(&options.default_exit_function) {
            Some(symbol) if symbol.value != 0 && !options.default_exit_function.is_empty() => {
                debug!("Using program-provided exit function at {:#x}", symbol.value);
                A::wrap(symbol.value)
            }
            _ => {
                let host = self.mmap_allocate(PAGE_SIZE as u64)?;
                self.install_shared_page(page_number(host), Page::host_page())?;
                host
            }
        };

        self.recompute_arena_boundaries();
        self.image = Some(image.clone());

        if options.load_program {
            for segment in segments.iter().filter(|s| s.is_exec()) {
                self.decode_program_segment(&image, segment, options)?;
            }
        }

        debug!(
            "Loaded program: entry {:#x}, heap {:#x}, stack {:#x}, exit {:#x}",
            self.start_address, self.heap_address, self.stack_address, self.exit_address
        );
        Ok(())
    }

    fn load_segment(
        &mut self,
        image: &ProgramImage,
        segment: &LoadSegment,
        options: &MachineOptions<A>,
    ) -> Result<()> {
        let data = image.segment_data(segment)?;
        let vaddr = A::wrap(segment.vaddr);
        let len = data.len() as u64;
        if A::wrap(vaddr.wrapping_add(len)) < vaddr {
            return Err(invalid_program!("Bogus ELF segment virtual base", vaddr));
        }
        if len == 0 {
            return Ok(());
        }

        let read = segment.flags.contains(SegmentFlags::READ);
        let write = segment.flags.contains(SegmentFlags::WRITE);
        let exec = segment.flags.contains(SegmentFlags::EXEC);
        trace!(
            "Loading segment {:#x}..{:#x} [{}{}{}]",
            vaddr,
            vaddr + len,
            if read { 'r' } else { '-' },
            if write { 'w' } else { '-' },
            if exec { 'x' } else { '-' }
        );

        if read && !write && self.uses_flat_memory_arena() {
            let rodata_end = self.initial_rodata_end.max(vaddr + len);
            self.set_initial_rodata_end(rodata_end);
        }
        if exec && !read {
            return Ok(());
        }
        if exec && write && !options.allow_write_exec_segment {
            return Err(invalid_program!(
                "Insecure ELF has writable executable code (Disable check in MachineOptions)",
                vaddr
            ));
        }
        if exec && (read || write) && options.enforce_exec_only {
            return Err(invalid_program!(
                "Execute segment must be execute-only",
                vaddr
            ));
        }

        self.memcpy(vaddr, data)?;

        let attr = if options.protect_segments {
            PageAttributes::with_permissions(read, write, exec)
        } else {
            PageAttributes::with_permissions(true, true, true)
        };
        self.set_page_attr(vaddr, len, attr)
    }

    fn decode_program_segment(
        &mut self,
        image: &ProgramImage,
        segment: &LoadSegment,
        options: &MachineOptions<A>,
    ) -> Result<()> {
        let mut data = image.segment_data(segment)?;
        let mut vaddr = A::wrap(segment.vaddr);

        if !options.ignore_text_section {
            if let Some(text) = image.section_by_name(".text") {
                let exlen = data.len() as u64;
                let inside = text.addr >= vaddr
                    && text.size <= exlen
                    && text.addr.saturating_add(text.size) <= vaddr.saturating_add(exlen);
                if inside {
                    data = image.section_data(text)?;
                    vaddr = A::wrap(text.addr);
                }
            }
        }

        let exec_segment = self.create_execute_segment(data, vaddr, true, false)?;
        exec_segment.set_execute_only(
            !segment
                .flags
                .intersects(SegmentFlags::READ | SegmentFlags::WRITE),
        );
        Ok(())
    }

    /// The address of the symbol called `name`.
    #[must_use]
    pub fn resolve_address(&self, name: &str) -> Option<u64> {
        let symbol = self.image.as_ref()?.symbol_by_name(name)?;
        Some(A::wrap(symbol.value))
    }

    /// The address of the section called `name`.
    #[must_use]
    pub fn resolve_section(&self, name: &str) -> Option<u64> {
        let section = self.image.as_ref()?.section_by_name(name)?;
        Some(A::wrap(section.addr))
    }

    /// The function symbol containing `addr`, else the closest function symbol below it.
    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<Callsite> {
        let image = self.image.as_ref()?;
        let addr = A::wrap(addr);
        if addr == 0 {
            return None;
        }

        let callsite = |symbol: &Symbol| Callsite {
            name: symbol.name.clone(),
            address: symbol.value,
            offset: addr - symbol.value,
            size: symbol.size,
        };

        let mut best: Option<&Symbol> = None;
        for symbol in image.symbols.iter().filter(|s| s.is_function) {
            if addr < symbol.value {
                continue;
            }
            if addr < symbol.value.saturating_add(symbol.size) {
                return Some(callsite(symbol));
            }
            if best.is_none_or(|b| symbol.value > b.value) {
                best = Some(symbol);
            }
        }
        best.map(callsite)
    }

    /// Formats one backtrace frame per address: `pc`, then `ra` when given.
    ///
    /// Frames are numbered when `ra` is given. Unknown addresses produce an empty line.
    #[must_use]
    pub fn backtrace(&self, pc: u64, ra: Option<u64>) -> Vec<String> {
        let frame = |index: Option<usize>, addr: u64| {
            let Some(site) = self.lookup(addr) else {
                return String::new();
            };
            let prefix = index.map(|n| format!("[{n}] ")).unwrap_or_default();
            if A::is_64() {
                format!(
                    "{prefix}0x{:016X} + 0x{:03x}: {}",
                    site.address, site.offset, site.name
                )
            } else {
                format!(
                    "{prefix}0x{:08x} + 0x{:03x}: {}",
                    site.address, site.offset, site.name
                )
            }
        };

        match ra {
            Some(ra) => vec![frame(Some(0), pc), frame(Some(1), ra)],
            None => vec![frame(None, pc)],
        }
    }
}
