//! A bump allocator for anonymous guest mappings.
//!
//! The mmap area starts [`BRK_MAX`] bytes above the heap start and grows upwards. Only the
//! most recent allocation can shrink or be returned; everything else is just unmapped.

use tracing::trace;

use crate::{
    address::{page_round_up, Address, PAGE_MASK},
    memory::{Memory, BRK_MAX},
    Error, Result,
};

impl<A: Address> Memory<A> {
    /// First address of the mmap area.
    #[must_use]
    pub fn mmap_start(&self) -> u64 {
        A::wrap(self.heap_address.wrapping_add(BRK_MAX))
    }

    /// The next address [`Memory::mmap_allocate`] hands out.
    #[must_use]
    pub fn mmap_address(&self) -> u64 {
        self.mmap_address
    }

    /// Moves the mmap bump pointer.
    pub fn set_mmap_address(&mut self, addr: u64) {
        self.mmap_address = A::wrap(addr);
    }

    /// Reserves `bytes` (rounded up to whole pages) and returns the start of the range.
    ///
    /// # Errors
    /// Returns [`Error::OutOfMemory`] if the range would leave the address space.
    pub fn mmap_allocate(&mut self, bytes: u64) -> Result<u64> {
        let result = self.mmap_address;
        let size = page_round_up(bytes).ok_or_else(|| Error::OutOfMemory {
            message: "mmap allocation too large".to_string(),
            pages: 0,
        })?;
        let next = result
            .checked_add(size)
            .filter(|next| A::wrap(*next) == *next)
            .ok_or_else(|| Error::OutOfMemory {
                message: "mmap area exhausted".to_string(),
                pages: 0,
            })?;

        trace!("mmap_allocate({bytes:#x}) -> {result:#x}");
        self.mmap_address = next;
        Ok(result)
    }

    /// Shrinks the most recent allocation at `addr` from `size` to `new_size` bytes.
    ///
    /// Returns `false` if `addr` was not the most recent allocation.
    pub fn mmap_relax(&mut self, addr: u64, size: u64, new_size: u64) -> bool {
        let (Some(size), Some(new_size)) = (page_round_up(size), page_round_up(new_size)) else {
            return false;
        };
        if new_size > size || addr.checked_add(size) != Some(self.mmap_address) {
            return false;
        }
        self.free_pages(addr + new_size, size - new_size);
        self.mmap_address = addr + new_size;
        true
    }

    /// Frees `[addr, addr + size)` and retracts the bump pointer when the range ends at it.
    ///
    /// Returns `true` if the bump pointer moved.
    pub fn mmap_unmap(&mut self, addr: u64, size: u64) -> bool {
        let addr = A::wrap(addr) & !PAGE_MASK;
        let Some(size) = page_round_up(size) else {
            return false;
        };
        self.free_pages(addr, size);

        let retract = addr.checked_add(size) == Some(self.mmap_address)
            && addr >= self.mmap_start();
        if retract {
            self.mmap_address = addr;
        }
        retract
    }
}
