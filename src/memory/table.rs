//! The page table of a [`crate::memory::Memory`].
//!
//! Pages live in a slab of slots indexed by a page-number map. Slot indices stay stable for as
//! long as a page exists, which lets [`crate::memory::cache::CachedPage`] remember a slot
//! instead of a reference. Freed slots are recycled, so any cache entry must be invalidated
//! when a page is removed.

use std::collections::HashMap;

use crate::memory::page::Page;

/// Page number to page mapping with stable slot indices.
#[derive(Debug, Default, Clone)]
pub struct PageTable {
    index: HashMap<u64, usize>,
    slots: Vec<Option<(u64, Page)>>,
    free: Vec<usize>,
}

impl PageTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        PageTable::default()
    }

    /// Creates an empty table with room for `capacity` pages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        PageTable {
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
        }
    }

    /// Number of pages in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if the table holds no pages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The slot of `pageno`, if present.
    #[must_use]
    pub fn slot_of(&self, pageno: u64) -> Option<usize> {
        self.index.get(&pageno).copied()
    }

    /// Returns `true` if `pageno` is present.
    #[must_use]
    pub fn contains(&self, pageno: u64) -> bool {
        self.index.contains_key(&pageno)
    }

    /// The page of `pageno`, if present.
    #[must_use]
    pub fn get(&self, pageno: u64) -> Option<&Page> {
        self.slot_of(pageno).and_then(|slot| self.slot(slot))
    }

    /// The page of `pageno` for modification, if present.
    pub fn get_mut(&mut self, pageno: u64) -> Option<&mut Page> {
        let slot = self.slot_of(pageno)?;
        self.slot_mut(slot)
    }

    /// The page stored in `slot`.
    #[must_use]
    pub fn slot(&self, slot: usize) -> Option<&Page> {
        self.slots.get(slot)?.as_ref().map(|(_, page)| page)
    }

    /// The page stored in `slot` for modification.
    pub fn slot_mut(&mut self, slot: usize) -> Option<&mut Page> {
        self.slots.get_mut(slot)?.as_mut().map(|(_, page)| page)
    }

    /// Inserts or replaces the page of `pageno`, returning its slot.
    ///
    /// Replacing keeps the slot of the previous page.
    pub fn insert(&mut self, pageno: u64, page: Page) -> usize {
        if let Some(slot) = self.slot_of(pageno) {
            self.slots[slot] = Some((pageno, page));
            return slot;
        }

        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot] = Some((pageno, page));
            slot
        } else {
            self.slots.push(Some((pageno, page)));
            self.slots.len() - 1
        };
        self.index.insert(pageno, slot);
        slot
    }

    /// Removes the page of `pageno`.
    pub fn remove(&mut self, pageno: u64) -> Option<Page> {
        let slot = self.index.remove(&pageno)?;
        let (_, page) = self.slots[slot].take()?;
        self.free.push(slot);
        Some(page)
    }

    /// Removes every page.
    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
    }

    /// Iterates over `(pageno, page)` in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Page)> {
        self.slots
            .iter()
            .filter_map(|entry| entry.as_ref().map(|(pageno, page)| (*pageno, page)))
    }

    /// Iterates mutably over `(pageno, page)` in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut Page)> {
        self.slots
            .iter_mut()
            .filter_map(|entry| entry.as_mut().map(|(pageno, page)| (*pageno, page)))
    }

    /// The page numbers present, sorted ascending.
    #[must_use]
    pub fn sorted_pagenos(&self) -> Vec<u64> {
        let mut pagenos: Vec<u64> = self.index.keys().copied().collect();
        pagenos.sort_unstable();
        pagenos
    }
}
