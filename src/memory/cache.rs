//! Single-entry page memo for the hot read and write paths.

/// The last page resolved by a read or write, identified by page number and table slot.
///
/// Only cacheable pages are ever memoized. An entry must be reset whenever its page is replaced
/// or removed, because the slot may be recycled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedPage {
    /// The memoized page number, or `u64::MAX` when empty
    pub pageno: u64,
    /// The table slot of the memoized page
    pub slot: usize,
}

impl Default for CachedPage {
    fn default() -> Self {
        CachedPage::EMPTY
    }
}

impl CachedPage {
    /// The empty entry. No page number matches it.
    pub const EMPTY: CachedPage = CachedPage {
        pageno: u64::MAX,
        slot: 0,
    };

    /// Creates an entry for `pageno` stored in `slot`.
    #[must_use]
    pub const fn new(pageno: u64, slot: usize) -> Self {
        CachedPage { pageno, slot }
    }

    /// The slot of `pageno` if it is the memoized page.
    #[inline]
    #[must_use]
    pub fn lookup(&self, pageno: u64) -> Option<usize> {
        (self.pageno == pageno).then_some(self.slot)
    }

    /// Returns `true` if the entry refers to `pageno`.
    #[must_use]
    pub fn holds(&self, pageno: u64) -> bool {
        self.pageno == pageno
    }
}
