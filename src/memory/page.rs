//! The page unit of guest memory.
//!
//! A [`Page`] is a set of [`PageAttributes`] plus a handle to 4 KiB of data. The handle carries
//! its ownership state explicitly through [`PageStorage`]:
//!
//! - **Owned** - the page's private buffer. Forks may hold additional references to it, in
//!   which case the first write transparently clones the buffer (`Arc::make_mut`), so neither
//!   side ever observes the other's writes.
//! - **Borrowed** - a loan of another page's buffer or of a process-wide singleton. A borrowed
//!   buffer is never written in place and its lifetime is guaranteed by reference counting, so
//!   the page a fork borrowed from can never be freed underneath it.
//! - **Arena** - a window into the machine's [`FlatArena`]. The arena outlives every page that
//!   refers to it because each such page holds a reference to it.
//!
//! # Singletons
//!
//! [`Page::cow_page`], [`Page::guard_page`] and [`Page::host_page`] are process-wide pages
//! that are installed by loan. The copy-on-write and guard pages share one zeroed buffer.

use std::{
    fmt,
    sync::{Arc, LazyLock},
};

use crate::{address::PAGE_SIZE, memory::arena::FlatArena, utils::io, utils::GuestIO, Result};

/// `STOP` (`0x7ff00073`) followed by `JAL x0, -4` (`0xffdff06f`)
const HOST_PAGE_CODE: [u8; 8] = [0x73, 0x00, 0xf0, 0x7f, 0x6f, 0xf0, 0xdf, 0xff];

static ZERO_DATA: LazyLock<Arc<PageData>> = LazyLock::new(|| Arc::new(PageData::default()));

static COW_PAGE: LazyLock<Page> = LazyLock::new(|| {
    Page::borrowed(
        PageAttributes {
            read: true,
            write: false,
            exec: false,
            is_cow: true,
            non_owning: true,
            ..PageAttributes::default()
        },
        ZERO_DATA.clone(),
    )
});

static GUARD_PAGE: LazyLock<Page> = LazyLock::new(|| {
    Page::borrowed(
        PageAttributes {
            read: false,
            write: false,
            exec: false,
            non_owning: true,
            ..PageAttributes::default()
        },
        ZERO_DATA.clone(),
    )
});

static HOST_PAGE: LazyLock<Page> = LazyLock::new(|| {
    let mut data = PageData::default();
    data.buffer[..HOST_PAGE_CODE.len()].copy_from_slice(&HOST_PAGE_CODE);
    Page::borrowed(
        PageAttributes {
            read: false,
            write: false,
            exec: true,
            non_owning: true,
            ..PageAttributes::default()
        },
        Arc::new(data),
    )
});

/// Permission and bookkeeping flags of a page.
///
/// The default is a readable, writable, cacheable page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageAttributes {
    /// Loads are permitted
    pub read: bool,
    /// Stores are permitted
    pub write: bool,
    /// Instruction fetches are permitted
    pub exec: bool,
    /// The page is shared and must be copied before the first write
    pub is_cow: bool,
    /// The page does not own its buffer
    pub non_owning: bool,
    /// The page is not inherited by forks
    pub dont_fork: bool,
    /// The page may be memoized by the read/write caches. Always `false` while a trap is
    /// installed.
    pub cacheable: bool,
    /// Free for use by the embedder
    pub user_defined: u8,
}

impl Default for PageAttributes {
    fn default() -> Self {
        PageAttributes {
            read: true,
            write: true,
            exec: false,
            is_cow: false,
            non_owning: false,
            dont_fork: false,
            cacheable: true,
            user_defined: 0,
        }
    }
}

impl PageAttributes {
    /// Read-only attributes.
    #[must_use]
    pub fn read_only() -> Self {
        PageAttributes {
            write: false,
            ..PageAttributes::default()
        }
    }

    /// Execute-only attributes.
    #[must_use]
    pub fn exec_only() -> Self {
        PageAttributes {
            read: false,
            write: false,
            exec: true,
            ..PageAttributes::default()
        }
    }

    /// Attributes built from plain read/write/execute permissions.
    #[must_use]
    pub fn with_permissions(read: bool, write: bool, exec: bool) -> Self {
        PageAttributes {
            read,
            write,
            exec,
            ..PageAttributes::default()
        }
    }

    /// Returns `true` when the read, write and execute permissions match the defaults.
    ///
    /// Bookkeeping flags are ignored: a missing page with default permissions does not need to
    /// be materialized to carry them.
    #[must_use]
    pub fn is_default(&self) -> bool {
        let def = PageAttributes::default();
        self.read == def.read && self.write == def.write && self.exec == def.exec
    }

    /// Copies every attribute from `other` except `non_owning`, which describes this page's
    /// buffer and cannot be changed by retagging permissions.
    pub fn apply_regular_attributes(&mut self, other: PageAttributes) {
        let non_owning = self.non_owning;
        *self = other;
        self.non_owning = non_owning;
    }

    /// The permissions as a `PROT_*` style bit mask (`r | w << 1 | x << 2`).
    #[must_use]
    pub fn to_prot(&self) -> u32 {
        u32::from(self.read) | (u32::from(self.write) << 1) | (u32::from(self.exec) << 2)
    }
}

impl fmt::Display for PageAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |set: bool| if set { 'x' } else { ' ' };
        write!(
            f,
            "Readable: [{}]  Writable: [{}]  Executable: [{}]",
            mark(self.read),
            mark(self.write),
            mark(self.exec)
        )
    }
}

/// One page worth of guest bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct PageData {
    /// The raw page contents
    pub buffer: [u8; PAGE_SIZE],
}

impl Default for PageData {
    fn default() -> Self {
        PageData {
            buffer: [0; PAGE_SIZE],
        }
    }
}

impl fmt::Debug for PageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageData")
            .field("nonzero", &self.buffer.iter().filter(|b| **b != 0).count())
            .finish()
    }
}

/// The kind of access that invoked a page trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    /// A load from the page
    Read,
    /// A store to the page
    Write,
    /// An instruction fetch from the page
    Exec,
}

/// The access reported to a page trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapEvent {
    /// Offset of the access inside the page
    pub offset: usize,
    /// The kind of access
    pub kind: TrapKind,
    /// Width of the access in bytes (zero for fetches)
    pub size: usize,
    /// The stored value for writes, the fetch address for execution, zero for reads
    pub value: u64,
}

/// An MMIO callback attached to a page.
///
/// The return value depends on the [`TrapKind`]:
/// - `Read` - `Some(value)` replaces the loaded value, `None` loads from the page buffer
/// - `Write` - ignored; the store is always consumed by the trap
/// - `Exec` - `Some(pc)` redirects execution to `pc`
pub type PageTrap = Arc<dyn Fn(&Page, TrapEvent) -> Option<u64> + Send + Sync>;

/// The ownership state of a page's buffer.
#[derive(Clone)]
pub enum PageStorage {
    /// A buffer private to this page (possibly still referenced by forks)
    Owned(Arc<PageData>),
    /// A loaned buffer that must never be written in place
    Borrowed(Arc<PageData>),
    /// The page at the given index of a flat arena
    Arena(Arc<FlatArena>, u64),
}

impl fmt::Debug for PageStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageStorage::Owned(_) => write!(f, "Owned"),
            PageStorage::Borrowed(_) => write!(f, "Borrowed"),
            PageStorage::Arena(_, index) => write!(f, "Arena({index})"),
        }
    }
}

/// A page of guest memory.
#[derive(Clone)]
pub struct Page {
    /// Permissions and bookkeeping flags
    pub attr: PageAttributes,
    storage: PageStorage,
    trap: Option<PageTrap>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("attr", &self.attr)
            .field("storage", &self.storage)
            .field("trap", &self.trap.is_some())
            .finish()
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.attr)
    }
}

impl Page {
    /// Creates a zero-filled page that owns its buffer.
    #[must_use]
    pub fn new(attr: PageAttributes) -> Self {
        Page::owned(attr, Arc::new(PageData::default()))
    }

    /// Creates a page owning `data`.
    #[must_use]
    pub fn owned(attr: PageAttributes, data: Arc<PageData>) -> Self {
        Page {
            attr,
            storage: PageStorage::Owned(data),
            trap: None,
        }
    }

    /// Creates a page borrowing `data`. The page is marked `non_owning`.
    #[must_use]
    pub fn borrowed(mut attr: PageAttributes, data: Arc<PageData>) -> Self {
        attr.non_owning = true;
        Page {
            attr,
            storage: PageStorage::Borrowed(data),
            trap: None,
        }
    }

    /// Creates a page backed by page `index` of `arena`. The page is marked `non_owning`.
    #[must_use]
    pub fn arena(mut attr: PageAttributes, arena: Arc<FlatArena>, index: u64) -> Self {
        attr.non_owning = true;
        Page {
            attr,
            storage: PageStorage::Arena(arena, index),
            trap: None,
        }
    }

    /// The shared read-only zero page used for untouched copy-on-write memory.
    #[must_use]
    pub fn cow_page() -> &'static Page {
        &COW_PAGE
    }

    /// The shared inaccessible page.
    #[must_use]
    pub fn guard_page() -> &'static Page {
        &GUARD_PAGE
    }

    /// The shared execute-only page holding a `STOP` trampoline, used as a synthetic return
    /// address.
    #[must_use]
    pub fn host_page() -> &'static Page {
        &HOST_PAGE
    }

    /// The ownership state of the buffer.
    #[must_use]
    pub fn storage(&self) -> &PageStorage {
        &self.storage
    }

    /// Returns `true` if the page owns its buffer.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        matches!(self.storage, PageStorage::Owned(_))
    }

    /// Returns `true` if the buffer is the process-wide zero buffer.
    #[must_use]
    pub fn is_cow_page(&self) -> bool {
        match &self.storage {
            PageStorage::Owned(data) | PageStorage::Borrowed(data) => {
                Arc::ptr_eq(data, &ZERO_DATA)
            }
            PageStorage::Arena(..) => false,
        }
    }

    /// Returns `true` if this page shares its buffer with `other`.
    #[must_use]
    pub fn shares_data_with(&self, other: &Page) -> bool {
        match (&self.storage, &other.storage) {
            (
                PageStorage::Owned(a) | PageStorage::Borrowed(a),
                PageStorage::Owned(b) | PageStorage::Borrowed(b),
            ) => Arc::ptr_eq(a, b),
            (PageStorage::Arena(a, i), PageStorage::Arena(b, j)) => Arc::ptr_eq(a, b) && i == j,
            _ => false,
        }
    }

    /// Converts the page into a private, writable copy of its current contents.
    ///
    /// This is the copy-on-write fault response: afterwards `write` is set and `is_cow` and
    /// `non_owning` are cleared.
    pub fn make_writable(&mut self) {
        match &self.storage {
            PageStorage::Owned(_) => {}
            PageStorage::Borrowed(data) => {
                self.storage = PageStorage::Owned(Arc::new((**data).clone()));
            }
            PageStorage::Arena(arena, index) => {
                let mut data = PageData::default();
                arena.read_page(*index, &mut data.buffer);
                self.storage = PageStorage::Owned(Arc::new(data));
            }
        }
        self.attr.write = true;
        self.attr.is_cow = false;
        self.attr.non_owning = false;
    }

    fn borrowed_storage(&self) -> PageStorage {
        match &self.storage {
            PageStorage::Owned(data) | PageStorage::Borrowed(data) => {
                PageStorage::Borrowed(data.clone())
            }
            PageStorage::Arena(arena, index) => PageStorage::Arena(arena.clone(), *index),
        }
    }

    /// Makes this page a loan of `master`'s buffer, taking over its attributes.
    pub fn loan(&mut self, master: &Page) {
        self.attr = master.attr;
        self.attr.non_owning = true;
        self.storage = master.borrowed_storage();
    }

    /// Creates a borrowed view of `master` with the same attributes.
    #[must_use]
    pub fn loaned(master: &Page) -> Page {
        let mut attr = master.attr;
        attr.non_owning = true;
        Page {
            attr,
            storage: master.borrowed_storage(),
            trap: None,
        }
    }

    /// Creates a loan of this page for a fork: writable pages become copy-on-write.
    #[must_use]
    pub fn fork_loan(&self) -> Page {
        let mut attr = self.attr;
        if attr.write {
            attr.write = false;
            attr.is_cow = true;
        }
        attr.non_owning = true;
        attr.cacheable = true;

        Page {
            attr,
            storage: self.borrowed_storage(),
            trap: None,
        }
    }

    /// Installs or removes an MMIO trap. Installing a trap makes the page uncacheable,
    /// removing it makes the page cacheable again.
    ///
    /// Returns `true` when a trap is installed afterwards.
    pub fn set_trap(&mut self, trap: Option<PageTrap>) -> bool {
        self.attr.cacheable = trap.is_none();
        self.trap = trap;
        self.trap.is_some()
    }

    /// Returns `true` if an MMIO trap is installed.
    #[must_use]
    pub fn has_trap(&self) -> bool {
        self.trap.is_some()
    }

    /// Invokes the installed trap, if any.
    pub fn trap(&self, offset: usize, kind: TrapKind, size: usize, value: u64) -> Option<u64> {
        let trap = self.trap.as_ref()?;
        trap(
            self,
            TrapEvent {
                offset,
                kind,
                size,
                value,
            },
        )
    }

    /// Runs `f` with read access to the page bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match &self.storage {
            PageStorage::Owned(data) | PageStorage::Borrowed(data) => f(&data.buffer),
            PageStorage::Arena(arena, index) => arena.with_page(*index, f),
        }
    }

    /// Runs `f` with write access to the page bytes.
    ///
    /// A borrowed buffer is privatized first; an owned buffer still shared with a fork is
    /// cloned. Writes therefore never become visible through another page.
    pub fn with_data_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match &mut self.storage {
            PageStorage::Owned(data) => f(&mut Arc::make_mut(data).buffer),
            PageStorage::Arena(arena, index) => arena.with_page_mut(*index, f),
            PageStorage::Borrowed(data) => {
                let mut private = PageData::clone(data);
                let result = f(&mut private.buffer);
                self.storage = PageStorage::Owned(Arc::new(private));
                self.attr.non_owning = false;
                result
            }
        }
    }

    /// Copies the whole page into a new buffer.
    #[must_use]
    pub fn to_data(&self) -> PageData {
        let mut data = PageData::default();
        self.with_data(|bytes| data.buffer.copy_from_slice(bytes));
        data
    }

    /// Reads a little-endian value at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value does not fit inside the page.
    pub fn read<T: GuestIO>(&self, offset: usize) -> Result<T> {
        self.with_data(|bytes| {
            let mut offset = offset;
            io::read_le_at(bytes, &mut offset)
        })
    }

    /// Writes a little-endian value at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value does not fit inside the page.
    pub fn write<T: GuestIO>(&mut self, offset: usize, value: T) -> Result<()> {
        self.with_data_mut(|bytes| {
            let mut offset = offset;
            io::write_le_at(bytes, &mut offset, value)
        })
    }
}
