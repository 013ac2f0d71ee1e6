//! Machine configuration.
//!
//! [`MachineOptions`] is a plain struct with public fields, a [`Default`] suitable for running
//! ordinary statically linked programs, a few presets and chainable `with_*` setters.
//!
//! # Presets
//!
//! - [`MachineOptions::sandboxed()`] - strict segment rules and alignment checks
//! - [`MachineOptions::permissive()`] - accepts unusual binaries (writable code, no `.text`)
//! - [`MachineOptions::minimal()`] - small memory budget and minimal forks
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rvmem::{decoder::SharedExecuteSegments, MachineOptions};
//!
//! let options = MachineOptions::<u64>::sandboxed()
//!     .with_memory_max(32 << 20)
//!     .with_shared_segments(Arc::new(SharedExecuteSegments::new(true)));
//! assert!(options.memory_alignment_check);
//! assert!(options.shared_segments.is_some());
//! ```

use std::{fmt, sync::Arc};

use crate::{
    address::Address,
    decoder::{HandlerRegistry, SharedExecuteSegments},
    memory::PageFaultHandler,
};

/// Default guest memory budget (64 MiB).
pub const DEFAULT_MEMORY_MAX: u64 = 64 << 20;

/// Default guest stack size (1 MiB).
pub const DEFAULT_STACK_SIZE: u64 = 1 << 20;

/// Configuration of a [`crate::Machine`] and its [`crate::memory::Memory`].
///
/// # Default Values
///
/// | Option | Default |
/// |--------|---------|
/// | `memory_max` | 64 MiB |
/// | `stack_size` | 1 MiB |
/// | `use_memory_arena` | `false` |
/// | `compressed_instructions` | `true` |
/// | `protect_segments` | `true` |
/// | `allow_write_exec_segment` | `false` |
/// | `default_exit_function` | `"fast_exit"` |
pub struct MachineOptions<A: Address> {
    /// Upper bound of guest memory in bytes. Must be at least one page.
    pub memory_max: u64,

    /// Size of the initial guest stack in bytes.
    pub stack_size: u64,

    /// Back the low part of the address space with one contiguous anonymous mapping.
    ///
    /// Loads and stores inside the arena skip the page table. Forks created with this option
    /// share the arena with their source.
    pub use_memory_arena: bool,

    /// Decode with the compressed (16-bit) instruction extension enabled.
    pub compressed_instructions: bool,

    /// Raise [`crate::Error::MisalignedAccess`] for accesses that are not naturally aligned.
    pub memory_alignment_check: bool,

    /// Copy the loadable segments of the program into memory.
    pub load_program: bool,

    /// Apply the segment permissions of the program. When disabled every loaded segment is
    /// readable, writable and executable.
    pub protect_segments: bool,

    /// Accept program segments that are both writable and executable.
    pub allow_write_exec_segment: bool,

    /// Reject executable program segments that are also readable or writable.
    pub enforce_exec_only: bool,

    /// Decode whole executable segments instead of narrowing them to their `.text` section.
    pub ignore_text_section: bool,

    /// Forks start without any pages of their source.
    pub minimal_fork: bool,

    /// Symbol used as the return address of guest function calls. When the program has no
    /// such symbol a host page with a `STOP` instruction is installed instead.
    pub default_exit_function: String,

    /// Share decoded execute segments with every other machine using the same registry.
    pub shared_segments: Option<Arc<SharedExecuteSegments<A>>>,

    /// Handler registry used for private segments. Ignored when `shared_segments` is set.
    pub handlers: Option<Arc<HandlerRegistry<A>>>,

    /// Replaces the default page fault handler and its page budget.
    pub page_fault_handler: Option<PageFaultHandler<A>>,
}

impl<A: Address> Default for MachineOptions<A> {
    fn default() -> Self {
        MachineOptions {
            memory_max: DEFAULT_MEMORY_MAX,
            stack_size: DEFAULT_STACK_SIZE,
            use_memory_arena: false,
            compressed_instructions: true,
            memory_alignment_check: false,
            load_program: true,
            protect_segments: true,
            allow_write_exec_segment: false,
            enforce_exec_only: false,
            ignore_text_section: false,
            minimal_fork: false,
            default_exit_function: "fast_exit".to_string(),
            shared_segments: None,
            handlers: None,
            page_fault_handler: None,
        }
    }
}

impl<A: Address> Clone for MachineOptions<A> {
    fn clone(&self) -> Self {
        MachineOptions {
            memory_max: self.memory_max,
            stack_size: self.stack_size,
            use_memory_arena: self.use_memory_arena,
            compressed_instructions: self.compressed_instructions,
            memory_alignment_check: self.memory_alignment_check,
            load_program: self.load_program,
            protect_segments: self.protect_segments,
            allow_write_exec_segment: self.allow_write_exec_segment,
            enforce_exec_only: self.enforce_exec_only,
            ignore_text_section: self.ignore_text_section,
            minimal_fork: self.minimal_fork,
            default_exit_function: self.default_exit_function.clone(),
            shared_segments: self.shared_segments.clone(),
            handlers: self.handlers.clone(),
            page_fault_handler: self.page_fault_handler.clone(),
        }
    }
}

impl<A: Address> fmt::Debug for MachineOptions<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineOptions")
            .field("memory_max", &self.memory_max)
            .field("stack_size", &self.stack_size)
            .field("use_memory_arena", &self.use_memory_arena)
            .field("compressed_instructions", &self.compressed_instructions)
            .field("memory_alignment_check", &self.memory_alignment_check)
            .field("load_program", &self.load_program)
            .field("protect_segments", &self.protect_segments)
            .field("allow_write_exec_segment", &self.allow_write_exec_segment)
            .field("enforce_exec_only", &self.enforce_exec_only)
            .field("ignore_text_section", &self.ignore_text_section)
            .field("minimal_fork", &self.minimal_fork)
            .field("default_exit_function", &self.default_exit_function)
            .field("shared_segments", &self.shared_segments.is_some())
            .field("handlers", &self.handlers.is_some())
            .field("page_fault_handler", &self.page_fault_handler.is_some())
            .finish()
    }
}

impl<A: Address> MachineOptions<A> {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Strict configuration for untrusted programs.
    ///
    /// Writable code is rejected, alignment is checked and the memory budget is 16 MiB.
    #[must_use]
    pub fn sandboxed() -> Self {
        MachineOptions {
            memory_max: 16 << 20,
            memory_alignment_check: true,
            protect_segments: true,
            allow_write_exec_segment: false,
            ..Default::default()
        }
    }

    /// Lenient configuration for hand-written or unusual binaries.
    ///
    /// Segment permissions are not applied, writable code is accepted and whole executable
    /// segments are decoded.
    #[must_use]
    pub fn permissive() -> Self {
        MachineOptions {
            protect_segments: false,
            allow_write_exec_segment: true,
            ignore_text_section: true,
            ..Default::default()
        }
    }

    /// Small configuration for short-lived machines and forks.
    #[must_use]
    pub fn minimal() -> Self {
        MachineOptions {
            memory_max: 1 << 20,
            stack_size: 64 << 10,
            minimal_fork: true,
            ..Default::default()
        }
    }

    /// Sets the guest memory budget in bytes.
    #[must_use]
    pub fn with_memory_max(mut self, bytes: u64) -> Self {
        self.memory_max = bytes;
        self
    }

    /// Sets the initial stack size in bytes.
    #[must_use]
    pub fn with_stack_size(mut self, bytes: u64) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Enables or disables the flat memory arena.
    #[must_use]
    pub fn with_memory_arena(mut self, enabled: bool) -> Self {
        self.use_memory_arena = enabled;
        self
    }

    /// Enables or disables compressed instructions.
    #[must_use]
    pub fn with_compressed_instructions(mut self, enabled: bool) -> Self {
        self.compressed_instructions = enabled;
        self
    }

    /// Enables or disables alignment checks.
    #[must_use]
    pub fn with_alignment_check(mut self, enabled: bool) -> Self {
        self.memory_alignment_check = enabled;
        self
    }

    /// Enables or disables minimal forks.
    #[must_use]
    pub fn with_minimal_fork(mut self, enabled: bool) -> Self {
        self.minimal_fork = enabled;
        self
    }

    /// Sets the symbol used as the return address of guest function calls.
    #[must_use]
    pub fn with_exit_function(mut self, symbol: impl Into<String>) -> Self {
        self.default_exit_function = symbol.into();
        self
    }

    /// Shares decoded execute segments through `shared`.
    ///
    /// The compressed instruction mode follows the registry.
    #[must_use]
    pub fn with_shared_segments(mut self, shared: Arc<SharedExecuteSegments<A>>) -> Self {
        self.compressed_instructions = shared.is_compressed();
        self.shared_segments = Some(shared);
        self
    }

    /// Decodes private segments against `handlers`.
    #[must_use]
    pub fn with_handlers(mut self, handlers: Arc<HandlerRegistry<A>>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Replaces the default page fault handler.
    #[must_use]
    pub fn with_page_fault_handler(mut self, handler: PageFaultHandler<A>) -> Self {
        self.page_fault_handler = Some(handler);
        self
    }

    /// The handler registry segments are decoded against: the shared registry's when sharing
    /// is enabled, else the configured one.
    #[must_use]
    pub fn handler_registry(&self) -> Option<Arc<HandlerRegistry<A>>> {
        match (&self.shared_segments, &self.handlers) {
            (Some(shared), _) => Some(shared.registry().clone()),
            (None, Some(handlers)) => Some(handlers.clone()),
            (None, None) => None,
        }
    }
}
