use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! invalid_program {
    // Message only, the data word defaults to zero
    ($msg:expr) => {
        crate::Error::InvalidProgram {
            message: $msg.to_string(),
            data: 0,
        }
    };

    // Message and an associated data word (address, length, index...)
    ($msg:expr, $data:expr) => {
        crate::Error::InvalidProgram {
            message: $msg.to_string(),
            data: ($data) as u64,
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Guest faults are raised at the point of detection and unwind only the current access or
/// instruction. The caller decides whether a fault is recoverable (e.g. deliver a signal to the
/// guest and resume) or fatal.
///
/// # Error Categories
///
/// ## Guest faults
/// - [`Error::ProtectionFault`] - Denied or unmapped read/write
/// - [`Error::ExecutionSpaceProtectionFault`] - Jump target lacks execute permission
/// - [`Error::MisalignedAccess`] - Strict alignment mode rejected an access
/// - [`Error::IllegalOpcode`] - The decoder cache holds no valid instruction at `pc`
/// - [`Error::UnimplementedInstruction`] - A valid encoding without a handler
/// - [`Error::ExecutionLoopDetected`] - Fault handlers kept redirecting execution
///
/// ## Resource errors
/// - [`Error::OutOfMemory`] - Page budget exhausted
///
/// ## Program errors
/// - [`Error::InvalidProgram`] - Malformed segments, too many segments, empty decode range
/// - [`Error::Malformed`] - Corrupted input (ELF images, snapshots)
/// - [`Error::GoblinErr`] - ELF parsing errors from the goblin crate
///
/// # Examples
///
/// ```rust
/// use rvmem::{prelude::*, Error};
///
/// let memory = Memory::<u64>::new(&MachineOptions::default())?;
/// match memory.read::<u64>(0x8) {
///     Err(Error::ProtectionFault { addr }) => assert_eq!(addr, 0x8),
///     other => panic!("expected a protection fault, got {other:?}"),
/// }
/// # Ok::<(), rvmem::Error>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Guest faults
    /// A read or write touched a page without the required permission.
    ///
    /// Raised for reads from non-readable pages (including guard pages) and writes to pages
    /// which are neither writable nor copy-on-write.
    #[error("Protection fault at {addr:#x}")]
    ProtectionFault {
        /// The guest address of the faulting access
        addr: u64,
    },

    /// Execution was attempted on a page without execute permission.
    #[error("Execution space protection fault at {addr:#x}")]
    ExecutionSpaceProtectionFault {
        /// The guest address of the faulting fetch
        addr: u64,
    },

    /// The page budget of the machine was exhausted.
    ///
    /// # Fields
    ///
    /// * `message` - What was being allocated
    /// * `pages` - The page budget that was reached
    #[error("{message} ({pages} pages)")]
    OutOfMemory {
        /// Description of the failed allocation
        message: String,
        /// The page budget that was reached
        pages: u64,
    },

    /// A program, segment or decode range was rejected.
    ///
    /// These errors are fatal to the requesting machine and never corrupt shared state.
    #[error("Invalid program: {message} (data: {data:#x})")]
    InvalidProgram {
        /// What was wrong with the program
        message: String,
        /// An associated data word, such as an address or count
        data: u64,
    },

    /// An access was not naturally aligned while strict alignment checks are enabled.
    #[error("Misaligned access of {size} bytes at {addr:#x}")]
    MisalignedAccess {
        /// The guest address of the access
        addr: u64,
        /// The width of the access in bytes
        size: usize,
    },

    /// The instruction at `pc` is not a valid encoding.
    #[error("Illegal opcode {instr:#010x} at {pc:#x}")]
    IllegalOpcode {
        /// The raw instruction bits
        instr: u32,
        /// The program counter of the instruction
        pc: u64,
    },

    /// The instruction at `pc` decodes, but no handler implements it.
    #[error("Unimplemented instruction {instr:#010x} at {pc:#x}")]
    UnimplementedInstruction {
        /// The raw instruction bits
        instr: u32,
        /// The program counter of the instruction
        pc: u64,
    },

    /// Fault or trap handlers redirected execution too many times in a row.
    #[error("Execution loop detected at {pc:#x}")]
    ExecutionLoopDetected {
        /// The program counter at the time of detection
        pc: u64,
    },

    /// The requested feature cannot be used with the current configuration.
    #[error("Feature disabled: {0}")]
    FeatureDisabled(&'static str),

    /// The input is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted on a host buffer.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate during ELF parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,
}

impl Error {
    /// Returns `true` for faults raised by a guest access or instruction, as opposed to
    /// configuration, program or host errors.
    #[must_use]
    pub fn is_guest_fault(&self) -> bool {
        matches!(
            self,
            Error::ProtectionFault { .. }
                | Error::ExecutionSpaceProtectionFault { .. }
                | Error::MisalignedAccess { .. }
                | Error::IllegalOpcode { .. }
                | Error::UnimplementedInstruction { .. }
                | Error::ExecutionLoopDetected { .. }
        )
    }

    /// The guest address associated with a fault, if any.
    #[must_use]
    pub fn fault_address(&self) -> Option<u64> {
        match self {
            Error::ProtectionFault { addr }
            | Error::ExecutionSpaceProtectionFault { addr }
            | Error::MisalignedAccess { addr, .. } => Some(*addr),
            Error::IllegalOpcode { pc, .. }
            | Error::UnimplementedInstruction { pc, .. }
            | Error::ExecutionLoopDetected { pc } => Some(*pc),
            _ => None,
        }
    }
}
