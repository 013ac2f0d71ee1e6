//! Decoder caches and execute segments.
//!
//! Raw code bytes are turned into one [`DecoderData`] per instruction granule. Each entry
//! carries a [`Bytecode`] for the inline fast path, a one-byte index into a
//! [`HandlerRegistry`] for the slow path, the (possibly rewritten) instruction bits and the
//! length of the straight-line block it starts.
//!
//! # Key Components
//!
//! - [`DecodedExecuteSegment`] - a padded copy of executable memory plus its decoder caches
//! - [`generate_decoder_cache`] - the deterministic decode algorithm
//! - [`SharedExecuteSegments`] - per-key deduplication of decoded segments across machines
//! - [`HandlerRegistry`] - the bounded table of dispatch handlers
//!
//! # Examples
//!
//! ```rust
//! use rvmem::decoder::{generate_decoder_cache, Bytecode, DecodedExecuteSegment, HandlerRegistry};
//!
//! // li a0, 1 ; ecall
//! let code = [0x13, 0x05, 0x10, 0x00, 0x73, 0x00, 0x00, 0x00];
//! let registry = HandlerRegistry::<u64>::new();
//! let mut segment = DecodedExecuteSegment::<u64>::create(&code, 0x1000, true)?;
//! generate_decoder_cache(&mut segment, &registry)?;
//!
//! let entry = segment.decoder_entry(0x1000).unwrap();
//! assert_eq!(entry.get_bytecode(), Bytecode::Li);
//! assert_eq!(entry.instruction_count(true), 2);
//! # Ok::<(), rvmem::Error>(())
//! ```

mod bytecode;
mod data;
mod generate;
mod handlers;
mod instruction;
mod segment;
mod shared;

pub use bytecode::{computed_index_for, Bytecode};
pub use data::{divisor, entries_per_page, DecoderCache, DecoderData, DECODER_DATA_SIZE};
pub use generate::{generate_decoder_cache, realize_fastsim};
pub use handlers::{HandlerFn, HandlerRegistry, InstructionHandler, MAX_HANDLERS};
pub use instruction::{ci_code, is_regular_compressed, opcode, Instruction};
pub use segment::{DecodedExecuteSegment, SegmentHash, SegmentKey};
pub use shared::{SegmentEntry, SegmentHandle, SharedExecuteSegments};
