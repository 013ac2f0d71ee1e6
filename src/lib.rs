// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]

//! # rvmem
//!
//! The memory and decoding core of a user-mode RISC-V emulator. `rvmem` provides the paged
//! guest address space behind every load, store and instruction fetch, the algorithm that
//! turns raw code bytes into a fast-dispatch decoder cache, and a registry that lets
//! unrelated machine instances share an identical decode result instead of recomputing it.
//!
//! ## Features
//!
//! - **Paged guest memory** - 4 KiB pages with per-page permissions, copy-on-write sharing,
//!   guard pages, MMIO traps and an optional flat arena fast path
//! - **Fork** - cheap copy-on-write clones of a running machine, isolated in both directions
//! - **Decoder caches** - per-granule dispatch descriptors with run-length instruction counts
//! - **Shared execute segments** - per-key locked deduplication of decoded code across machines
//! - **ELF loading** - program headers, sections and symbols through `goblin`
//! - **Snapshots** - versioned save and restore of the page table and register file
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rvmem::prelude::*;
//!
//! let binary = std::fs::read("program.elf")?;
//! let mut machine = Machine::<u64>::from_elf(&binary, MachineOptions::default())?;
//! machine.simulate(1_000_000)?;
//! println!("a0 = {}", machine.cpu.reg(10));
//! # Ok::<(), rvmem::Error>(())
//! ```
//!
//! ### Sharing decoded code between machines
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvmem::prelude::*;
//!
//! let shared = Arc::new(SharedExecuteSegments::<u64>::new(true));
//! let options = MachineOptions::default().with_shared_segments(shared.clone());
//!
//! let binary = std::fs::read("program.elf")?;
//! let first = Machine::<u64>::from_elf(&binary, options.clone())?;
//! let second = Machine::<u64>::from_elf(&binary, options)?;
//! assert_eq!(shared.len(), 1);
//! # Ok::<(), rvmem::Error>(())
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). Faults abort only the current access
//! or step and are never retried internally:
//!
//! ```rust,no_run
//! use rvmem::{prelude::*, Error};
//!
//! let mut machine = Machine::<u64>::new(MachineOptions::default())?;
//! match machine.memory.read::<u32>(0x10) {
//!     Ok(value) => println!("read {value:#x}"),
//!     Err(Error::ProtectionFault { addr }) => println!("guard page hit at {addr:#x}"),
//!     Err(e) => println!("other error: {e}"),
//! }
//! # Ok::<(), rvmem::Error>(())
//! ```
//!
//! ## Development and Testing
//!
//! ```bash
//! cargo test
//! cargo bench
//! cargo +nightly fuzz run decoder --release
//! ```
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;
pub(crate) mod utils;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// ```rust,no_run
/// use rvmem::prelude::*;
///
/// let machine = Machine::<u32>::new(MachineOptions::default())?;
/// assert_eq!(machine.memory.pages_active(), 1);
/// # Ok::<(), rvmem::Error>(())
/// ```
pub mod prelude;

/// Guest address widths.
///
/// A machine is either 32- or 64-bit for its whole lifetime. The [`address::Address`] trait
/// abstracts over `u32` and `u64` so every component is written once.
pub mod address;

/// Machine configuration.
///
/// [`config::MachineOptions`] controls memory budgets, the flat arena, instruction encoding,
/// segment protection rules, forking and the injectable handler and segment registries.
pub mod config;

/// Paged guest memory.
///
/// - [`memory::Memory`] - the per-machine address space
/// - [`memory::Page`], [`memory::PageAttributes`], [`memory::PageData`] - the page unit
/// - [`memory::ProgramImage`] - loadable segments, sections and symbols of a program
///
/// # Examples
///
/// ```rust
/// use rvmem::prelude::*;
///
/// let mut memory = Memory::<u64>::new(&MachineOptions::default())?;
/// memory.memcpy(0x2000, b"hello")?;
/// let text = memory.memview(0x2000, 5, 16, |bytes| bytes.to_vec())?;
/// assert_eq!(text, b"hello");
/// # Ok::<(), rvmem::Error>(())
/// ```
pub mod memory;

/// Decoder caches and execute segments.
///
/// - [`decoder::DecoderData`] - the 8-byte dispatch descriptor
/// - [`decoder::DecodedExecuteSegment`] - decoded code for one contiguous range
/// - [`decoder::SharedExecuteSegments`] - cross-machine deduplication of decoded segments
/// - [`decoder::HandlerRegistry`] - the bounded table of dispatch handlers
pub mod decoder;

/// The execution facade driving the decoder cache.
pub mod cpu;

/// A complete emulated machine coupling a [`cpu::Cpu`] with its [`memory::Memory`].
pub mod machine;

/// `rvmem` Result type.
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
///
/// # Examples
///
/// ```rust
/// use rvmem::{Result, Error};
///
/// fn guest_word(bytes: &[u8]) -> Result<u32> {
///     if bytes.len() < 4 {
///         return Err(Error::OutOfBounds);
///     }
///     Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `rvmem` Error type.
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust,no_run
/// use rvmem::{prelude::*, Error};
///
/// match Machine::<u64>::from_elf(&[0u8; 16], MachineOptions::default()) {
///     Ok(_) => println!("loaded"),
///     Err(Error::InvalidProgram { message, .. }) => println!("rejected: {message}"),
///     Err(e) => println!("error: {e}"),
/// }
/// ```
pub use error::Error;

/// Main entry point for running guest code.
///
/// See [`machine::Machine`] for construction, forking, stepping and snapshots.
pub use machine::Machine;

/// Configuration for [`Machine`] and [`memory::Memory`].
pub use config::MachineOptions;
