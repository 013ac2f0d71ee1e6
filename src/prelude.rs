//! # rvmem Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the rvmem library. Import this module to get quick access to the essential types for
//! creating, running and inspecting machines.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all rvmem operations
pub use crate::Error;

/// The result type used throughout rvmem
pub use crate::Result;

/// Guest address widths
pub use crate::address::Address;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// A complete machine and the reason a run returned
pub use crate::machine::{Machine, StopReason};

/// Machine configuration
pub use crate::config::MachineOptions;

/// Registers and execute-segment lookup
pub use crate::cpu::{Cpu, Registers};

// ================================================================================================
// Memory
// ================================================================================================

/// The guest address space and its pages
pub use crate::memory::{Memory, Page, PageAttributes};

/// Loadable program images
pub use crate::memory::{LoadSegment, ProgramImage, SegmentFlags};

// ================================================================================================
// Decoding
// ================================================================================================

/// Decoded execute segments and their cross-machine registry
pub use crate::decoder::{DecodedExecuteSegment, HandlerRegistry, SharedExecuteSegments};
