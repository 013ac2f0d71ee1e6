//! The instruction handler registry.
//!
//! Decoder entries refer to their slow-path handler through a one-byte index. The
//! [`HandlerRegistry`] owns the index space: it deduplicates handlers by function identity and
//! hands out at most 256 indices, with index 0 reserved for the illegal-instruction handler.
//!
//! Readers never block. Handlers are stored in a [`boxcar::Vec`], so a dispatching CPU can
//! resolve an index while another thread registers a new handler; only registration itself
//! is serialized.
//!
//! A registry is explicit state rather than a process-wide table. Every
//! [`crate::decoder::SharedExecuteSegments`] owns the registry its segments were decoded
//! against, which keeps handler indices coherent for all machines sharing a segment.

use std::{collections::HashMap, fmt, sync::Mutex};

use crate::{
    address::Address,
    cpu::isa,
    decoder::instruction::Instruction,
    machine::Machine,
    Result,
};

/// Maximum number of handlers a registry can hold.
pub const MAX_HANDLERS: usize = 256;

/// The slow-path implementation of an instruction.
pub type HandlerFn<A> = fn(&mut Machine<A>, Instruction) -> Result<()>;

/// A named instruction handler.
pub struct InstructionHandler<A: Address> {
    /// Mnemonic used in traces and fault descriptions
    pub name: &'static str,
    /// The handler function
    pub handler: HandlerFn<A>,
}

impl<A: Address> InstructionHandler<A> {
    /// Creates a handler.
    #[must_use]
    pub const fn new(name: &'static str, handler: HandlerFn<A>) -> Self {
        InstructionHandler { name, handler }
    }

    /// The identity used for deduplication.
    fn key(&self) -> usize {
        self.handler as usize
    }
}

impl<A: Address> Clone for InstructionHandler<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: Address> Copy for InstructionHandler<A> {}

impl<A: Address> fmt::Debug for InstructionHandler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionHandler")
            .field("name", &self.name)
            .finish()
    }
}

/// Deduplicating table of up to 256 instruction handlers.
pub struct HandlerRegistry<A: Address> {
    handlers: boxcar::Vec<InstructionHandler<A>>,
    index: Mutex<HashMap<usize, u8>>,
}

impl<A: Address> fmt::Debug for HandlerRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.count())
            .finish()
    }
}

impl<A: Address> Default for HandlerRegistry<A> {
    fn default() -> Self {
        HandlerRegistry::new()
    }
}

impl<A: Address> HandlerRegistry<A> {
    /// Creates a registry with the illegal-instruction handler at index 0.
    #[must_use]
    pub fn new() -> Self {
        let registry = HandlerRegistry::empty();
        registry.handlers.push(isa::illegal_handler());
        lock!(registry.index).insert(isa::illegal_handler::<A>().key(), 0);
        registry
    }

    /// Creates a registry without any handlers.
    ///
    /// The first handler registered receives index 0. Decoding against a registry whose
    /// index 0 is not the illegal-instruction handler fails.
    #[must_use]
    pub fn empty() -> Self {
        HandlerRegistry {
            handlers: boxcar::Vec::new(),
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the index of `handler`, registering it on first use.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidProgram`] when all 256 indices are taken.
    pub fn index_for(&self, handler: InstructionHandler<A>) -> Result<u8> {
        let mut index = lock!(self.index);
        if let Some(idx) = index.get(&handler.key()) {
            return Ok(*idx);
        }

        let count = self.handlers.count();
        if count >= MAX_HANDLERS {
            return Err(invalid_program!("Too many instruction handlers", count));
        }

        let idx = u8::try_from(self.handlers.push(handler))
            .map_err(|_| invalid_program!("Too many instruction handlers", count))?;
        index.insert(handler.key(), idx);
        Ok(idx)
    }

    /// Registers `handler` under `name`, returning its index.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidProgram`] when all 256 indices are taken.
    pub fn register(&self, name: &'static str, handler: HandlerFn<A>) -> Result<u8> {
        self.index_for(InstructionHandler::new(name, handler))
    }

    /// The handler at `idx`.
    #[must_use]
    pub fn get(&self, idx: u8) -> Option<&InstructionHandler<A>> {
        self.handlers.get(usize::from(idx))
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.count()
    }

    /// Returns `true` if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.count() == 0
    }

    /// Returns `true` if index 0 holds the illegal-instruction handler.
    #[must_use]
    pub fn has_invalid_at_zero(&self) -> bool {
        self.get(0)
            .is_some_and(|h| h.key() == isa::illegal_handler::<A>().key())
    }

    /// Resolves the handler index of `instr` through the base instruction decoder.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidProgram`] when all 256 indices are taken.
    pub fn index_of_instruction(&self, instr: Instruction) -> Result<u8> {
        self.index_for(isa::decode::<A>(instr))
    }
}
