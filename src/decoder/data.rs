//! Decoder cache entries.
//!
//! A [`DecoderData`] is an 8-byte dispatch descriptor. There is one entry per 2-byte granule
//! when compressed instructions are enabled and one per 4-byte granule otherwise. Entries are
//! grouped into page-sized [`DecoderCache`]s so a program counter maps to its entry with a
//! subtraction and a shift.
//!
//! # Block layout
//!
//! The `block` field describes the straight-line block the entry belongs to:
//!
//! | Mode       | Low byte | High byte |
//! |------------|----------|-----------|
//! | compressed | `idxend`: half-words to the block end | `icount`: instructions left |
//! | fixed      | `idxend` (all 16 bits): instructions to the block end | |

use crate::{address::PAGE_SIZE, decoder::bytecode::Bytecode, utils::io, Result};

/// Size of one serialized entry.
pub const DECODER_DATA_SIZE: usize = 8;

/// An 8-byte dispatch descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DecoderData {
    /// Raw [`Bytecode`] value
    pub bytecode: u8,
    /// Index into the handler registry. Zero is the illegal-instruction handler.
    pub handler: u8,
    /// Block length information, see the module documentation
    pub block: u16,
    /// Instruction bits (possibly rewritten)
    pub instr: u32,
}

impl DecoderData {
    /// An entry that raises an illegal instruction.
    pub const INVALID: DecoderData = DecoderData {
        bytecode: 0,
        handler: 0,
        block: 0,
        instr: 0,
    };

    /// Creates an entry.
    #[must_use]
    pub const fn new(bytecode: Bytecode, handler: u8, instr: u32) -> Self {
        DecoderData {
            bytecode: bytecode as u8,
            handler,
            block: 0,
            instr,
        }
    }

    /// The entry's bytecode.
    #[must_use]
    pub fn get_bytecode(&self) -> Bytecode {
        Bytecode::from_u8(self.bytecode)
    }

    /// Replaces the bytecode.
    pub fn set_bytecode(&mut self, bytecode: Bytecode) {
        self.bytecode = bytecode.as_u8();
    }

    /// Resets the handler to the illegal-instruction handler.
    pub fn set_invalid_handler(&mut self) {
        self.handler = 0;
    }

    /// Returns `true` if the handler is the illegal-instruction handler.
    #[must_use]
    pub fn is_invalid_handler(&self) -> bool {
        self.handler == 0
    }

    /// Makes this entry raise an illegal instruction.
    pub fn invalidate(&mut self) {
        self.bytecode = Bytecode::Invalid.as_u8();
        self.handler = 0;
    }

    /// Distance to the end of the block, in granules.
    #[must_use]
    pub fn idxend(&self, compressed: bool) -> u16 {
        if compressed {
            self.block & 0xff
        } else {
            self.block
        }
    }

    /// Sets the distance to the end of the block, in granules.
    pub fn set_idxend(&mut self, compressed: bool, idxend: u16) {
        if compressed {
            self.block = (self.block & 0xff00) | (idxend & 0xff);
        } else {
            self.block = idxend;
        }
    }

    /// Instructions left in the block, including this one. Only meaningful in compressed mode.
    #[must_use]
    pub fn icount(&self) -> u8 {
        (self.block >> 8) as u8
    }

    /// Sets the instruction count of a compressed block entry.
    pub fn set_icount(&mut self, icount: u8) {
        self.block = (self.block & 0x00ff) | (u16::from(icount) << 8);
    }

    /// Bytes from this entry to the last instruction of its block.
    #[must_use]
    pub fn block_bytes(&self, compressed: bool) -> usize {
        usize::from(self.idxend(compressed)) * if compressed { 2 } else { 4 }
    }

    /// Instructions from this entry to the end of its block, inclusive.
    #[must_use]
    pub fn instruction_count(&self, compressed: bool) -> usize {
        if compressed {
            usize::from(self.icount())
        } else {
            usize::from(self.idxend(false)) + 1
        }
    }

    /// The little-endian 8-byte representation.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DECODER_DATA_SIZE] {
        let mut bytes = [0u8; DECODER_DATA_SIZE];
        bytes[0] = self.bytecode;
        bytes[1] = self.handler;
        bytes[2..4].copy_from_slice(&self.block.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.instr.to_le_bytes());
        bytes
    }

    /// Parses the little-endian 8-byte representation.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than 8 bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut offset = 0;
        Ok(DecoderData {
            bytecode: io::read_le_at(data, &mut offset)?,
            handler: io::read_le_at(data, &mut offset)?,
            block: io::read_le_at(data, &mut offset)?,
            instr: io::read_le_at(data, &mut offset)?,
        })
    }
}

/// Number of entries per decoder cache page.
#[must_use]
pub const fn entries_per_page(compressed: bool) -> usize {
    PAGE_SIZE / divisor(compressed)
}

/// Bytes covered by one entry.
#[must_use]
pub const fn divisor(compressed: bool) -> usize {
    if compressed {
        2
    } else {
        4
    }
}

/// The decoder entries of one page of code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderCache {
    entries: Vec<DecoderData>,
}

impl DecoderCache {
    /// Creates a page of invalid entries.
    #[must_use]
    pub fn new(compressed: bool) -> Self {
        DecoderCache {
            entries: vec![DecoderData::INVALID; entries_per_page(compressed)],
        }
    }

    /// The entry at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&DecoderData> {
        self.entries.get(index)
    }

    /// The entry at `index` for modification.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut DecoderData> {
        self.entries.get_mut(index)
    }

    /// All entries of the page.
    #[must_use]
    pub fn entries(&self) -> &[DecoderData] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the page has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_fields_compressed() {
        let mut entry = DecoderData::new(Bytecode::CLi, 3, 0x4501);
        entry.set_idxend(true, 7);
        entry.set_icount(4);
        assert_eq!(entry.idxend(true), 7);
        assert_eq!(entry.icount(), 4);
        assert_eq!(entry.block_bytes(true), 14);
        assert_eq!(entry.instruction_count(true), 4);

        entry.set_idxend(true, 2);
        assert_eq!(entry.icount(), 4);
    }

    #[test]
    fn test_block_fields_fixed() {
        let mut entry = DecoderData::new(Bytecode::Addi, 1, 0x0015_8513);
        entry.set_idxend(false, 300);
        assert_eq!(entry.idxend(false), 300);
        assert_eq!(entry.block_bytes(false), 1200);
        assert_eq!(entry.instruction_count(false), 301);
    }

    #[test]
    fn test_byte_layout() {
        let entry = DecoderData {
            bytecode: 0x12,
            handler: 0x34,
            block: 0x5678,
            instr: 0x9abc_def0,
        };
        let bytes = entry.to_bytes();
        assert_eq!(bytes, [0x12, 0x34, 0x78, 0x56, 0xf0, 0xde, 0xbc, 0x9a]);
        assert_eq!(DecoderData::from_bytes(&bytes).unwrap(), entry);
        assert!(DecoderData::from_bytes(&bytes[..7]).is_err());
    }

    #[test]
    fn test_invalidate() {
        let mut entry = DecoderData::new(Bytecode::Jal, 9, 0xffdf_f06f);
        assert!(!entry.is_invalid_handler());
        entry.invalidate();
        assert_eq!(entry.get_bytecode(), Bytecode::Invalid);
        assert!(entry.is_invalid_handler());
    }

    #[test]
    fn test_cache_sizes() {
        assert_eq!(DecoderCache::new(true).len(), 2048);
        assert_eq!(DecoderCache::new(false).len(), 1024);
        assert!(DecoderCache::new(true)
            .entries()
            .iter()
            .all(|e| *e == DecoderData::INVALID));
    }
}
