//! Decoded execute segments.
//!
//! A [`DecodedExecuteSegment`] holds a page-aligned copy of a range of executable guest
//! memory together with the decoder caches produced from it. The copy is padded with zeroes
//! before the first and after the last instruction so that a full 4-byte instruction can
//! always be read at any in-range address without a length check.
//!
//! Segments are immutable once decoded and are shared between machines through `Arc`. The only
//! state that changes afterwards is the `stale` flag (set when the CPU notices that guest memory
//! no longer matches the decoded bytes) and the `execute_only` flag set by the loader.

use std::{
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
};

use sha1::{Digest, Sha1};

use crate::{
    address::{Address, PAGE_MASK, PAGE_SIZE},
    decoder::{
        bytecode::Bytecode,
        data::{divisor, entries_per_page, DecoderCache, DecoderData},
        instruction::Instruction,
    },
    Result,
};

/// SHA-1 digest of a segment's instruction bytes.
pub type SegmentHash = [u8; 20];

/// The key under which a segment is shared between machines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey {
    /// First address of the segment
    pub base: u64,
    /// Content hash of the instruction bytes
    pub hash: SegmentHash,
    /// Size of the memory arena of the machine that decoded it
    pub arena_size: u64,
}

impl SegmentKey {
    /// The key of `segment` for a machine with the given arena size.
    #[must_use]
    pub fn from_segment<A: Address>(segment: &DecodedExecuteSegment<A>, arena_size: u64) -> Self {
        SegmentKey {
            base: segment.exec_begin(),
            hash: segment.hash(),
            arena_size,
        }
    }
}

/// A range of executable memory together with its decoder cache.
pub struct DecodedExecuteSegment<A: Address> {
    vaddr_begin: u64,
    vaddr_end: u64,
    pagedata_base: u64,
    pagedata: Vec<u8>,
    decoder: Vec<DecoderCache>,
    compressed: bool,
    hash: SegmentHash,
    execute_only: AtomicBool,
    likely_jit: bool,
    stale: AtomicBool,
    _address: PhantomData<A>,
}

impl<A: Address> fmt::Debug for DecodedExecuteSegment<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedExecuteSegment")
            .field("begin", &format_args!("{:#x}", self.vaddr_begin))
            .field("end", &format_args!("{:#x}", self.vaddr_end))
            .field("pagedata_base", &format_args!("{:#x}", self.pagedata_base))
            .field("decoder_pages", &self.decoder.len())
            .field("crc", &format_args!("{:#010x}", self.crc()))
            .field("execute_only", &self.is_execute_only())
            .field("likely_jit", &self.likely_jit)
            .field("stale", &self.is_stale())
            .finish()
    }
}

impl<A: Address> DecodedExecuteSegment<A> {
    /// Copies `data`, the instructions at `vaddr`, into a new zero-padded segment and hashes
    /// them. The decoder cache is empty until the segment is decoded.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidProgram`] if the length is not a multiple of the
    /// instruction granule or if the segment would wrap the address space.
    pub fn create(data: &[u8], vaddr: u64, compressed: bool) -> Result<Self> {
        let exlen = data.len();
        if exlen % divisor(compressed) != 0 {
            return Err(invalid_program!("Misaligned execute segment length", exlen));
        }

        let pbase = vaddr & !PAGE_MASK;
        #[allow(clippy::cast_possible_truncation)]
        let prelen = (vaddr - pbase) as usize;
        // Two extra bytes so a 4-byte read at the last half-word stays in range
        let midlen = exlen
            .checked_add(prelen + 2)
            .ok_or_else(|| invalid_program!("Segment virtual base was bogus", vaddr))?;
        let plen = midlen
            .checked_add(PAGE_SIZE - 1)
            .map(|len| len & !(PAGE_SIZE - 1))
            .ok_or_else(|| invalid_program!("Segment virtual base was bogus", vaddr))?;
        if prelen > plen || prelen + exlen > plen {
            return Err(invalid_program!("Segment virtual base was bogus", vaddr));
        }
        let Some(vaddr_end) = vaddr.checked_add(exlen as u64) else {
            return Err(invalid_program!("Segment virtual base was bogus", vaddr));
        };
        if pbase.checked_add(plen as u64).is_none() || A::from_u64(vaddr_end).to_u64() != vaddr_end
        {
            return Err(invalid_program!("Segment virtual base was bogus", vaddr));
        }

        let mut pagedata = vec![0u8; plen];
        pagedata[prelen..prelen + exlen].copy_from_slice(data);
        let hash: SegmentHash = Sha1::digest(data).into();

        Ok(DecodedExecuteSegment {
            vaddr_begin: vaddr,
            vaddr_end,
            pagedata_base: pbase,
            pagedata,
            decoder: Vec::new(),
            compressed,
            hash,
            execute_only: AtomicBool::new(false),
            likely_jit: false,
            stale: AtomicBool::new(false),
            _address: PhantomData,
        })
    }

    /// First address of the decoded range.
    #[must_use]
    pub fn exec_begin(&self) -> u64 {
        self.vaddr_begin
    }

    /// One past the last address of the decoded range.
    #[must_use]
    pub fn exec_end(&self) -> u64 {
        self.vaddr_end
    }

    /// Page-aligned address of the first byte of the stored copy.
    #[must_use]
    pub fn pagedata_base(&self) -> u64 {
        self.pagedata_base
    }

    /// Returns `true` if `[addr, addr + len)` lies inside the decoded range.
    #[must_use]
    pub fn is_within(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.vaddr_begin && end <= self.vaddr_end,
            None => false,
        }
    }

    /// Returns `true` if the segment was decoded for compressed instructions.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// The stored bytes from `pc` to the end of the copy.
    #[must_use]
    pub fn exec_data(&self, pc: u64) -> Option<&[u8]> {
        let offset = usize::try_from(pc.checked_sub(self.pagedata_base)?).ok()?;
        self.pagedata.get(offset..)
    }

    /// The whole stored copy, starting at [`Self::pagedata_base`].
    #[must_use]
    pub fn pagedata(&self) -> &[u8] {
        &self.pagedata
    }

    /// Reads the instruction at `pc` from the stored copy.
    ///
    /// Segments decoded without compressed instructions always read a whole word. The upper
    /// half of a 4-byte instruction is read as zero when it would extend past `end`.
    #[must_use]
    pub fn read_instruction(&self, pc: u64, end: u64) -> Instruction {
        let half = |addr: u64| -> u32 {
            self.exec_data(addr)
                .and_then(|bytes| bytes.get(..2))
                .map_or(0, |b| u32::from(u16::from_le_bytes([b[0], b[1]])))
        };

        let lo = half(pc);
        if self.compressed && lo & 0x3 != 0x3 {
            return Instruction(lo);
        }
        let hi = match pc.checked_add(4) {
            Some(next) if next <= end => half(pc + 2),
            _ => 0,
        };
        Instruction(lo | (hi << 16))
    }

    /// Decoder cache index of `pc`, split into page and entry.
    fn entry_index(&self, pc: u64) -> Option<(usize, usize)> {
        let offset = usize::try_from(pc.checked_sub(self.pagedata_base)?).ok()?;
        if offset % divisor(self.compressed) != 0 {
            return None;
        }
        let idx = offset / divisor(self.compressed);
        let per_page = entries_per_page(self.compressed);
        Some((idx / per_page, idx % per_page))
    }

    /// The decoder entry of `pc`.
    #[must_use]
    pub fn decoder_entry(&self, pc: u64) -> Option<&DecoderData> {
        let (page, entry) = self.entry_index(pc)?;
        self.decoder.get(page)?.get(entry)
    }

    pub(crate) fn decoder_entry_mut(&mut self, pc: u64) -> Option<&mut DecoderData> {
        let (page, entry) = self.entry_index(pc)?;
        self.decoder.get_mut(page)?.get_mut(entry)
    }

    /// The decoder cache pages.
    #[must_use]
    pub fn decoder_caches(&self) -> &[DecoderCache] {
        &self.decoder
    }

    pub(crate) fn create_decoder_cache(&mut self, pages: usize) {
        self.decoder = vec![DecoderCache::new(self.compressed); pages];
    }

    /// Approximate heap usage of the segment.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.pagedata.len()
            + self.decoder.len() * std::mem::size_of::<DecoderData>() * entries_per_page(self.compressed)
    }

    /// Returns `true` if the segment holds no bytes.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.pagedata.is_empty()
    }

    /// SHA-1 of the instruction bytes.
    #[must_use]
    pub fn hash(&self) -> SegmentHash {
        self.hash
    }

    /// The first four bytes of the content hash as an integer, for display.
    #[must_use]
    pub fn crc(&self) -> u32 {
        u32::from_le_bytes([self.hash[0], self.hash[1], self.hash[2], self.hash[3]])
    }

    /// Returns `true` if the segment's pages were neither readable nor writable.
    #[must_use]
    pub fn is_execute_only(&self) -> bool {
        self.execute_only.load(Ordering::Relaxed)
    }

    /// Marks the segment as execute-only.
    pub fn set_execute_only(&self, execute_only: bool) {
        self.execute_only.store(execute_only, Ordering::Relaxed);
    }

    /// Returns `true` if the segment was created from writable memory.
    #[must_use]
    pub fn is_likely_jit(&self) -> bool {
        self.likely_jit
    }

    pub(crate) fn set_likely_jit(&mut self, likely_jit: bool) {
        self.likely_jit = likely_jit;
    }

    /// Returns `true` once guest memory was found to differ from the decoded bytes.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Marks the segment as stale. A stale segment is evicted on next use.
    pub fn set_stale(&self, stale: bool) {
        self.stale.store(stale, Ordering::Release);
    }

    /// Rewrites `bytecode` for threaded dispatch of the instruction at `pc`.
    ///
    /// Branches and jumps are checked against the segment bounds, so the dispatcher can
    /// follow them without re-validating the target. `instr` is updated in place where the
    /// rewritten bytecode expects a different payload.
    #[must_use]
    pub fn threaded_rewrite(&self, bytecode: Bytecode, pc: u64, instr: &mut u32) -> Bytecode {
        let pc_align = divisor(self.compressed) as u64;
        let original = Instruction(*instr);

        if bytecode.is_rv64_only() && !A::is_64() {
            return Bytecode::Invalid;
        }

        match bytecode {
            Bytecode::Beq
            | Bytecode::Bne
            | Bytecode::Blt
            | Bytecode::Bge
            | Bytecode::Bltu
            | Bytecode::Bgeu => {
                let imm = original.b_imm();
                let target = pc.checked_add_signed(i64::from(imm));
                match target {
                    Some(addr) if self.is_within(addr, 4) && addr % pc_align == 0 => {}
                    _ => return Bytecode::Invalid,
                }

                // Forward branches can skip the instruction counter check
                match bytecode {
                    Bytecode::Beq if imm > 0 => Bytecode::BeqFw,
                    Bytecode::Bne if imm > 0 => Bytecode::BneFw,
                    _ => bytecode,
                }
            }
            Bytecode::Jal => {
                let diff = original.j_imm();
                let Some(addr) = pc.checked_add_signed(i64::from(diff)) else {
                    return Bytecode::Invalid;
                };
                if !self.is_within(addr, 4) || addr % pc_align != 0 {
                    return Bytecode::Invalid;
                }

                match original.rd() {
                    0 => {
                        *instr = diff as u32;
                        Bytecode::FastJal
                    }
                    1 => {
                        *instr = diff as u32;
                        Bytecode::FastCall
                    }
                    _ => bytecode,
                }
            }
            _ => bytecode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_padding() {
        let code = [0x13, 0x05, 0xa0, 0x29]; // li a0, 666
        let segment = DecodedExecuteSegment::<u64>::create(&code, 0x1ffc, true).unwrap();
        assert_eq!(segment.exec_begin(), 0x1ffc);
        assert_eq!(segment.exec_end(), 0x2000);
        assert_eq!(segment.pagedata_base(), 0x1000);
        // 4092 bytes of prologue + 4 bytes of code + 2 spare bytes spill into a second page
        assert_eq!(segment.pagedata().len(), 2 * PAGE_SIZE);
        assert_eq!(segment.exec_data(0x1ffc).unwrap()[..4], code);
        assert!(segment.pagedata()[..0xffc].iter().all(|b| *b == 0));
        assert_eq!(segment.read_instruction(0x1ffc, 0x2000).whole(), 0x29a0_0513);
    }

    #[test]
    fn test_misaligned_length() {
        let err = DecodedExecuteSegment::<u64>::create(&[0x01], 0x1000, true).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidProgram { .. }));
        assert!(DecodedExecuteSegment::<u64>::create(&[0x01, 0x00], 0x1000, false).is_err());
        assert!(DecodedExecuteSegment::<u64>::create(&[0x01, 0x00], 0x1000, true).is_ok());
    }

    #[test]
    fn test_bogus_base() {
        assert!(DecodedExecuteSegment::<u64>::create(&[0; 8], u64::MAX - 3, true).is_err());
        assert!(DecodedExecuteSegment::<u32>::create(&[0; 8], 0xffff_fffc, true).is_err());
    }

    #[test]
    fn test_is_within() {
        let segment = DecodedExecuteSegment::<u64>::create(&[0; 16], 0x1000, true).unwrap();
        assert!(segment.is_within(0x1000, 4));
        assert!(segment.is_within(0x100c, 4));
        assert!(!segment.is_within(0x100e, 4));
        assert!(!segment.is_within(0xffe, 2));
        assert!(!segment.is_within(u64::MAX, 4));
    }

    #[test]
    fn test_hash_depends_on_content() {
        let a = DecodedExecuteSegment::<u64>::create(&[1, 0, 0, 0], 0x1000, true).unwrap();
        let b = DecodedExecuteSegment::<u64>::create(&[1, 0, 0, 0], 0x2000, true).unwrap();
        let c = DecodedExecuteSegment::<u64>::create(&[2, 0, 0, 0], 0x1000, true).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_ne!(SegmentKey::from_segment(&a, 0), SegmentKey::from_segment(&b, 0));
        assert_ne!(SegmentKey::from_segment(&a, 0), SegmentKey::from_segment(&a, 4096));
    }

    #[test]
    fn test_branch_rewrites() {
        let segment = DecodedExecuteSegment::<u64>::create(&[0; 32], 0x1000, true).unwrap();

        // beq a0, a1, +8 stays inside and becomes a forward branch
        let mut instr = 0x00b5_0463;
        assert_eq!(
            segment.threaded_rewrite(Bytecode::Beq, 0x1000, &mut instr),
            Bytecode::BeqFw
        );
        assert_eq!(instr, 0x00b5_0463);

        // The same branch at the end jumps outside
        let mut instr = 0x00b5_0463;
        assert_eq!(
            segment.threaded_rewrite(Bytecode::Beq, 0x101c, &mut instr),
            Bytecode::Invalid
        );
    }

    #[test]
    fn test_jal_rewrites() {
        let segment = DecodedExecuteSegment::<u64>::create(&[0; 32], 0x1000, true).unwrap();

        // j -4
        let mut instr = 0xffdf_f06f;
        assert_eq!(
            segment.threaded_rewrite(Bytecode::Jal, 0x1004, &mut instr),
            Bytecode::FastJal
        );
        assert_eq!(instr as i32, -4);

        // jal ra, -4
        let mut instr = 0xffdf_f0ef;
        assert_eq!(
            segment.threaded_rewrite(Bytecode::Jal, 0x1004, &mut instr),
            Bytecode::FastCall
        );

        // jal t0, -4 keeps its encoding
        let mut instr = 0xffdf_f2ef;
        assert_eq!(
            segment.threaded_rewrite(Bytecode::Jal, 0x1004, &mut instr),
            Bytecode::Jal
        );
        assert_eq!(instr, 0xffdf_f2ef);

        // Leaving the segment
        let mut instr = 0xffdf_f06f;
        assert_eq!(
            segment.threaded_rewrite(Bytecode::Jal, 0x1000, &mut instr),
            Bytecode::Invalid
        );
    }

    #[test]
    fn test_rv64_only_on_rv32() {
        let segment = DecodedExecuteSegment::<u32>::create(&[0; 16], 0x1000, true).unwrap();
        let mut instr = 0x0015_051b;
        assert_eq!(
            segment.threaded_rewrite(Bytecode::Addiw, 0x1000, &mut instr),
            Bytecode::Invalid
        );
        let mut instr = 0x0005_b503;
        assert_eq!(
            segment.threaded_rewrite(Bytecode::Ldd, 0x1000, &mut instr),
            Bytecode::Invalid
        );
    }

    #[test]
    fn test_flags() {
        let segment = DecodedExecuteSegment::<u64>::create(&[0; 4], 0x1000, true).unwrap();
        assert!(!segment.is_stale());
        segment.set_stale(true);
        assert!(segment.is_stale());
        segment.set_execute_only(true);
        assert!(segment.is_execute_only());
        assert!(!segment.is_likely_jit());
    }
}
