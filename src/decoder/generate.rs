//! Decoder cache generation.
//!
//! Generation is a pure function of the segment bytes, its address, the instruction width
//! mode and the handler registry. Two machines decoding the same bytes at the same address
//! against the same registry always produce identical entries, which is what makes sharing
//! decoded segments between machines sound.
//!
//! The process has two passes:
//!
//! 1. **Entries** - every granule between `exec_begin` and `exec_end` receives its bytecode,
//!    its threaded rewrite and its handler index. With compressed instructions enabled the
//!    granules that fall in the middle of a 4-byte instruction are made invalid so a jump into
//!    them traps instead of executing garbage.
//! 2. **Blocks** - [`realize_fastsim`] measures straight-line blocks so the dispatcher can
//!    account instructions per block instead of per instruction.
//!
//! The decoder covers one entry past `exec_end`, which is always invalid. Branch handlers do
//! not need to re-check the program counter after falling through.

use tracing::trace;

use crate::{
    address::{page_round_up, Address, PAGE_SIZE},
    decoder::{
        bytecode::{computed_index_for, Bytecode},
        data::{divisor, DecoderData},
        handlers::HandlerRegistry,
        instruction::{opcode, Instruction},
        segment::DecodedExecuteSegment,
    },
    Result,
};

/// Maximum number of half-words in a compressed block.
const MAX_COMPRESSED_BLOCK: u64 = 255;

/// Maximum number of instructions in a fixed-width block.
const MAX_FIXED_BLOCK: u32 = 65535;

/// Fills the decoder cache of `exec`.
///
/// # Errors
/// Returns [`crate::Error::InvalidProgram`] if the segment range is invalid, if the registry
/// does not map the illegal instruction to index 0, or if the instruction stream violates the
/// block limits.
pub fn generate_decoder_cache<A: Address>(
    exec: &mut DecodedExecuteSegment<A>,
    registry: &HandlerRegistry<A>,
) -> Result<()> {
    if exec.exec_end() < exec.exec_begin() {
        return Err(invalid_program!(
            "Execute segment was invalid",
            exec.exec_begin()
        ));
    }

    let compressed = exec.is_compressed();
    let pbase = exec.pagedata_base();
    let addr = exec.exec_begin();
    let end_addr = exec.exec_end();
    let len = end_addr - addr;

    // One more entry than there are instructions
    let midlen = len + (addr - pbase) + 4;
    let plen = page_round_up(midlen)
        .ok_or_else(|| invalid_program!("Execute segment was invalid", addr))?;
    #[allow(clippy::cast_possible_truncation)]
    let n_pages = (plen / PAGE_SIZE as u64) as usize;
    if n_pages == 0 {
        return Err(invalid_program!("Program produced empty decoder cache", addr));
    }
    exec.create_decoder_cache(n_pages);

    let invalid = registry.index_of_instruction(Instruction(0))?;
    if invalid != 0 {
        return Err(invalid_program!(
            "The invalid instruction did not have the index zero",
            invalid
        ));
    }

    let step = divisor(compressed) as u64;
    let mut was_full_instruction = true;
    let mut dst = addr;
    while dst < end_addr {
        let instruction = exec.read_instruction(dst, end_addr);

        let entry = if !compressed || was_full_instruction {
            decode_entry(exec, registry, instruction, dst)?
        } else {
            // The second half of a 4-byte instruction must never be a valid jump target
            DecoderData {
                instr: instruction.whole(),
                ..DecoderData::INVALID
            }
        };
        *entry_mut(exec, dst)? = entry;

        if compressed {
            was_full_instruction = !was_full_instruction || instruction.length() == 2;
        }
        dst += step;
    }

    *entry_mut(exec, end_addr)? = DecoderData::INVALID;

    realize_fastsim(exec, addr, dst)?;
    trace!(
        "Decoded {:#x}..{:#x} into {} decoder pages",
        addr,
        end_addr,
        n_pages
    );
    Ok(())
}

fn decode_entry<A: Address>(
    exec: &DecodedExecuteSegment<A>,
    registry: &HandlerRegistry<A>,
    instruction: Instruction,
    pc: u64,
) -> Result<DecoderData> {
    // 16-bit encodings are not instructions on fixed-width machines
    if !exec.is_compressed() && instruction.is_compressed() {
        return Ok(DecoderData {
            instr: instruction.whole(),
            ..DecoderData::INVALID
        });
    }

    let bytecode = computed_index_for(instruction, A::is_64());
    let mut bits = instruction.whole();
    let bytecode = exec.threaded_rewrite(bytecode, pc, &mut bits);
    let handler = if bytecode == Bytecode::Invalid {
        0
    } else {
        registry.index_of_instruction(instruction)?
    };
    Ok(DecoderData::new(bytecode, handler, bits))
}

fn entry_mut<A: Address>(exec: &mut DecodedExecuteSegment<A>, pc: u64) -> Result<&mut DecoderData> {
    exec.decoder_entry_mut(pc)
        .ok_or_else(|| invalid_program!("Decoder entry outside of the decoder cache", pc))
}

/// Computes block lengths for every entry in `[base_pc, last_pc)`.
///
/// # Errors
/// Returns [`crate::Error::InvalidProgram`] if the range is empty or misaligned, if the
/// program counter overflows, or if a block grows past its limit.
pub fn realize_fastsim<A: Address>(
    exec: &mut DecodedExecuteSegment<A>,
    base_pc: u64,
    last_pc: u64,
) -> Result<()> {
    if exec.is_compressed() {
        realize_compressed(exec, base_pc, last_pc)
    } else {
        realize_fixed(exec, base_pc, last_pc)
    }
}

/// An entry of the block being measured: its address and its length in half-words.
type BlockEntry = (u64, u64);

fn realize_compressed<A: Address>(
    exec: &mut DecodedExecuteSegment<A>,
    base_pc: u64,
    last_pc: u64,
) -> Result<()> {
    if base_pc >= last_pc {
        return Err(invalid_program!(
            "The execute segment has an overflow",
            base_pc
        ));
    }
    if base_pc & 0x1 != 0 {
        return Err(invalid_program!("The execute segment is misaligned", base_pc));
    }

    let mut block: Vec<BlockEntry> = Vec::with_capacity(MAX_COMPRESSED_BLOCK as usize + 1);
    let mut pc = base_pc;
    while pc < last_pc {
        block.clear();
        let block_pc = pc;

        loop {
            let entry_pc = pc;
            let instruction = exec.read_instruction(entry_pc, last_pc);
            let length = instruction.length() as u64;
            block.push((entry_pc, length >> 1));

            pc = pc.checked_add(length).ok_or_else(|| {
                invalid_program!("PC overflow during execute segment decoding", entry_pc)
            })?;

            // Crossing the end means the last instruction is truncated
            if pc > last_pc {
                entry_mut(exec, entry_pc)?.invalidate();
                break;
            }

            if instruction.ends_block(A::is_64()) {
                break;
            }

            // The final instruction should have ended the block, so force an end here
            if pc >= last_pc {
                entry_mut(exec, entry_pc)?.invalidate();
                break;
            }

            // Long runs without control flow end in a block-ending fallback entry
            if (pc - block_pc) >> 1 >= MAX_COMPRESSED_BLOCK {
                let entry = entry_mut(exec, entry_pc)?;
                entry.set_bytecode(Bytecode::Funcblock);
                entry.set_invalid_handler();
                entry.instr = instruction.whole();
                break;
            }
        }

        fill_entries(exec, &block, block_pc, pc)?;
    }
    Ok(())
}

fn fill_entries<A: Address>(
    exec: &mut DecodedExecuteSegment<A>,
    block: &[BlockEntry],
    block_pc: u64,
    current_pc: u64,
) -> Result<()> {
    let Some(&(_, last_count)) = block.last() else {
        return Err(invalid_program!(
            "Encountered empty block after measuring",
            block_pc
        ));
    };

    let total = (current_pc - block_pc) >> 1;
    let mut count = total.saturating_sub(last_count);
    if count > MAX_COMPRESSED_BLOCK {
        return Err(invalid_program!(
            "Too many non-branching instructions in a row",
            block_pc
        ));
    }

    let n = block.len();
    for (i, &(entry_pc, length)) in block.iter().enumerate() {
        let entry = entry_mut(exec, entry_pc)?;
        // Ends at the instruction before the last PC
        #[allow(clippy::cast_possible_truncation)]
        {
            entry.set_idxend(true, count as u16);
            entry.set_icount((n - i) as u8);
        }
        count = count.saturating_sub(length);
    }
    Ok(())
}

fn realize_fixed<A: Address>(
    exec: &mut DecodedExecuteSegment<A>,
    base_pc: u64,
    last_pc: u64,
) -> Result<()> {
    let mut idxend: u32 = 0;
    let mut cursor = last_pc.checked_sub(4);

    while let Some(pc) = cursor {
        if pc < base_pc || pc >= last_pc {
            break;
        }

        let instruction = exec.read_instruction(pc, last_pc);
        if matches!(
            instruction.opcode(),
            opcode::BRANCH | opcode::SYSTEM | opcode::JAL | opcode::JALR
        ) {
            idxend = 0;
        }

        let entry = entry_mut(exec, pc)?;
        if idxend == MAX_FIXED_BLOCK {
            entry.set_bytecode(Bytecode::Funcblock);
            entry.set_invalid_handler();
            entry.instr = instruction.whole();
            idxend = 0;
        }

        #[allow(clippy::cast_possible_truncation)]
        entry.set_idxend(false, idxend as u16);
        idxend += 1;

        cursor = pc.checked_sub(4);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::data::DecoderCache;

    fn words(instrs: &[u32]) -> Vec<u8> {
        instrs.iter().flat_map(|i| i.to_le_bytes()).collect()
    }

    fn decode<A: Address>(code: &[u8], vaddr: u64, compressed: bool) -> DecodedExecuteSegment<A> {
        let registry = HandlerRegistry::<A>::new();
        let mut exec = DecodedExecuteSegment::<A>::create(code, vaddr, compressed).unwrap();
        generate_decoder_cache(&mut exec, &registry).unwrap();
        exec
    }

    #[test]
    fn test_straight_line_block() {
        // li a0, 1; li a1, 2; addi a0, a0, 3; ecall
        let code = words(&[0x0010_0513, 0x0020_0593, 0x0035_0513, 0x0000_0073]);
        let exec = decode::<u64>(&code, 0x1000, true);

        let first = exec.decoder_entry(0x1000).unwrap();
        assert_eq!(first.get_bytecode(), Bytecode::Li);
        // Three more instructions of 2 half-words each until the ecall
        assert_eq!(first.idxend(true), 6);
        assert_eq!(first.icount(), 4);
        assert_eq!(first.block_bytes(true), 12);

        let ecall = exec.decoder_entry(0x100c).unwrap();
        assert_eq!(ecall.get_bytecode(), Bytecode::Syscall);
        assert_eq!(ecall.idxend(true), 0);
        assert_eq!(ecall.icount(), 1);

        // Middle of a 4-byte instruction and the entry past the end are invalid
        assert_eq!(
            exec.decoder_entry(0x1002).unwrap().get_bytecode(),
            Bytecode::Invalid
        );
        assert_eq!(*exec.decoder_entry(0x1010).unwrap(), DecoderData::INVALID);
    }

    #[test]
    fn test_handlers_assigned() {
        let code = words(&[0x0010_0513, 0x0000_0013, 0x0000_0073]);
        let exec = decode::<u64>(&code, 0x1000, true);
        let li = exec.decoder_entry(0x1000).unwrap();
        let nop = exec.decoder_entry(0x1004).unwrap();
        assert!(!li.is_invalid_handler());
        assert_eq!(nop.get_bytecode(), Bytecode::Function);
        assert!(!nop.is_invalid_handler());
    }

    #[test]
    fn test_unterminated_block_ends_invalid() {
        // li a0, 1; li a1, 2 and then the segment ends
        let code = words(&[0x0010_0513, 0x0020_0593]);
        let exec = decode::<u64>(&code, 0x1000, true);
        assert_eq!(
            exec.decoder_entry(0x1004).unwrap().get_bytecode(),
            Bytecode::Invalid
        );
        assert_eq!(exec.decoder_entry(0x1000).unwrap().icount(), 2);
    }

    #[test]
    fn test_compressed_mix() {
        // c.li a0, 0; li a1, 2; c.jr ra
        let mut code = vec![0x01, 0x45];
        code.extend(words(&[0x0020_0593]));
        code.extend([0x82, 0x80]);
        let exec = decode::<u64>(&code, 0x1000, true);

        let first = exec.decoder_entry(0x1000).unwrap();
        assert_eq!(first.get_bytecode(), Bytecode::CLi);
        assert_eq!(first.idxend(true), 3);
        assert_eq!(first.icount(), 3);

        let second = exec.decoder_entry(0x1002).unwrap();
        assert_eq!(second.get_bytecode(), Bytecode::Li);
        assert_eq!(second.idxend(true), 2);
        assert_eq!(
            exec.decoder_entry(0x1004).unwrap().get_bytecode(),
            Bytecode::Invalid
        );
        assert_eq!(
            exec.decoder_entry(0x1006).unwrap().get_bytecode(),
            Bytecode::CJr
        );
    }

    #[test]
    fn test_long_block_becomes_funcblock() {
        // 200 non-branching 4-byte instructions followed by an ecall
        let mut instrs = vec![0x0015_0513; 200];
        instrs.push(0x0000_0073);
        let exec = decode::<u64>(&words(&instrs), 0x1000, true);

        // The block is cut after 128 instructions (256 half-words)
        let cut = 0x1000 + 127 * 4;
        let entry = exec.decoder_entry(cut).unwrap();
        assert_eq!(entry.get_bytecode(), Bytecode::Funcblock);
        assert!(entry.is_invalid_handler());
        assert_eq!(entry.instr, 0x0015_0513);
        assert_eq!(exec.decoder_entry(0x1000).unwrap().icount(), 128);

        // The next block starts right after
        assert_eq!(
            exec.decoder_entry(cut + 4).unwrap().get_bytecode(),
            Bytecode::Addi
        );
    }

    #[test]
    fn test_fixed_width_blocks() {
        let code = words(&[0x0010_0513, 0x0020_0593, 0x0000_0073, 0x0035_0513]);
        let exec = decode::<u64>(&code, 0x2000, false);
        assert_eq!(exec.decoder_caches()[0].len(), DecoderCache::new(false).len());

        assert_eq!(exec.decoder_entry(0x2000).unwrap().idxend(false), 2);
        assert_eq!(exec.decoder_entry(0x2000).unwrap().instruction_count(false), 3);
        assert_eq!(exec.decoder_entry(0x2008).unwrap().idxend(false), 0);
        assert_eq!(exec.decoder_entry(0x200c).unwrap().idxend(false), 0);
        // Fixed-width entries only exist on word boundaries
        assert!(exec.decoder_entry(0x2002).is_none());
    }

    #[test]
    fn test_fixed_width_rejects_compressed() {
        let code = [0x01, 0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x00];
        let exec = decode::<u64>(&code, 0x1000, false);
        assert_eq!(
            exec.decoder_entry(0x1000).unwrap().get_bytecode(),
            Bytecode::Invalid
        );
    }

    #[test]
    fn test_determinism() {
        let code = words(&[0x0010_0513, 0x00b5_0463, 0xffdf_f06f, 0x0000_0073]);
        let a = decode::<u64>(&code, 0x1000, true);
        let b = decode::<u64>(&code, 0x1000, true);
        assert_eq!(a.decoder_caches(), b.decoder_caches());
    }

    #[test]
    fn test_invalid_not_at_zero() {
        fn other(_: &mut crate::Machine<u64>, _: Instruction) -> Result<()> {
            Ok(())
        }

        let registry = HandlerRegistry::<u64>::empty();
        registry.register("other", other).unwrap();
        let mut exec = DecodedExecuteSegment::<u64>::create(&[0; 4], 0x1000, true).unwrap();
        let err = generate_decoder_cache(&mut exec, &registry).unwrap_err();
        assert!(err.to_string().contains("index zero"));
    }

    #[test]
    fn test_realize_errors() {
        let mut exec = DecodedExecuteSegment::<u64>::create(&[0; 8], 0x1000, true).unwrap();
        exec.create_decoder_cache(1);
        assert!(realize_fastsim(&mut exec, 0x1004, 0x1004).is_err());
        assert!(realize_fastsim(&mut exec, 0x1001, 0x1004).is_err());
    }
}
