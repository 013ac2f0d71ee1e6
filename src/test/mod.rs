//! Helper functions for unit tests

use crate::{address::Address, config::MachineOptions, utils::io::push_le};

// Machine options small enough to exhaust in a test
pub fn options<A: Address>() -> MachineOptions<A> {
    MachineOptions::default()
        .with_memory_max(64 << 20)
        .with_stack_size(1 << 20)
}

// A minimal ELF64 RISC-V executable with one R+X PT_LOAD segment holding `code` at `vaddr`,
// which is also the entry point. There are no sections or symbols.
pub fn riscv_elf(vaddr: u64, code: &[u8], flags: u32) -> Vec<u8> {
    const EHDR_SIZE: u16 = 64;
    const PHDR_SIZE: u16 = 56;

    let mut elf = Vec::with_capacity(usize::from(EHDR_SIZE + PHDR_SIZE) + code.len());

    // e_ident: magic, ELFCLASS64, little-endian, version 1, System V ABI
    elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    elf.extend_from_slice(&[0; 8]);
    push_le(&mut elf, 2u16); // ET_EXEC
    push_le(&mut elf, 243u16); // EM_RISCV
    push_le(&mut elf, 1u32);
    push_le(&mut elf, vaddr);
    push_le(&mut elf, u64::from(EHDR_SIZE)); // e_phoff
    push_le(&mut elf, 0u64); // e_shoff
    push_le(&mut elf, flags);
    push_le(&mut elf, EHDR_SIZE);
    push_le(&mut elf, PHDR_SIZE);
    push_le(&mut elf, 1u16); // e_phnum
    push_le(&mut elf, 64u16);
    push_le(&mut elf, 0u16);
    push_le(&mut elf, 0u16);

    let offset = u64::from(EHDR_SIZE + PHDR_SIZE);
    push_le(&mut elf, 1u32); // PT_LOAD
    push_le(&mut elf, 0x5u32); // R+X
    push_le(&mut elf, offset);
    push_le(&mut elf, vaddr);
    push_le(&mut elf, vaddr);
    push_le(&mut elf, code.len() as u64);
    push_le(&mut elf, code.len() as u64);
    push_le(&mut elf, 0x1000u64);

    elf.extend_from_slice(code);
    elf
}

#[test]
fn riscv_elf_layout() {
    let elf = riscv_elf(0x1_0000, &[1, 2, 3, 4], 0);
    assert_eq!(elf.len(), 64 + 56 + 4);
    assert_eq!(&elf[120..], &[1, 2, 3, 4]);
}
