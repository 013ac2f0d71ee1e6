//! Base integer instruction handlers.
//!
//! [`decode`] maps an instruction to the handler implementing it. Handlers receive the whole
//! machine and the instruction bits; a handler that redirects control flow calls
//! [`crate::cpu::Cpu::jump`], every other handler leaves the program counter alone and the
//! dispatcher advances it past the instruction.
//!
//! RV32I/RV64I, the M extension and the address-generation and sign-extension subsets of
//! Zba/Zbb/Zbs are implemented. Other valid encodings (floating point, atomics, vectors,
//! CSRs, compressed instructions) resolve to a handler raising
//! [`Error::UnimplementedInstruction`].

use crate::{
    address::Address,
    cpu::{REG_A7, REG_RA},
    decoder::{opcode, Instruction, InstructionHandler},
    machine::Machine,
    Error, Result,
};

/// The handler for encodings that are not instructions. Always registry index 0.
#[must_use]
pub fn illegal_handler<A: Address>() -> InstructionHandler<A> {
    InstructionHandler::new("ILLEGAL", illegal::<A>)
}

/// Resolves the handler implementing `instr`.
#[must_use]
pub fn decode<A: Address>(instr: Instruction) -> InstructionHandler<A> {
    if instr.is_compressed() {
        return if instr.half() == 0 {
            illegal_handler()
        } else {
            InstructionHandler::new("COMPRESSED", unimplemented::<A>)
        };
    }

    match instr.opcode() {
        opcode::LOAD => InstructionHandler::new("LOAD", load::<A>),
        opcode::STORE => InstructionHandler::new("STORE", store::<A>),
        opcode::BRANCH => InstructionHandler::new("BRANCH", branch::<A>),
        opcode::LUI => InstructionHandler::new("LUI", lui::<A>),
        opcode::AUIPC => InstructionHandler::new("AUIPC", auipc::<A>),
        opcode::JAL => InstructionHandler::new("JAL", jal::<A>),
        opcode::JALR if instr.funct3() == 0 => InstructionHandler::new("JALR", jalr::<A>),
        opcode::OP_IMM => InstructionHandler::new("OP_IMM", op_imm::<A>),
        opcode::OP => InstructionHandler::new("OP", op::<A>),
        opcode::OP_IMM32 if A::is_64() => InstructionHandler::new("OP_IMM32", op_imm32::<A>),
        opcode::OP32 if A::is_64() => InstructionHandler::new("OP32", op32::<A>),
        opcode::FENCE => InstructionHandler::new("FENCE", fence::<A>),
        opcode::SYSTEM => match (instr.funct3(), instr.i_imm_raw()) {
            (0, 0) => InstructionHandler::new("ECALL", ecall::<A>),
            (0, 1) => InstructionHandler::new("EBREAK", ebreak::<A>),
            (0, 0x105 | 0x7ff) => InstructionHandler::new("STOP", stop::<A>),
            _ => InstructionHandler::new("SYSTEM", unimplemented::<A>),
        },
        opcode::LOAD_FP
        | opcode::STORE_FP
        | opcode::ATOMIC
        | opcode::FMADD
        | opcode::FMSUB
        | opcode::FNMSUB
        | opcode::FNMADD
        | opcode::FP_FUNC
        | opcode::VECTOR => InstructionHandler::new("UNIMPLEMENTED", unimplemented::<A>),
        _ => illegal_handler(),
    }
}

#[inline]
fn signed<A: Address>(value: u64) -> i64 {
    A::from_u64(value).to_i64()
}

#[inline]
#[allow(clippy::cast_sign_loss)]
fn imm<A: Address>(value: i32) -> u64 {
    A::wrap(i64::from(value) as u64)
}

#[inline]
#[allow(clippy::cast_sign_loss)]
fn sext32(value: u64) -> u64 {
    i64::from(value as u32 as i32) as u64
}

#[inline]
fn shamt<A: Address>(value: u64) -> u32 {
    (value & u64::from(A::BITS - 1)) as u32
}

fn illegal<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    Err(Error::IllegalOpcode {
        instr: instr.whole(),
        pc: machine.cpu.pc(),
    })
}

fn unimplemented<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    Err(Error::UnimplementedInstruction {
        instr: instr.whole(),
        pc: machine.cpu.pc(),
    })
}

#[allow(clippy::cast_sign_loss)]
fn load<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    let addr = machine
        .cpu
        .reg(instr.rs1())
        .wrapping_add(imm::<A>(instr.i_imm()));
    let value = match instr.funct3() {
        0x0 => i64::from(machine.memory.read::<i8>(addr)?) as u64,
        0x1 => i64::from(machine.memory.read::<i16>(addr)?) as u64,
        0x2 => i64::from(machine.memory.read::<i32>(addr)?) as u64,
        0x3 if A::is_64() => machine.memory.read::<u64>(addr)?,
        0x4 => u64::from(machine.memory.read::<u8>(addr)?),
        0x5 => u64::from(machine.memory.read::<u16>(addr)?),
        0x6 if A::is_64() => u64::from(machine.memory.read::<u32>(addr)?),
        _ => return illegal(machine, instr),
    };
    machine.cpu.set_reg(instr.rd(), value);
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn store<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    let addr = machine
        .cpu
        .reg(instr.rs1())
        .wrapping_add(imm::<A>(instr.s_imm()));
    let value = machine.cpu.reg(instr.rs2());
    match instr.funct3() {
        0x0 => machine.memory.write::<u8>(addr, value as u8),
        0x1 => machine.memory.write::<u16>(addr, value as u16),
        0x2 => machine.memory.write::<u32>(addr, value as u32),
        0x3 if A::is_64() => machine.memory.write::<u64>(addr, value),
        _ => illegal(machine, instr),
    }
}

fn branch<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    let a = machine.cpu.reg(instr.rs1());
    let b = machine.cpu.reg(instr.rs2());
    let taken = match instr.funct3() {
        0x0 => a == b,
        0x1 => a != b,
        0x4 => signed::<A>(a) < signed::<A>(b),
        0x5 => signed::<A>(a) >= signed::<A>(b),
        0x6 => a < b,
        0x7 => a >= b,
        _ => return illegal(machine, instr),
    };
    if taken {
        let target = machine.cpu.pc().wrapping_add(imm::<A>(instr.b_imm()));
        machine.cpu.jump(target);
    }
    Ok(())
}

fn lui<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    machine.cpu.set_reg(instr.rd(), imm::<A>(instr.u_imm()));
    Ok(())
}

fn auipc<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    let value = machine.cpu.pc().wrapping_add(imm::<A>(instr.u_imm()));
    machine.cpu.set_reg(instr.rd(), value);
    Ok(())
}

fn jal<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    let pc = machine.cpu.pc();
    machine
        .cpu
        .set_reg(instr.rd(), pc.wrapping_add(instr.length() as u64));
    machine.cpu.jump(pc.wrapping_add(imm::<A>(instr.j_imm())));
    Ok(())
}

fn jalr<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    let pc = machine.cpu.pc();
    let target = machine
        .cpu
        .reg(instr.rs1())
        .wrapping_add(imm::<A>(instr.i_imm()))
        & !1;
    machine
        .cpu
        .set_reg(instr.rd(), pc.wrapping_add(instr.length() as u64));
    machine.cpu.jump(target);
    Ok(())
}

#[allow(clippy::cast_sign_loss)]
fn op_imm<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    let src = machine.cpu.reg(instr.rs1());
    let imm = imm::<A>(instr.i_imm());
    let value = match instr.funct3() {
        0x0 => src.wrapping_add(imm),
        0x1 => match (instr.i_high_bits(), instr.i_imm_raw()) {
            (0x0, _) => src << shamt::<A>(imm),
            (_, 0b0110_0000_0100) => i64::from(src as i8) as u64,
            (_, 0b0110_0000_0101) => i64::from(src as i16) as u64,
            (0x280, _) => src | (1 << shamt::<A>(imm)),
            _ => return unimplemented(machine, instr),
        },
        0x2 => u64::from(signed::<A>(src) < signed::<A>(imm)),
        0x3 => u64::from(src < imm),
        0x4 => src ^ imm,
        0x5 => match instr.i_high_bits() {
            0x0 => src >> shamt::<A>(imm),
            0x400 => (signed::<A>(src) >> shamt::<A>(imm)) as u64,
            0x480 => (src >> shamt::<A>(imm)) & 1,
            _ => return unimplemented(machine, instr),
        },
        0x6 => src | imm,
        _ => src & imm,
    };
    machine.cpu.set_reg(instr.rd(), value);
    Ok(())
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn mulh<A: Address>(a: i128, b: i128) -> u64 {
    ((a * b) >> A::BITS) as u64
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn op<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    let a = machine.cpu.reg(instr.rs1());
    let b = machine.cpu.reg(instr.rs2());
    let (sa, sb) = (signed::<A>(a), signed::<A>(b));
    let value = match instr.r_op() {
        0x0 => a.wrapping_add(b),
        0x200 => a.wrapping_sub(b),
        0x1 => a << shamt::<A>(b),
        0x2 => u64::from(sa < sb),
        0x3 => u64::from(a < b),
        0x4 => a ^ b,
        0x5 => a >> shamt::<A>(b),
        0x205 => (sa >> shamt::<A>(b)) as u64,
        0x6 => a | b,
        0x7 => a & b,
        // M extension
        0x10 => a.wrapping_mul(b),
        0x11 => mulh::<A>(i128::from(sa), i128::from(sb)),
        0x12 => mulh::<A>(i128::from(sa), i128::from(b)),
        0x13 => ((u128::from(a) * u128::from(b)) >> A::BITS) as u64,
        0x14 => match (sa, sb) {
            (_, 0) => u64::MAX,
            (_, -1) => sa.wrapping_neg() as u64,
            _ => (sa / sb) as u64,
        },
        0x15 => a.checked_div(b).unwrap_or(u64::MAX),
        0x16 => match (sa, sb) {
            (_, 0) => a,
            (_, -1) => 0,
            _ => (sa % sb) as u64,
        },
        0x17 => a.checked_rem(b).unwrap_or(a),
        // Zba/Zbb
        0x44 if !A::is_64() => a & 0xFFFF,
        0x102 => b.wrapping_add(a << 1),
        0x104 => b.wrapping_add(a << 2),
        0x106 => b.wrapping_add(a << 3),
        _ => return unimplemented(machine, instr),
    };
    machine.cpu.set_reg(instr.rd(), value);
    Ok(())
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn op_imm32<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    let src = machine.cpu.reg(instr.rs1());
    let shift = instr.i_imm_raw() & 0x1f;
    let value = match instr.funct3() {
        0x0 => sext32(src.wrapping_add(imm::<A>(instr.i_imm()))),
        0x1 if instr.i_high_bits() == 0 => sext32(src << shift),
        0x5 if instr.i_high_bits() == 0 => sext32(u64::from((src as u32) >> shift)),
        0x5 if instr.is_srai() => i64::from((src as u32 as i32) >> shift) as u64,
        _ => return unimplemented(machine, instr),
    };
    machine.cpu.set_reg(instr.rd(), value);
    Ok(())
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn op32<A: Address>(machine: &mut Machine<A>, instr: Instruction) -> Result<()> {
    let a = machine.cpu.reg(instr.rs1());
    let b = machine.cpu.reg(instr.rs2());
    let (wa, wb) = (a as u32, b as u32);
    let (sa, sb) = (wa as i32, wb as i32);
    let shift = wb & 0x1f;
    let value = match instr.r_op() {
        0x0 => sext32(u64::from(wa.wrapping_add(wb))),
        0x200 => sext32(u64::from(wa.wrapping_sub(wb))),
        0x1 => sext32(u64::from(wa << shift)),
        0x5 => sext32(u64::from(wa >> shift)),
        0x205 => i64::from(sa >> shift) as u64,
        0x10 => sext32(u64::from(wa.wrapping_mul(wb))),
        0x14 => match sb {
            0 => u64::MAX,
            _ => i64::from(sa.wrapping_div(sb)) as u64,
        },
        0x15 => sext32(u64::from(wa.checked_div(wb).unwrap_or(u32::MAX))),
        0x16 => match sb {
            0 => i64::from(sa) as u64,
            _ => i64::from(sa.wrapping_rem(sb)) as u64,
        },
        0x17 => sext32(u64::from(wa.checked_rem(wb).unwrap_or(wa))),
        0x40 => b.wrapping_add(u64::from(wa)),
        0x44 => a & 0xFFFF,
        _ => return unimplemented(machine, instr),
    };
    machine.cpu.set_reg(instr.rd(), value);
    Ok(())
}

fn fence<A: Address>(_machine: &mut Machine<A>, _instr: Instruction) -> Result<()> {
    Ok(())
}

fn ecall<A: Address>(machine: &mut Machine<A>, _instr: Instruction) -> Result<()> {
    let number = machine.cpu.reg(REG_A7);
    machine.system_call(number)
}

fn ebreak<A: Address>(machine: &mut Machine<A>, _instr: Instruction) -> Result<()> {
    machine.stop();
    Ok(())
}

fn stop<A: Address>(machine: &mut Machine<A>, _instr: Instruction) -> Result<()> {
    machine.stop();
    Ok(())
}

/// Links `ra` and jumps, the semantics of a call rewritten by the decoder.
pub(crate) fn fast_call<A: Address>(machine: &mut Machine<A>, offset: i32, len: usize) {
    let pc = machine.cpu.pc();
    machine.cpu.set_reg(REG_RA, pc.wrapping_add(len as u64));
    machine.cpu.jump(pc.wrapping_add(imm::<A>(offset)));
}

/// Jumps without linking.
pub(crate) fn fast_jump<A: Address>(machine: &mut Machine<A>, offset: i32) {
    let pc = machine.cpu.pc();
    machine.cpu.jump(pc.wrapping_add(imm::<A>(offset)));
}
