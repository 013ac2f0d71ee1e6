//! Dispatch bytecodes and the instruction to bytecode mapping.
//!
//! Every decoder entry carries a [`Bytecode`] that the CPU dispatches on directly. Common
//! instructions get a dedicated bytecode; anything else maps to [`Bytecode::Function`] (or
//! [`Bytecode::CFunction`] for compressed encodings) and is executed through the handler
//! registry.

use strum::{EnumCount, EnumIter, FromRepr, IntoStaticStr};

use crate::decoder::instruction::{ci_code, opcode, Instruction};

/// A fast-dispatch bytecode. Fits in one byte.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, EnumCount, EnumIter, FromRepr, IntoStaticStr,
)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Bytecode {
    #[default]
    Invalid = 0,
    Addi,
    Li,
    Mv,

    Slli,
    Slti,
    Sltiu,
    Xori,
    Srli,
    Srai,
    Ori,
    Andi,

    Lui,
    Auipc,

    Ldb,
    Ldbu,
    Ldh,
    Ldhu,
    Ldw,

    Stb,
    Sth,
    Stw,

    Ldwu,
    Ldd,
    Std,

    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    BeqFw,
    BneFw,

    Jal,
    Jalr,
    FastJal,
    FastCall,

    OpAdd,
    OpSub,
    OpSll,
    OpSlt,
    OpSltu,
    OpXor,
    OpSrl,
    OpOr,
    OpAnd,
    OpMul,
    OpDiv,
    OpDivu,
    OpRem,
    OpRemu,
    OpSra,
    OpZextH,
    OpSh1add,
    OpSh2add,
    OpSh3add,

    SextB,
    SextH,
    Bseti,
    Bexti,

    Addiw,
    Slliw,
    Srliw,
    Sraiw,
    OpAddw,
    OpSubw,
    OpMulw,
    OpAddUw,
    OpSh1addUw,
    OpSh2addUw,

    CAddi,
    CLi,
    CMv,
    CSlli,
    CBeqz,
    CBnez,
    CJmp,
    CJr,
    CJalAddiw,
    CJalr,
    CLdd,
    CStd,
    CLdw,
    CStw,
    CSrli,
    CAndi,
    CAdd,
    CXor,
    COr,
    CFunction,

    Syscall,
    Stop,

    Flw,
    Fld,
    Fsw,
    Fsd,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fmadd,
    Vle32,
    Vse32,
    VfaddVv,
    VfmulVf,

    Function,
    Funcblock,
    Livepatch,
    System,
}

const _: () = assert!(Bytecode::COUNT <= 256);

impl Bytecode {
    /// The raw byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts a raw byte back into a bytecode. Unknown values become [`Bytecode::Invalid`].
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        Bytecode::from_repr(value).unwrap_or(Bytecode::Invalid)
    }

    /// Returns `true` for conditional branches, including the forward variants.
    #[must_use]
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Bytecode::Beq
                | Bytecode::Bne
                | Bytecode::Blt
                | Bytecode::Bge
                | Bytecode::Bltu
                | Bytecode::Bgeu
                | Bytecode::BeqFw
                | Bytecode::BneFw
        )
    }

    /// Returns `true` for bytecodes that only exist on 64-bit machines.
    #[must_use]
    pub fn is_rv64_only(self) -> bool {
        matches!(
            self,
            Bytecode::Addiw
                | Bytecode::Slliw
                | Bytecode::Srliw
                | Bytecode::Sraiw
                | Bytecode::OpAddw
                | Bytecode::OpSubw
                | Bytecode::OpMulw
                | Bytecode::OpAddUw
                | Bytecode::OpSh1addUw
                | Bytecode::OpSh2addUw
                | Bytecode::Ldwu
                | Bytecode::Ldd
                | Bytecode::Std
        )
    }
}

/// Maps an instruction to its bytecode, before any segment-relative rewriting.
#[must_use]
pub fn computed_index_for(instr: Instruction, is_64: bool) -> Bytecode {
    if instr.is_compressed() {
        return compressed_index_for(instr, is_64);
    }

    match instr.opcode() {
        opcode::LOAD => {
            if instr.rd() == 0 {
                return Bytecode::Function;
            }
            match instr.funct3() {
                0x0 => Bytecode::Ldb,
                0x1 => Bytecode::Ldh,
                0x2 => Bytecode::Ldw,
                0x3 if is_64 => Bytecode::Ldd,
                0x4 => Bytecode::Ldbu,
                0x5 => Bytecode::Ldhu,
                0x6 if is_64 => Bytecode::Ldwu,
                _ => Bytecode::Invalid,
            }
        }
        opcode::STORE => match instr.funct3() {
            0x0 => Bytecode::Stb,
            0x1 => Bytecode::Sth,
            0x2 => Bytecode::Stw,
            0x3 if is_64 => Bytecode::Std,
            _ => Bytecode::Invalid,
        },
        opcode::BRANCH => match instr.funct3() {
            0x0 => Bytecode::Beq,
            0x1 => Bytecode::Bne,
            0x4 => Bytecode::Blt,
            0x5 => Bytecode::Bge,
            0x6 => Bytecode::Bltu,
            0x7 => Bytecode::Bgeu,
            _ => Bytecode::Invalid,
        },
        opcode::LUI if instr.rd() == 0 => Bytecode::Function,
        opcode::LUI => Bytecode::Lui,
        opcode::AUIPC if instr.rd() == 0 => Bytecode::Function,
        opcode::AUIPC => Bytecode::Auipc,
        opcode::JAL => Bytecode::Jal,
        opcode::JALR => Bytecode::Jalr,
        opcode::OP_IMM => op_imm_index_for(instr),
        opcode::OP => {
            if instr.rd() == 0 {
                return Bytecode::Function;
            }
            match instr.r_op() {
                0x0 => Bytecode::OpAdd,
                0x200 => Bytecode::OpSub,
                0x1 => Bytecode::OpSll,
                0x2 => Bytecode::OpSlt,
                0x3 => Bytecode::OpSltu,
                0x4 => Bytecode::OpXor,
                0x5 => Bytecode::OpSrl,
                0x6 => Bytecode::OpOr,
                0x7 => Bytecode::OpAnd,
                0x10 => Bytecode::OpMul,
                0x14 => Bytecode::OpDiv,
                0x15 => Bytecode::OpDivu,
                0x16 => Bytecode::OpRem,
                0x17 => Bytecode::OpRemu,
                0x44 => Bytecode::OpZextH,
                0x102 => Bytecode::OpSh1add,
                0x104 => Bytecode::OpSh2add,
                0x106 => Bytecode::OpSh3add,
                0x205 => Bytecode::OpSra,
                _ => Bytecode::Function,
            }
        }
        opcode::OP32 => {
            if !is_64 {
                return Bytecode::Invalid;
            }
            match instr.r_op() {
                0x0 => Bytecode::OpAddw,
                0x200 => Bytecode::OpSubw,
                0x10 => Bytecode::OpMulw,
                0x40 => Bytecode::OpAddUw,
                0x44 => Bytecode::OpZextH,
                _ => Bytecode::Function,
            }
        }
        opcode::OP_IMM32 => {
            if !is_64 {
                return Bytecode::Invalid;
            }
            if instr.rd() == 0 {
                return Bytecode::Function;
            }
            match instr.funct3() {
                0x0 => Bytecode::Addiw,
                0x1 if instr.i_high_bits() == 0 => Bytecode::Slliw,
                0x5 if instr.i_high_bits() == 0 => Bytecode::Srliw,
                _ => Bytecode::Function,
            }
        }
        opcode::SYSTEM => {
            if instr.funct3() == 0 {
                match instr.i_imm_raw() {
                    0 => return Bytecode::Syscall,
                    // WFI and STOP
                    0x105 | 0x7ff => return Bytecode::Stop,
                    _ => {}
                }
            }
            Bytecode::System
        }
        opcode::LOAD_FP => match instr.funct3() {
            0x2 => Bytecode::Flw,
            0x3 => Bytecode::Fld,
            0x6 => Bytecode::Vle32,
            _ => Bytecode::Invalid,
        },
        opcode::STORE_FP => match instr.funct3() {
            0x2 => Bytecode::Fsw,
            0x3 => Bytecode::Fsd,
            0x6 => Bytecode::Vse32,
            _ => Bytecode::Invalid,
        },
        opcode::FMADD => Bytecode::Fmadd,
        opcode::FP_FUNC => {
            if instr.fp_funct2() >= 2 {
                return Bytecode::Function;
            }
            match instr.fp_func() {
                0b00000 => Bytecode::Fadd,
                0b00001 => Bytecode::Fsub,
                0b00010 => Bytecode::Fmul,
                0b00011 => Bytecode::Fdiv,
                _ => Bytecode::Function,
            }
        }
        opcode::VECTOR => match (instr.funct3(), instr.v_funct6()) {
            // OPF.VV
            (0x1, 0b000000) => Bytecode::VfaddVv,
            // OPF.VF
            (0x5, 0b100100) => Bytecode::VfmulVf,
            _ => Bytecode::Function,
        },
        // Fences, atomics, the remaining fused ops and custom opcodes
        _ => Bytecode::Function,
    }
}

fn op_imm_index_for(instr: Instruction) -> Bytecode {
    if instr.rd() == 0 {
        return Bytecode::Function;
    }
    match instr.funct3() {
        0x0 => {
            if instr.rs1() == 0 {
                Bytecode::Li
            } else if instr.i_imm() == 0 {
                Bytecode::Mv
            } else {
                Bytecode::Addi
            }
        }
        0x1 => match (instr.i_high_bits(), instr.i_imm_raw()) {
            (0x0, _) => Bytecode::Slli,
            (_, 0b0110_0000_0100) => Bytecode::SextB,
            (_, 0b0110_0000_0101) => Bytecode::SextH,
            (0x280, _) => Bytecode::Bseti,
            _ => Bytecode::Function,
        },
        0x2 => Bytecode::Slti,
        0x3 => Bytecode::Sltiu,
        0x4 => Bytecode::Xori,
        0x5 => {
            if instr.i_high_bits() == 0 {
                Bytecode::Srli
            } else if instr.is_srai() {
                Bytecode::Srai
            } else if instr.i_high_bits() == 0x480 {
                Bytecode::Bexti
            } else {
                Bytecode::Function
            }
        }
        0x6 => Bytecode::Ori,
        _ => Bytecode::Andi,
    }
}

fn compressed_index_for(ci: Instruction, is_64: bool) -> Bytecode {
    let funct3 = (ci.whole() >> 13) & 0x7;
    let rd = ci.c_rd();

    match ci.ci_opcode() {
        x if x == ci_code(0b000, 0b00) => {
            // All zero bits is the canonical illegal instruction
            if ci.half() != 0 {
                Bytecode::CAddi // C.ADDI4SPN
            } else {
                Bytecode::Invalid
            }
        }
        x if x == ci_code(0b010, 0b00) => Bytecode::CLdw,
        x if x == ci_code(0b001, 0b00) || x == ci_code(0b011, 0b00) => Bytecode::CFunction,
        x if x == ci_code(0b110, 0b00) => Bytecode::CStw,
        x if x == ci_code(0b111, 0b00) && is_64 => Bytecode::CStd,
        x if x == ci_code(0b000, 0b01) && rd != 0 => Bytecode::CAddi,
        x if x == ci_code(0b010, 0b01) && rd != 0 => Bytecode::CLi,
        // C.ADDI16SP
        x if x == ci_code(0b011, 0b01) && rd == 2 => Bytecode::CAddi,
        // C.ADDIW on RV64, C.JAL on RV32
        x if x == ci_code(0b001, 0b01) => Bytecode::CJalAddiw,
        x if x == ci_code(0b101, 0b01) => Bytecode::CJmp,
        x if x == ci_code(0b110, 0b01) => Bytecode::CBeqz,
        x if x == ci_code(0b111, 0b01) => Bytecode::CBnez,
        x if x == ci_code(0b000, 0b10) && rd != 0 => Bytecode::CSlli,
        x if x == ci_code(0b010, 0b10) && rd != 0 => Bytecode::CLdw,
        x if x == ci_code(0b011, 0b10) && rd != 0 && is_64 => Bytecode::CLdd,
        x if x == ci_code(0b100, 0b01) => match ci.ca_funct6() & 0x3 {
            0x0 => Bytecode::CSrli,
            0x2 => Bytecode::CAndi,
            0x3 => match ci.ca_funct2() | (ci.ca_funct6() & 0x4) {
                0x1 => Bytecode::CXor,
                0x2 => Bytecode::COr,
                _ => Bytecode::CFunction,
            },
            _ => Bytecode::CFunction,
        },
        x if x == ci_code(0b100, 0b10) => {
            let topbit = ci.c_topbit();
            let rs2 = ci.c_rs2();
            match (topbit, rd != 0, rs2 != 0) {
                (false, true, false) => Bytecode::CJr,
                (true, true, false) => Bytecode::CJalr,
                (false, true, true) => Bytecode::CMv,
                (true, true, true) => Bytecode::CAdd,
                _ => Bytecode::CFunction,
            }
        }
        _ if ci.whole() & 0x3 == 0b10 && funct3 == 6 => Bytecode::CStw,
        _ if ci.whole() & 0x3 == 0b10 && funct3 == 7 && is_64 => Bytecode::CStd,
        _ => Bytecode::CFunction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn index(bits: u32) -> Bytecode {
        computed_index_for(Instruction(bits), true)
    }

    #[test]
    fn test_byte_values() {
        assert_eq!(Bytecode::Invalid.as_u8(), 0);
        for bytecode in Bytecode::iter() {
            assert_eq!(Bytecode::from_u8(bytecode.as_u8()), bytecode);
        }
        assert_eq!(Bytecode::from_u8(255), Bytecode::Invalid);
        let name: &'static str = Bytecode::FastJal.into();
        assert_eq!(name, "FastJal");
    }

    #[test]
    fn test_zero_is_invalid() {
        assert_eq!(index(0), Bytecode::Invalid);
        assert_eq!(computed_index_for(Instruction(0), false), Bytecode::Invalid);
    }

    #[test]
    fn test_op_imm() {
        assert_eq!(index(0x29a0_0513), Bytecode::Li); // li a0, 666
        assert_eq!(index(0x0005_8513), Bytecode::Mv); // mv a0, a1
        assert_eq!(index(0x0015_8513), Bytecode::Addi); // addi a0, a1, 1
        assert_eq!(index(0x0000_0013), Bytecode::Function); // nop
        assert_eq!(index(0x0035_9513), Bytecode::Slli); // slli a0, a1, 3
        assert_eq!(index(0x4035_d513), Bytecode::Srai); // srai a0, a1, 3
        assert_eq!(index(0x6045_9513), Bytecode::SextB); // sext.b a0, a1
    }

    #[test]
    fn test_loads_and_stores() {
        assert_eq!(index(0x0005_b503), Bytecode::Ldd); // ld a0, 0(a1)
        assert_eq!(
            computed_index_for(Instruction(0x0005_b503), false),
            Bytecode::Invalid
        );
        assert_eq!(index(0x0005_a503), Bytecode::Ldw); // lw a0, 0(a1)
        assert_eq!(index(0x0005_a003), Bytecode::Function); // lw zero, 0(a1)
        assert_eq!(index(0x00a5_b023), Bytecode::Std); // sd a0, 0(a1)
    }

    #[test]
    fn test_control_flow() {
        assert_eq!(index(0x00b5_0463), Bytecode::Beq);
        assert_eq!(index(0x00b5_2463), Bytecode::Invalid); // funct3 2 is reserved
        assert_eq!(index(0xffdf_f06f), Bytecode::Jal);
        assert_eq!(index(0x0000_8067), Bytecode::Jalr);
    }

    #[test]
    fn test_system() {
        assert_eq!(index(0x0000_0073), Bytecode::Syscall); // ecall
        assert_eq!(index(0x7ff0_0073), Bytecode::Stop);
        assert_eq!(index(0x1050_0073), Bytecode::Stop); // wfi
        assert_eq!(index(0x0010_0073), Bytecode::System); // ebreak
    }

    #[test]
    fn test_word_ops_need_rv64() {
        // addiw a0, a0, 1
        assert_eq!(index(0x0015_051b), Bytecode::Addiw);
        assert_eq!(
            computed_index_for(Instruction(0x0015_051b), false),
            Bytecode::Invalid
        );
        // addw a0, a0, a1
        assert_eq!(index(0x00b5_053b), Bytecode::OpAddw);
    }

    #[test]
    fn test_compressed() {
        assert_eq!(index(0x4501), Bytecode::CLi); // c.li a0, 0
        assert_eq!(index(0x852e), Bytecode::CMv); // c.mv a0, a1
        assert_eq!(index(0x952e), Bytecode::CAdd); // c.add a0, a1
        assert_eq!(index(0x8082), Bytecode::CJr); // c.jr ra
        assert_eq!(index(0xa001), Bytecode::CJmp); // c.j 0
        assert_eq!(index(0x0001), Bytecode::CFunction); // c.nop
        assert_eq!(index(0x6582), Bytecode::CLdd); // c.ldsp a1, 0(sp)
        assert_eq!(index(0xe02e), Bytecode::CStd); // c.sdsp a1, 0(sp)
        assert_eq!(index(0xc02e), Bytecode::CStw); // c.swsp a1, 0(sp)
    }
}
