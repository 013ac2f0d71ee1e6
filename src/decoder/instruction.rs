//! Field access for raw RISC-V instruction words.

use std::fmt;

/// Major opcodes (bits `6:0`) of 32-bit instructions.
pub mod opcode {
    /// Integer loads
    pub const LOAD: u32 = 0x03;
    /// Floating-point loads
    pub const LOAD_FP: u32 = 0x07;
    /// FENCE / FENCE.I
    pub const FENCE: u32 = 0x0f;
    /// Register-immediate ALU operations
    pub const OP_IMM: u32 = 0x13;
    /// Add upper immediate to PC
    pub const AUIPC: u32 = 0x17;
    /// 32-bit register-immediate ALU operations (RV64)
    pub const OP_IMM32: u32 = 0x1b;
    /// Integer stores
    pub const STORE: u32 = 0x23;
    /// Floating-point stores
    pub const STORE_FP: u32 = 0x27;
    /// Atomic memory operations
    pub const ATOMIC: u32 = 0x2f;
    /// Register-register ALU operations
    pub const OP: u32 = 0x33;
    /// Load upper immediate
    pub const LUI: u32 = 0x37;
    /// 32-bit register-register ALU operations (RV64)
    pub const OP32: u32 = 0x3b;
    /// Fused multiply-add
    pub const FMADD: u32 = 0x43;
    /// Fused multiply-subtract
    pub const FMSUB: u32 = 0x47;
    /// Negated fused multiply-subtract
    pub const FNMSUB: u32 = 0x4b;
    /// Negated fused multiply-add
    pub const FNMADD: u32 = 0x4f;
    /// Floating-point operations
    pub const FP_FUNC: u32 = 0x53;
    /// Vector operations
    pub const VECTOR: u32 = 0x57;
    /// Conditional branches
    pub const BRANCH: u32 = 0x63;
    /// Jump and link register
    pub const JALR: u32 = 0x67;
    /// Jump and link
    pub const JAL: u32 = 0x6f;
    /// ECALL, EBREAK, CSR access and friends
    pub const SYSTEM: u32 = 0x73;
}

/// Builds the compressed opcode key from `funct3` and the quadrant.
#[must_use]
pub const fn ci_code(funct3: u32, quadrant: u32) -> u32 {
    (funct3 << 13) | quadrant
}

/// A raw instruction word.
///
/// Compressed instructions occupy the low 16 bits; the upper half is whatever followed them in
/// memory and must be ignored.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Instruction(pub u32);

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_compressed() {
            write!(f, "Instruction({:#06x})", self.half())
        } else {
            write!(f, "Instruction({:#010x})", self.0)
        }
    }
}

impl From<u32> for Instruction {
    fn from(bits: u32) -> Self {
        Instruction(bits)
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
impl Instruction {
    /// The whole instruction word.
    #[inline]
    #[must_use]
    pub const fn whole(self) -> u32 {
        self.0
    }

    /// The low 16 bits.
    #[inline]
    #[must_use]
    pub const fn half(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Encoded length in bytes: 4 when the two low bits are set, 2 otherwise.
    #[inline]
    #[must_use]
    pub const fn length(self) -> usize {
        if self.0 & 0x3 == 0x3 {
            4
        } else {
            2
        }
    }

    /// Returns `true` for 16-bit encodings.
    #[inline]
    #[must_use]
    pub const fn is_compressed(self) -> bool {
        self.length() == 2
    }

    /// Major opcode, bits `6:0`.
    #[inline]
    #[must_use]
    pub const fn opcode(self) -> u32 {
        self.0 & 0x7f
    }

    /// Destination register.
    #[inline]
    #[must_use]
    pub const fn rd(self) -> usize {
        ((self.0 >> 7) & 0x1f) as usize
    }

    /// `funct3`, bits `14:12`.
    #[inline]
    #[must_use]
    pub const fn funct3(self) -> u32 {
        (self.0 >> 12) & 0x7
    }

    /// First source register.
    #[inline]
    #[must_use]
    pub const fn rs1(self) -> usize {
        ((self.0 >> 15) & 0x1f) as usize
    }

    /// Second source register.
    #[inline]
    #[must_use]
    pub const fn rs2(self) -> usize {
        ((self.0 >> 20) & 0x1f) as usize
    }

    /// `funct7`, bits `31:25`.
    #[inline]
    #[must_use]
    pub const fn funct7(self) -> u32 {
        self.0 >> 25
    }

    /// `funct3 | funct7 << 4`, a dense key for R-type operations.
    #[inline]
    #[must_use]
    pub const fn r_op(self) -> u32 {
        self.funct3() | (self.funct7() << 4)
    }

    /// Unsigned 12-bit I-type immediate.
    #[inline]
    #[must_use]
    pub const fn i_imm_raw(self) -> u32 {
        self.0 >> 20
    }

    /// Upper 6 bits of the I-type immediate, which select the shift type.
    #[inline]
    #[must_use]
    pub const fn i_high_bits(self) -> u32 {
        (self.0 >> 20) & 0xFC0
    }

    /// Returns `true` for the SRAI/SRAIW immediate form.
    #[inline]
    #[must_use]
    pub const fn is_srai(self) -> bool {
        self.i_high_bits() == 0x400
    }

    /// Sign-extended I-type immediate.
    #[inline]
    #[must_use]
    pub const fn i_imm(self) -> i32 {
        (self.0 as i32) >> 20
    }

    /// Sign-extended S-type immediate.
    #[inline]
    #[must_use]
    pub const fn s_imm(self) -> i32 {
        (((self.0 as i32) >> 25) << 5) | ((self.0 >> 7) & 0x1f) as i32
    }

    /// Sign-extended B-type branch offset.
    #[inline]
    #[must_use]
    pub const fn b_imm(self) -> i32 {
        let bits = self.0;
        let imm = (((bits >> 31) & 0x1) << 12)
            | (((bits >> 7) & 0x1) << 11)
            | (((bits >> 25) & 0x3f) << 5)
            | (((bits >> 8) & 0xf) << 1);
        ((imm << 19) as i32) >> 19
    }

    /// U-type immediate, already shifted into bits `31:12`.
    #[inline]
    #[must_use]
    pub const fn u_imm(self) -> i32 {
        (self.0 & 0xFFFF_F000) as i32
    }

    /// Sign-extended J-type jump offset.
    #[inline]
    #[must_use]
    pub const fn j_imm(self) -> i32 {
        let bits = self.0;
        let imm = (((bits >> 31) & 0x1) << 20)
            | (((bits >> 12) & 0xff) << 12)
            | (((bits >> 20) & 0x1) << 11)
            | (((bits >> 21) & 0x3ff) << 1);
        ((imm << 11) as i32) >> 11
    }

    /// `funct5` of floating-point operations, bits `31:27`.
    #[inline]
    #[must_use]
    pub const fn fp_func(self) -> u32 {
        self.0 >> 27
    }

    /// Format field of R4-type instructions, bits `26:25`.
    #[inline]
    #[must_use]
    pub const fn fp_funct2(self) -> u32 {
        (self.0 >> 25) & 0x3
    }

    /// `funct6` of vector operations, bits `31:26`.
    #[inline]
    #[must_use]
    pub const fn v_funct6(self) -> u32 {
        self.0 >> 26
    }

    /// Compressed opcode key: `funct3` (bits `15:13`) and the quadrant (bits `1:0`).
    #[inline]
    #[must_use]
    pub const fn ci_opcode(self) -> u32 {
        self.0 & 0xE003
    }

    /// Compressed `rd`/`rs1` field, bits `11:7`.
    #[inline]
    #[must_use]
    pub const fn c_rd(self) -> usize {
        ((self.0 >> 7) & 0x1f) as usize
    }

    /// Compressed `rs2` field, bits `6:2`.
    #[inline]
    #[must_use]
    pub const fn c_rs2(self) -> usize {
        ((self.0 >> 2) & 0x1f) as usize
    }

    /// Compressed arithmetic `funct6`, bits `15:10`.
    #[inline]
    #[must_use]
    pub const fn ca_funct6(self) -> u32 {
        (self.0 >> 10) & 0x3f
    }

    /// Compressed arithmetic `funct2`, bits `6:5`.
    #[inline]
    #[must_use]
    pub const fn ca_funct2(self) -> u32 {
        (self.0 >> 5) & 0x3
    }

    /// Bit 12 of a compressed instruction.
    #[inline]
    #[must_use]
    pub const fn c_topbit(self) -> bool {
        self.0 & (1 << 12) != 0
    }

    /// Returns `true` if this instruction may change the program counter or stop the
    /// machine, which ends a straight-line block.
    #[must_use]
    pub fn ends_block(self, is_64: bool) -> bool {
        if self.is_compressed() {
            return !is_regular_compressed(self.half(), is_64);
        }
        matches!(
            self.opcode(),
            opcode::BRANCH | opcode::SYSTEM | opcode::JAL | opcode::JALR
        )
    }
}

/// Returns `true` for compressed instructions that cannot change the program counter.
#[must_use]
pub fn is_regular_compressed(half: u16, is_64: bool) -> bool {
    let ci = Instruction(u32::from(half));
    match ci.ci_opcode() {
        // C.ADDIW on RV64, C.JAL on RV32
        x if x == ci_code(0b001, 0b01) => is_64,
        // C.J, C.BEQZ, C.BNEZ
        x if x == ci_code(0b101, 0b01)
            || x == ci_code(0b110, 0b01)
            || x == ci_code(0b111, 0b01) =>
        {
            false
        }
        x if x == ci_code(0b100, 0b10) => {
            // C.JR and C.JALR
            !(ci.c_rd() != 0 && ci.c_rs2() == 0)
        }
        _ => true,
    }
}
