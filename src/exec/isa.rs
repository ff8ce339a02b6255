//! Instruction set: opcodes, encoding formats and static properties.
//!
//! Instructions are 16-bit halfwords; a `PFIX` halfword extends the
//! immediate of the following instruction, producing a 4-byte "long" form.
//! Registers r0-r11 are packed three to an instruction in the 3R formats
//! using the split high/low scheme (high part 0-2 in a base-3 field, low
//! two bits verbatim).
//!
//! The encoders here are the inverse of [`crate::exec::decode`] and are used
//! by the boot machinery and the test suite to assemble guest programs.

/// Decoded operand tuple. Branch operands are resolved to absolute byte
/// addresses at decode time.
pub type Operands = [u32; 4];

/// Instruction opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionOpcode {
    // 3R
    Add,
    Sub,
    And,
    Or,
    Shl,
    Shr,
    Eq,
    Lss,
    Lsu,
    Ldw3,
    Stw3,
    Tsetr,
    Mul,
    Xor,
    // 2RUS
    Addi,
    Subi,
    Shli,
    Shri,
    // RU6 (long forms via PFIX)
    Ldc,
    Ldwdp,
    Stwdp,
    Ldwsp,
    Stwsp,
    Brft,
    Brff,
    Brbt,
    Brbf,
    Setci,
    Outcti,
    Chkcti,
    // U10
    Blrf,
    Blrb,
    Ldapf,
    Ldapb,
    Pfix,
    // U6
    Brfu,
    Brbu,
    Retsp,
    Setsr,
    Clrsr,
    // 2R
    In,
    Out,
    Outt,
    Int,
    Outct2,
    Inct,
    Chkct2,
    Testct,
    Testwct,
    Setd,
    Setv,
    Setev,
    Getst,
    Getts,
    Setpt,
    Setpsc,
    Endin,
    Peek,
    Setclk,
    Setrdy,
    Settw,
    Getr,
    Not,
    Tinitpc,
    Tinitsp,
    Tinitdp,
    Tinitcp,
    Tinitlr,
    // 1R
    Eeu,
    Edu,
    Freer,
    Msync,
    Mjoin,
    Syncr,
    Bau,
    Clrpt,
    Getid,
    // 0R
    Ssync,
    Clre,
    Waiteu,
    Freet,
    Nop,
}

use InstructionOpcode::*;

/// Encoding format of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    R3,
    R2Us,
    Ru6,
    U10,
    U6,
    R2,
    R1,
    R0,
}

impl InstructionOpcode {
    pub fn format(self) -> Format {
        match self {
            Add | Sub | And | Or | Shl | Shr | Eq | Lss | Lsu | Ldw3 | Stw3 | Tsetr | Mul
            | Xor => Format::R3,
            Addi | Subi | Shli | Shri => Format::R2Us,
            Ldc | Ldwdp | Stwdp | Ldwsp | Stwsp | Brft | Brff | Brbt | Brbf | Setci | Outcti
            | Chkcti => Format::Ru6,
            Blrf | Blrb | Ldapf | Ldapb | Pfix => Format::U10,
            Brfu | Brbu | Retsp | Setsr | Clrsr => Format::U6,
            In | Out | Outt | Int | Outct2 | Inct | Chkct2 | Testct | Testwct | Setd | Setv
            | Setev | Getst | Getts | Setpt | Setpsc | Endin | Peek | Setclk | Setrdy | Settw
            | Getr | Not | Tinitpc | Tinitsp | Tinitdp | Tinitcp | Tinitlr => Format::R2,
            Eeu | Edu | Freer | Msync | Mjoin | Syncr | Bau | Clrpt | Getid => Format::R1,
            Ssync | Clre | Waiteu | Freet | Nop => Format::R0,
        }
    }

    /// Opcode field value within the instruction's format region.
    pub(crate) fn opcode_bits(self) -> u16 {
        match self {
            // 3R: bits [15:11] = 0x00..
            Add => 0x00,
            Sub => 0x01,
            And => 0x02,
            Or => 0x03,
            Shl => 0x04,
            Shr => 0x05,
            Eq => 0x06,
            Lss => 0x07,
            Lsu => 0x08,
            Ldw3 => 0x09,
            Stw3 => 0x0A,
            Tsetr => 0x0B,
            Mul => 0x0C,
            Xor => 0x0D,
            // 2RUS: bits [15:11] = 0x0E..0x11
            Addi => 0x0E,
            Subi => 0x0F,
            Shli => 0x10,
            Shri => 0x11,
            // RU6: bits [15:10] = 0x24..0x2F
            Ldc => 0x24,
            Ldwdp => 0x25,
            Stwdp => 0x26,
            Ldwsp => 0x27,
            Stwsp => 0x28,
            Brft => 0x29,
            Brff => 0x2A,
            Brbt => 0x2B,
            Brbf => 0x2C,
            Setci => 0x2D,
            Outcti => 0x2E,
            Chkcti => 0x2F,
            // U10: bits [15:10] = 0x30..0x35
            Blrf => 0x30,
            Blrb => 0x31,
            Ldapf => 0x32,
            Ldapb => 0x33,
            Pfix => 0x34,
            // U6: bits [15:10] = 0x36, sub-opcode in bits [9:6]
            Brfu => 0x0,
            Brbu => 0x1,
            Retsp => 0x2,
            Setsr => 0x3,
            Clrsr => 0x4,
            // 2R: bits [15:8] = 0xE0..
            In => 0xE0,
            Out => 0xE1,
            Outt => 0xE2,
            Int => 0xE3,
            Outct2 => 0xE4,
            Inct => 0xE5,
            Chkct2 => 0xE6,
            Testct => 0xE7,
            Testwct => 0xE8,
            Setd => 0xE9,
            Setv => 0xEA,
            Setev => 0xEB,
            Getst => 0xEC,
            Getts => 0xED,
            Setpt => 0xEE,
            Setpsc => 0xEF,
            Endin => 0xF0,
            Peek => 0xF1,
            Setclk => 0xF2,
            Setrdy => 0xF3,
            Settw => 0xF4,
            Getr => 0xF5,
            Not => 0xF6,
            Tinitpc => 0xF7,
            Tinitsp => 0xF8,
            Tinitdp => 0xF9,
            Tinitcp => 0xFA,
            Tinitlr => 0xFB,
            // 1R: bits [15:4] = 0xFE0..
            Eeu => 0xFE0,
            Edu => 0xFE1,
            Freer => 0xFE2,
            Msync => 0xFE3,
            Mjoin => 0xFE4,
            Syncr => 0xFE5,
            Bau => 0xFE6,
            Clrpt => 0xFE7,
            Getid => 0xFE8,
            // 0R: full halfword
            Ssync => 0xFFF0,
            Clre => 0xFFF1,
            Waiteu => 0xFFF2,
            Freet => 0xFFF3,
            Nop => 0xFFF4,
        }
    }

    /// Whether the instruction ends a straight-line fragment.
    pub fn may_branch(self) -> bool {
        matches!(
            self,
            Brft | Brff | Brbt | Brbf | Brfu | Brbu | Blrf | Blrb | Bau | Retsp | Waiteu
        )
    }

    /// Whether the instruction can park or redirect the issuing thread, so
    /// a fragment must check for early return after it.
    pub fn may_pause(self) -> bool {
        matches!(
            self,
            In | Out
                | Outt
                | Int
                | Outct2
                | Outcti
                | Inct
                | Chkct2
                | Chkcti
                | Testct
                | Testwct
                | Setpt
                | Setpsc
                | Endin
                | Ssync
                | Msync
                | Mjoin
                | Syncr
                | Waiteu
                | Setsr
                | Setci
        )
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: InstructionOpcode,
    pub operands: Operands,
    /// Encoded size in bytes (2, or 4 for PFIXed forms).
    pub size: u8,
}

impl Instruction {
    pub fn new(op: InstructionOpcode, operands: Operands, size: u8) -> Self {
        Instruction { op, operands, size }
    }
}

/// Static successor PCs of a control-flow instruction, given the resolved
/// operands and the address of the following instruction. `None` for
/// instructions whose successors are not statically known.
pub fn static_successors(
    op: InstructionOpcode,
    operands: &Operands,
    next_pc: u32,
) -> Option<smallvec::SmallVec<[u32; 2]>> {
    let mut out = smallvec::SmallVec::new();
    match op {
        Brft | Brff | Brbt | Brbf => {
            out.push(next_pc);
            out.push(operands[1]);
        }
        Brfu | Brbu | Blrf | Blrb => out.push(operands[0]),
        Ldapf | Ldapb => out.push(next_pc),
        _ => return None,
    }
    Some(out)
}

// -- encoders ------------------------------------------------------------

fn pack_3ops(a: u32, b: u32, c: u32) -> u16 {
    debug_assert!(a < 12 && b < 12 && c < 12);
    let combined = (a >> 2) * 9 + (b >> 2) * 3 + (c >> 2);
    ((combined << 6) | ((a & 3) << 4) | ((b & 3) << 2) | (c & 3)) as u16
}

/// Unpack the three-operand field. Returns None for reserved encodings.
pub(crate) fn unpack_3ops(ins: u16) -> Option<(u32, u32, u32)> {
    let combined = ((ins >> 6) & 0x1F) as u32;
    if combined > 26 {
        return None;
    }
    let a = ((combined / 9) << 2) | ((ins >> 4) & 3) as u32;
    let b = (((combined / 3) % 3) << 2) | ((ins >> 2) & 3) as u32;
    let c = ((combined % 3) << 2) | (ins & 3) as u32;
    Some((a, b, c))
}

/// Encode a 3R-format instruction.
pub fn encode_3r(op: InstructionOpcode, a: u32, b: u32, c: u32) -> u16 {
    debug_assert_eq!(op.format(), Format::R3);
    (op.opcode_bits() << 11) | pack_3ops(a, b, c)
}

/// Encode a 2RUS-format instruction (two registers, immediate 0-11).
pub fn encode_2rus(op: InstructionOpcode, a: u32, b: u32, imm: u32) -> u16 {
    debug_assert_eq!(op.format(), Format::R2Us);
    (op.opcode_bits() << 11) | pack_3ops(a, b, imm)
}

/// Encode an RU6-format instruction.
pub fn encode_ru6(op: InstructionOpcode, reg: u32, imm: u32) -> u16 {
    debug_assert_eq!(op.format(), Format::Ru6);
    debug_assert!(reg < 12 && imm < 64);
    (op.opcode_bits() << 10) | ((reg as u16) << 6) | imm as u16
}

/// Encode an RU6 instruction with a 16-bit immediate as PFIX + RU6.
pub fn encode_lru6(op: InstructionOpcode, reg: u32, imm: u32) -> [u16; 2] {
    debug_assert!(imm < (1 << 16));
    [encode_u10(Pfix, imm >> 6), encode_ru6(op, reg, imm & 0x3F)]
}

/// Encode a U10-format instruction.
pub fn encode_u10(op: InstructionOpcode, imm: u32) -> u16 {
    debug_assert_eq!(op.format(), Format::U10);
    debug_assert!(imm < (1 << 10));
    (op.opcode_bits() << 10) | imm as u16
}

/// Encode a U10 instruction with a 20-bit immediate as PFIX + U10.
pub fn encode_lu10(op: InstructionOpcode, imm: u32) -> [u16; 2] {
    debug_assert!(imm < (1 << 20));
    [encode_u10(Pfix, imm >> 10), encode_u10(op, imm & 0x3FF)]
}

/// Encode a U6-format instruction.
pub fn encode_u6(op: InstructionOpcode, imm: u32) -> u16 {
    debug_assert_eq!(op.format(), Format::U6);
    debug_assert!(imm < 64);
    (0x36 << 10) | (op.opcode_bits() << 6) | imm as u16
}

/// Encode a U6 instruction with a 16-bit immediate as PFIX + U6.
pub fn encode_lu6(op: InstructionOpcode, imm: u32) -> [u16; 2] {
    debug_assert!(imm < (1 << 16));
    [encode_u10(Pfix, imm >> 6), encode_u6(op, imm & 0x3F)]
}

/// Encode a 2R-format instruction.
pub fn encode_2r(op: InstructionOpcode, a: u32, b: u32) -> u16 {
    debug_assert_eq!(op.format(), Format::R2);
    debug_assert!(a < 16 && b < 16);
    (op.opcode_bits() << 8) | ((a as u16) << 4) | b as u16
}

/// Encode a 1R-format instruction.
pub fn encode_1r(op: InstructionOpcode, a: u32) -> u16 {
    debug_assert_eq!(op.format(), Format::R1);
    debug_assert!(a < 16);
    (op.opcode_bits() << 4) | a as u16
}

/// Encode a 0R-format instruction.
pub fn encode_0r(op: InstructionOpcode) -> u16 {
    debug_assert_eq!(op.format(), Format::R0);
    op.opcode_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_3ops() {
        for a in 0..12 {
            for b in 0..12 {
                for c in [0u32, 5, 11] {
                    let packed = pack_3ops(a, b, c);
                    assert_eq!(unpack_3ops(packed), Some((a, b, c)));
                }
            }
        }
    }

    #[test]
    fn test_reserved_combined_rejected() {
        // combined field 27..31 is reserved.
        let ins = 27 << 6;
        assert_eq!(unpack_3ops(ins), None);
    }

    #[test]
    fn test_format_regions_disjoint() {
        // A 3R ADD and an RU6 LDC with arbitrary operands must never
        // produce the same halfword.
        let add = encode_3r(Add, 1, 2, 3);
        assert!(add < 0x9000);
        let ldc = encode_ru6(Ldc, 0, 0);
        assert!(ldc >= 0x9000);
    }

    #[test]
    fn test_successors_conditional_branch() {
        let ops = [2, 0x1_0040, 0, 0];
        let succ = static_successors(Brft, &ops, 0x1_0010).unwrap();
        assert_eq!(succ.as_slice(), &[0x1_0010, 0x1_0040]);
    }

    #[test]
    fn test_successors_unconditional() {
        let ops = [0x1_0040, 0, 0, 0];
        let succ = static_successors(Brfu, &ops, 0x1_0010).unwrap();
        assert_eq!(succ.as_slice(), &[0x1_0040]);
        assert!(static_successors(Add, &ops, 0).is_none());
    }
}
