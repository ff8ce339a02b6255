//! Instruction decoder.
//!
//! Decodes one instruction from up to two halfwords (the second is consumed
//! only by `PFIX`ed long forms). PC-relative branch and address operands are
//! resolved to absolute byte addresses here, so the execution engine and the
//! fragment compiler never re-derive targets.

use super::isa::{unpack_3ops, Format, Instruction, InstructionOpcode, Operands};

use InstructionOpcode::*;

const PFIX_OPCODE: u16 = 0x34;

/// Decode the instruction at byte address `pc`. `hw0` is the halfword at
/// `pc`, `hw1` the following halfword (ignored unless `hw0` is a prefix).
pub fn decode(hw0: u16, hw1: u16, pc: u32) -> Option<Instruction> {
    if hw0 >> 10 == PFIX_OPCODE {
        let prefix = (hw0 & 0x3FF) as u32;
        decode_inner(hw1, pc, 4, Some(prefix))
    } else {
        decode_inner(hw0, pc, 2, None)
    }
}

fn decode_inner(ins: u16, pc: u32, size: u8, prefix: Option<u32>) -> Option<Instruction> {
    let next_pc = pc.wrapping_add(size as u32);

    // 3R / 2RUS region: bits [15:11] in 0x00..=0x11.
    let op5 = ins >> 11;
    if op5 <= 0x11 {
        if prefix.is_some() {
            return None;
        }
        let op = match op5 {
            0x00 => Add,
            0x01 => Sub,
            0x02 => And,
            0x03 => Or,
            0x04 => Shl,
            0x05 => Shr,
            0x06 => Eq,
            0x07 => Lss,
            0x08 => Lsu,
            0x09 => Ldw3,
            0x0A => Stw3,
            0x0B => Tsetr,
            0x0C => Mul,
            0x0D => Xor,
            0x0E => Addi,
            0x0F => Subi,
            0x10 => Shli,
            0x11 => Shri,
            _ => return None,
        };
        let (a, b, c) = unpack_3ops(ins)?;
        return Some(Instruction::new(op, [a, b, c, 0], size));
    }

    let op6 = ins >> 10;
    match op6 {
        // RU6
        0x24..=0x2F => {
            let op = match op6 {
                0x24 => Ldc,
                0x25 => Ldwdp,
                0x26 => Stwdp,
                0x27 => Ldwsp,
                0x28 => Stwsp,
                0x29 => Brft,
                0x2A => Brff,
                0x2B => Brbt,
                0x2C => Brbf,
                0x2D => Setci,
                0x2E => Outcti,
                0x2F => Chkcti,
                _ => unreachable!(),
            };
            let reg = ((ins >> 6) & 0xF) as u32;
            if reg >= 12 {
                return None;
            }
            let mut imm = (ins & 0x3F) as u32;
            if let Some(prefix) = prefix {
                imm |= prefix << 6;
            }
            let operands = resolve_ru6(op, reg, imm, next_pc);
            Some(Instruction::new(op, operands, size))
        }
        // U10
        0x30..=0x33 => {
            let op = match op6 {
                0x30 => Blrf,
                0x31 => Blrb,
                0x32 => Ldapf,
                0x33 => Ldapb,
                _ => unreachable!(),
            };
            let mut imm = (ins & 0x3FF) as u32;
            if let Some(prefix) = prefix {
                imm |= prefix << 10;
            }
            let offset = imm << 1;
            let value = match op {
                Blrf | Ldapf => next_pc.wrapping_add(offset),
                Blrb | Ldapb => next_pc.wrapping_sub(offset),
                _ => unreachable!(),
            };
            Some(Instruction::new(op, [value, 0, 0, 0], size))
        }
        // A bare PFIX reaching here means a prefix of a prefix: reserved.
        0x34 => None,
        // U6
        0x36 => {
            let op = match (ins >> 6) & 0xF {
                0x0 => Brfu,
                0x1 => Brbu,
                0x2 => Retsp,
                0x3 => Setsr,
                0x4 => Clrsr,
                _ => return None,
            };
            let mut imm = (ins & 0x3F) as u32;
            if let Some(prefix) = prefix {
                imm |= prefix << 6;
            }
            let operands = match op {
                Brfu => [next_pc.wrapping_add(imm << 1), 0, 0, 0],
                Brbu => [next_pc.wrapping_sub(imm << 1), 0, 0, 0],
                _ => [imm, 0, 0, 0],
            };
            Some(Instruction::new(op, operands, size))
        }
        _ => {
            if prefix.is_some() {
                return None;
            }
            decode_regs(ins, size)
        }
    }
}

fn resolve_ru6(op: InstructionOpcode, reg: u32, imm: u32, next_pc: u32) -> Operands {
    match op {
        Brft | Brff => [reg, next_pc.wrapping_add(imm << 1), 0, 0],
        Brbt | Brbf => [reg, next_pc.wrapping_sub(imm << 1), 0, 0],
        _ => [reg, imm, 0, 0],
    }
}

fn decode_regs(ins: u16, size: u8) -> Option<Instruction> {
    // 2R region: bits [15:8] in 0xE0..=0xFB.
    let op8 = ins >> 8;
    if (0xE0..=0xFB).contains(&op8) {
        let op = match op8 {
            0xE0 => In,
            0xE1 => Out,
            0xE2 => Outt,
            0xE3 => Int,
            0xE4 => Outct2,
            0xE5 => Inct,
            0xE6 => Chkct2,
            0xE7 => Testct,
            0xE8 => Testwct,
            0xE9 => Setd,
            0xEA => Setv,
            0xEB => Setev,
            0xEC => Getst,
            0xED => Getts,
            0xEE => Setpt,
            0xEF => Setpsc,
            0xF0 => Endin,
            0xF1 => Peek,
            0xF2 => Setclk,
            0xF3 => Setrdy,
            0xF4 => Settw,
            0xF5 => Getr,
            0xF6 => Not,
            0xF7 => Tinitpc,
            0xF8 => Tinitsp,
            0xF9 => Tinitdp,
            0xFA => Tinitcp,
            0xFB => Tinitlr,
            _ => return None,
        };
        let a = ((ins >> 4) & 0xF) as u32;
        let b = (ins & 0xF) as u32;
        return Some(Instruction::new(op, [a, b, 0, 0], size));
    }
    // 1R region: bits [15:4] in 0xFE0..=0xFE8.
    let op12 = ins >> 4;
    if (0xFE0..=0xFE8).contains(&op12) {
        let op = match op12 {
            0xFE0 => Eeu,
            0xFE1 => Edu,
            0xFE2 => Freer,
            0xFE3 => Msync,
            0xFE4 => Mjoin,
            0xFE5 => Syncr,
            0xFE6 => Bau,
            0xFE7 => Clrpt,
            0xFE8 => Getid,
            _ => return None,
        };
        return Some(Instruction::new(op, [(ins & 0xF) as u32, 0, 0, 0], size));
    }
    // 0R region.
    let op = match ins {
        0xFFF0 => Ssync,
        0xFFF1 => Clre,
        0xFFF2 => Waiteu,
        0xFFF3 => Freet,
        0xFFF4 => Nop,
        _ => return None,
    };
    Some(Instruction::new(op, [0, 0, 0, 0], size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::isa::{
        encode_0r, encode_1r, encode_2r, encode_2rus, encode_3r, encode_lru6, encode_ru6,
        encode_u10, encode_u6,
    };

    #[test]
    fn test_roundtrip_3r() {
        let hw = encode_3r(Add, 1, 2, 11);
        let inst = decode(hw, 0, 0x1_0000).unwrap();
        assert_eq!(inst.op, Add);
        assert_eq!(inst.operands, [1, 2, 11, 0]);
        assert_eq!(inst.size, 2);
    }

    #[test]
    fn test_roundtrip_2rus() {
        let hw = encode_2rus(Addi, 3, 4, 7);
        let inst = decode(hw, 0, 0).unwrap();
        assert_eq!(inst.op, Addi);
        assert_eq!(inst.operands, [3, 4, 7, 0]);
    }

    #[test]
    fn test_roundtrip_ldc() {
        let hw = encode_ru6(Ldc, 5, 42);
        let inst = decode(hw, 0, 0).unwrap();
        assert_eq!(inst.op, Ldc);
        assert_eq!(inst.operands[0], 5);
        assert_eq!(inst.operands[1], 42);
    }

    #[test]
    fn test_long_immediate() {
        let [p, hw] = encode_lru6(Ldc, 2, 0x1234);
        let inst = decode(p, hw, 0).unwrap();
        assert_eq!(inst.op, Ldc);
        assert_eq!(inst.operands[1], 0x1234);
        assert_eq!(inst.size, 4);
    }

    #[test]
    fn test_branch_target_resolution() {
        // brfu 4 at pc 0x10000: target = 0x10002 + 8.
        let hw = encode_u6(Brfu, 4);
        let inst = decode(hw, 0, 0x1_0000).unwrap();
        assert_eq!(inst.operands[0], 0x1_000A);
    }

    #[test]
    fn test_backward_branch_target() {
        let hw = encode_ru6(Brbt, 1, 6);
        let inst = decode(hw, 0, 0x1_0020).unwrap();
        assert_eq!(inst.op, Brbt);
        assert_eq!(inst.operands[1], 0x1_0022 - 12);
    }

    #[test]
    fn test_roundtrip_regs() {
        let inst = decode(encode_2r(Out, 3, 4), 0, 0).unwrap();
        assert_eq!((inst.op, inst.operands[0], inst.operands[1]), (Out, 3, 4));
        let inst = decode(encode_1r(Eeu, 9), 0, 0).unwrap();
        assert_eq!((inst.op, inst.operands[0]), (Eeu, 9));
        let inst = decode(encode_0r(Ssync), 0, 0).unwrap();
        assert_eq!(inst.op, Ssync);
    }

    #[test]
    fn test_reserved_encodings_fail() {
        assert!(decode(0xFF00, 0, 0).is_none());
        // PFIX of a PFIX.
        let p = encode_u10(Pfix, 1);
        assert!(decode(p, p, 0).is_none());
        // PFIX of a 3R instruction.
        assert!(decode(p, encode_3r(Add, 0, 1, 2), 0).is_none());
    }
}
