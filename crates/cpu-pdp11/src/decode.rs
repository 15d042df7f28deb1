//! Instruction decode.
//!
//! A fixed ordered table of (mask, match) rows — the compiled form of the
//! instruction-set bit patterns. Decode scans the table, extracts the
//! operand fields and builds the command with its micro-op list.
//!
//! Field layout (bits 15..0): single-operand `B ooooooooo mmmrrr`,
//! double-operand `B ooo MMMRRR mmmrrr`, branches `oooooooo dddddddd`.

use crate::addressing::Operand;
use crate::command::{Command, Op};
use crate::error::Fault;

/// One opcode pattern. `has_byte` rows read the byte-variant flag from
/// bit 15; their mask leaves it out.
struct Pattern {
    mask: u16,
    bits: u16,
    op: Op,
    stores_dest: bool,
    alu_cycles: u8,
    has_byte: bool,
}

const fn byte_op(mask: u16, bits: u16, op: Op, stores_dest: bool, alu_cycles: u8) -> Pattern {
    Pattern {
        mask,
        bits,
        op,
        stores_dest,
        alu_cycles,
        has_byte: true,
    }
}

const fn word_op(mask: u16, bits: u16, op: Op, stores_dest: bool, alu_cycles: u8) -> Pattern {
    Pattern {
        mask,
        bits,
        op,
        stores_dest,
        alu_cycles,
        has_byte: false,
    }
}

/// Ordered scan list; hot patterns (moves, ALU ops) near the top.
#[rustfmt::skip]
const PATTERNS: &[Pattern] = &[
    byte_op(0x7FC0, 0x0A00, Op::Clr,  true,  4),
    byte_op(0x7FC0, 0x0A40, Op::Com,  true,  4),
    byte_op(0x7FC0, 0x0A80, Op::Inc,  true,  4),
    byte_op(0x7FC0, 0x0AC0, Op::Dec,  true,  4),
    byte_op(0x7FC0, 0x0B00, Op::Neg,  true,  4),
    byte_op(0x7FC0, 0x0BC0, Op::Tst,  false, 4),
    byte_op(0x7FC0, 0x0C80, Op::Asr,  true,  5),
    byte_op(0x7FC0, 0x0CC0, Op::Asl,  true,  4),
    byte_op(0x7FC0, 0x0C00, Op::Ror,  true,  5),
    byte_op(0x7FC0, 0x0C40, Op::Rol,  true,  4),
    word_op(0xFFC0, 0x00C0, Op::Swab, true,  4),
    byte_op(0x7FC0, 0x0B40, Op::Adc,  true,  4),
    byte_op(0x7FC0, 0x0B80, Op::Sbc,  true,  4),
    word_op(0xFFC0, 0x0DC0, Op::Sxt,  true,  4),
    byte_op(0x7000, 0x1000, Op::Mov,  true,  3),
    byte_op(0x7000, 0x2000, Op::Cmp,  false, 3),
    word_op(0xF000, 0x6000, Op::Add,  true,  3),
    word_op(0xF000, 0xE000, Op::Sub,  true,  3),
    byte_op(0x7000, 0x3000, Op::Bit,  false, 3),
    byte_op(0x7000, 0x4000, Op::Bic,  true,  3),
    byte_op(0x7000, 0x5000, Op::Bis,  true,  3),
    word_op(0xFE00, 0x7000, Op::Mul,  true,  40),
    word_op(0xFE00, 0x7800, Op::Xor,  true,  3),
    word_op(0xFF00, 0x0100, Op::Br,   false, 7),
    word_op(0xFF00, 0x0200, Op::Bne,  false, 7),
    word_op(0xFF00, 0x0300, Op::Beq,  false, 7),
    word_op(0xFF00, 0x8000, Op::Bpl,  false, 7),
    word_op(0xFF00, 0x8100, Op::Bmi,  false, 7),
    word_op(0xFF00, 0x8400, Op::Bvc,  false, 7),
    word_op(0xFF00, 0x8500, Op::Bvs,  false, 7),
    word_op(0xFF00, 0x8600, Op::Bcc,  false, 7),
    word_op(0xFF00, 0x8700, Op::Bcs,  false, 7),
    word_op(0xFF00, 0x0400, Op::Bge,  false, 7),
    word_op(0xFF00, 0x0500, Op::Blt,  false, 7),
    word_op(0xFF00, 0x0600, Op::Bgt,  false, 7),
    word_op(0xFF00, 0x0700, Op::Ble,  false, 7),
    word_op(0xFF00, 0x8200, Op::Bhi,  false, 7),
    word_op(0xFF00, 0x8300, Op::Blos, false, 7),
    word_op(0xFFC0, 0x0040, Op::Jmp,  false, 0),
    word_op(0xFE00, 0x0800, Op::Jsr,  false, 0),
    word_op(0xFFF8, 0x0080, Op::Rts,  false, 0),
    word_op(0xFFC0, 0x0D00, Op::Mark, false, 0),
    word_op(0xFE00, 0x7E00, Op::Sob,  false, 7),
];

fn dst_operand(word: u16) -> Result<Operand, Fault> {
    Operand::new((word & 7) as u8, ((word >> 3) & 7) as u8)
}

fn src_operand(word: u16) -> Result<Operand, Fault> {
    Operand::new(((word >> 6) & 7) as u8, ((word >> 9) & 7) as u8)
}

/// Decode one 16-bit instruction word.
pub fn decode(word: u16) -> Result<Command, Fault> {
    for pattern in PATTERNS {
        if word & pattern.mask != pattern.bits {
            continue;
        }
        let on_byte = pattern.has_byte && word & 0x8000 != 0;
        let mut alu_cycles = pattern.alu_cycles;
        // Byte-size latency adjustments: shifts/rotates pay one extra ALU
        // cycle, byte moves pay three.
        if on_byte {
            match pattern.op {
                Op::Asr | Op::Asl | Op::Ror | Op::Rol => alu_cycles += 1,
                Op::Mov => alu_cycles += 3,
                _ => {}
            }
        }
        return build(pattern, word, on_byte, alu_cycles);
    }
    Err(Fault::UnknownOpcode(word))
}

fn build(pattern: &Pattern, word: u16, on_byte: bool, alu_cycles: u8) -> Result<Command, Fault> {
    let op = pattern.op;
    match op {
        Op::Clr
        | Op::Com
        | Op::Inc
        | Op::Dec
        | Op::Neg
        | Op::Tst
        | Op::Asr
        | Op::Asl
        | Op::Ror
        | Op::Rol
        | Op::Swab
        | Op::Adc
        | Op::Sbc
        | Op::Sxt => Ok(Command::single_operand(
            op,
            on_byte,
            alu_cycles,
            pattern.stores_dest,
            dst_operand(word)?,
        )),
        Op::Mov | Op::Cmp | Op::Add | Op::Sub | Op::Bit | Op::Bic | Op::Bis => {
            Ok(Command::double_operand(
                op,
                on_byte,
                alu_cycles,
                pattern.stores_dest,
                src_operand(word)?,
                dst_operand(word)?,
            ))
        }
        Op::Mul => {
            // MUL packs the general operand in bits 8..3 and the register
            // destination in bits 2..0.
            let src = Operand::new(((word >> 3) & 7) as u8, ((word >> 6) & 7) as u8)?;
            Command::mul(alu_cycles, src, (word & 7) as u8)
        }
        Op::Xor => Ok(Command::register_source(
            op,
            alu_cycles,
            ((word >> 6) & 7) as u8,
            dst_operand(word)?,
        )),
        Op::Br
        | Op::Bne
        | Op::Beq
        | Op::Bpl
        | Op::Bmi
        | Op::Bvc
        | Op::Bvs
        | Op::Bcc
        | Op::Bcs
        | Op::Bge
        | Op::Blt
        | Op::Bgt
        | Op::Ble
        | Op::Bhi
        | Op::Blos => Ok(Command::branch(op, alu_cycles, word as i8)),
        Op::Jmp => Command::jmp(dst_operand(word)?),
        Op::Jsr => Command::jsr(((word >> 6) & 7) as u8, dst_operand(word)?),
        Op::Rts => Command::rts((word & 7) as u8),
        Op::Mark => Ok(Command::mark(word & 0x3F)),
        Op::Sob => Command::sob(alu_cycles, ((word >> 6) & 7) as u8, word & 0x3F),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alu::Size;

    #[test]
    fn clr_word_register() {
        let cmd = decode(0b0000_1010_0000_0001).unwrap();
        assert_eq!(cmd.op(), Op::Clr);
        assert!(!cmd.on_byte());
        assert_eq!(cmd.dst().unwrap().reg(), 1);
        assert_eq!(cmd.dst().unwrap().mode(), 0);
    }

    #[test]
    fn clr_byte_deferred() {
        let cmd = decode(0b1000_1010_0000_1001).unwrap();
        assert_eq!(cmd.op(), Op::Clr);
        assert!(cmd.on_byte());
        assert_eq!(cmd.size(), Size::Byte);
        assert_eq!(cmd.dst().unwrap().mode(), 1);
    }

    #[test]
    fn mov_fields() {
        // MOV R2, (R4)+ = 0o010224
        let cmd = decode(0o010224).unwrap();
        assert_eq!(cmd.op(), Op::Mov);
        assert_eq!(cmd.src().unwrap().reg(), 2);
        assert_eq!(cmd.src().unwrap().mode(), 0);
        assert_eq!(cmd.dst().unwrap().reg(), 4);
        assert_eq!(cmd.dst().unwrap().mode(), 2);
    }

    #[test]
    fn add_and_sub_are_word_only() {
        assert_eq!(decode(0o060001).unwrap().op(), Op::Add);
        assert_eq!(decode(0o160001).unwrap().op(), Op::Sub);
        assert!(!decode(0o160001).unwrap().on_byte());
    }

    #[test]
    fn branch_offsets_sign_extend() {
        let cmd = decode(0x01FE).unwrap(); // BR .-2
        assert_eq!(cmd.op(), Op::Br);
        assert_eq!(cmd.text(&[]), "BR -2");
        let fwd = decode(0x0203).unwrap(); // BNE .+3 words
        assert_eq!(fwd.op(), Op::Bne);
    }

    #[test]
    fn sob_and_jsr() {
        let sob = decode(0b0111_1110_1000_0001).unwrap();
        assert_eq!(sob.op(), Op::Sob);
        let jsr = decode(0b0000_1001_0100_1010).unwrap();
        assert_eq!(jsr.op(), Op::Jsr);
        assert_eq!(jsr.dst().unwrap().mode(), 1);
        assert_eq!(jsr.dst().unwrap().reg(), 2);
    }

    #[test]
    fn rts_and_mark() {
        assert_eq!(decode(0o000205).unwrap().op(), Op::Rts);
        assert_eq!(decode(0o006403).unwrap().op(), Op::Mark);
    }

    #[test]
    fn byte_latency_adjustments() {
        // Encodings only matter through the table; inspect via text.
        let movb = decode(0x9000 | 0o000102).unwrap(); // MOVB R1, R2
        assert_eq!(movb.mnemonic(), "MOVB");
        let asrb = decode(0x8000 | 0o006201).unwrap(); // ASRB R1
        assert_eq!(asrb.mnemonic(), "ASRB");
    }

    #[test]
    fn unknown_and_invalid() {
        assert!(matches!(decode(0), Err(Fault::UnknownOpcode(0))));
        // CLR @#... is fine, but CLR with PC in mode 4 is not.
        assert!(matches!(
            decode(0o005047),
            Err(Fault::OperandWrongPcMode(4))
        ));
        // JMP R3: jump to a register faults.
        assert!(matches!(decode(0o000103), Err(Fault::JumpToRegister)));
        // MUL into SP.
        assert!(matches!(decode(0o070016), Err(Fault::MulIntoSpOrPc)));
    }
}
