//! Decoded instructions.
//!
//! A `Command` owns its operands, their scratch state and the ordered
//! micro-op list the pipeline stages project onto themselves. The list is
//! fixed at decode time; only the scratch cells and the branch flag mutate
//! while the instruction flows down the pipe.
//!
//! The jump group (JSR/RTS/MARK) expands to the same register-move and
//! stack-access sequences the hardware microcode would run, spelled out as
//! plain micro-ops.

use crate::alu::Size;
use crate::addressing::Operand;
use crate::error::Fault;
use crate::microcode::{AluAction, Cell, ExecAction, MicroOp, OperandRef, WordSink};
use crate::registers::{PC, SP};

/// Opcode identity, shared by the decoder, the executor and the
/// disassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Clr,
    Com,
    Inc,
    Dec,
    Neg,
    Tst,
    Asr,
    Asl,
    Ror,
    Rol,
    Swab,
    Adc,
    Sbc,
    Sxt,
    Mov,
    Cmp,
    Add,
    Sub,
    Bit,
    Bic,
    Bis,
    Mul,
    Xor,
    Br,
    Bne,
    Beq,
    Bpl,
    Bmi,
    Bvc,
    Bvs,
    Bcc,
    Bcs,
    Bge,
    Blt,
    Bgt,
    Ble,
    Bhi,
    Blos,
    Jmp,
    Jsr,
    Rts,
    Mark,
    Sob,
}

impl Op {
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Clr => "CLR",
            Op::Com => "COM",
            Op::Inc => "INC",
            Op::Dec => "DEC",
            Op::Neg => "NEG",
            Op::Tst => "TST",
            Op::Asr => "ASR",
            Op::Asl => "ASL",
            Op::Ror => "ROR",
            Op::Rol => "ROL",
            Op::Swab => "SWAB",
            Op::Adc => "ADC",
            Op::Sbc => "SBC",
            Op::Sxt => "SXT",
            Op::Mov => "MOV",
            Op::Cmp => "CMP",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Bit => "BIT",
            Op::Bic => "BIC",
            Op::Bis => "BIS",
            Op::Mul => "MUL",
            Op::Xor => "XOR",
            Op::Br => "BR",
            Op::Bne => "BNE",
            Op::Beq => "BEQ",
            Op::Bpl => "BPL",
            Op::Bmi => "BMI",
            Op::Bvc => "BVC",
            Op::Bvs => "BVS",
            Op::Bcc => "BCC",
            Op::Bcs => "BCS",
            Op::Bge => "BGE",
            Op::Blt => "BLT",
            Op::Bgt => "BGT",
            Op::Ble => "BLE",
            Op::Bhi => "BHI",
            Op::Blos => "BLOS",
            Op::Jmp => "JMP",
            Op::Jsr => "JSR",
            Op::Rts => "RTS",
            Op::Mark => "MARK",
            Op::Sob => "SOB",
        }
    }

    /// Branches and jumps drain the pipe before the next fetch.
    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(
            self,
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
                | Op::Blos
                | Op::Jmp
                | Op::Jsr
                | Op::Rts
                | Op::Mark
                | Op::Sob
        )
    }
}

/// A fully decoded instruction.
#[derive(Debug, Clone)]
pub struct Command {
    pub(crate) op: Op,
    pub(crate) on_byte: bool,
    pub(crate) size: Size,
    pub(crate) src: Option<Operand>,
    pub(crate) dst: Option<Operand>,
    /// Hidden stack operand of the jump group (JSR push / RTS pop).
    pub(crate) aux: Option<Operand>,
    /// Branch displacement in bytes (offset field ×2, sign-extended).
    pub(crate) offset: Option<i16>,
    /// MARK's parameter count.
    pub(crate) number: Option<u16>,
    pub(crate) alu_cycles: u8,
    pub(crate) micro_ops: Vec<MicroOp>,
    /// Command-private scratch words (MARK temporaries, MUL high word,
    /// jump linkage).
    pub(crate) extra: [u16; 3],
    /// Set by the ALU step, consumed by `BranchIf` at writeback.
    pub(crate) branch_taken: bool,
}

impl Command {
    fn new(op: Op, on_byte: bool, alu_cycles: u8) -> Self {
        Self {
            op,
            on_byte,
            size: if on_byte { Size::Byte } else { Size::Word },
            src: None,
            dst: None,
            aux: None,
            offset: None,
            number: None,
            alu_cycles,
            micro_ops: vec![MicroOp::Decode],
            extra: [0; 3],
            branch_taken: false,
        }
    }

    // === Builders, one per command class ===

    pub(crate) fn single_operand(
        op: Op,
        on_byte: bool,
        alu_cycles: u8,
        stores_dest: bool,
        dst: Operand,
    ) -> Self {
        let mut cmd = Self::new(op, on_byte, alu_cycles);
        let size = cmd.size;
        dst.push_fetch(OperandRef::Dst, size, &mut cmd.micro_ops);
        cmd.micro_ops.push(MicroOp::Alu {
            action: AluAction::Execute,
            cycles: alu_cycles,
        });
        if stores_dest {
            dst.push_store(OperandRef::Dst, size, &mut cmd.micro_ops);
        }
        cmd.dst = Some(dst);
        cmd
    }

    pub(crate) fn double_operand(
        op: Op,
        on_byte: bool,
        alu_cycles: u8,
        stores_dest: bool,
        src: Operand,
        mut dst: Operand,
    ) -> Self {
        let mut cmd = Self::new(op, on_byte, alu_cycles);
        let size = cmd.size;
        // MOV resolves the destination address but never reads it; a byte
        // MOV into a register widens the store to a sign-extended word.
        let store_size = if op == Op::Mov {
            dst.do_not_fetch = true;
            if on_byte && dst.mode() == 0 {
                Size::Word
            } else {
                size
            }
        } else {
            size
        };
        src.push_fetch(OperandRef::Src, size, &mut cmd.micro_ops);
        dst.push_fetch(OperandRef::Dst, size, &mut cmd.micro_ops);
        cmd.micro_ops.push(MicroOp::Alu {
            action: AluAction::Execute,
            cycles: alu_cycles,
        });
        if stores_dest {
            dst.push_store(OperandRef::Dst, store_size, &mut cmd.micro_ops);
        }
        cmd.src = Some(src);
        cmd.dst = Some(dst);
        cmd
    }

    /// XOR: register source, general destination, word only.
    pub(crate) fn register_source(op: Op, alu_cycles: u8, src_reg: u8, dst: Operand) -> Self {
        let mut cmd = Self::new(op, false, alu_cycles);
        let src = Operand::new(src_reg, 0).unwrap_or_else(|_| unreachable!());
        src.push_fetch(OperandRef::Src, Size::Word, &mut cmd.micro_ops);
        dst.push_fetch(OperandRef::Dst, Size::Word, &mut cmd.micro_ops);
        cmd.micro_ops.push(MicroOp::Alu {
            action: AluAction::Execute,
            cycles: alu_cycles,
        });
        dst.push_store(OperandRef::Dst, Size::Word, &mut cmd.micro_ops);
        cmd.src = Some(src);
        cmd.dst = Some(dst);
        cmd
    }

    /// MUL: general source, register destination; an even destination pairs
    /// with R+1 for the high word.
    pub(crate) fn mul(alu_cycles: u8, src: Operand, dst_reg: u8) -> Result<Self, Fault> {
        if matches!(dst_reg, SP | PC) {
            return Err(Fault::MulIntoSpOrPc);
        }
        let mut cmd = Self::new(Op::Mul, false, alu_cycles);
        let dst = Operand::new(dst_reg, 0)?;
        src.push_fetch(OperandRef::Src, Size::Word, &mut cmd.micro_ops);
        dst.push_fetch(OperandRef::Dst, Size::Word, &mut cmd.micro_ops);
        cmd.micro_ops.push(MicroOp::Alu {
            action: AluAction::Execute,
            cycles: alu_cycles,
        });
        dst.push_store(OperandRef::Dst, Size::Word, &mut cmd.micro_ops);
        if dst_reg % 2 == 0 {
            cmd.micro_ops.push(MicroOp::StoreRegister {
                reg: dst_reg + 1,
                size: Size::Word,
                value: Cell::Extra(0),
            });
        }
        cmd.src = Some(src);
        cmd.dst = Some(dst);
        Ok(cmd)
    }

    pub(crate) fn branch(op: Op, alu_cycles: u8, offset: i8) -> Self {
        let mut cmd = Self::new(op, false, alu_cycles);
        cmd.offset = Some(i16::from(offset) * 2);
        cmd.micro_ops.push(MicroOp::Alu {
            action: AluAction::Execute,
            cycles: alu_cycles,
        });
        cmd.micro_ops.push(MicroOp::BranchIf {
            offset: i16::from(offset) * 2,
        });
        cmd
    }

    /// SOB: decrement, then branch backwards while non-zero. PSW untouched.
    pub(crate) fn sob(alu_cycles: u8, reg: u8, offset: u16) -> Result<Self, Fault> {
        let mut cmd = Self::new(Op::Sob, false, alu_cycles);
        let dst = Operand::new(reg, 0)?;
        dst.push_fetch(OperandRef::Dst, Size::Word, &mut cmd.micro_ops);
        cmd.micro_ops.push(MicroOp::Alu {
            action: AluAction::Decrement(Cell::Operand(OperandRef::Dst)),
            cycles: 4,
        });
        dst.push_store(OperandRef::Dst, Size::Word, &mut cmd.micro_ops);
        cmd.micro_ops.push(MicroOp::Alu {
            action: AluAction::Execute,
            cycles: alu_cycles,
        });
        let displacement = -2 * (offset as i16);
        cmd.micro_ops.push(MicroOp::BranchIf {
            offset: displacement,
        });
        cmd.offset = Some(displacement);
        cmd.dst = Some(dst);
        Ok(cmd)
    }

    pub(crate) fn jmp(mut dst: Operand) -> Result<Self, Fault> {
        if dst.mode() == 0 {
            return Err(Fault::JumpToRegister);
        }
        let mut cmd = Self::new(Op::Jmp, false, 0);
        dst.do_not_fetch = true;
        dst.push_fetch(OperandRef::Dst, Size::Word, &mut cmd.micro_ops);
        cmd.micro_ops.push(MicroOp::StoreRegister {
            reg: PC,
            size: Size::Word,
            value: Cell::Operand(OperandRef::Dst),
        });
        cmd.dst = Some(dst);
        Ok(cmd)
    }

    /// JSR: push the linkage register, move the return PC into it, jump.
    pub(crate) fn jsr(link_reg: u8, mut dst: Operand) -> Result<Self, Fault> {
        if dst.mode() == 0 {
            return Err(Fault::JumpToRegister);
        }
        let mut cmd = Self::new(Op::Jsr, false, 0);
        dst.do_not_fetch = true;
        dst.push_fetch(OperandRef::Dst, Size::Word, &mut cmd.micro_ops);

        // Push: the expansion of MOV link, -(SP).
        let src = Operand::new(link_reg, 0)?;
        let mut aux = Operand::new(SP, 4)?;
        aux.do_not_fetch = true;
        src.push_fetch(OperandRef::Src, Size::Word, &mut cmd.micro_ops);
        aux.push_fetch(OperandRef::Aux, Size::Word, &mut cmd.micro_ops);
        cmd.micro_ops.push(MicroOp::Alu {
            action: AluAction::Copy {
                from: Cell::Operand(OperandRef::Src),
                to: Cell::Operand(OperandRef::Aux),
            },
            cycles: 3,
        });
        aux.push_store(OperandRef::Aux, Size::Word, &mut cmd.micro_ops);

        // Linkage: the expansion of MOV PC, link.
        cmd.micro_ops.push(MicroOp::FetchRegister {
            reg: PC,
            size: Size::Word,
            dest: Cell::Extra(0),
        });
        cmd.micro_ops.push(MicroOp::Alu {
            action: AluAction::Copy {
                from: Cell::Extra(0),
                to: Cell::Extra(1),
            },
            cycles: 3,
        });
        cmd.micro_ops.push(MicroOp::StoreRegister {
            reg: link_reg,
            size: Size::Word,
            value: Cell::Extra(1),
        });

        cmd.micro_ops.push(MicroOp::StoreRegister {
            reg: PC,
            size: Size::Word,
            value: Cell::Operand(OperandRef::Dst),
        });
        cmd.src = Some(src);
        cmd.aux = Some(aux);
        cmd.dst = Some(dst);
        Ok(cmd)
    }

    /// RTS: jump through the linkage register, pop its saved value.
    pub(crate) fn rts(reg: u8) -> Result<Self, Fault> {
        let mut cmd = Self::new(Op::Rts, false, 0);
        let src = Operand::new(reg, 0)?;
        src.push_fetch(OperandRef::Src, Size::Word, &mut cmd.micro_ops);
        cmd.micro_ops.push(MicroOp::StoreRegister {
            reg: PC,
            size: Size::Word,
            value: Cell::Operand(OperandRef::Src),
        });

        // Pop: the expansion of MOV (SP)+, reg.
        let aux = Operand::new(SP, 2)?;
        aux.push_fetch(OperandRef::Aux, Size::Word, &mut cmd.micro_ops);
        cmd.micro_ops.push(MicroOp::Alu {
            action: AluAction::Copy {
                from: Cell::Operand(OperandRef::Aux),
                to: Cell::Extra(0),
            },
            cycles: 3,
        });
        cmd.micro_ops.push(MicroOp::StoreRegister {
            reg,
            size: Size::Word,
            value: Cell::Extra(0),
        });
        cmd.src = Some(src);
        cmd.aux = Some(aux);
        Ok(cmd)
    }

    /// MARK n: SP ← SP + 2n, PC ← R5, R5 ← pop.
    pub(crate) fn mark(number: u16) -> Self {
        let mut cmd = Self::new(Op::Mark, false, 0);
        cmd.number = Some(number);
        cmd.micro_ops.push(MicroOp::FetchRegister {
            reg: SP,
            size: Size::Word,
            dest: Cell::Extra(0),
        });
        cmd.micro_ops.push(MicroOp::Execute {
            action: ExecAction::AddCell {
                cell: Cell::Extra(0),
                value: number.wrapping_mul(2),
            },
            cycles: 1,
        });
        cmd.micro_ops.push(MicroOp::FetchRegister {
            reg: 5,
            size: Size::Word,
            dest: Cell::Extra(1),
        });
        cmd.micro_ops.push(MicroOp::FetchAddress {
            addr: Cell::Extra(0),
            size: Size::Word,
            dest: Cell::Extra(2),
        });
        cmd.micro_ops.push(MicroOp::Execute {
            action: ExecAction::AddCell {
                cell: Cell::Extra(0),
                value: 2,
            },
            cycles: 1,
        });
        cmd.micro_ops.push(MicroOp::StoreRegister {
            reg: SP,
            size: Size::Word,
            value: Cell::Extra(0),
        });
        cmd.micro_ops.push(MicroOp::StoreRegister {
            reg: 5,
            size: Size::Word,
            value: Cell::Extra(2),
        });
        cmd.micro_ops.push(MicroOp::StoreRegister {
            reg: PC,
            size: Size::Word,
            value: Cell::Extra(1),
        });
        cmd
    }

    // === Accessors ===

    #[must_use]
    pub fn op(&self) -> Op {
        self.op
    }

    #[must_use]
    pub fn mnemonic(&self) -> String {
        if self.on_byte {
            format!("{}B", self.op.mnemonic())
        } else {
            self.op.mnemonic().to_string()
        }
    }

    #[must_use]
    pub fn on_byte(&self) -> bool {
        self.on_byte
    }

    #[must_use]
    pub fn size(&self) -> Size {
        self.size
    }

    #[must_use]
    pub fn src(&self) -> Option<&Operand> {
        self.src.as_ref()
    }

    #[must_use]
    pub fn dst(&self) -> Option<&Operand> {
        self.dst.as_ref()
    }

    #[must_use]
    pub fn is_control(&self) -> bool {
        self.op.is_control()
    }

    /// Words following the opcode in the instruction stream.
    #[must_use]
    pub fn num_next_words(&self) -> usize {
        let mut num = 0;
        if self.src.as_ref().is_some_and(Operand::requires_next_word) {
            num += 1;
        }
        if self.dst.as_ref().is_some_and(Operand::requires_next_word) {
            num += 1;
        }
        num
    }

    /// Fetch sizes of the following words, source first.
    #[must_use]
    pub fn next_word_sizes(&self) -> Vec<Size> {
        let mut sizes = Vec::new();
        for operand in [self.src.as_ref(), self.dst.as_ref()].into_iter().flatten() {
            if operand.requires_next_word() {
                sizes.push(operand.next_word_size(self.on_byte));
            }
        }
        sizes
    }

    /// Assembly text; `following` supplies the words after the opcode.
    #[must_use]
    pub fn text(&self, following: &[u16]) -> String {
        let mut words = following.iter().copied();
        let mut take = |operand: &Operand| {
            if operand.requires_next_word() {
                operand.text(words.next())
            } else {
                operand.text(None)
            }
        };
        let src = self.src.as_ref().map(&mut take);
        let dst = self.dst.as_ref().map(&mut take);
        let mnemonic = self.mnemonic();
        match (src, dst) {
            (Some(src), Some(dst)) => format!("{mnemonic} {src}, {dst}"),
            (None, Some(dst)) => {
                if let Some(offset) = self.offset {
                    // SOB displays the raw iteration count.
                    format!("{mnemonic} {dst}, {}", octal_signed(-offset / 2))
                } else {
                    format!("{mnemonic} {dst}")
                }
            }
            (Some(src), None) => format!("{mnemonic} {src}"),
            (None, None) => {
                if let Some(offset) = self.offset {
                    format!("{mnemonic} {}", octal_signed(offset / 2))
                } else if let Some(number) = self.number {
                    format!("{mnemonic} {number:o}")
                } else {
                    mnemonic
                }
            }
        }
    }

    // === Scratch-cell plumbing used by the pipeline ===

    pub(crate) fn operand(&self, which: OperandRef) -> &Operand {
        let operand = match which {
            OperandRef::Src => self.src.as_ref(),
            OperandRef::Dst => self.dst.as_ref(),
            OperandRef::Aux => self.aux.as_ref(),
        };
        debug_assert!(operand.is_some(), "micro-op references a missing operand");
        operand.unwrap_or_else(|| unreachable!())
    }

    fn operand_mut(&mut self, which: OperandRef) -> &mut Operand {
        let operand = match which {
            OperandRef::Src => self.src.as_mut(),
            OperandRef::Dst => self.dst.as_mut(),
            OperandRef::Aux => self.aux.as_mut(),
        };
        debug_assert!(operand.is_some(), "micro-op references a missing operand");
        operand.unwrap_or_else(|| unreachable!())
    }

    pub(crate) fn cell_word(&self, cell: Cell) -> u16 {
        match cell {
            Cell::Operand(which) => self.operand(which).scratch,
            Cell::Extra(index) => self.extra[index as usize],
        }
    }

    pub(crate) fn set_cell_word(&mut self, cell: Cell, value: u16) {
        match cell {
            Cell::Operand(which) => self.operand_mut(which).scratch = value,
            Cell::Extra(index) => self.extra[index as usize] = value,
        }
    }

    /// Low-byte write preserving the high byte, like byte loads into a
    /// register.
    pub(crate) fn set_cell_byte(&mut self, cell: Cell, value: u8) {
        let word = (self.cell_word(cell) & 0xFF00) | u16::from(value);
        self.set_cell_word(cell, word);
    }

    pub(crate) fn set_cell_sized(&mut self, cell: Cell, size: Size, value: u16) {
        match size {
            Size::Byte => self.set_cell_byte(cell, value as u8),
            Size::Word => self.set_cell_word(cell, value),
        }
    }

    /// Value a store micro-op writes, narrowed to its size.
    pub(crate) fn store_value(&self, cell: Cell, size: Size) -> u16 {
        match size {
            Size::Byte => self.cell_word(cell) & 0xFF,
            Size::Word => self.cell_word(cell),
        }
    }

    /// Captured effective address of a destination operand.
    pub(crate) fn capture_address(&self, which: OperandRef) -> u16 {
        self.operand(which).address
    }

    pub(crate) fn deliver_next_word(&mut self, sink: WordSink, word: u16, size: Size) {
        match sink {
            WordSink::Discard => {}
            WordSink::NextWord(which) => self.operand_mut(which).next_word = word,
            WordSink::Cell(cell) => self.set_cell_sized(cell, size, word),
        }
    }

    pub(crate) fn apply_exec(&mut self, action: ExecAction) {
        match action {
            ExecAction::AddNextWord(which) => {
                let operand = self.operand_mut(which);
                operand.scratch = operand.scratch.wrapping_add(operand.next_word);
            }
            ExecAction::CaptureAddress(which) => {
                let operand = self.operand_mut(which);
                operand.address = operand.scratch;
            }
            ExecAction::AddCell { cell, value } => {
                let word = self.cell_word(cell).wrapping_add(value);
                self.set_cell_word(cell, word);
            }
        }
    }
}

fn octal_signed(value: i16) -> String {
    if value < 0 {
        format!("-{:o}", -i32::from(value))
    } else {
        format!("{value:o}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_offset_doubles() {
        let cmd = Command::branch(Op::Br, 7, -2);
        assert_eq!(cmd.offset, Some(-4));
        assert!(cmd.is_control());
        assert_eq!(cmd.text(&[]), "BR -2");
    }

    #[test]
    fn sob_counts_stores_and_branch() {
        let cmd = Command::sob(7, 2, 1).unwrap();
        assert_eq!(cmd.offset, Some(-2));
        let stores = cmd
            .micro_ops
            .iter()
            .filter(|op| op.is_writeback_stage())
            .count();
        assert_eq!(stores, 2); // StoreRegister + BranchIf
        assert_eq!(cmd.text(&[]), "SOB R2, 1");
    }

    #[test]
    fn jsr_blocks_link_and_pc() {
        let dst = Operand::new(2, 1).unwrap();
        let cmd = Command::jsr(5, dst).unwrap();
        let stored: Vec<u8> = cmd
            .micro_ops
            .iter()
            .filter_map(|op| match op {
                MicroOp::StoreRegister { reg, .. } => Some(*reg),
                _ => None,
            })
            .collect();
        assert_eq!(stored, vec![5, PC]);
        assert!(cmd
            .micro_ops
            .iter()
            .any(|op| matches!(op, MicroOp::StoreAddress { .. })));
        assert_eq!(cmd.text(&[]), "JSR R5, (R2)");
    }

    #[test]
    fn jump_to_register_is_a_fault() {
        let dst = Operand::new(3, 0).unwrap();
        assert!(matches!(Command::jmp(dst), Err(Fault::JumpToRegister)));
    }

    #[test]
    fn mul_into_sp_is_a_fault() {
        let src = Operand::new(1, 0).unwrap();
        assert!(matches!(
            Command::mul(40, src, SP),
            Err(Fault::MulIntoSpOrPc)
        ));
    }

    #[test]
    fn mov_immediate_counts_following_word() {
        let src = Operand::new(PC, 2).unwrap();
        let dst = Operand::new(1, 0).unwrap();
        let cmd = Command::double_operand(Op::Mov, false, 3, true, src, dst);
        assert_eq!(cmd.num_next_words(), 1);
        assert_eq!(cmd.text(&[0o17]), "MOV #17, R1");
    }
}
