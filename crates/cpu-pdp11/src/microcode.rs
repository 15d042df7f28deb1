//! Micro-operation definitions for the pipeline.
//!
//! Every instruction is broken into an ordered micro-op list at decode time.
//! The stages project the list onto themselves: instruction fetch takes the
//! next-word fetches, decode takes `Decode`, operand fetch takes
//! register/address fetches and address arithmetic, the ALU stage takes
//! `Alu`, writeback takes stores and branch resolution.
//!
//! Micro-ops carry no closures. Dataflow goes through cells — the scratch
//! registers owned by the command's operands plus a small bank of extra
//! scratch words — identified by `Cell`.

use crate::alu::Size;

/// Which of the command's operands a micro-op refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperandRef {
    Src,
    Dst,
    /// Hidden operand used by the jump group for its stack access
    /// (JSR push / RTS pop).
    Aux,
}

/// A 16-bit scratch location inside the owning command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cell {
    /// The scratch register of an operand.
    Operand(OperandRef),
    /// One of the command's extra scratch words (MARK temporaries, MUL
    /// high word, jump linkage).
    Extra(u8),
}

/// Where a fetched next-instruction word lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WordSink {
    /// The opcode fetch itself; the word was already decoded at enqueue.
    Discard,
    /// Index word for mode 6/7: parked on the operand until address
    /// arithmetic consumes it.
    NextWord(OperandRef),
    /// PC-immediate/absolute: straight into a scratch cell.
    Cell(Cell),
}

/// Zero/short address-arithmetic step run by the operand-fetch stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecAction {
    /// scratch += parked next-instruction word (indexed modes).
    AddNextWord(OperandRef),
    /// Capture the operand's scratch as its effective address, so later
    /// indirection loads cannot clobber it before writeback.
    CaptureAddress(OperandRef),
    /// cell += constant (MARK stack arithmetic).
    AddCell { cell: Cell, value: u16 },
}

/// ALU-stage work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AluAction {
    /// Run the command's execute step (PSW effects live there).
    Execute,
    /// Plain word move between cells; no PSW effect. Used by the jump
    /// group's internal register moves.
    Copy { from: Cell, to: Cell },
    /// SOB's counter decrement; the later `Execute` tests the result.
    Decrement(Cell),
}

/// One step of an instruction, interpreted by a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MicroOp {
    /// Instruction decoded (single op claimed by the decode stage).
    Decode,
    /// Fetch the word after the opcode through the icache.
    FetchNextWord { size: Size, sink: WordSink },
    /// Read a general register into a cell.
    FetchRegister { reg: u8, size: Size, dest: Cell },
    /// Load from memory at the address held in `addr` into `dest`.
    FetchAddress { addr: Cell, size: Size, dest: Cell },
    /// Address arithmetic in the operand-fetch stage.
    Execute { action: ExecAction, cycles: u8 },
    /// ALU latency plus its effect.
    Alu { action: AluAction, cycles: u8 },
    /// Auto-increment (post-increment modes).
    IncRegister { reg: u8, step: u16 },
    /// Auto-decrement (pre-decrement modes).
    DecRegister { reg: u8, step: u16 },
    /// Writeback into a register.
    StoreRegister { reg: u8, size: Size, value: Cell },
    /// Writeback into memory at the operand's captured address.
    StoreAddress { addr: OperandRef, size: Size, value: Cell },
    /// Branch resolution: PC += offset when the condition held.
    BranchIf { offset: i16 },
}

impl MicroOp {
    /// True for the ops the operand-fetch stage interprets.
    pub(crate) fn is_operand_stage(&self) -> bool {
        matches!(
            self,
            MicroOp::FetchRegister { .. }
                | MicroOp::FetchAddress { .. }
                | MicroOp::IncRegister { .. }
                | MicroOp::DecRegister { .. }
                | MicroOp::Execute { .. }
        )
    }

    /// True for the ops the writeback stage interprets.
    pub(crate) fn is_writeback_stage(&self) -> bool {
        matches!(
            self,
            MicroOp::StoreRegister { .. }
                | MicroOp::StoreAddress { .. }
                | MicroOp::BranchIf { .. }
        )
    }
}
