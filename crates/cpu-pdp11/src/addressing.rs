//! Operand descriptors and addressing-mode micro-op sequences.
//!
//! Eight modes × eight registers. Each operand owns a scratch register that
//! the fetch sequence funnels values through, and a captured effective
//! address the store sequence writes back to. PC operands are restricted to
//! register, immediate, absolute, relative and relative-deferred forms.

use crate::alu::Size;
use crate::error::Fault;
use crate::microcode::{Cell, ExecAction, MicroOp, OperandRef, WordSink};
use crate::registers::{PC, SP};

/// One source or destination operand.
#[derive(Debug, Clone)]
pub struct Operand {
    reg: u8,
    mode: u8,
    /// Scratch register the fetch sequence resolves into.
    pub(crate) scratch: u16,
    /// Effective address captured before the final indirection load.
    pub(crate) address: u16,
    /// Next-instruction word parked here for the indexed modes.
    pub(crate) next_word: u16,
    /// JMP/JSR destinations and MOV destinations resolve the address but
    /// skip the final operand load.
    pub(crate) do_not_fetch: bool,
}

impl Operand {
    pub(crate) fn new(reg: u8, mode: u8) -> Result<Self, Fault> {
        debug_assert!(reg < 8 && mode < 8);
        if reg == PC && !matches!(mode, 0 | 2 | 3 | 6 | 7) {
            return Err(Fault::OperandWrongPcMode(mode));
        }
        Ok(Self {
            reg,
            mode,
            scratch: 0,
            address: 0,
            next_word: 0,
            do_not_fetch: false,
        })
    }

    #[must_use]
    pub fn reg(&self) -> u8 {
        self.reg
    }

    #[must_use]
    pub fn mode(&self) -> u8 {
        self.mode
    }

    /// Whether the encoding carries a word after the opcode for this
    /// operand (index word, immediate or absolute address).
    #[must_use]
    pub fn requires_next_word(&self) -> bool {
        (self.reg == PC && self.mode != 0) || self.mode / 2 == 3
    }

    /// Size of the following word in the instruction stream. Only the
    /// PC-immediate form of a byte instruction fetches a byte.
    #[must_use]
    pub fn next_word_size(&self, on_byte: bool) -> Size {
        if self.reg == PC && self.mode == 2 && on_byte {
            Size::Byte
        } else {
            Size::Word
        }
    }

    /// Append the fetch/address-resolution micro-ops for this operand.
    pub(crate) fn push_fetch(&self, which: OperandRef, size: Size, ops: &mut Vec<MicroOp>) {
        let cell = Cell::Operand(which);
        let pc_stream = self.reg == PC && self.mode / 2 == 1;

        // Pre-decrement. Byte ops still step SP/PC by a full word.
        if self.mode / 2 == 2 {
            let step = if self.mode == 4 && size == Size::Byte && !matches!(self.reg, SP | PC) {
                1
            } else {
                2
            };
            ops.push(MicroOp::DecRegister { reg: self.reg, step });
        }

        // Index word for the indexed modes.
        if self.mode / 2 == 3 {
            ops.push(MicroOp::FetchNextWord {
                size: Size::Word,
                sink: WordSink::NextWord(which),
            });
        }

        // PC immediate/absolute: the following word is the value (or the
        // absolute address), fetched straight into the scratch register.
        if pc_stream {
            let fetch_size = if self.mode == 2 { size } else { Size::Word };
            ops.push(MicroOp::FetchNextWord {
                size: fetch_size,
                sink: WordSink::Cell(cell),
            });
        }

        if self.mode == 0 && self.do_not_fetch {
            return;
        }

        // Base register value.
        if !pc_stream {
            let fetch_size = if self.mode == 0 { size } else { Size::Word };
            ops.push(MicroOp::FetchRegister {
                reg: self.reg,
                size: fetch_size,
                dest: cell,
            });
        }

        if self.mode == 0 {
            return;
        }

        // Post-increment.
        if self.mode / 2 == 1 && self.reg != PC {
            let step = if self.mode == 2 && size == Size::Byte && !matches!(self.reg, SP | PC) {
                1
            } else {
                2
            };
            ops.push(MicroOp::IncRegister { reg: self.reg, step });
        }

        // Indexed modes add the parked word to the base.
        if self.mode / 2 == 3 {
            ops.push(MicroOp::Execute {
                action: ExecAction::AddNextWord(which),
                cycles: 1,
            });
        }

        // Single-indirection modes: the scratch now holds the effective
        // address; capture it before the load overwrites the scratch.
        if matches!(self.mode, 1 | 2 | 4 | 6) && !pc_stream {
            ops.push(MicroOp::Execute {
                action: ExecAction::CaptureAddress(which),
                cycles: 0,
            });
        }

        if matches!(self.mode, 1 | 2 | 4 | 6) && self.do_not_fetch {
            return;
        }

        if !pc_stream {
            let fetch_size = if matches!(self.mode, 1 | 2 | 4 | 6) {
                size
            } else {
                Size::Word
            };
            ops.push(MicroOp::FetchAddress {
                addr: cell,
                size: fetch_size,
                dest: cell,
            });
        }

        if matches!(self.mode, 1 | 2 | 4 | 6) {
            return;
        }

        // Deferred modes: the load above produced the real address.
        ops.push(MicroOp::Execute {
            action: ExecAction::CaptureAddress(which),
            cycles: 0,
        });

        if self.do_not_fetch {
            return;
        }
        ops.push(MicroOp::FetchAddress {
            addr: cell,
            size,
            dest: cell,
        });
    }

    /// Append the writeback micro-op for this operand.
    pub(crate) fn push_store(&self, which: OperandRef, size: Size, ops: &mut Vec<MicroOp>) {
        if self.mode == 0 {
            ops.push(MicroOp::StoreRegister {
                reg: self.reg,
                size,
                value: Cell::Operand(which),
            });
        } else {
            debug_assert!(!(self.reg == PC && self.mode == 2));
            ops.push(MicroOp::StoreAddress {
                addr: which,
                size,
                value: Cell::Operand(which),
            });
        }
    }

    /// Assembly text. `following` is the next-instruction word when the mode
    /// carries one.
    #[must_use]
    pub fn text(&self, following: Option<u16>) -> String {
        let value = following.unwrap_or(0);
        if self.reg == PC {
            let base = match self.mode {
                0 => "PC".to_string(),
                2 | 3 => format!("#{value:o}"),
                _ => format!("{value:o}(PC)"),
            };
            if self.mode % 2 == 1 && self.mode != 1 {
                format!("@{base}")
            } else {
                base
            }
        } else {
            let mut text = format!("R{}", self.reg);
            if self.mode != 0 {
                text = format!("({text})");
            }
            match self.mode / 2 {
                1 => text = format!("{text}+"),
                2 => text = format!("-{text}"),
                3 => text = format!("{value:o}{text}"),
                _ => {}
            }
            if self.mode % 2 == 1 && self.mode != 1 {
                text = format!("@{text}");
            }
            text
        }
    }
}
