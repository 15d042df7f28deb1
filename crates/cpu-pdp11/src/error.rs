//! Engine faults.
//!
//! Faults are never retried. Decode faults surface synchronously; runtime
//! faults abort the current cycle and stop the engine with its state
//! preserved for inspection.

use std::fmt;

/// A condition that stops the engine (or rejects a host request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// No opcode pattern matches the 16-bit word.
    UnknownOpcode(u16),
    /// PC-based operand with a mode outside {0, 2, 3, 6, 7}.
    OperandWrongPcMode(u8),
    /// JMP/JSR destination is a plain register.
    JumpToRegister,
    /// MUL destination is SP or PC.
    MulIntoSpOrPc,
    /// Word access at an odd address.
    OddAddress(u16),
    /// Odd value written to SP or PC.
    RegisterOddValue,
    /// SP moved outside its configured bounds.
    StackOverflow(u16),
    /// Unblocking a register that is not blocked.
    RegisterUnblock,
    /// Unblocking a cache address that is not pinned.
    CacheUnblock,
    /// VRAM/ROM/IO regions overlap after (re)configuration.
    WrongMemoryLayout,
    /// Mode register selects a video mode that does not exist.
    WrongVideoMode(u8),
    /// Breakpoint requested on an odd address.
    OddBreakpoint(u16),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode(word) => {
                write!(f, "unrecognized instruction {word:#018b}")
            }
            Self::OperandWrongPcMode(mode) => {
                write!(f, "mode {mode} is not valid for a PC operand")
            }
            Self::JumpToRegister => write!(f, "cannot jump to a register"),
            Self::MulIntoSpOrPc => {
                write!(f, "cannot multiply into SP or PC")
            }
            Self::OddAddress(addr) => {
                write!(f, "word access at odd address {addr:#06X}")
            }
            Self::RegisterOddValue => {
                write!(f, "tried to set an odd value into SP or PC")
            }
            Self::StackOverflow(sp) => {
                write!(f, "stack pointer {sp:#06X} is out of bounds")
            }
            Self::RegisterUnblock => {
                write!(f, "tried to unblock a register that is not blocked")
            }
            Self::CacheUnblock => {
                write!(f, "tried to unblock a cache address that is not pinned")
            }
            Self::WrongMemoryLayout => {
                write!(f, "wrong layout of memory and devices")
            }
            Self::WrongVideoMode(mode) => write!(f, "wrong video mode {mode}"),
            Self::OddBreakpoint(addr) => {
                write!(f, "breakpoint at odd address {addr:#06X}")
            }
        }
    }
}

impl std::error::Error for Fault {}
