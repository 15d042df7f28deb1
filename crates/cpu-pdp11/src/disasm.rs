//! Disassembly of memory ranges.
//!
//! A linear scan, two bytes at a time. Words that decode become text rows;
//! their following words (immediates, absolute addresses, index offsets)
//! become PART_OF_PREVIOUS rows with the values substituted into the text.
//! Words that do not decode are marked as data. The octal view is handled
//! by the caller formatting raw words with [`octal`].

use std::collections::BTreeMap;

use crate::alu::Size;
use crate::bus::Bus;
use crate::command::Command;
use crate::decode::decode;
use crate::error::Fault;

/// What a listing row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisasmState {
    /// The word does not decode.
    NotAnInstruction,
    /// Never scanned.
    Undefined,
    /// Instruction start with a textual form.
    Disassembled,
    /// Following word of the previous instruction.
    PartOfPrevious,
}

/// One row of a listing.
#[derive(Debug, Clone)]
pub struct DisasmEntry {
    state: DisasmState,
    text: Option<String>,
    num_next: usize,
}

impl DisasmEntry {
    #[must_use]
    pub fn undefined() -> Self {
        Self {
            state: DisasmState::Undefined,
            text: None,
            num_next: 0,
        }
    }

    #[must_use]
    pub fn not_an_instruction() -> Self {
        Self {
            state: DisasmState::NotAnInstruction,
            text: None,
            num_next: 0,
        }
    }

    #[must_use]
    pub fn disassembled(text: String, num_next: usize) -> Self {
        Self {
            state: DisasmState::Disassembled,
            text: Some(text),
            num_next,
        }
    }

    #[must_use]
    pub fn part_of_previous(num_next: usize) -> Self {
        Self {
            state: DisasmState::PartOfPrevious,
            text: None,
            num_next,
        }
    }

    #[must_use]
    pub fn state(&self) -> DisasmState {
        self.state
    }

    /// Words following this instruction's opcode.
    #[must_use]
    pub fn num_next(&self) -> usize {
        self.num_next
    }

    #[must_use]
    pub fn display_text(&self) -> &str {
        match self.state {
            DisasmState::NotAnInstruction => "Not an instruction",
            DisasmState::Disassembled => self.text.as_deref().unwrap_or(""),
            DisasmState::Undefined | DisasmState::PartOfPrevious => "",
        }
    }
}

/// Six-digit octal form of a raw word.
#[must_use]
pub fn octal(word: u16) -> String {
    format!("{word:06o}")
}

/// Scan `[from, to)` and produce a listing row per word address.
///
/// Any decode error marks the row as data; an instruction whose following
/// words run past `to` degrades into data rows.
pub fn disassemble_range<B: Bus>(
    bus: &mut B,
    from: u16,
    to: u16,
) -> Result<BTreeMap<u16, DisasmEntry>, Fault> {
    let mut entries = BTreeMap::new();
    let mut stored = true;
    let mut cur_next = 0usize;
    let mut num_next = 0usize;
    let mut pending_addr = 0u16;
    let mut pending: Option<Command> = None;
    let mut data: Vec<u16> = Vec::new();
    let mut sizes: Vec<Size> = Vec::new();

    let mut addr = from;
    while addr < to {
        entries.insert(addr, DisasmEntry::undefined());
        if !stored {
            let word = bus.load(addr, sizes[cur_next])?;
            data.push(word);
            cur_next += 1;
            if cur_next == num_next {
                if let Some(command) = pending.take() {
                    entries.insert(
                        pending_addr,
                        DisasmEntry::disassembled(command.text(&data), num_next),
                    );
                }
                stored = true;
            }
            entries.insert(addr, DisasmEntry::part_of_previous(num_next));
            addr = addr.wrapping_add(2);
            continue;
        }

        let word = bus.load(addr, Size::Word)?;
        match decode(word) {
            Err(_) => {
                entries.insert(addr, DisasmEntry::not_an_instruction());
            }
            Ok(command) => {
                if command.num_next_words() == 0 {
                    entries.insert(
                        addr,
                        DisasmEntry::disassembled(command.text(&[]), 0),
                    );
                } else {
                    cur_next = 0;
                    num_next = command.num_next_words();
                    sizes = command.next_word_sizes();
                    data.clear();
                    stored = false;
                    pending_addr = addr;
                    pending = Some(command);
                }
            }
        }
        addr = addr.wrapping_add(2);
    }

    if !stored {
        let mut tail = pending_addr;
        while tail < to {
            entries.insert(tail, DisasmEntry::not_an_instruction());
            tail = tail.wrapping_add(2);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WordBus(Vec<u8>);

    impl Bus for WordBus {
        fn load(&mut self, address: u16, size: Size) -> Result<u16, Fault> {
            match size {
                Size::Byte => Ok(u16::from(self.0[address as usize])),
                Size::Word => Ok(u16::from(self.0[address as usize + 1]) << 8
                    | u16::from(self.0[address as usize])),
            }
        }

        fn store(&mut self, address: u16, size: Size, value: u16) -> Result<(), Fault> {
            self.0[address as usize] = value as u8;
            if size == Size::Word {
                self.0[address as usize + 1] = (value >> 8) as u8;
            }
            Ok(())
        }

        fn is_device(&self, _address: u16) -> bool {
            false
        }
    }

    fn bus_with(words: &[u16]) -> WordBus {
        let mut bus = WordBus(vec![0; 0x100]);
        for (index, &word) in words.iter().enumerate() {
            bus.store(index as u16 * 2, Size::Word, word).unwrap();
        }
        bus
    }

    #[test]
    fn plain_listing() {
        // CLR R1; TST R2; garbage.
        let mut bus = bus_with(&[0o005001, 0o005702, 0o000000]);
        let entries = disassemble_range(&mut bus, 0, 6).unwrap();
        assert_eq!(entries[&0].display_text(), "CLR R1");
        assert_eq!(entries[&2].display_text(), "TST R2");
        assert_eq!(entries[&4].state(), DisasmState::NotAnInstruction);
    }

    #[test]
    fn immediate_consumes_following_word() {
        // MOV #17, R3 (0o012703 0o000017), then CLR R0.
        let mut bus = bus_with(&[0o012703, 0o000017, 0o005000]);
        let entries = disassemble_range(&mut bus, 0, 6).unwrap();
        assert_eq!(entries[&0].display_text(), "MOV #17, R3");
        assert_eq!(entries[&0].num_next(), 1);
        assert_eq!(entries[&2].state(), DisasmState::PartOfPrevious);
        assert_eq!(entries[&4].display_text(), "CLR R0");
    }

    #[test]
    fn two_following_words() {
        // MOV 10(R1), @20(R2): both operands indexed.
        let mut bus = bus_with(&[0o016172, 0o000010, 0o000020, 0o000240]);
        let entries = disassemble_range(&mut bus, 0, 8).unwrap();
        assert_eq!(entries[&0].display_text(), "MOV 10(R1), @20(R2)");
        assert_eq!(entries[&2].state(), DisasmState::PartOfPrevious);
        assert_eq!(entries[&4].state(), DisasmState::PartOfPrevious);
    }

    #[test]
    fn truncated_instruction_degrades_to_data() {
        // MOV #n at the very end, missing its immediate.
        let mut bus = bus_with(&[0o005001, 0o012703]);
        let entries = disassemble_range(&mut bus, 0, 4).unwrap();
        assert_eq!(entries[&0].display_text(), "CLR R1");
        assert_eq!(entries[&2].state(), DisasmState::NotAnInstruction);
    }

    #[test]
    fn octal_formatting() {
        assert_eq!(octal(0o005001), "005001");
        assert_eq!(octal(0xFFFF), "177777");
    }
}
