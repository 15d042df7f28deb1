//! Host-facing machine facade.
//!
//! Wires the pipeline core to the memory map, the keyboard and the
//! debugger surface: stepping, breakpoints, the cached ROM listing and the
//! state-query paths the UI displays.

use std::collections::{BTreeMap, BTreeSet};

use cpu_pdp11::disasm::{self, DisasmEntry, DisasmState};
use cpu_pdp11::{Bus, Cache, Fault, Pipeline, Psw, RegisterFile, Size, PC, SP};
use emu_core::{Observable, Value};

use crate::config::MachineConfig;
use crate::keyboard::Keyboard;
use crate::memory::{self, Memory};
use crate::rom::GlyphSet;
use crate::video::Presenter;

/// Why a `step` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    /// One instruction ran to completion.
    Instruction,
    /// The keyboard interrupt was taken instead.
    Interrupt,
}

/// Listing flavor for [`Emulator::disasm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisasmView {
    Instructions,
    Octal,
}

/// One row of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisasmLine {
    pub address: u16,
    pub text: String,
    pub breakpoint: bool,
}

/// The whole machine.
pub struct Emulator {
    memory: Memory,
    pipeline: Pipeline,
    keyboard: Keyboard,
    breakpoints: BTreeSet<u16>,
    listing: BTreeMap<u16, DisasmEntry>,
    /// One past the last ROM address holding loaded code.
    listing_end: u16,
    stopped: bool,
}

impl Emulator {
    pub fn new(config: &MachineConfig) -> Result<Self, Fault> {
        let memory = Memory::new(config.keyboard_register)?;
        let mut pipeline = Pipeline::new(
            Cache::new(config.caches_enabled),
            Cache::new(config.caches_enabled),
        );
        pipeline.set_enabled(config.pipeline_enabled);
        pipeline
            .registers_mut()
            .set_sp_lower_bound(config.sp_lower_bound)?;
        pipeline
            .registers_mut()
            .set_sp_upper_bound(config.sp_upper_bound)?;
        pipeline.registers_mut().write_word(PC, config.initial_pc)?;
        Ok(Self {
            memory,
            pipeline,
            keyboard: Keyboard::new(),
            breakpoints: BTreeSet::new(),
            listing: BTreeMap::new(),
            listing_end: memory::ROM_START,
            stopped: false,
        })
    }

    // === Setup ===

    /// Place assembled words into memory and refresh the ROM listing.
    pub fn load_rom_words(&mut self, address: u16, words: &[u16]) -> Result<(), Fault> {
        let mut cursor = address;
        for &word in words {
            self.memory.write(cursor, Size::Word, word)?;
            cursor = cursor.wrapping_add(2);
        }
        if address >= memory::ROM_START && cursor > self.listing_end {
            self.listing_end = cursor;
        }
        self.refresh_listing()
    }

    /// Place the glyph bitmaps at the top of ROM. Returns the address the
    /// set starts at (the draw routines take it as a parameter).
    pub fn load_glyphs(&mut self, glyphs: &GlyphSet) -> Result<u16, Fault> {
        let start = memory::ROM_END - glyphs.total_bytes();
        let mut cursor = start;
        for &word in glyphs.words() {
            self.memory.write(cursor, Size::Word, word)?;
            cursor = cursor.wrapping_add(2);
        }
        Ok(start)
    }

    fn refresh_listing(&mut self) -> Result<(), Fault> {
        self.listing =
            disasm::disassemble_range(&mut self.memory, memory::ROM_START, self.listing_end)?;
        Ok(())
    }

    // === Execution ===

    /// Run until the next instruction completes, or take a pending
    /// keyboard interrupt. Faults stop the engine with state preserved.
    pub fn step(&mut self) -> Result<StepEvent, Fault> {
        if self.interrupt().map_err(|fault| self.stop_on(fault))? {
            return Ok(StepEvent::Interrupt);
        }
        self.pipeline
            .step(&mut self.memory)
            .map_err(|fault| self.stop_on(fault))?;
        Ok(StepEvent::Instruction)
    }

    /// Free-running execution: overlapped pipeline cycles until a
    /// breakpointed instruction is fetched or the engine stops.
    pub fn run(&mut self) -> Result<(), Fault> {
        self.stopped = false;
        loop {
            self.interrupt().map_err(|fault| self.stop_on(fault))?;
            let new_command = self
                .pipeline
                .cycle(&mut self.memory)
                .map_err(|fault| self.stop_on(fault))?;
            if self.stopped
                || (new_command
                    && self
                        .breakpoints
                        .contains(&self.pipeline.last_instruction_address()))
            {
                return Ok(());
            }
        }
    }

    fn stop_on(&mut self, fault: Fault) -> Fault {
        self.stopped = true;
        fault
    }

    /// Ask a running loop to stop at the next instruction boundary.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    #[must_use]
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Service the keyboard interrupt if it is permitted and a key is
    /// pending: drain the pipe, push PSW and PC, vector through address 0.
    pub fn interrupt(&mut self) -> Result<bool, Fault> {
        if !self.memory.keyboard_interrupt_permitted() {
            return Ok(false);
        }
        let Some(key) = self.keyboard.pop() else {
            return Ok(false);
        };
        self.memory.set_keyboard_interrupt_permitted(false);
        self.memory.set_keyboard_key(key);
        self.pipeline.barrier(&mut self.memory)?;

        let psw_word = self.pipeline.psw().to_word();
        self.push_word(psw_word)?;
        let return_pc = self.pipeline.registers().peek_word(PC);
        self.push_word(return_pc)?;

        let vector_pc = self.memory.load(0x0000, Size::Word)?;
        let vector_psw = self.memory.load(0x0002, Size::Word)?;
        self.pipeline.registers_mut().write_word(PC, vector_pc)?;
        *self.pipeline.psw_mut() = Psw::from_word(vector_psw);

        self.pipeline.enqueue_next(&mut self.memory)?;
        Ok(true)
    }

    fn push_word(&mut self, value: u16) -> Result<(), Fault> {
        self.pipeline.registers_mut().inc_store(SP, -2)?;
        let sp = self.pipeline.registers().peek_word(SP);
        self.memory.write(sp, Size::Word, value)
    }

    // === Breakpoints ===

    pub fn toggle_breakpoint(&mut self, address: u16) -> Result<(), Fault> {
        if address % 2 == 1 {
            return Err(Fault::OddBreakpoint(address));
        }
        if !self.breakpoints.remove(&address) {
            self.breakpoints.insert(address);
        }
        Ok(())
    }

    pub fn set_breakpoint(&mut self, address: u16, on: bool) -> Result<(), Fault> {
        if address % 2 == 1 {
            return Err(Fault::OddBreakpoint(address));
        }
        if on {
            self.breakpoints.insert(address);
        } else {
            self.breakpoints.remove(&address);
        }
        Ok(())
    }

    #[must_use]
    pub fn has_breakpoint(&self, address: u16) -> bool {
        self.breakpoints.contains(&address)
    }

    // === Listing ===

    /// Produce `count` listing rows starting at `address`, padded upward
    /// when the walk overruns the end of memory. Instruction view starts
    /// on an instruction boundary; octal view formats raw words.
    pub fn disasm(
        &self,
        address: u16,
        count: usize,
        view: DisasmView,
    ) -> Result<Vec<DisasmLine>, Fault> {
        if address % 2 == 1 {
            return Err(Fault::OddAddress(address));
        }
        let mut result: Vec<DisasmLine> = Vec::new();
        if count == 0 {
            return Ok(result);
        }

        let mut start = address;
        if view == DisasmView::Instructions {
            while start > 0
                && self
                    .listing
                    .get(&start)
                    .is_some_and(|entry| entry.state() == DisasmState::PartOfPrevious)
            {
                start -= 2;
            }
        }

        let mut cursor = u32::from(start);
        while result.len() < count && cursor < memory::SIZE {
            let row_addr = cursor as u16;
            match view {
                DisasmView::Octal => {
                    result.push(self.listing_row_octal(row_addr)?);
                }
                DisasmView::Instructions => match self.listing.get(&row_addr) {
                    None => result.push(self.listing_row(row_addr, "")),
                    Some(entry) => {
                        result.push(self.listing_row(row_addr, entry.display_text()));
                        cursor += entry.num_next() as u32 * 2;
                    }
                },
            }
            cursor += 2;
        }

        // Not enough rows below: extend the listing upward.
        let mut cursor = result.first().map_or(u32::from(start), |row| u32::from(row.address));
        while result.len() < count && cursor > 0 {
            cursor -= 2;
            let row_addr = cursor as u16;
            match view {
                DisasmView::Octal => {
                    result.insert(0, self.listing_row_octal(row_addr)?);
                }
                DisasmView::Instructions => match self.listing.get(&row_addr) {
                    None => result.insert(0, self.listing_row(row_addr, "")),
                    Some(entry) => {
                        cursor = cursor.saturating_sub(entry.num_next() as u32 * 2);
                        let start_addr = cursor as u16;
                        let text = self
                            .listing
                            .get(&start_addr)
                            .map_or("", DisasmEntry::display_text);
                        result.insert(0, self.listing_row(start_addr, text));
                    }
                },
            }
        }
        Ok(result)
    }

    fn listing_row(&self, address: u16, text: &str) -> DisasmLine {
        DisasmLine {
            address,
            text: text.to_string(),
            breakpoint: self.breakpoints.contains(&address),
        }
    }

    fn listing_row_octal(&self, address: u16) -> Result<DisasmLine, Fault> {
        let word = self.memory.read(address, Size::Word)?;
        Ok(self.listing_row(address, &disasm::octal(word)))
    }

    // === Inspection ===

    #[must_use]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    #[must_use]
    pub fn registers(&self) -> &RegisterFile {
        self.pipeline.registers()
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        self.pipeline.registers_mut()
    }

    #[must_use]
    pub fn psw(&self) -> Psw {
        self.pipeline.psw()
    }

    #[must_use]
    pub fn current_pc(&self) -> u16 {
        self.pipeline.registers().peek_word(PC)
    }

    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// The shared key buffer; clone it for the UI thread.
    #[must_use]
    pub fn keyboard(&self) -> &Keyboard {
        &self.keyboard
    }

    pub fn set_presenter(&mut self, presenter: Presenter) {
        self.memory.video_mut().set_presenter(presenter);
    }

    /// Push the current frame to the presenter.
    pub fn show(&mut self) {
        self.memory.video_mut().show();
    }
}

const EMULATOR_QUERY_PATHS: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "sp", "pc",
    "psw", "psw.n", "psw.z", "psw.v", "psw.c",
    "icache.hits", "icache.misses", "dcache.hits", "dcache.misses",
    "pipeline.cycles", "pipeline.instructions",
    "stopped",
];

impl Observable for Emulator {
    fn query(&self, path: &str) -> Option<Value> {
        let regs = self.pipeline.registers();
        match path {
            "r0" => Some(regs.peek_word(0).into()),
            "r1" => Some(regs.peek_word(1).into()),
            "r2" => Some(regs.peek_word(2).into()),
            "r3" => Some(regs.peek_word(3).into()),
            "r4" => Some(regs.peek_word(4).into()),
            "r5" => Some(regs.peek_word(5).into()),
            "sp" => Some(regs.peek_word(SP).into()),
            "pc" => Some(regs.peek_word(PC).into()),
            "psw" => Some(self.pipeline.psw().to_word().into()),
            "psw.n" => Some(self.pipeline.psw().n().into()),
            "psw.z" => Some(self.pipeline.psw().z().into()),
            "psw.v" => Some(self.pipeline.psw().v().into()),
            "psw.c" => Some(self.pipeline.psw().c().into()),
            "icache.hits" => Some(self.pipeline.icache().hits().into()),
            "icache.misses" => Some(self.pipeline.icache().misses().into()),
            "dcache.hits" => Some(self.pipeline.dcache().hits().into()),
            "dcache.misses" => Some(self.pipeline.dcache().misses().into()),
            "pipeline.cycles" => Some(self.pipeline.cycles().get().into()),
            "pipeline.instructions" => Some(self.pipeline.instructions().into()),
            "stopped" => Some(self.stopped.into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        EMULATOR_QUERY_PATHS
    }
}
