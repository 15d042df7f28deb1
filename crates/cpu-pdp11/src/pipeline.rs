//! Five-stage pipeline with scoreboard interlocks.
//!
//! Stages in order: instruction fetch (IF), decode (ID), operand fetch
//! (OF), ALU, writeback (WB). Commands live in a shared in-flight window
//! owned by the pipeline; each stage keeps a FIFO of per-instruction work
//! items that reference window slots by instruction id.
//!
//! One `cycle()` advances everything once: caches first, then stages from
//! the back of the pipe to the front so results flow without intra-cycle
//! races. A stage refused by the cache parks in WAIT_DATA/WAIT_INSTRUCTION
//! and retries when its cache reports ready for that exact address and
//! direction. Control transfers set a branch-in-flight bit that suppresses
//! new fetches until the pipe drains.
//!
//! Hazards: after resolving its operands, OF write-locks every destination
//! register and pins every destination memory word; WB releases them as the
//! stores land. The register scoreboard is the entire synchronization
//! device.

use std::collections::VecDeque;

use emu_core::Ticks;

use crate::alu::Size;
use crate::bus::{Access, Bus};
use crate::cache::Cache;
use crate::command::Command;
use crate::decode::decode;
use crate::error::Fault;
use crate::flags::Psw;
use crate::microcode::{AluAction, MicroOp, OperandRef, WordSink};
use crate::registers::{RegisterFile, PC};

const STAGES: usize = 5;

/// Where a stage is in its current work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Idle, no work item.
    WaitNext,
    /// Has a work item, upstream has not finished the instruction yet.
    WaitPrev,
    /// Actively working through its ops.
    InProgress,
    /// Stalled on the data cache.
    WaitData,
    /// Stalled on the instruction cache.
    WaitInstruction,
    /// All ops done, waiting for downstream to take over.
    Finished,
}

fn cmd(window: &VecDeque<Command>, base: u64, id: u64) -> &Command {
    &window[(id - base) as usize]
}

fn cmd_mut(window: &mut VecDeque<Command>, base: u64, id: u64) -> &mut Command {
    &mut window[(id - base) as usize]
}

// === Instruction fetch ===

#[derive(Debug, Clone, Copy)]
struct FetchOp {
    size: Size,
    sink: WordSink,
}

#[derive(Debug)]
struct FetchJob {
    cmd: u64,
    ops: Vec<FetchOp>,
}

#[derive(Debug)]
struct FetchStage {
    state: StageState,
    worked: bool,
    address: u16,
    queue: VecDeque<FetchJob>,
    opnum: usize,
    /// Set by the decode stage once the opcode has been claimed; buffered
    /// words are only delivered to their operands after this.
    decoded: bool,
    buffered: Option<u16>,
}

impl FetchStage {
    fn new() -> Self {
        Self {
            state: StageState::WaitNext,
            worked: false,
            address: 0,
            queue: VecDeque::new(),
            opnum: 0,
            decoded: false,
            buffered: None,
        }
    }

    fn add_job(&mut self, job: FetchJob) {
        self.queue.push_back(job);
        if self.state == StageState::WaitNext {
            debug_assert_eq!(self.queue.len(), 1);
            self.state = StageState::InProgress;
            self.opnum = 0;
        }
    }

    /// Decode has claimed the opcode; buffered next-words may now flow.
    fn command_decoded(&mut self) {
        self.decoded = true;
        if self.state == StageState::InProgress && self.buffered.is_some() {
            self.worked = true;
        }
    }

    fn cycle<B: Bus>(
        &mut self,
        decoder: &mut DecodeStage,
        icache: &mut Cache,
        registers: &mut RegisterFile,
        window: &mut VecDeque<Command>,
        base: u64,
        bus: &mut B,
    ) -> Result<bool, Fault> {
        if self.worked
            || matches!(self.state, StageState::Finished | StageState::WaitNext)
        {
            return Ok(false);
        }
        self.worked = true;

        let (job_cmd, job_len) = {
            let Some(job) = self.queue.front() else {
                return Ok(true);
            };
            (job.cmd, job.ops.len())
        };

        if self.state == StageState::InProgress {
            if let Some(word) = self.buffered {
                if self.decoded {
                    let op = self.queue[0].ops[self.opnum];
                    cmd_mut(window, base, job_cmd).deliver_next_word(op.sink, word, op.size);
                    self.opnum += 1;
                    self.buffered = None;
                    let moved = registers.inc_fetch(PC, 2)?;
                    debug_assert!(moved, "PC blocked during instruction fetch");
                }
            } else if let Some(pc) = registers.read_word(PC) {
                self.address = pc;
                let size = self.queue[0].ops[self.opnum].size;
                match icache.load(bus, pc, size)? {
                    Some(word) if self.opnum != 0 => self.buffered = Some(word),
                    Some(_) => {
                        // The opcode itself: decoded at enqueue, only the
                        // timing matters here.
                        self.state = StageState::Finished;
                        self.opnum += 1;
                        let moved = registers.inc_fetch(PC, 2)?;
                        debug_assert!(moved, "PC blocked during instruction fetch");
                    }
                    None => self.state = StageState::WaitInstruction,
                }
            }
        } else if self.state == StageState::WaitInstruction {
            let size = self.queue[0].ops[self.opnum].size;
            match icache.load(bus, self.address, size)? {
                Some(word) if self.opnum != 0 => {
                    self.buffered = Some(word);
                    self.state = StageState::InProgress;
                }
                Some(_) => {
                    self.state = StageState::Finished;
                    self.opnum += 1;
                    let moved = registers.inc_fetch(PC, 2)?;
                    debug_assert!(moved, "PC blocked during instruction fetch");
                }
                None => {}
            }
        }

        if self.opnum == job_len && self.state != StageState::Finished {
            self.queue.pop_front();
            self.state = StageState::WaitNext;
            self.opnum = 0;
            self.decoded = false;
            decoder.instruction_fetched();
        }
        Ok(true)
    }

    /// Handoff after the opcode fetch: keep delivering next-words, or go
    /// idle when there were none.
    fn continue_after_opcode(&mut self) {
        debug_assert_eq!(self.state, StageState::Finished);
        if self.opnum == self.queue.front().map_or(0, |job| job.ops.len()) {
            self.queue.pop_front();
            self.state = StageState::WaitNext;
            self.opnum = 0;
        } else {
            self.state = StageState::InProgress;
        }
    }
}

// === Decode ===

#[derive(Debug)]
struct DecodeJob {
    has_next: bool,
}

#[derive(Debug)]
struct DecodeStage {
    state: StageState,
    worked: bool,
    queue: VecDeque<DecodeJob>,
    wait_for_fetch: bool,
}

impl DecodeStage {
    fn new() -> Self {
        Self {
            state: StageState::WaitNext,
            worked: false,
            queue: VecDeque::new(),
            wait_for_fetch: false,
        }
    }

    fn add_job(&mut self, job: DecodeJob) {
        self.queue.push_back(job);
        if self.state == StageState::WaitNext {
            debug_assert_eq!(self.queue.len(), 1);
            self.state = StageState::WaitPrev;
        }
    }

    /// All next-instruction words delivered; decode completes.
    fn instruction_fetched(&mut self) {
        debug_assert!(self.wait_for_fetch);
        self.state = StageState::Finished;
        self.wait_for_fetch = false;
        self.worked = true;
    }

    fn cycle(&mut self, fetch: &mut FetchStage) -> bool {
        if matches!(
            self.state,
            StageState::WaitPrev | StageState::Finished | StageState::WaitNext
        ) || self.wait_for_fetch
            || self.worked
        {
            return false;
        }
        self.worked = true;
        debug_assert_eq!(self.state, StageState::InProgress);
        if self.queue.front().is_some_and(|job| job.has_next) {
            fetch.command_decoded();
            self.wait_for_fetch = true;
        } else {
            self.state = StageState::Finished;
        }
        true
    }

    fn continue_generic(&mut self) {
        match self.state {
            StageState::WaitPrev => self.state = StageState::InProgress,
            StageState::Finished => {
                self.queue.pop_front();
                self.state = if self.queue.is_empty() {
                    StageState::WaitNext
                } else {
                    StageState::WaitPrev
                };
            }
            _ => {}
        }
    }
}

// === Operand fetch ===

#[derive(Debug)]
struct OperandJob {
    cmd: u64,
    /// Indices into the command's micro-op list this stage interprets.
    ops: Vec<usize>,
    /// Registers to write-lock once the ops are done.
    block_regs: Vec<u8>,
    /// Destination operands whose captured addresses get pinned.
    block_addrs: Vec<OperandRef>,
}

/// Multi-cycle work inside the operand stage: either the 2-cycle penalty
/// of an unaligned data access (the loaded value rides along) or a timed
/// address-arithmetic step.
#[derive(Debug, Clone, Copy)]
struct OperandPending {
    cycles_left: u8,
    data: Option<u16>,
}

#[derive(Debug)]
struct OperandStage {
    state: StageState,
    worked: bool,
    address: u16,
    queue: VecDeque<OperandJob>,
    opnum: usize,
    blocking_reg: bool,
    blocking_mem: bool,
    num_block: usize,
    pending: Option<OperandPending>,
}

impl OperandStage {
    fn new() -> Self {
        Self {
            state: StageState::WaitNext,
            worked: false,
            address: 0,
            queue: VecDeque::new(),
            opnum: 0,
            blocking_reg: false,
            blocking_mem: false,
            num_block: 0,
            pending: None,
        }
    }

    fn add_job(&mut self, job: OperandJob) {
        self.queue.push_back(job);
        if self.state == StageState::WaitNext {
            debug_assert_eq!(self.queue.len(), 1);
            self.state = StageState::WaitPrev;
        }
    }

    fn cycle<B: Bus>(
        &mut self,
        dcache: &mut Cache,
        registers: &mut RegisterFile,
        window: &mut VecDeque<Command>,
        base: u64,
        bus: &mut B,
    ) -> Result<bool, Fault> {
        if self.worked
            || matches!(
                self.state,
                StageState::WaitPrev | StageState::Finished | StageState::WaitNext
            )
        {
            return Ok(false);
        }
        let (job_cmd, ops_len, regs_empty, mem_empty) = {
            let Some(job) = self.queue.front() else {
                return Ok(false);
            };
            (
                job.cmd,
                job.ops.len(),
                job.block_regs.is_empty(),
                job.block_addrs.is_empty(),
            )
        };
        if ops_len == 0 && regs_empty && mem_empty {
            self.state = StageState::Finished;
            return Ok(false);
        }
        self.worked = true;

        if self.blocking_reg {
            self.acquire_registers(registers, dcache, window, base)?;
            return Ok(true);
        }
        if self.blocking_mem {
            self.acquire_memory(dcache, window, base)?;
            return Ok(true);
        }
        if ops_len == 0 {
            self.num_block = 0;
            self.acquire_registers(registers, dcache, window, base)?;
            return Ok(true);
        }

        self.run_free_ops(window, base);
        if self.opnum == ops_len {
            self.num_block = 0;
            self.acquire_registers(registers, dcache, window, base)?;
            return Ok(true);
        }

        let op_index = self.queue[0].ops[self.opnum];
        let op = cmd(window, base, job_cmd).micro_ops[op_index];

        if self.state == StageState::InProgress {
            if let Some(mut pending) = self.pending {
                pending.cycles_left -= 1;
                if pending.cycles_left == 0 {
                    self.finish_pending(pending, op, window, base, job_cmd);
                    self.opnum += 1;
                    self.pending = None;
                } else {
                    self.pending = Some(pending);
                }
            } else {
                match op {
                    MicroOp::FetchRegister { reg, size, dest } => match size {
                        Size::Word => {
                            if let Some(value) = registers.read_word(reg) {
                                cmd_mut(window, base, job_cmd).set_cell_word(dest, value);
                                self.opnum += 1;
                            }
                        }
                        Size::Byte => {
                            if let Some(value) = registers.read_byte(reg) {
                                cmd_mut(window, base, job_cmd).set_cell_byte(dest, value);
                                self.opnum += 1;
                            }
                        }
                    },
                    MicroOp::FetchAddress { addr, size, dest } => {
                        self.address = cmd(window, base, job_cmd).cell_word(addr);
                        match dcache.load(bus, self.address, size)? {
                            Some(data) => {
                                if self.address % 2 == 1 {
                                    self.pending = Some(OperandPending {
                                        cycles_left: 2,
                                        data: Some(data),
                                    });
                                } else {
                                    cmd_mut(window, base, job_cmd)
                                        .set_cell_sized(dest, size, data);
                                    self.opnum += 1;
                                }
                            }
                            None => self.state = StageState::WaitData,
                        }
                    }
                    MicroOp::IncRegister { reg, step } => {
                        debug_assert_ne!(reg, PC);
                        if registers.inc_fetch(reg, step)? {
                            self.opnum += 1;
                        }
                    }
                    MicroOp::DecRegister { reg, step } => {
                        debug_assert_ne!(reg, PC);
                        if registers.dec_fetch(reg, step)? {
                            self.opnum += 1;
                        }
                    }
                    MicroOp::Execute { action, cycles } => {
                        if cycles == 1 {
                            cmd_mut(window, base, job_cmd).apply_exec(action);
                            self.opnum += 1;
                        } else if cycles > 1 {
                            // First cycle burns now, the rest tick down.
                            self.pending = Some(OperandPending {
                                cycles_left: cycles - 1,
                                data: None,
                            });
                        }
                    }
                    _ => debug_assert!(false, "op {op:?} does not belong to operand fetch"),
                }
            }
        } else if self.state == StageState::WaitData {
            debug_assert!(matches!(op, MicroOp::FetchAddress { .. }));
            if let MicroOp::FetchAddress { size, dest, .. } = op {
                match dcache.load(bus, self.address, size)? {
                    Some(data) => {
                        self.state = StageState::InProgress;
                        if self.address % 2 == 1 {
                            self.pending = Some(OperandPending {
                                cycles_left: 2,
                                data: Some(data),
                            });
                        } else {
                            cmd_mut(window, base, job_cmd).set_cell_sized(dest, size, data);
                            self.opnum += 1;
                        }
                    }
                    None => {}
                }
            }
        }

        if self.opnum == ops_len {
            self.num_block = 0;
            self.acquire_registers(registers, dcache, window, base)?;
        }
        Ok(true)
    }

    fn finish_pending(
        &mut self,
        pending: OperandPending,
        op: MicroOp,
        window: &mut VecDeque<Command>,
        base: u64,
        job_cmd: u64,
    ) {
        match (pending.data, op) {
            (Some(data), MicroOp::FetchAddress { size, dest, .. }) => {
                cmd_mut(window, base, job_cmd).set_cell_sized(dest, size, data);
            }
            (None, MicroOp::Execute { action, .. }) => {
                cmd_mut(window, base, job_cmd).apply_exec(action);
            }
            _ => debug_assert!(false, "pending work does not match op {op:?}"),
        }
    }

    /// Run leading zero-cycle address-arithmetic ops.
    fn run_free_ops(&mut self, window: &mut VecDeque<Command>, base: u64) {
        loop {
            let (job_cmd, ops_len) = {
                let Some(job) = self.queue.front() else { return };
                (job.cmd, job.ops.len())
            };
            if self.opnum >= ops_len {
                return;
            }
            let op_index = self.queue[0].ops[self.opnum];
            let op = cmd(window, base, job_cmd).micro_ops[op_index];
            if let MicroOp::Execute { action, cycles: 0 } = op {
                cmd_mut(window, base, job_cmd).apply_exec(action);
                self.opnum += 1;
            } else {
                return;
            }
        }
    }

    /// Write-lock destination registers, then pin destination words; either
    /// may refuse (held by an older instruction) and is retried next cycle.
    fn acquire_registers(
        &mut self,
        registers: &mut RegisterFile,
        dcache: &mut Cache,
        window: &VecDeque<Command>,
        base: u64,
    ) -> Result<(), Fault> {
        let regs: Vec<u8> = self.queue[0].block_regs.clone();
        while self.num_block < regs.len() {
            if registers.block(regs[self.num_block], true)? {
                self.num_block += 1;
            } else {
                break;
            }
        }
        if self.num_block < regs.len() {
            self.blocking_reg = true;
        } else {
            self.blocking_reg = false;
            self.num_block = 0;
            self.acquire_memory(dcache, window, base)?;
        }
        Ok(())
    }

    fn acquire_memory(
        &mut self,
        dcache: &mut Cache,
        window: &VecDeque<Command>,
        base: u64,
    ) -> Result<(), Fault> {
        let (job_cmd, addrs) = {
            let job = &self.queue[0];
            (job.cmd, job.block_addrs.clone())
        };
        while self.num_block < addrs.len() {
            let address = cmd(window, base, job_cmd).capture_address(addrs[self.num_block]);
            if dcache.block(address, true)? {
                self.num_block += 1;
            } else {
                break;
            }
        }
        if self.num_block < addrs.len() {
            self.blocking_mem = true;
        } else {
            self.blocking_mem = false;
            self.state = StageState::Finished;
        }
        Ok(())
    }

    fn continue_generic(&mut self) {
        match self.state {
            StageState::WaitPrev => self.state = StageState::InProgress,
            StageState::Finished => {
                self.queue.pop_front();
                self.opnum = 0;
                self.state = if self.queue.is_empty() {
                    StageState::WaitNext
                } else {
                    StageState::WaitPrev
                };
            }
            _ => {}
        }
    }
}

// === ALU ===

#[derive(Debug)]
struct AluJob {
    cmd: u64,
    ops: Vec<usize>,
}

#[derive(Debug)]
struct AluStage {
    state: StageState,
    worked: bool,
    queue: VecDeque<AluJob>,
    opnum: usize,
    countdown: Option<u8>,
}

impl AluStage {
    fn new() -> Self {
        Self {
            state: StageState::WaitNext,
            worked: false,
            queue: VecDeque::new(),
            opnum: 0,
            countdown: None,
        }
    }

    fn add_job(&mut self, job: AluJob) {
        self.queue.push_back(job);
        if self.state == StageState::WaitNext {
            debug_assert_eq!(self.queue.len(), 1);
            self.state = StageState::WaitPrev;
        }
    }

    fn cycle(&mut self, window: &mut VecDeque<Command>, base: u64, psw: &mut Psw) -> bool {
        if self.worked
            || matches!(
                self.state,
                StageState::WaitPrev | StageState::Finished | StageState::WaitNext
            )
        {
            return false;
        }
        let (job_cmd, ops_len) = {
            let Some(job) = self.queue.front() else {
                return false;
            };
            (job.cmd, job.ops.len())
        };
        if ops_len == 0 {
            self.state = StageState::Finished;
            return false;
        }
        self.worked = true;
        debug_assert_eq!(self.state, StageState::InProgress);

        let op_index = self.queue[0].ops[self.opnum];
        let MicroOp::Alu { action, cycles } = cmd(window, base, job_cmd).micro_ops[op_index]
        else {
            debug_assert!(false, "non-ALU op in the ALU stage");
            return true;
        };

        if let Some(left) = self.countdown {
            if left == 1 {
                apply_alu(cmd_mut(window, base, job_cmd), action, psw);
                self.opnum += 1;
                self.countdown = None;
            } else {
                self.countdown = Some(left - 1);
            }
        } else {
            debug_assert!(cycles > 0, "ALU op with zero latency");
            if cycles == 1 {
                apply_alu(cmd_mut(window, base, job_cmd), action, psw);
                self.opnum += 1;
            } else {
                // First cycle burns now, the rest tick down.
                self.countdown = Some(cycles - 1);
            }
        }

        if self.opnum == ops_len {
            self.state = StageState::Finished;
        }
        true
    }

    fn continue_generic(&mut self) {
        match self.state {
            StageState::WaitPrev => self.state = StageState::InProgress,
            StageState::Finished => {
                self.queue.pop_front();
                self.opnum = 0;
                self.state = if self.queue.is_empty() {
                    StageState::WaitNext
                } else {
                    StageState::WaitPrev
                };
            }
            _ => {}
        }
    }
}

fn apply_alu(command: &mut Command, action: AluAction, psw: &mut Psw) {
    match action {
        AluAction::Execute => command.execute(psw),
        AluAction::Copy { from, to } => {
            let value = command.cell_word(from);
            command.set_cell_word(to, value);
        }
        AluAction::Decrement(cell) => {
            let value = command.cell_word(cell).wrapping_sub(1);
            command.set_cell_word(cell, value);
        }
    }
}

// === Writeback ===

#[derive(Debug)]
struct WritebackJob {
    cmd: u64,
    ops: Vec<usize>,
}

#[derive(Debug)]
struct WritebackStage {
    state: StageState,
    worked: bool,
    address: u16,
    queue: VecDeque<WritebackJob>,
    opnum: usize,
    /// Extra cycles of an unaligned store.
    countdown: Option<u8>,
}

impl WritebackStage {
    fn new() -> Self {
        Self {
            state: StageState::WaitNext,
            worked: false,
            address: 0,
            queue: VecDeque::new(),
            opnum: 0,
            countdown: None,
        }
    }

    fn add_job(&mut self, job: WritebackJob) {
        self.queue.push_back(job);
        if self.state == StageState::WaitNext {
            debug_assert_eq!(self.queue.len(), 1);
            self.state = StageState::WaitPrev;
        }
    }

    fn cycle<B: Bus>(
        &mut self,
        dcache: &mut Cache,
        registers: &mut RegisterFile,
        window: &mut VecDeque<Command>,
        base: u64,
        bus: &mut B,
    ) -> Result<bool, Fault> {
        if self.worked
            || matches!(
                self.state,
                StageState::WaitPrev | StageState::Finished | StageState::WaitNext
            )
        {
            return Ok(false);
        }
        let (job_cmd, ops_len) = {
            let Some(job) = self.queue.front() else {
                return Ok(false);
            };
            (job.cmd, job.ops.len())
        };
        if ops_len == 0 {
            self.state = StageState::Finished;
            return Ok(false);
        }
        self.worked = true;

        let op_index = self.queue[0].ops[self.opnum];
        let op = cmd(window, base, job_cmd).micro_ops[op_index];

        if self.state == StageState::InProgress {
            if let Some(left) = self.countdown {
                if left == 1 {
                    self.opnum += 1;
                    self.countdown = None;
                } else {
                    self.countdown = Some(left - 1);
                }
            } else {
                match op {
                    MicroOp::StoreRegister { reg, size, value } => {
                        let data = cmd(window, base, job_cmd).store_value(value, size);
                        match size {
                            Size::Word => registers.write_word(reg, data)?,
                            Size::Byte => registers.write_byte(reg, data as u8)?,
                        }
                        self.opnum += 1;
                        self.release_register(reg, registers, window, base)?;
                    }
                    MicroOp::StoreAddress { addr, size, value } => {
                        self.address = cmd(window, base, job_cmd).capture_address(addr);
                        let data = cmd(window, base, job_cmd).store_value(value, size);
                        if dcache.store(bus, self.address, size, data)? {
                            if self.address % 2 == 1 {
                                self.countdown = Some(2);
                            } else {
                                self.opnum += 1;
                            }
                        } else {
                            self.state = StageState::WaitData;
                        }
                    }
                    MicroOp::BranchIf { offset } => {
                        if cmd(window, base, job_cmd).branch_taken {
                            registers.inc_store(PC, offset)?;
                        }
                        self.opnum += 1;
                        self.release_register(PC, registers, window, base)?;
                    }
                    _ => debug_assert!(false, "op {op:?} does not belong to writeback"),
                }
            }
        } else if self.state == StageState::WaitData {
            debug_assert!(matches!(op, MicroOp::StoreAddress { .. }));
            if let MicroOp::StoreAddress { size, value, .. } = op {
                let data = cmd(window, base, job_cmd).store_value(value, size);
                if dcache.store(bus, self.address, size, data)? {
                    self.state = StageState::InProgress;
                    if self.address % 2 == 1 {
                        self.countdown = Some(2);
                    } else {
                        self.opnum += 1;
                    }
                }
            }
        }

        if self.opnum == ops_len {
            self.release_memory(dcache, window, base)?;
        }
        Ok(true)
    }

    /// Unlock a register once no later op of this instruction stores it.
    fn release_register(
        &self,
        reg: u8,
        registers: &mut RegisterFile,
        window: &VecDeque<Command>,
        base: u64,
    ) -> Result<(), Fault> {
        let job = &self.queue[0];
        let command = cmd(window, base, job.cmd);
        let mut last_store = true;
        for &op_index in &job.ops[self.opnum..] {
            last_store = last_store
                && match command.micro_ops[op_index] {
                    MicroOp::StoreRegister { reg: later, .. } => later != reg,
                    MicroOp::BranchIf { .. } => reg != PC,
                    _ => false,
                };
        }
        if last_store {
            let changed = registers.block(reg, false)?;
            debug_assert!(changed, "released register was not blocked");
        }
        Ok(())
    }

    /// Unpin every destination word of the retiring instruction.
    fn release_memory(
        &mut self,
        dcache: &mut Cache,
        window: &VecDeque<Command>,
        base: u64,
    ) -> Result<(), Fault> {
        let job = &self.queue[0];
        let command = cmd(window, base, job.cmd);
        for &op_index in &job.ops {
            if let MicroOp::StoreAddress { addr, .. } = command.micro_ops[op_index] {
                dcache.block(command.capture_address(addr), false)?;
            }
        }
        self.state = StageState::Finished;
        Ok(())
    }

    fn continue_generic(&mut self) {
        match self.state {
            StageState::WaitPrev => self.state = StageState::InProgress,
            StageState::Finished => {
                self.queue.pop_front();
                self.opnum = 0;
                self.state = if self.queue.is_empty() {
                    StageState::WaitNext
                } else {
                    StageState::WaitPrev
                };
            }
            _ => {}
        }
    }
}

// === The pipeline ===

/// The execution engine: both caches, the register file, the PSW and the
/// five stages, driven one cycle at a time.
#[derive(Debug)]
pub struct Pipeline {
    fetch: FetchStage,
    decoder: DecodeStage,
    operands: OperandStage,
    alu: AluStage,
    writeback: WritebackStage,
    window: VecDeque<Command>,
    base: u64,
    next_id: u64,
    icache: Cache,
    dcache: Cache,
    registers: RegisterFile,
    psw: Psw,
    enabled: bool,
    branch_in_flight: bool,
    last_instruction_address: u16,
    cycles: Ticks,
    instructions: u64,
}

impl Pipeline {
    #[must_use]
    pub fn new(icache: Cache, dcache: Cache) -> Self {
        Self {
            fetch: FetchStage::new(),
            decoder: DecodeStage::new(),
            operands: OperandStage::new(),
            alu: AluStage::new(),
            writeback: WritebackStage::new(),
            window: VecDeque::new(),
            base: 0,
            next_id: 0,
            icache,
            dcache,
            registers: RegisterFile::new(),
            psw: Psw::default(),
            enabled: true,
            branch_in_flight: false,
            last_instruction_address: 0,
            cycles: Ticks::ZERO,
            instructions: 0,
        }
    }

    /// Advance the virtual clock one cycle. Returns true when a new
    /// instruction was enqueued this cycle.
    pub fn cycle<B: Bus>(&mut self, bus: &mut B) -> Result<bool, Fault> {
        self.cycles += Ticks::new(1);
        let mut new_command = false;
        if self.empty()
            || (self.enabled
                && self.fetch.state == StageState::WaitNext
                && !self.branch_in_flight)
        {
            self.enqueue(bus)?;
            new_command = true;
        }
        Ok(self.progress(bus, true)? || new_command)
    }

    /// Run one whole instruction: cycle until the next one is enqueued,
    /// then drain it without fetching further. Single-step semantics for
    /// the debugger.
    pub fn step<B: Bus>(&mut self, bus: &mut B) -> Result<(), Fault> {
        while !self.cycle(bus)? {}
        self.drain(bus)?;
        Ok(())
    }

    /// Run cycles without fetching until every stage is idle. Returns the
    /// number of cycles consumed. Used by the interrupt entry.
    pub fn barrier<B: Bus>(&mut self, bus: &mut B) -> Result<u64, Fault> {
        self.drain(bus)
    }

    fn drain<B: Bus>(&mut self, bus: &mut B) -> Result<u64, Fault> {
        let mut cycles = 0u64;
        while !self.empty() {
            cycles += 1;
            self.progress(bus, false)?;
        }
        self.cycles += Ticks::new(cycles);
        self.branch_in_flight = false;
        Ok(cycles)
    }

    /// True when every stage is idle.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.fetch.state == StageState::WaitNext
            && self.decoder.state == StageState::WaitNext
            && self.operands.state == StageState::WaitNext
            && self.alu.state == StageState::WaitNext
            && self.writeback.state == StageState::WaitNext
    }

    /// Enqueue the instruction at PC into all five stages. Public for the
    /// interrupt path, which re-primes the pipe after rewriting PC.
    pub fn enqueue_next<B: Bus>(&mut self, bus: &mut B) -> Result<(), Fault> {
        self.enqueue(bus)
    }

    fn enqueue<B: Bus>(&mut self, bus: &mut B) -> Result<(), Fault> {
        self.instructions += 1;
        let pc = self.registers.peek_word(PC);
        self.last_instruction_address = pc;
        let word = bus.load(pc, Size::Word)?;
        let command = decode(word)?;
        if command.is_control() {
            self.branch_in_flight = true;
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut fetch_ops = vec![FetchOp {
            size: Size::Word,
            sink: WordSink::Discard,
        }];
        let mut of_ops = Vec::new();
        let mut block_regs = Vec::new();
        let mut block_addrs = Vec::new();
        let mut alu_ops = Vec::new();
        let mut wb_ops = Vec::new();
        for (index, op) in command.micro_ops.iter().enumerate() {
            match *op {
                MicroOp::FetchNextWord { size, sink } => {
                    fetch_ops.push(FetchOp { size, sink });
                }
                MicroOp::Decode => {}
                MicroOp::Alu { .. } => alu_ops.push(index),
                MicroOp::StoreRegister { reg, .. } => {
                    if !block_regs.contains(&reg) {
                        block_regs.push(reg);
                    }
                    wb_ops.push(index);
                }
                MicroOp::BranchIf { .. } => {
                    if !block_regs.contains(&PC) {
                        block_regs.push(PC);
                    }
                    wb_ops.push(index);
                }
                MicroOp::StoreAddress { addr, .. } => {
                    block_addrs.push(addr);
                    wb_ops.push(index);
                }
                _ => {
                    debug_assert!(op.is_operand_stage());
                    of_ops.push(index);
                }
            }
        }
        let has_next = command.num_next_words() != 0;
        debug_assert!(op_projection_is_total(&command, &of_ops, &alu_ops, &wb_ops));

        self.window.push_back(command);
        self.fetch.add_job(FetchJob {
            cmd: id,
            ops: fetch_ops,
        });
        self.decoder.add_job(DecodeJob { has_next });
        self.operands.add_job(OperandJob {
            cmd: id,
            ops: of_ops,
            block_regs,
            block_addrs,
        });
        self.alu.add_job(AluJob {
            cmd: id,
            ops: alu_ops,
        });
        self.writeback.add_job(WritebackJob {
            cmd: id,
            ops: wb_ops,
        });
        Ok(())
    }

    fn progress<B: Bus>(&mut self, bus: &mut B, fetch_new: bool) -> Result<bool, Fault> {
        let mut new_command = false;
        self.fetch.worked = false;
        self.decoder.worked = false;
        self.operands.worked = false;
        self.alu.worked = false;
        self.writeback.worked = false;

        let imem_ready = self.icache.cycle();
        let dmem_ready = self.dcache.cycle();
        let mut worked = false;

        // Wake stages whose exact request just became ready.
        for pos in 0..STAGES {
            let (state, address) = self.stage_wait_info(pos);
            let retry = match state {
                StageState::WaitData => {
                    dmem_ready
                        && self.dcache.address() == Some(address)
                        && self.dcache.access() == Some(self.stage_direction(pos))
                }
                StageState::WaitInstruction => {
                    imem_ready
                        && self.icache.address() == Some(address)
                        && self.icache.access() == Some(Access::Read)
                }
                _ => false,
            };
            if retry {
                worked |= self.stage_cycle(pos, bus)?;
            }
        }

        for pos in (0..STAGES).rev() {
            worked |= self.advance(pos, dmem_ready, imem_ready, bus)?;
        }

        if fetch_new
            && (self.empty()
                || (self.enabled
                    && !self.branch_in_flight
                    && self.fetch.state == StageState::WaitNext))
        {
            new_command = true;
            self.branch_in_flight = false;
            self.enqueue(bus)?;
        }

        // Pipelining means the fresh front can start within the same cycle;
        // with the pipe disabled that only happens when nothing else moved.
        if self.enabled || !worked {
            self.advance(0, dmem_ready, imem_ready, bus)?;
        }
        Ok(new_command)
    }

    fn advance<B: Bus>(
        &mut self,
        pos: usize,
        dmem_ready: bool,
        imem_ready: bool,
        bus: &mut B,
    ) -> Result<bool, Fault> {
        let mut worked = false;
        for i in pos..STAGES {
            let state = self.stage_state(i);
            let mut try_cycle = !(state == StageState::WaitData && !dmem_ready)
                && !(state == StageState::WaitInstruction && !imem_ready);
            if i != pos {
                try_cycle = try_cycle && !self.stage_worked(i - 1);
            }
            if try_cycle {
                worked |= self.stage_cycle(i, bus)?;
            }

            if i == STAGES - 1 {
                if self.stage_state(i) == StageState::Finished {
                    self.retire();
                }
            } else if self.stage_state(i) == StageState::Finished
                && self.stage_state(i + 1) == StageState::WaitPrev
            {
                self.stage_continue(i);
                self.stage_continue(i + 1);
            }
        }
        Ok(worked)
    }

    fn stage_cycle<B: Bus>(&mut self, pos: usize, bus: &mut B) -> Result<bool, Fault> {
        match pos {
            0 => {
                let Self {
                    fetch,
                    decoder,
                    icache,
                    registers,
                    window,
                    base,
                    ..
                } = self;
                fetch.cycle(decoder, icache, registers, window, *base, bus)
            }
            1 => {
                let Self { fetch, decoder, .. } = self;
                Ok(decoder.cycle(fetch))
            }
            2 => {
                let Self {
                    operands,
                    dcache,
                    registers,
                    window,
                    base,
                    ..
                } = self;
                operands.cycle(dcache, registers, window, *base, bus)
            }
            3 => {
                let Self {
                    alu, window, base, psw, ..
                } = self;
                Ok(alu.cycle(window, *base, psw))
            }
            _ => {
                let Self {
                    writeback,
                    dcache,
                    registers,
                    window,
                    base,
                    ..
                } = self;
                writeback.cycle(dcache, registers, window, *base, bus)
            }
        }
    }

    fn stage_state(&self, pos: usize) -> StageState {
        match pos {
            0 => self.fetch.state,
            1 => self.decoder.state,
            2 => self.operands.state,
            3 => self.alu.state,
            _ => self.writeback.state,
        }
    }

    fn stage_worked(&self, pos: usize) -> bool {
        match pos {
            0 => self.fetch.worked,
            1 => self.decoder.worked,
            2 => self.operands.worked,
            3 => self.alu.worked,
            _ => self.writeback.worked,
        }
    }

    fn stage_wait_info(&self, pos: usize) -> (StageState, u16) {
        match pos {
            0 => (self.fetch.state, self.fetch.address),
            1 => (self.decoder.state, 0),
            2 => (self.operands.state, self.operands.address),
            3 => (self.alu.state, 0),
            _ => (self.writeback.state, self.writeback.address),
        }
    }

    fn stage_direction(&self, pos: usize) -> Access {
        if pos == STAGES - 1 {
            Access::Write
        } else {
            Access::Read
        }
    }

    fn stage_continue(&mut self, pos: usize) {
        match pos {
            0 => self.fetch.continue_after_opcode(),
            1 => self.decoder.continue_generic(),
            2 => self.operands.continue_generic(),
            3 => self.alu.continue_generic(),
            _ => self.writeback.continue_generic(),
        }
    }

    /// The oldest instruction finished writeback: drop it from the window.
    fn retire(&mut self) {
        self.writeback.continue_generic();
        self.window.pop_front();
        self.base += 1;
    }

    // === Host surface ===

    #[must_use]
    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    #[must_use]
    pub fn psw(&self) -> Psw {
        self.psw
    }

    pub fn psw_mut(&mut self) -> &mut Psw {
        &mut self.psw
    }

    #[must_use]
    pub fn icache(&self) -> &Cache {
        &self.icache
    }

    #[must_use]
    pub fn dcache(&self) -> &Cache {
        &self.dcache
    }

    pub fn icache_mut(&mut self) -> &mut Cache {
        &mut self.icache
    }

    pub fn dcache_mut(&mut self) -> &mut Cache {
        &mut self.dcache
    }

    #[must_use]
    pub fn cycles(&self) -> Ticks {
        self.cycles
    }

    #[must_use]
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    pub fn clear_statistics(&mut self) {
        self.cycles = Ticks::ZERO;
        self.instructions = 0;
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Disable to serialize instructions (no overlap) for A/B timing runs.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Address the most recently enqueued instruction was fetched from.
    #[must_use]
    pub fn last_instruction_address(&self) -> u16 {
        self.last_instruction_address
    }
}

fn op_projection_is_total(
    command: &Command,
    of_ops: &[usize],
    alu_ops: &[usize],
    wb_ops: &[usize],
) -> bool {
    let claimed = of_ops.len() + alu_ops.len() + wb_ops.len();
    let fetches = command
        .micro_ops
        .iter()
        .filter(|op| matches!(op, MicroOp::FetchNextWord { .. } | MicroOp::Decode))
        .count();
    claimed + fetches == command.micro_ops.len()
}
