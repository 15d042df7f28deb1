//! Machine-level behavior: keyboard interrupt entry, listings,
//! breakpoints and the observable surface.

use emu_core::{Observable, Value};
use machine_pdp11::cpu_pdp11::{Fault, Size, SP};
use machine_pdp11::memory::KEYBOARD_REGISTER;
use machine_pdp11::{DisasmView, Emulator, MachineConfig, StepEvent};

fn machine_at(pc: u16) -> Emulator {
    let config = MachineConfig {
        initial_pc: pc,
        ..MachineConfig::default()
    };
    Emulator::new(&config).unwrap()
}

fn load_ram(emulator: &mut Emulator, address: u16, words: &[u16]) {
    let mut cursor = address;
    for &word in words {
        emulator
            .memory_mut()
            .write(cursor, Size::Word, word)
            .unwrap();
        cursor += 2;
    }
}

#[test]
fn keyboard_interrupt_vectors_through_zero() {
    let mut emulator = machine_at(0x0100);
    // Vector: PC at 0, PSW at 2. Handler: CLR R0; BR .
    load_ram(&mut emulator, 0x0000, &[0x0200, 0x0000]);
    load_ram(&mut emulator, 0x0200, &[0o005000, 0o000777]);
    load_ram(&mut emulator, 0x0100, &[0o000777]);
    emulator.registers_mut().write_word(SP, 0x0F00).unwrap();
    emulator.registers_mut().write_word(0, 0xDEAD).unwrap();
    emulator.pipeline_mut().psw_mut().set_c(true);

    // The program enables the interrupt via a store to the register.
    emulator
        .memory_mut()
        .write(KEYBOARD_REGISTER, Size::Word, 0x8000)
        .unwrap();
    emulator.keyboard().add_alpha('b');

    assert_eq!(emulator.step().unwrap(), StepEvent::Interrupt);

    // Permitted bit cleared, key code latched.
    assert!(!emulator.memory().keyboard_interrupt_permitted());
    assert_eq!(emulator.memory().keyboard_key(), 1);

    // PSW then PC pushed, each under a predecrement.
    assert_eq!(emulator.registers().peek_word(SP), 0x0EFC);
    assert_eq!(emulator.memory().read(0x0EFE, Size::Word).unwrap(), 0b0001);
    assert_eq!(emulator.memory().read(0x0EFC, Size::Word).unwrap(), 0x0100);

    // Vector loaded.
    assert_eq!(emulator.current_pc(), 0x0200);
    assert!(!emulator.psw().c());

    // The handler runs from here.
    emulator.step().unwrap();
    assert_eq!(emulator.registers().peek_word(0), 0);
}

#[test]
fn interrupt_needs_permission_and_a_key() {
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0000, &[0x0200, 0x0000]);
    load_ram(&mut emulator, 0x0200, &[0o000777]);
    load_ram(&mut emulator, 0x0100, &[0o005001, 0o000777]);

    // Key pending but not permitted: the instruction runs instead and the
    // key stays queued.
    emulator.keyboard().add_enter();
    assert_eq!(emulator.step().unwrap(), StepEvent::Instruction);
    assert_eq!(emulator.registers().peek_word(1), 0);
    assert!(!emulator.keyboard().is_empty());

    // Permitted with the queued key: the vector is taken.
    emulator
        .memory_mut()
        .write(KEYBOARD_REGISTER, Size::Word, 0x8000)
        .unwrap();
    assert_eq!(emulator.step().unwrap(), StepEvent::Interrupt);
    assert!(emulator.keyboard().is_empty());

    // Permitted but no key: back to plain execution.
    emulator
        .memory_mut()
        .write(KEYBOARD_REGISTER, Size::Word, 0x8000)
        .unwrap();
    assert_eq!(emulator.step().unwrap(), StepEvent::Instruction);
}

#[test]
fn run_stops_at_a_breakpoint() {
    let mut emulator = machine_at(0x8000);
    // MOV #5, R1; CLR R2; BR .
    emulator
        .load_rom_words(0x8000, &[0o012701, 0o000005, 0o005002, 0o000777])
        .unwrap();
    emulator.toggle_breakpoint(0x8006).unwrap();

    emulator.run().unwrap();
    assert_eq!(emulator.pipeline().last_instruction_address(), 0x8006);
    // One more step drains the in-flight instructions.
    emulator.step().unwrap();
    assert_eq!(emulator.registers().peek_word(1), 5);
    assert_eq!(emulator.registers().peek_word(2), 0);
}

#[test]
fn breakpoints_toggle_and_reject_odd() {
    let mut emulator = machine_at(0x8000);
    emulator.toggle_breakpoint(0x8000).unwrap();
    assert!(emulator.has_breakpoint(0x8000));
    emulator.toggle_breakpoint(0x8000).unwrap();
    assert!(!emulator.has_breakpoint(0x8000));
    assert!(matches!(
        emulator.toggle_breakpoint(0x8001),
        Err(Fault::OddBreakpoint(0x8001))
    ));
    emulator.set_breakpoint(0x8004, true).unwrap();
    assert!(emulator.has_breakpoint(0x8004));
    emulator.set_breakpoint(0x8004, false).unwrap();
    assert!(!emulator.has_breakpoint(0x8004));
}

#[test]
fn instruction_listing_resolves_following_words() {
    let mut emulator = machine_at(0x8000);
    // MOV #17, R3; CLR R1; data word.
    emulator
        .load_rom_words(0x8000, &[0o012703, 0o000017, 0o005001, 0o000000])
        .unwrap();
    emulator.toggle_breakpoint(0x8004).unwrap();

    let rows = emulator.disasm(0x8000, 3, DisasmView::Instructions).unwrap();
    assert_eq!(rows[0].address, 0x8000);
    assert_eq!(rows[0].text, "MOV #17, R3");
    assert_eq!(rows[1].address, 0x8004);
    assert_eq!(rows[1].text, "CLR R1");
    assert!(rows[1].breakpoint);
    assert_eq!(rows[2].address, 0x8006);
    assert_eq!(rows[2].text, "Not an instruction");

    // Asking from the middle of the MOV backs up to its start.
    let rows = emulator.disasm(0x8002, 2, DisasmView::Instructions).unwrap();
    assert_eq!(rows[0].address, 0x8000);
    assert_eq!(rows[0].text, "MOV #17, R3");
}

#[test]
fn octal_listing_formats_raw_words() {
    let mut emulator = machine_at(0x8000);
    emulator.load_rom_words(0x8000, &[0o012703, 0o000017]).unwrap();

    let rows = emulator.disasm(0x8000, 2, DisasmView::Octal).unwrap();
    assert_eq!(rows[0].text, "012703");
    assert_eq!(rows[1].text, "000017");

    // At the top of memory the listing pads upward.
    let rows = emulator.disasm(0xFFFC, 3, DisasmView::Octal).unwrap();
    assert_eq!(rows[0].address, 0xFFFA);
    assert_eq!(rows[2].address, 0xFFFE);

    assert!(matches!(
        emulator.disasm(0x8001, 1, DisasmView::Octal),
        Err(Fault::OddAddress(0x8001))
    ));
}

#[test]
fn observable_paths_cover_the_front_panel() {
    let mut emulator = machine_at(0x8000);
    emulator.load_rom_words(0x8000, &[0o005001]).unwrap();
    emulator.step().unwrap();

    assert_eq!(emulator.query("r1"), Some(Value::U16(0)));
    assert_eq!(emulator.query("pc"), Some(Value::U16(0x8002)));
    assert_eq!(emulator.query("psw.z"), Some(Value::Bool(true)));
    assert_eq!(emulator.query("stopped"), Some(Value::Bool(false)));
    let Some(Value::U64(cycles)) = emulator.query("pipeline.cycles") else {
        panic!("missing cycle counter");
    };
    assert!(cycles > 0);
    assert!(emulator.query("nonsense").is_none());
    assert!(emulator.query_paths().contains(&"icache.misses"));
}

#[test]
fn fault_leaves_state_inspectable() {
    let mut emulator = machine_at(0x0100);
    // The word at 0x0100 does not decode.
    load_ram(&mut emulator, 0x0100, &[0o000007]);
    let error = emulator.step();
    assert!(matches!(error, Err(Fault::UnknownOpcode(0o000007))));
    assert!(emulator.stopped());
    assert_eq!(emulator.current_pc(), 0x0100);
    assert_eq!(emulator.query("stopped"), Some(Value::Bool(true)));
}

#[test]
fn ipc_reflects_overlap() {
    let mut emulator = machine_at(0x8000);
    // A straight-line burst, free-running until the loop at the end.
    emulator
        .load_rom_words(
            0x8000,
            &[0o005001, 0o005002, 0o005003, 0o005004, 0o000777],
        )
        .unwrap();
    emulator.toggle_breakpoint(0x8008).unwrap();

    emulator.run().unwrap();
    emulator.step().unwrap();
    let instructions = emulator.pipeline().instructions();
    let cycles = emulator.pipeline().cycles().get();
    assert!(instructions >= 5);
    assert!(cycles >= instructions);
    assert_eq!(emulator.registers().peek_word(4), 0);
}
