//! End-to-end execution scenarios through the public machine API.

use machine_pdp11::cpu_pdp11::{Size, PC, SP};
use machine_pdp11::{Emulator, MachineConfig, StepEvent};

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
fn clr_word_register() {
    let mut emulator = machine_at(0x8000);
    emulator.load_rom_words(0x8000, &[0b0000_1010_0000_0001]).unwrap();
    emulator.registers_mut().write_word(1, 0xFFFF).unwrap();

    assert_eq!(emulator.step().unwrap(), StepEvent::Instruction);
    assert_eq!(emulator.registers().peek_word(1), 0);
    let psw = emulator.psw();
    assert!(psw.z() && !psw.n() && !psw.v() && !psw.c());
    assert_eq!(emulator.current_pc(), 0x8002);
}

#[test]
fn clr_byte_through_register_deferred() {
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0100, &[0b1000_1010_0000_1001]);
    emulator.registers_mut().write_word(1, 0x0080).unwrap();
    emulator
        .memory_mut()
        .write(0x0080, Size::Word, 0x01FE)
        .unwrap();

    emulator.step().unwrap();
    assert_eq!(emulator.memory().read(0x0080, Size::Word).unwrap(), 0x0100);
    assert_eq!(emulator.memory().read(0x0081, Size::Byte).unwrap(), 0x01);
    assert_eq!(emulator.memory().read(0x0080, Size::Byte).unwrap(), 0x00);
}

#[test]
fn neg_of_most_negative_value() {
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0100, &[0b0000_1011_0000_0010]);
    emulator.registers_mut().write_word(2, 0x8000).unwrap();

    emulator.step().unwrap();
    assert_eq!(emulator.registers().peek_word(2), 0x8000);
    let psw = emulator.psw();
    assert!(psw.n() && !psw.z() && psw.v() && psw.c());
}

#[test]
fn sob_branches_back() {
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0100, &[0b0111_1110_1000_0001]);
    emulator.registers_mut().write_word(2, 2).unwrap();

    emulator.step().unwrap();
    assert_eq!(emulator.registers().peek_word(2), 1);
    assert!(!emulator.psw().z());
    assert_eq!(emulator.current_pc(), 0x0100);
}

#[test]
fn jsr_through_register_deferred() {
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0100, &[0b0000_1001_0100_1010]);
    emulator.registers_mut().write_word(2, 0x1CA4).unwrap();
    emulator.registers_mut().write_word(5, 0x1234).unwrap();
    emulator.registers_mut().write_word(SP, 0xFFFE).unwrap();

    emulator.step().unwrap();
    assert_eq!(emulator.registers().peek_word(SP), 0xFFFC);
    assert_eq!(emulator.memory().read(0xFFFC, Size::Word).unwrap(), 0x1234);
    assert_eq!(emulator.registers().peek_word(5), 0x0102);
    assert_eq!(emulator.current_pc(), 0x1CA4);
}

#[test]
fn rts_returns_and_pops() {
    // JSR R5, @(R2) to a subroutine that is just RTS R5.
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0100, &[0b0000_1001_0100_1010]);
    load_ram(&mut emulator, 0x0200, &[0o000205]);
    emulator.registers_mut().write_word(2, 0x0200).unwrap();
    emulator.registers_mut().write_word(5, 0x1234).unwrap();
    emulator.registers_mut().write_word(SP, 0xFFFE).unwrap();

    emulator.step().unwrap();
    assert_eq!(emulator.current_pc(), 0x0200);
    emulator.step().unwrap();
    assert_eq!(emulator.current_pc(), 0x0102);
    assert_eq!(emulator.registers().peek_word(5), 0x1234);
    assert_eq!(emulator.registers().peek_word(SP), 0xFFFE);
}

#[test]
fn mov_byte_into_register_sign_extends() {
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0100, &[0o110102]);
    emulator.registers_mut().write_word(1, 0x0080).unwrap();
    emulator.registers_mut().write_word(2, 0x7777).unwrap();

    emulator.step().unwrap();
    assert_eq!(emulator.registers().peek_word(2), 0xFF80);
    assert!(emulator.psw().n());
}

#[test]
fn mark_unwinds_the_stack() {
    // MARK 2: SP <- SP + 4, PC <- R5, R5 <- pop.
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0100, &[0o006402]);
    emulator.registers_mut().write_word(SP, 0x0F00).unwrap();
    emulator.registers_mut().write_word(5, 0x0300).unwrap();
    // Saved R5 sits above the two parameter words.
    emulator
        .memory_mut()
        .write(0x0F04, Size::Word, 0x4321)
        .unwrap();

    emulator.step().unwrap();
    assert_eq!(emulator.current_pc(), 0x0300);
    assert_eq!(emulator.registers().peek_word(5), 0x4321);
    assert_eq!(emulator.registers().peek_word(SP), 0x0F06);
}

#[test]
fn autoincrement_walks_a_table() {
    // MOV (R1)+, R2; MOV (R1)+, R3.
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0100, &[0o012102, 0o012103]);
    load_ram(&mut emulator, 0x0300, &[0xAAAA, 0xBBBB]);
    emulator.registers_mut().write_word(1, 0x0300).unwrap();

    emulator.step().unwrap();
    emulator.step().unwrap();
    assert_eq!(emulator.registers().peek_word(2), 0xAAAA);
    assert_eq!(emulator.registers().peek_word(3), 0xBBBB);
    assert_eq!(emulator.registers().peek_word(1), 0x0304);
}

#[test]
fn stack_overflow_stops_the_engine() {
    // JSR with SP at the lower bound underflows the stack.
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0100, &[0b0000_1001_0100_1010]);
    emulator.registers_mut().set_sp_lower_bound(0x0F00).unwrap();
    emulator.registers_mut().write_word(SP, 0x0F00).unwrap();
    emulator.registers_mut().write_word(2, 0x0200).unwrap();

    assert!(emulator.step().is_err());
    assert!(emulator.stopped());
    // State preserved for inspection.
    assert_eq!(emulator.registers().peek_word(SP), 0x0F00);
}

#[test]
fn pc_and_sp_stay_even_across_a_program() {
    let mut emulator = machine_at(0x0100);
    // MOV #5, R1; SOB R1, 1; CLR R2; BR .
    load_ram(
        &mut emulator,
        0x0100,
        &[0o012701, 0o000005, 0o077101, 0o005002, 0o000777],
    );
    emulator.registers_mut().write_word(SP, 0x0F00).unwrap();

    for _ in 0..12 {
        emulator.step().unwrap();
        assert_eq!(emulator.current_pc() % 2, 0);
        assert_eq!(emulator.registers().peek_word(SP) % 2, 0);
        assert!(!emulator.registers().any_blocked());
    }
    assert_eq!(emulator.registers().peek_word(1), 0);
    assert_eq!(emulator.registers().peek_word(2), 0);
}

#[test]
fn video_store_paints_through_the_engine() {
    // MOV #0, @#VRAM: byte stores via the device path. Use CLRB @#addr.
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0100, &[0x8000 | 0o005037, 0x4000]);

    emulator.step().unwrap();
    assert_eq!(emulator.memory().video().image().pixel(0, 0), 0);
    assert_eq!(emulator.memory().video().image().pixel(7, 0), 0);
    // Reading back through memory reassembles the byte from pixels.
    assert_eq!(emulator.memory().read(0x4000, Size::Byte).unwrap(), 0);
}

#[test]
fn word_primitives_roundtrip_via_pc() {
    let mut emulator = machine_at(0x0100);
    load_ram(&mut emulator, 0x0100, &[0o005000]);
    emulator.step().unwrap();
    assert_eq!(emulator.registers().peek_word(PC), 0x0102);
}
