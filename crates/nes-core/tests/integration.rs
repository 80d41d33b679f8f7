//! Integration tests for the NES system

use nes_core::cartridge::{CHR_BANK_SIZE, HEADER_SIZE, PRG_BANK_SIZE};
use nes_core::{Buttons, ConsoleConfig, NesSystem};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Build an NROM image: PRG filled with NOPs, `routine` placed at `origin`,
/// reset and NMI vectors pointing at it.
fn build_rom(prg_banks: u8, origin: u16, routine: &[u8]) -> Vec<u8> {
    let mut rom = vec![b'N', b'E', b'S', 0x1A, prg_banks, 1, 0x01, 0x00];
    rom.resize(HEADER_SIZE, 0);

    let prg_len = prg_banks as usize * PRG_BANK_SIZE;
    let mut prg = vec![0xEA; prg_len];
    let offset = (origin as usize - 0x8000) % prg_len;
    prg[offset..offset + routine.len()].copy_from_slice(routine);

    let [lo, hi] = origin.to_le_bytes();
    for vector in [0xFFFA, 0xFFFC, 0xFFFE] {
        let at = (vector - 0x8000) % prg_len;
        prg[at] = lo;
        prg[at + 1] = hi;
    }

    rom.extend(prg);
    rom.extend(std::iter::repeat(0).take(CHR_BANK_SIZE));
    rom
}

fn boot(rom: &[u8]) -> NesSystem {
    init_tracing();
    let mut system = NesSystem::with_config(ConsoleConfig::strict());
    system.load_rom(rom).expect("valid ROM");
    system.reset();
    system
}

#[test]
fn test_system_creation() {
    let system = NesSystem::new();
    assert_eq!(system.frame_count(), 0);
}

#[test]
fn test_program_writes_prg_ram() {
    // LDA #$42; STA $6000; JMP *
    let routine = [0xA9, 0x42, 0x8D, 0x00, 0x60, 0x4C, 0x05, 0xC0];
    let mut system = boot(&build_rom(1, 0xC000, &routine));
    assert_eq!(system.cpu().registers().pc, 0xC000);

    for _ in 0..100 {
        system.step().unwrap();
    }
    assert_eq!(system.read_memory(0x6000), 0x42);
    assert_eq!(system.cpu().registers().pc, 0xC005);
}

#[test]
fn test_program_writes_palette_through_ppu_ports() {
    let routine = [
        0xA2, 0x00, // LDX #$00
        0x86, 0x00, // STX $00
        0xA9, 0x3F, // LDA #$3F
        0x8D, 0x06, 0x20, // STA $2006
        0xA9, 0x00, // LDA #$00
        0x8D, 0x06, 0x20, // STA $2006
        0xA9, 0x0F, // LDA #$0F
        0x8D, 0x07, 0x20, // STA $2007
        0x4C, 0x13, 0x80, // JMP $8013
    ];
    let mut system = boot(&build_rom(2, 0x8000, &routine));
    for _ in 0..20 {
        system.step().unwrap();
    }

    let cartridge = system.bus().cartridge();
    assert_eq!(system.ppu().read_memory(0x3F00, cartridge), 0x0F);
    assert_eq!(system.ppu().vram_addr(), 0x3F01);
}

#[test]
fn test_program_reads_controller() {
    let routine = [
        0xA9, 0x01, // LDA #$01
        0x8D, 0x16, 0x40, // STA $4016
        0xA2, 0x00, // LDX #$00
        0xAD, 0x16, 0x40, // loop: LDA $4016
        0x95, 0x10, // STA $10,X
        0xE8, // INX
        0xE0, 0x08, // CPX #$08
        0xD0, 0xF6, // BNE loop
        0x4C, 0x11, 0x80, // JMP *
    ];
    let mut system = boot(&build_rom(1, 0x8000, &routine));
    system.set_controller_state(0, (Buttons::RIGHT | Buttons::START).bits());

    for _ in 0..60 {
        system.step().unwrap();
    }
    let bits: Vec<u8> = (0x10..0x18).map(|a| system.read_memory(a)).collect();
    assert_eq!(bits, vec![1, 0, 0, 0, 1, 0, 0, 0]);
}

#[test]
fn test_vblank_nmi_runs_handler_each_frame() {
    let routine = [
        0xA9, 0x80, // LDA #$80
        0x8D, 0x00, 0x20, // STA $2000
        0x4C, 0x05, 0x80, // JMP *
    ];
    let mut rom = build_rom(1, 0x8000, &routine);
    // NMI handler at $8100: INC $20; RTI
    let handler = HEADER_SIZE + 0x0100;
    rom[handler..handler + 3].copy_from_slice(&[0xE6, 0x20, 0x40]);
    rom[HEADER_SIZE + 0x3FFA] = 0x00;
    rom[HEADER_SIZE + 0x3FFB] = 0x81;

    let mut system = boot(&rom);
    system.run_frames(3).unwrap();
    for _ in 0..4 {
        system.step().unwrap();
    }
    assert_eq!(system.read_memory(0x0020), 3);
    assert_eq!(system.frame_count(), 3);
}

#[test]
fn test_framebuffer_after_first_frame() {
    let mut system = boot(&build_rom(1, 0x8000, &[0x4C, 0x00, 0x80]));
    system.run_frame().unwrap();

    let frame = system.frame_buffer();
    assert_eq!(frame.len(), 256 * 240);
    assert!(frame.iter().all(|&index| index < 4));
    assert_eq!(frame[255], 3);
    assert!(!system.is_frame_ready());
}
