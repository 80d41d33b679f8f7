//! NES CLI - headless runner for the NES emulator core

use anyhow::{Context, Result};
use clap::Parser;
use nes_core::{ConsoleConfig, NesSystem, StepTiming, UnknownOpcodePolicy};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// NES Emulator CLI
#[derive(Parser, Debug)]
#[command(name = "nes-cli")]
#[command(about = "Run an iNES ROM headlessly and dump emulator state", long_about = None)]
struct Args {
    /// Path to the iNES ROM file
    #[arg(short, long)]
    rom: PathBuf,

    /// Number of frames to run
    #[arg(short, long, default_value = "60")]
    frames: u64,

    /// Dump CPU state after execution
    #[arg(short = 'c', long)]
    dump_cpu: bool,

    /// Dump PPU state after execution
    #[arg(short = 'p', long)]
    dump_ppu: bool,

    /// Dump 16 bytes of CPU memory starting at this hex address (repeatable)
    #[arg(short = 'm', long, value_parser = parse_hex_u16)]
    dump_mem: Vec<u16>,

    /// Controller 1 button mask, hex (bit 0 = A ... bit 7 = Right)
    #[arg(long, value_parser = parse_hex_u8, default_value = "0")]
    pad1: u8,

    /// Controller 2 button mask, hex
    #[arg(long, value_parser = parse_hex_u8, default_value = "0")]
    pad2: u8,

    /// Stop on undocumented opcodes instead of skipping them
    #[arg(long)]
    strict: bool,

    /// Advance the PPU three cycles per CPU cycle instead of per instruction
    #[arg(long)]
    cycle_timing: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

fn parse_hex_u16(s: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(s.trim_start_matches('$').trim_start_matches("0x"), 16)
}

fn parse_hex_u8(s: &str) -> Result<u8, std::num::ParseIntError> {
    u8::from_str_radix(s.trim_start_matches('$').trim_start_matches("0x"), 16)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ConsoleConfig {
        unknown_opcode: if args.strict {
            UnknownOpcodePolicy::Halt
        } else {
            UnknownOpcodePolicy::Continue
        },
        timing: if args.cycle_timing {
            StepTiming::PerCycle
        } else {
            StepTiming::PerInstruction
        },
    };

    let mut system = NesSystem::with_config(config);
    system
        .load_cartridge(&args.rom)
        .with_context(|| format!("failed to load {}", args.rom.display()))?;
    if let Some(cart) = system.bus().cartridge() {
        println!("Loaded cartridge:");
        println!("  PRG ROM: {} bytes", cart.prg_rom().len());
        println!(
            "  CHR {}: {} bytes",
            if cart.has_chr_ram() { "RAM" } else { "ROM" },
            cart.chr().len()
        );
        println!("  Mapper: {}", cart.mapper());
        println!("  Mirroring: {:?}", cart.mirroring());
    }

    system.reset();
    system.set_controller_state(0, args.pad1);
    system.set_controller_state(1, args.pad2);

    info!(frames = args.frames, "running");
    let result = system.run_frames(args.frames);
    println!("Completed {} frames.", system.frame_count());

    if args.dump_cpu {
        dump_cpu_state(&system);
    }
    if args.dump_ppu {
        dump_ppu_state(&system);
    }
    for &address in &args.dump_mem {
        dump_memory(&mut system, address);
    }

    result.context("emulation stopped")?;
    Ok(())
}

fn dump_cpu_state(system: &NesSystem) {
    let cpu = system.cpu();
    let regs = cpu.registers();
    let status = cpu.status();

    println!("\nCPU State:");
    println!("  A:    ${:02X}", regs.a);
    println!("  X:    ${:02X}", regs.x);
    println!("  Y:    ${:02X}", regs.y);
    println!("  PC:   ${:04X}", regs.pc);
    println!("  SP:   ${:02X}", regs.sp);
    println!("  P:    ${:02X} ({})", status.bits(), status);
    println!("  Cycles: {}", cpu.total_cycles());
    if cpu.is_halted() {
        println!("  Halted");
    }
}

fn dump_ppu_state(system: &NesSystem) {
    let ppu = system.ppu();

    println!("\nPPU State:");
    println!("  Scanline: {}", ppu.scanline());
    println!("  Cycle: {}", ppu.cycle());
    println!("  CTRL: ${:02X}", ppu.ctrl().bits());
    println!("  MASK: ${:02X}", ppu.mask().bits());
    println!("  STATUS: ${:02X}", ppu.status().bits());
    println!(
        "  v: ${:04X}  t: ${:04X}  fine X: {}",
        ppu.vram_addr(),
        ppu.temp_addr(),
        ppu.fine_x()
    );
    println!("  OAMADDR: ${:02X}", ppu.oam_addr());
}

fn dump_memory(system: &mut NesSystem, address: u16) {
    let bytes: Vec<String> = (0..16u16)
        .map(|offset| format!("{:02X}", system.read_memory(address.wrapping_add(offset))))
        .collect();
    println!("\n${:04X}: {}", address, bytes.join(" "));
}
