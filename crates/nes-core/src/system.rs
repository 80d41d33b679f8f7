//! NES System Integration
//!
//! Ties the CPU to the bus (RAM, PPU, cartridge, controller ports) and
//! exposes the driver-facing surface: load, reset, step, framebuffer,
//! frame-ready flag and controller input.

use std::path::Path;

use crate::bus::Bus;
use crate::cartridge::{Cartridge, CartridgeError};
use crate::config::{ConsoleConfig, StepTiming};
use crate::controller::Buttons;
use crate::cpu::{Bus as CpuBus, Cpu, CpuError};
use crate::ppu::{Ppu, FRAME_SIZE};

/// PPU cycles per CPU cycle (NTSC)
pub const PPU_CYCLES_PER_CPU_CYCLE: u32 = 3;

/// NES System - integrates all components
#[derive(Debug, Clone)]
pub struct NesSystem {
    cpu: Cpu,
    bus: Bus,
    config: ConsoleConfig,
    /// CPU cycles of the last step, used by [`StepTiming::PerCycle`]
    last_cycles: u8,
    /// Frame counter
    frame_count: u64,
}

impl NesSystem {
    /// Create a new NES system with no cartridge
    pub fn new() -> Self {
        Self::with_config(ConsoleConfig::default())
    }

    pub fn with_config(config: ConsoleConfig) -> Self {
        Self {
            cpu: Cpu::with_policy(config.unknown_opcode),
            bus: Bus::new(),
            config,
            last_cycles: 1,
            frame_count: 0,
        }
    }

    pub fn config(&self) -> ConsoleConfig {
        self.config
    }

    /// Load an iNES file. On failure the current cartridge, if any, stays in place.
    pub fn load_cartridge(&mut self, path: impl AsRef<Path>) -> Result<(), CartridgeError> {
        let cartridge = Cartridge::load(path)?;
        self.insert_cartridge(cartridge);
        Ok(())
    }

    /// Load an iNES image from memory
    pub fn load_rom(&mut self, rom_data: &[u8]) -> Result<(), CartridgeError> {
        let cartridge = Cartridge::from_rom(rom_data)?;
        self.insert_cartridge(cartridge);
        Ok(())
    }

    pub fn insert_cartridge(&mut self, cartridge: Cartridge) {
        self.bus.set_cartridge(cartridge);
    }

    /// Reset the NES system
    pub fn reset(&mut self) {
        self.bus.reset();
        self.cpu.reset(&mut self.bus);
        self.last_cycles = 1;
        self.frame_count = 0;
    }

    /// Advance the console: tick the PPU, deliver a pending NMI, then run
    /// one CPU instruction.
    pub fn step(&mut self) -> Result<(), CpuError> {
        let ppu_cycles = match self.config.timing {
            StepTiming::PerInstruction => PPU_CYCLES_PER_CPU_CYCLE,
            StepTiming::PerCycle => PPU_CYCLES_PER_CPU_CYCLE * self.last_cycles as u32,
        };
        for _ in 0..ppu_cycles {
            if self.bus.tick_ppu() {
                self.frame_count += 1;
            }
        }

        let mut cycles = 0;
        if self.bus.poll_nmi() {
            cycles += self.cpu.nmi(&mut self.bus);
        }
        cycles += self.cpu.step(&mut self.bus)?;
        self.last_cycles = cycles;
        Ok(())
    }

    /// Step until a frame completes, then clear the frame-ready flag
    pub fn run_frame(&mut self) -> Result<(), CpuError> {
        while !self.is_frame_ready() {
            self.step()?;
        }
        self.clear_frame_ready();
        Ok(())
    }

    /// Run for N frames
    pub fn run_frames(&mut self, frames: u64) -> Result<(), CpuError> {
        for _ in 0..frames {
            self.run_frame()?;
        }
        Ok(())
    }

    /// Palette indices, 256x240 row-major
    pub fn frame_buffer(&self) -> &[u8; FRAME_SIZE] {
        self.bus.ppu().frame_buffer()
    }

    pub fn is_frame_ready(&self) -> bool {
        self.bus.ppu().is_frame_complete()
    }

    pub fn clear_frame_ready(&mut self) {
        self.bus.ppu_mut().clear_frame_complete();
    }

    /// Set the button mask for controller `index` (0 or 1); other indices are ignored
    pub fn set_controller_state(&mut self, index: usize, mask: u8) {
        self.bus
            .set_controller_state(index, Buttons::from_bits_retain(mask));
    }

    /// Get CPU reference
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// Get mutable CPU reference
    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    /// Get PPU reference
    pub fn ppu(&self) -> &Ppu {
        self.bus.ppu()
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    /// Get frame count
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Read a byte from memory via the bus
    pub fn read_memory(&mut self, address: u16) -> u8 {
        self.bus.read(address)
    }

    /// Write a byte to memory via the bus
    pub fn write_memory(&mut self, address: u16, value: u8) {
        self.bus.write(address, value);
    }
}

impl Default for NesSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::{HEADER_SIZE, PRG_BANK_SIZE};
    use crate::config::UnknownOpcodePolicy;
    use crate::ppu::{LAST_CYCLE, SCANLINES_PER_FRAME};

    /// One PRG bank filled with `fill`, `code` at $8000, all vectors at $8000
    fn rom_with(code: &[u8], fill: u8) -> Vec<u8> {
        let mut rom = vec![b'N', b'E', b'S', 0x1A, 1, 0, 0, 0];
        rom.resize(HEADER_SIZE, 0);
        let mut prg = vec![fill; PRG_BANK_SIZE];
        prg[..code.len()].copy_from_slice(code);
        for vector in [0x3FFA, 0x3FFC, 0x3FFE] {
            prg[vector] = 0x00;
            prg[vector + 1] = 0x80;
        }
        rom.extend(prg);
        rom
    }

    fn cycles_per_frame() -> u64 {
        (LAST_CYCLE as u64 + 1) * SCANLINES_PER_FRAME as u64
    }

    #[test]
    fn test_system_creation() {
        let system = NesSystem::new();
        assert_eq!(system.frame_count(), 0);
        assert!(!system.is_frame_ready());
    }

    #[test]
    fn test_system_reset_reads_vector() {
        let mut system = NesSystem::new();
        system.load_rom(&rom_with(&[], 0xEA)).unwrap();
        system.reset();
        assert_eq!(system.cpu().registers().pc, 0x8000);
        assert_eq!(system.cpu().registers().sp, 0xFD);
    }

    #[test]
    fn test_step_ticks_ppu_three_cycles() {
        let mut system = NesSystem::new();
        system.load_rom(&rom_with(&[], 0xEA)).unwrap();
        system.reset();
        system.step().unwrap();
        assert_eq!(system.ppu().cycle(), 3);
        assert_eq!(system.cpu().registers().pc, 0x8001);
    }

    #[test]
    fn test_per_cycle_timing() {
        let config = ConsoleConfig {
            timing: StepTiming::PerCycle,
            ..ConsoleConfig::default()
        };
        let mut system = NesSystem::with_config(config);
        system.load_rom(&rom_with(&[], 0xEA)).unwrap();
        system.reset();
        system.step().unwrap();
        system.step().unwrap();
        // 3 for the first step, then 3 * 2 for the NOP that preceded it
        assert_eq!(system.ppu().cycle(), 9);
    }

    #[test]
    fn test_frame_ready_and_clear() {
        let mut system = NesSystem::new();
        system.load_rom(&rom_with(&[], 0xEA)).unwrap();
        system.reset();

        let steps = cycles_per_frame() / 3 + 1;
        for _ in 0..steps {
            system.step().unwrap();
        }
        assert!(system.is_frame_ready());
        assert_eq!(system.frame_count(), 1);

        system.clear_frame_ready();
        assert!(!system.is_frame_ready());
    }

    #[test]
    fn test_frame_count_without_clearing_ready_flag() {
        let mut system = NesSystem::new();
        system.load_rom(&rom_with(&[], 0xEA)).unwrap();
        system.reset();

        let steps = cycles_per_frame() * 3 / 3 + 10;
        for _ in 0..steps {
            system.step().unwrap();
        }
        assert!(system.is_frame_ready());
        assert_eq!(system.frame_count(), 3);
    }

    #[test]
    fn test_nmi_delivered_before_instruction() {
        // $8000: LDA #$80; STA $2000; JMP $8005
        let mut code = vec![0xA9, 0x80, 0x8D, 0x00, 0x20, 0x4C, 0x05, 0x80];
        code.resize(0x10, 0xEA);
        // NMI handler at $8010: INC $10; RTI
        code.extend([0xE6, 0x10, 0x40]);
        let mut rom = rom_with(&code, 0xEA);
        rom[HEADER_SIZE + 0x3FFA] = 0x10;

        let mut system = NesSystem::new();
        system.load_rom(&rom).unwrap();
        system.reset();
        system.run_frame().unwrap();
        for _ in 0..4 {
            system.step().unwrap();
        }
        assert_eq!(system.read_memory(0x0010), 1);
    }

    #[test]
    fn test_unknown_opcode_stops_strict_console() {
        let mut system = NesSystem::with_config(ConsoleConfig::strict());
        system.load_rom(&rom_with(&[0x02], 0xEA)).unwrap();
        system.reset();
        assert_eq!(
            system.step(),
            Err(CpuError::UnimplementedOpcode {
                opcode: 0x02,
                pc: 0x8000
            })
        );
        assert_eq!(system.cpu().policy(), UnknownOpcodePolicy::Halt);
    }

    #[test]
    fn test_failed_load_keeps_cartridge() {
        let mut system = NesSystem::new();
        system.load_rom(&rom_with(&[0xA9], 0xEA)).unwrap();
        assert!(system.load_rom(b"not a rom").is_err());
        assert!(system.load_cartridge("/nonexistent/rom.nes").is_err());
        assert_eq!(system.read_memory(0x8000), 0xA9);
    }

    #[test]
    fn test_controller_state_through_console() {
        let mut system = NesSystem::new();
        system.set_controller_state(0, 0x80);
        system.set_controller_state(5, 0xFF);
        system.write_memory(0x4016, 1);
        assert_eq!(system.read_memory(0x4016), 1);
        assert_eq!(system.read_memory(0x4016), 0);
    }
}
