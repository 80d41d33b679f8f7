//! NES Core - Pure Rust NES emulator library
//!
//! This crate provides the core emulation logic for a Nintendo Entertainment System (NES):
//! the 6502 CPU, the CPU bus, the PPU register file and timing, controller ports and
//! fixed-mapping (NROM) cartridges. Windowing, audio and pacing belong to the host.
//!
//! Diagnostics go through `tracing`; install a subscriber in the host to see them.

#![forbid(unsafe_code)]

/// CPU module containing the 2A03 (6502 variant) implementation
pub mod cpu;
/// Opcode decode table
pub mod opcodes;
/// Memory bus and mapping
pub mod bus;
/// PPU (Picture Processing Unit) implementation
pub mod ppu;
/// Cartridge loading and mapping
pub mod cartridge;
/// Controller shift registers
pub mod controller;
/// Console configuration
pub mod config;
/// Integration module for complete NES system
pub mod system;

pub use cartridge::{Cartridge, CartridgeError, Mirroring};
pub use config::{ConsoleConfig, StepTiming, UnknownOpcodePolicy};
pub use controller::Buttons;
pub use cpu::{Cpu, CpuError, FlatMemory};
pub use system::NesSystem;
