//! CPU module - 2A03 (6502 variant) implementation
//!
//! Instructions are decoded through [`crate::opcodes::OPCODE_TABLE`] and run
//! by a single executor that resolves the operand for the entry's addressing
//! mode and then applies the operation. The decimal flag is tracked but
//! arithmetic is always binary, as on the NES.
//!
//! All memory traffic goes through the [`Bus`] trait; the CPU keeps no
//! memory of its own.

use std::fmt;

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::UnknownOpcodePolicy;
use crate::opcodes::{self, AddressingMode, InstructionInfo, Operation};

/// NMI vector
pub const NMI_VECTOR: u16 = 0xFFFA;
/// Reset vector
pub const RESET_VECTOR: u16 = 0xFFFC;
/// IRQ/BRK vector
pub const IRQ_VECTOR: u16 = 0xFFFE;
/// Stack page
pub const STACK_BASE: u16 = 0x0100;
/// Status register after reset
pub const RESET_STATUS: u8 = 0x34;
/// Load address used by [`FlatMemory::load_program`]
pub const PROGRAM_START: u16 = 0x0600;

const RESET_CYCLES: u64 = 7;
const NMI_CYCLES: u8 = 7;
const UNKNOWN_OPCODE_CYCLES: u8 = 2;

/// Bus trait for memory and I/O access
pub trait Bus {
    /// Read a byte from the given address
    fn read(&mut self, address: u16) -> u8;
    /// Write a byte to the given address
    fn write(&mut self, address: u16, value: u8);
}

bitflags! {
    /// CPU status flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u8 {
        const CARRY = 0b0000_0001;
        const ZERO = 0b0000_0010;
        const INTERRUPT_DISABLE = 0b0000_0100;
        const DECIMAL = 0b0000_1000;
        const BREAK = 0b0001_0000;
        const UNUSED = 0b0010_0000;
        const OVERFLOW = 0b0100_0000;
        const NEGATIVE = 0b1000_0000;
    }
}

impl StatusFlags {
    fn update_zero_negative(&mut self, value: u8) {
        self.set(Self::ZERO, value == 0);
        self.set(Self::NEGATIVE, value & 0x80 != 0);
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(StatusFlags, char); 8] = [
            (StatusFlags::NEGATIVE, 'N'),
            (StatusFlags::OVERFLOW, 'V'),
            (StatusFlags::UNUSED, 'U'),
            (StatusFlags::BREAK, 'B'),
            (StatusFlags::DECIMAL, 'D'),
            (StatusFlags::INTERRUPT_DISABLE, 'I'),
            (StatusFlags::ZERO, 'Z'),
            (StatusFlags::CARRY, 'C'),
        ];
        for (flag, name) in NAMES {
            let c = if self.contains(flag) {
                name
            } else {
                name.to_ascii_lowercase()
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// 2A03 CPU registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuRegisters {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
}

impl Default for CpuRegisters {
    fn default() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFD,
            pc: 0,
        }
    }
}

/// CPU error types
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CpuError {
    #[error("unimplemented opcode ${opcode:02X} at ${pc:04X}")]
    UnimplementedOpcode { opcode: u8, pc: u16 },
    #[error("CPU halted on opcode ${opcode:02X} at ${pc:04X}")]
    Halted { opcode: u8, pc: u16 },
}

/// CPU emulator state
#[derive(Debug, Clone)]
pub struct Cpu {
    registers: CpuRegisters,
    status: StatusFlags,
    total_cycles: u64,
    policy: UnknownOpcodePolicy,
    /// Opcode that trapped under [`UnknownOpcodePolicy::Halt`]
    halted_on: Option<u8>,
}

impl Cpu {
    /// Create a new CPU instance
    pub fn new() -> Self {
        Self::with_policy(UnknownOpcodePolicy::default())
    }

    pub fn with_policy(policy: UnknownOpcodePolicy) -> Self {
        Self {
            registers: CpuRegisters::default(),
            status: StatusFlags::from_bits_retain(RESET_STATUS),
            total_cycles: 0,
            policy,
            halted_on: None,
        }
    }

    /// Reset registers and load PC from the reset vector
    pub fn reset(&mut self, bus: &mut impl Bus) {
        self.registers = CpuRegisters::default();
        self.status = StatusFlags::from_bits_retain(RESET_STATUS);
        self.registers.pc = read_word(bus, RESET_VECTOR);
        self.total_cycles = RESET_CYCLES;
        self.halted_on = None;
    }

    /// Get CPU registers
    pub fn registers(&self) -> &CpuRegisters {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut CpuRegisters {
        &mut self.registers
    }

    /// Get CPU status flags
    pub fn status(&self) -> StatusFlags {
        self.status
    }

    /// Replace the status register; the unused bit stays set
    pub fn set_status(&mut self, bits: u8) {
        self.status = StatusFlags::from_bits_retain(bits) | StatusFlags::UNUSED;
    }

    /// Get total cycles executed
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn policy(&self) -> UnknownOpcodePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: UnknownOpcodePolicy) {
        self.policy = policy;
    }

    pub fn is_halted(&self) -> bool {
        self.halted_on.is_some()
    }

    /// Execute one instruction and return its base cycle count
    pub fn step(&mut self, bus: &mut impl Bus) -> Result<u8, CpuError> {
        if let Some(opcode) = self.halted_on {
            return Err(CpuError::Halted {
                opcode,
                pc: self.registers.pc,
            });
        }

        let pc = self.registers.pc;
        let opcode = self.fetch_byte(bus);
        let cycles = match opcodes::decode(opcode) {
            Some(info) => {
                self.execute(bus, info);
                info.cycles
            }
            None => match self.policy {
                UnknownOpcodePolicy::Halt => {
                    self.registers.pc = pc;
                    self.halted_on = Some(opcode);
                    return Err(CpuError::UnimplementedOpcode { opcode, pc });
                }
                UnknownOpcodePolicy::Continue => {
                    warn!("unimplemented opcode ${:02X} at ${:04X}", opcode, pc);
                    UNKNOWN_OPCODE_CYCLES
                }
            },
        };

        self.total_cycles += u64::from(cycles);
        Ok(cycles)
    }

    /// Enter the NMI handler
    pub fn nmi(&mut self, bus: &mut impl Bus) -> u8 {
        if self.is_halted() {
            return 0;
        }
        debug!(pc = self.registers.pc, "NMI");

        self.push_word(bus, self.registers.pc);
        let pushed = (self.status - StatusFlags::BREAK) | StatusFlags::UNUSED;
        self.push(bus, pushed.bits());
        self.status.insert(StatusFlags::INTERRUPT_DISABLE);
        self.registers.pc = read_word(bus, NMI_VECTOR);

        self.total_cycles += u64::from(NMI_CYCLES);
        NMI_CYCLES
    }

    fn execute(&mut self, bus: &mut impl Bus, info: InstructionInfo) {
        let mode = info.mode;
        match info.operation {
            // Loads and stores
            Operation::Lda => {
                let value = self.read_operand(bus, mode);
                self.registers.a = self.set_zn(value);
            }
            Operation::Ldx => {
                let value = self.read_operand(bus, mode);
                self.registers.x = self.set_zn(value);
            }
            Operation::Ldy => {
                let value = self.read_operand(bus, mode);
                self.registers.y = self.set_zn(value);
            }
            Operation::Sta => {
                let address = self.operand_address(bus, mode);
                bus.write(address, self.registers.a);
            }
            Operation::Stx => {
                let address = self.operand_address(bus, mode);
                bus.write(address, self.registers.x);
            }
            Operation::Sty => {
                let address = self.operand_address(bus, mode);
                bus.write(address, self.registers.y);
            }

            // Transfers
            Operation::Tax => self.registers.x = self.set_zn(self.registers.a),
            Operation::Tay => self.registers.y = self.set_zn(self.registers.a),
            Operation::Txa => self.registers.a = self.set_zn(self.registers.x),
            Operation::Tya => self.registers.a = self.set_zn(self.registers.y),
            Operation::Tsx => self.registers.x = self.set_zn(self.registers.sp),
            Operation::Txs => self.registers.sp = self.registers.x,

            // Arithmetic and logic
            Operation::Adc => {
                let value = self.read_operand(bus, mode);
                self.add_with_carry(value);
            }
            Operation::Sbc => {
                let value = self.read_operand(bus, mode);
                self.add_with_carry(!value);
            }
            Operation::And => {
                let value = self.read_operand(bus, mode);
                self.registers.a = self.set_zn(self.registers.a & value);
            }
            Operation::Ora => {
                let value = self.read_operand(bus, mode);
                self.registers.a = self.set_zn(self.registers.a | value);
            }
            Operation::Eor => {
                let value = self.read_operand(bus, mode);
                self.registers.a = self.set_zn(self.registers.a ^ value);
            }
            Operation::Bit => {
                let value = self.read_operand(bus, mode);
                self.status.set(StatusFlags::ZERO, self.registers.a & value == 0);
                self.status.set(StatusFlags::OVERFLOW, value & 0x40 != 0);
                self.status.set(StatusFlags::NEGATIVE, value & 0x80 != 0);
            }
            Operation::Cmp => self.compare(bus, mode, self.registers.a),
            Operation::Cpx => self.compare(bus, mode, self.registers.x),
            Operation::Cpy => self.compare(bus, mode, self.registers.y),

            // Read-modify-write
            Operation::Asl => self.modify(bus, mode, Self::shift_left),
            Operation::Lsr => self.modify(bus, mode, Self::shift_right),
            Operation::Rol => self.modify(bus, mode, Self::rotate_left),
            Operation::Ror => self.modify(bus, mode, Self::rotate_right),
            Operation::Inc => {
                self.modify(bus, mode, |cpu, value| cpu.set_zn(value.wrapping_add(1)))
            }
            Operation::Dec => {
                self.modify(bus, mode, |cpu, value| cpu.set_zn(value.wrapping_sub(1)))
            }

            Operation::Inx => self.registers.x = self.set_zn(self.registers.x.wrapping_add(1)),
            Operation::Iny => self.registers.y = self.set_zn(self.registers.y.wrapping_add(1)),
            Operation::Dex => self.registers.x = self.set_zn(self.registers.x.wrapping_sub(1)),
            Operation::Dey => self.registers.y = self.set_zn(self.registers.y.wrapping_sub(1)),

            // Branches
            Operation::Bcc => self.branch(bus, !self.status.contains(StatusFlags::CARRY)),
            Operation::Bcs => self.branch(bus, self.status.contains(StatusFlags::CARRY)),
            Operation::Bne => self.branch(bus, !self.status.contains(StatusFlags::ZERO)),
            Operation::Beq => self.branch(bus, self.status.contains(StatusFlags::ZERO)),
            Operation::Bpl => self.branch(bus, !self.status.contains(StatusFlags::NEGATIVE)),
            Operation::Bmi => self.branch(bus, self.status.contains(StatusFlags::NEGATIVE)),
            Operation::Bvc => self.branch(bus, !self.status.contains(StatusFlags::OVERFLOW)),
            Operation::Bvs => self.branch(bus, self.status.contains(StatusFlags::OVERFLOW)),

            // Jumps and subroutines
            Operation::Jmp => self.registers.pc = self.operand_address(bus, mode),
            Operation::Jsr => {
                let target = self.operand_address(bus, mode);
                self.push_word(bus, self.registers.pc.wrapping_sub(1));
                self.registers.pc = target;
            }
            Operation::Rts => self.registers.pc = self.pop_word(bus).wrapping_add(1),
            Operation::Rti => {
                let bits = self.pop(bus);
                self.restore_status(bits);
                self.registers.pc = self.pop_word(bus);
            }
            Operation::Brk => {
                self.registers.pc = self.registers.pc.wrapping_add(1);
                self.push_word(bus, self.registers.pc);
                let pushed = self.status | StatusFlags::BREAK | StatusFlags::UNUSED;
                self.push(bus, pushed.bits());
                self.status.insert(StatusFlags::BREAK);
                self.registers.pc = read_word(bus, IRQ_VECTOR);
            }

            // Stack
            Operation::Pha => self.push(bus, self.registers.a),
            Operation::Php => {
                let pushed = self.status | StatusFlags::BREAK | StatusFlags::UNUSED;
                self.push(bus, pushed.bits());
            }
            Operation::Pla => {
                let value = self.pop(bus);
                self.registers.a = self.set_zn(value);
            }
            Operation::Plp => {
                let bits = self.pop(bus);
                self.restore_status(bits);
            }

            // Flags
            Operation::Clc => self.status.remove(StatusFlags::CARRY),
            Operation::Sec => self.status.insert(StatusFlags::CARRY),
            Operation::Cli => self.status.remove(StatusFlags::INTERRUPT_DISABLE),
            Operation::Sei => self.status.insert(StatusFlags::INTERRUPT_DISABLE),
            Operation::Cld => self.status.remove(StatusFlags::DECIMAL),
            Operation::Sed => self.status.insert(StatusFlags::DECIMAL),
            Operation::Clv => self.status.remove(StatusFlags::OVERFLOW),

            Operation::Nop => {}
        }
    }

    /// Resolve the effective address for `mode`, consuming operand bytes.
    /// Immediate yields the address of the operand byte itself.
    fn operand_address(&mut self, bus: &mut impl Bus, mode: AddressingMode) -> u16 {
        match mode {
            AddressingMode::Immediate => {
                let address = self.registers.pc;
                self.registers.pc = address.wrapping_add(1);
                address
            }
            AddressingMode::ZeroPage => self.fetch_byte(bus) as u16,
            AddressingMode::ZeroPageX => self.fetch_byte(bus).wrapping_add(self.registers.x) as u16,
            AddressingMode::ZeroPageY => self.fetch_byte(bus).wrapping_add(self.registers.y) as u16,
            AddressingMode::Absolute => self.fetch_word(bus),
            AddressingMode::AbsoluteX => self.fetch_word(bus).wrapping_add(self.registers.x as u16),
            AddressingMode::AbsoluteY => self.fetch_word(bus).wrapping_add(self.registers.y as u16),
            AddressingMode::Indirect => {
                // The high byte never crosses a page: ($30FF) reads $30FF and $3000
                let pointer = self.fetch_word(bus);
                let lo = bus.read(pointer);
                let hi = bus.read((pointer & 0xFF00) | (pointer.wrapping_add(1) & 0x00FF));
                u16::from_le_bytes([lo, hi])
            }
            AddressingMode::IndirectX => {
                let pointer = self.fetch_byte(bus).wrapping_add(self.registers.x);
                read_zero_page_word(bus, pointer)
            }
            AddressingMode::IndirectY => {
                let pointer = self.fetch_byte(bus);
                read_zero_page_word(bus, pointer).wrapping_add(self.registers.y as u16)
            }
            AddressingMode::Relative => {
                let offset = self.fetch_byte(bus) as i8;
                self.registers.pc.wrapping_add_signed(offset as i16)
            }
            AddressingMode::Implied | AddressingMode::Accumulator => self.registers.pc,
        }
    }

    fn read_operand(&mut self, bus: &mut impl Bus, mode: AddressingMode) -> u8 {
        if mode == AddressingMode::Accumulator {
            return self.registers.a;
        }
        let address = self.operand_address(bus, mode);
        bus.read(address)
    }

    fn modify(&mut self, bus: &mut impl Bus, mode: AddressingMode, op: fn(&mut Self, u8) -> u8) {
        if mode == AddressingMode::Accumulator {
            let a = self.registers.a;
            self.registers.a = op(self, a);
            return;
        }
        let address = self.operand_address(bus, mode);
        let value = bus.read(address);
        let result = op(self, value);
        bus.write(address, result);
    }

    fn branch(&mut self, bus: &mut impl Bus, condition: bool) {
        let target = self.operand_address(bus, AddressingMode::Relative);
        if condition {
            self.registers.pc = target;
        }
    }

    fn compare(&mut self, bus: &mut impl Bus, mode: AddressingMode, register: u8) {
        let value = self.read_operand(bus, mode);
        self.status.set(StatusFlags::CARRY, register >= value);
        self.set_zn(register.wrapping_sub(value));
    }

    fn add_with_carry(&mut self, value: u8) {
        let a = self.registers.a;
        let carry = self.status.contains(StatusFlags::CARRY) as u16;
        let sum = a as u16 + value as u16 + carry;
        let result = sum as u8;

        self.status.set(StatusFlags::CARRY, sum > 0xFF);
        self.status.set(
            StatusFlags::OVERFLOW,
            !(a ^ value) & (a ^ result) & 0x80 != 0,
        );
        self.registers.a = self.set_zn(result);
    }

    fn shift_left(&mut self, value: u8) -> u8 {
        self.status.set(StatusFlags::CARRY, value & 0x80 != 0);
        self.set_zn(value << 1)
    }

    fn shift_right(&mut self, value: u8) -> u8 {
        self.status.set(StatusFlags::CARRY, value & 0x01 != 0);
        self.set_zn(value >> 1)
    }

    fn rotate_left(&mut self, value: u8) -> u8 {
        let carry_in = self.status.contains(StatusFlags::CARRY) as u8;
        self.status.set(StatusFlags::CARRY, value & 0x80 != 0);
        self.set_zn((value << 1) | carry_in)
    }

    fn rotate_right(&mut self, value: u8) -> u8 {
        let carry_in = self.status.contains(StatusFlags::CARRY) as u8;
        self.status.set(StatusFlags::CARRY, value & 0x01 != 0);
        self.set_zn((value >> 1) | (carry_in << 7))
    }

    fn set_zn(&mut self, value: u8) -> u8 {
        self.status.update_zero_negative(value);
        value
    }

    // PLP and RTI: Break comes back clear, Unused comes back set
    fn restore_status(&mut self, bits: u8) {
        self.status =
            (StatusFlags::from_bits_retain(bits) - StatusFlags::BREAK) | StatusFlags::UNUSED;
    }

    fn fetch_byte(&mut self, bus: &mut impl Bus) -> u8 {
        let value = bus.read(self.registers.pc);
        self.registers.pc = self.registers.pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self, bus: &mut impl Bus) -> u16 {
        let lo = self.fetch_byte(bus);
        let hi = self.fetch_byte(bus);
        u16::from_le_bytes([lo, hi])
    }

    fn push(&mut self, bus: &mut impl Bus, value: u8) {
        bus.write(STACK_BASE | self.registers.sp as u16, value);
        self.registers.sp = self.registers.sp.wrapping_sub(1);
    }

    fn pop(&mut self, bus: &mut impl Bus) -> u8 {
        self.registers.sp = self.registers.sp.wrapping_add(1);
        bus.read(STACK_BASE | self.registers.sp as u16)
    }

    fn push_word(&mut self, bus: &mut impl Bus, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.push(bus, hi);
        self.push(bus, lo);
    }

    fn pop_word(&mut self, bus: &mut impl Bus) -> u16 {
        let lo = self.pop(bus);
        let hi = self.pop(bus);
        u16::from_le_bytes([lo, hi])
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

fn read_word(bus: &mut impl Bus, address: u16) -> u16 {
    let lo = bus.read(address);
    let hi = bus.read(address.wrapping_add(1));
    u16::from_le_bytes([lo, hi])
}

fn read_zero_page_word(bus: &mut impl Bus, pointer: u8) -> u16 {
    let lo = bus.read(pointer as u16);
    let hi = bus.read(pointer.wrapping_add(1) as u16);
    u16::from_le_bytes([lo, hi])
}

/// Flat 64KB address space with no mapping, for exercising the CPU alone
#[derive(Debug, Clone)]
pub struct FlatMemory {
    bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn new() -> Self {
        Self {
            bytes: vec![0; 0x10000],
        }
    }

    /// Copy `data` to `address`, wrapping at the top of memory
    pub fn load(&mut self, address: u16, data: &[u8]) {
        let mut address = address;
        for &byte in data {
            self.bytes[address as usize] = byte;
            address = address.wrapping_add(1);
        }
    }

    /// Place a program at $0600 and point the reset vector at it
    pub fn load_program(&mut self, program: &[u8]) {
        self.load(PROGRAM_START, program);
        self.set_reset_vector(PROGRAM_START);
    }

    pub fn set_reset_vector(&mut self, address: u16) {
        self.load(RESET_VECTOR, &address.to_le_bytes());
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for FlatMemory {
    fn read(&mut self, address: u16) -> u8 {
        self.bytes[address as usize]
    }

    fn write(&mut self, address: u16, value: u8) {
        self.bytes[address as usize] = value;
    }
}
