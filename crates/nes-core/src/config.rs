//! Console configuration

/// What the CPU does when it fetches an undocumented opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownOpcodePolicy {
    /// Trap: rewind to the opcode and refuse to run until reset
    Halt,
    /// Log a warning and treat the byte as a 2-cycle NOP
    #[default]
    Continue,
}

/// How many PPU cycles one console step advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepTiming {
    /// Three PPU cycles per instruction
    #[default]
    PerInstruction,
    /// Three PPU cycles per CPU cycle of the previous instruction
    PerCycle,
}

/// Console configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsoleConfig {
    pub unknown_opcode: UnknownOpcodePolicy,
    pub timing: StepTiming,
}

impl ConsoleConfig {
    /// Halt on undocumented opcodes, per-instruction timing
    pub fn strict() -> Self {
        Self {
            unknown_opcode: UnknownOpcodePolicy::Halt,
            ..Self::default()
        }
    }
}
