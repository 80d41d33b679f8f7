//! Standard controller ports ($4016/$4017)
//!
//! Each port is an 8-bit shift register. A strobe write latches the current
//! button mask; every read returns the top bit and shifts left, filling with
//! 1s so that reads past the eighth return 1.

use bitflags::bitflags;

bitflags! {
    /// Button mask as supplied by the host
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u8 {
        const A = 0b0000_0001;
        const B = 0b0000_0010;
        const SELECT = 0b0000_0100;
        const START = 0b0000_1000;
        const UP = 0b0001_0000;
        const DOWN = 0b0010_0000;
        const LEFT = 0b0100_0000;
        const RIGHT = 0b1000_0000;
    }
}

/// Standard NES controller
#[derive(Debug, Clone, Copy, Default)]
pub struct Controller {
    buttons: Buttons,
    shift: u8,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the live button state
    pub fn set_buttons(&mut self, buttons: Buttons) {
        self.buttons = buttons;
    }

    pub fn buttons(&self) -> Buttons {
        self.buttons
    }

    /// Strobe write: bit 0 set latches the live state into the shift register
    pub fn write(&mut self, value: u8) {
        if value & 0x01 != 0 {
            self.shift = self.buttons.bits();
        }
    }

    /// Serial read: returns 0 or 1
    pub fn read(&mut self) -> u8 {
        let bit = self.shift >> 7;
        self.shift = (self.shift << 1) | 0x01;
        bit
    }

    /// Clear the shift register; the host's button mask is kept
    pub fn reset(&mut self) {
        self.shift = 0;
    }
}
