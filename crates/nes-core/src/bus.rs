//! Memory bus and mapping
//!
//! The NES memory map as seen by the CPU:
//! $0000-$07FF - 2KB Internal RAM
//! $0800-$1FFF - RAM mirroring (repeats every $0800 bytes)
//! $2000-$2007 - PPU registers
//! $2008-$3FFF - PPU register mirroring (every 8 bytes)
//! $4014       - OAM DMA
//! $4016/$4017 - Controller ports
//! $6000-$7FFF - Cartridge PRG RAM
//! $8000-$FFFF - Cartridge PRG ROM
//!
//! Anything else reads 0 and ignores writes.

use tracing::warn;

use crate::cartridge::Cartridge;
use crate::controller::{Buttons, Controller};
use crate::cpu::Bus as CpuBus;
use crate::ppu::{Ppu, OAM_SIZE};

/// RAM size in bytes
pub const RAM_SIZE: usize = 2048;

/// Number of controller ports
pub const CONTROLLER_PORTS: usize = 2;

/// Memory bus structure
#[derive(Debug, Clone)]
pub struct Bus {
    /// 2KB internal RAM (with mirroring)
    ram: [u8; RAM_SIZE],
    ppu: Ppu,
    cartridge: Option<Cartridge>,
    controllers: [Controller; CONTROLLER_PORTS],
}

impl Bus {
    /// Create a new bus with no cartridge
    pub fn new() -> Self {
        Self {
            ram: [0; RAM_SIZE],
            ppu: Ppu::new(),
            cartridge: None,
            controllers: [Controller::new(); CONTROLLER_PORTS],
        }
    }

    /// Set the cartridge for this bus
    pub fn set_cartridge(&mut self, cartridge: Cartridge) {
        self.cartridge = Some(cartridge);
    }

    /// Get a reference to the cartridge, if present
    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.cartridge.as_ref()
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn ppu_mut(&mut self) -> &mut Ppu {
        &mut self.ppu
    }

    /// Advance the PPU one cycle; true when vblank begins
    pub fn tick_ppu(&mut self) -> bool {
        self.ppu.step()
    }

    /// Consume a pending NMI request from the PPU
    pub fn poll_nmi(&mut self) -> bool {
        self.ppu.take_nmi()
    }

    /// Set the live button mask of a controller port (0 or 1)
    pub fn set_controller_state(&mut self, index: usize, buttons: Buttons) {
        match self.controllers.get_mut(index) {
            Some(controller) => controller.set_buttons(buttons),
            None => warn!(index, "no such controller port"),
        }
    }

    pub fn controller(&self, index: usize) -> Option<&Controller> {
        self.controllers.get(index)
    }

    /// Reset PPU and controller ports; RAM and the cartridge are kept
    pub fn reset(&mut self) {
        self.ppu.reset();
        for controller in &mut self.controllers {
            controller.reset();
        }
    }

    // $4014 - copy page $XX00-$XXFF into OAM
    fn oam_dma(&mut self, page: u8) {
        let base = (page as u16) << 8;
        let mut data = [0u8; OAM_SIZE];
        for (offset, byte) in data.iter_mut().enumerate() {
            *byte = self.read(base | offset as u16);
        }
        self.ppu.write_oam_dma(&data);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBus for Bus {
    /// Read a byte from the given address
    fn read(&mut self, address: u16) -> u8 {
        match address {
            // $0000-$1FFF - Internal RAM and mirrors
            0x0000..=0x1FFF => self.ram[(address & 0x07FF) as usize],
            // $2000-$3FFF - PPU registers and mirrors
            0x2000..=0x3FFF => self.ppu.read_register(address, self.cartridge.as_ref()),
            // $4016/$4017 - Controller ports
            0x4016 => self.controllers[0].read(),
            0x4017 => self.controllers[1].read(),
            // $6000-$FFFF - Cartridge
            0x6000..=0xFFFF => self.cartridge.as_ref().map_or(0, |cart| cart.cpu_read(address)),
            _ => 0,
        }
    }

    /// Write a byte to the given address
    fn write(&mut self, address: u16, value: u8) {
        match address {
            0x0000..=0x1FFF => self.ram[(address & 0x07FF) as usize] = value,
            0x2000..=0x3FFF => self.ppu.write_register(address, value, self.cartridge.as_mut()),
            0x4014 => self.oam_dma(value),
            // The strobe line is shared by both ports
            0x4016 => {
                for controller in &mut self.controllers {
                    controller.write(value);
                }
            }
            0x4017 => self.controllers[1].write(value),
            0x6000..=0xFFFF => {
                if let Some(cart) = self.cartridge.as_mut() {
                    cart.cpu_write(address, value);
                }
            }
            _ => {}
        }
    }
}
