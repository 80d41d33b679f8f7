//! PPU (Picture Processing Unit) implementation
//!
//! Models the CPU-visible register file ($2000-$2007), the loopy scroll
//! registers (`v`, `t`, fine X and the shared write toggle), the PPU address
//! space and the scanline/cycle timing that drives vblank and NMI.
//!
//! Timing: 341 cycles per scanline, 262 scanlines per frame. Scanlines 0-239
//! are visible, 241 starts vblank, 261 is the pre-render line. Pixel output
//! is a fixed test pattern; background and sprite compositing are not
//! modeled.

use bitflags::bitflags;
use tracing::debug;

use crate::cartridge::{Cartridge, Mirroring};

/// Visible width in pixels
pub const SCREEN_WIDTH: usize = 256;
/// Visible height in pixels
pub const SCREEN_HEIGHT: usize = 240;
/// Framebuffer size (one palette index per pixel)
pub const FRAME_SIZE: usize = SCREEN_WIDTH * SCREEN_HEIGHT;

pub const NAMETABLE_SIZE: usize = 4096;
pub const PALETTE_SIZE: usize = 32;
pub const OAM_SIZE: usize = 256;

/// Last cycle index of a scanline
pub const LAST_CYCLE: u16 = 340;
/// First vblank scanline
pub const VBLANK_SCANLINE: u16 = 241;
/// Pre-render scanline
pub const PRE_RENDER_SCANLINE: u16 = 261;
pub const SCANLINES_PER_FRAME: u16 = 262;

bitflags! {
    /// $2000 - PPUCTRL
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PpuCtrl: u8 {
        const NAMETABLE_X = 0b0000_0001;
        const NAMETABLE_Y = 0b0000_0010;
        const VRAM_INCREMENT_32 = 0b0000_0100;
        const SPRITE_PATTERN_TABLE = 0b0000_1000;
        const BG_PATTERN_TABLE = 0b0001_0000;
        const SPRITE_SIZE_16 = 0b0010_0000;
        const MASTER_SLAVE = 0b0100_0000;
        const NMI_ENABLE = 0b1000_0000;
    }
}

bitflags! {
    /// $2001 - PPUMASK
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PpuMask: u8 {
        const GRAYSCALE = 0b0000_0001;
        const SHOW_BG_LEFT = 0b0000_0010;
        const SHOW_SPRITES_LEFT = 0b0000_0100;
        const SHOW_BG = 0b0000_1000;
        const SHOW_SPRITES = 0b0001_0000;
        const EMPHASIZE_RED = 0b0010_0000;
        const EMPHASIZE_GREEN = 0b0100_0000;
        const EMPHASIZE_BLUE = 0b1000_0000;
    }
}

bitflags! {
    /// $2002 - PPUSTATUS
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PpuStatus: u8 {
        const SPRITE_OVERFLOW = 0b0010_0000;
        const SPRITE_ZERO_HIT = 0b0100_0000;
        const VBLANK = 0b1000_0000;
    }
}

/// PPU internal state
#[derive(Debug, Clone)]
pub struct Ppu {
    nametables: [u8; NAMETABLE_SIZE],
    palette: [u8; PALETTE_SIZE],
    oam: [u8; OAM_SIZE],

    ctrl: PpuCtrl,
    mask: PpuMask,
    status: PpuStatus,
    oam_addr: u8,

    /// Current VRAM address (15 bits)
    v: u16,
    /// Temporary VRAM address (15 bits)
    t: u16,
    fine_x: u8,
    write_toggle: bool,
    read_buffer: u8,

    scanline: u16,
    cycle: u16,
    frame_complete: bool,
    nmi_pending: bool,

    frame_buffer: Box<[u8; FRAME_SIZE]>,
}

impl Ppu {
    /// Create a new PPU instance
    pub fn new() -> Self {
        Self {
            nametables: [0; NAMETABLE_SIZE],
            palette: [0; PALETTE_SIZE],
            oam: [0; OAM_SIZE],
            ctrl: PpuCtrl::empty(),
            mask: PpuMask::empty(),
            status: PpuStatus::empty(),
            oam_addr: 0,
            v: 0,
            t: 0,
            fine_x: 0,
            write_toggle: false,
            read_buffer: 0,
            scanline: 0,
            cycle: 0,
            frame_complete: false,
            nmi_pending: false,
            frame_buffer: Box::new([0; FRAME_SIZE]),
        }
    }

    /// Reset registers, timing and the framebuffer. Memory contents survive.
    pub fn reset(&mut self) {
        self.ctrl = PpuCtrl::empty();
        self.mask = PpuMask::empty();
        self.status = PpuStatus::empty();
        self.oam_addr = 0;
        self.v = 0;
        self.t = 0;
        self.fine_x = 0;
        self.write_toggle = false;
        self.read_buffer = 0;
        self.scanline = 0;
        self.cycle = 0;
        self.frame_complete = false;
        self.nmi_pending = false;
        self.frame_buffer.fill(0);
    }

    /// Advance one PPU cycle. Returns true on the cycle vblank begins.
    pub fn step(&mut self) -> bool {
        let mut vblank_started = false;
        self.cycle += 1;
        if self.cycle > LAST_CYCLE {
            self.cycle = 0;
            self.scanline += 1;

            if self.scanline == VBLANK_SCANLINE {
                self.status.insert(PpuStatus::VBLANK);
                if self.ctrl.contains(PpuCtrl::NMI_ENABLE) {
                    self.nmi_pending = true;
                }
                self.frame_complete = true;
                vblank_started = true;
            } else if self.scanline > PRE_RENDER_SCANLINE {
                self.scanline = 0;
                self.status.remove(PpuStatus::VBLANK);
            }
        }

        if (self.scanline as usize) < SCREEN_HEIGHT && (self.cycle as usize) < SCREEN_WIDTH {
            self.render_pixel(self.cycle as usize, self.scanline as usize);
        }
        vblank_started
    }

    // Placeholder checkerboard of 32x32 blocks cycling through palette indices 0-3
    fn render_pixel(&mut self, x: usize, y: usize) {
        self.frame_buffer[y * SCREEN_WIDTH + x] = ((x / 32 + y / 32) % 4) as u8;
    }

    /// CPU read of a PPU register; `address` is reduced modulo 8
    pub fn read_register(&mut self, address: u16, cartridge: Option<&Cartridge>) -> u8 {
        match address & 0x0007 {
            // $2002 - PPUSTATUS
            2 => {
                let value = self.status.bits();
                self.status.remove(PpuStatus::VBLANK);
                self.write_toggle = false;
                value
            }
            // $2004 - OAMDATA
            4 => self.oam[self.oam_addr as usize],
            // $2007 - PPUDATA
            7 => {
                let value = self.read_buffer;
                self.read_buffer = self.read_memory(self.v, cartridge);
                self.increment_vram_addr();
                value
            }
            // Write-only registers
            _ => 0,
        }
    }

    /// CPU write of a PPU register; `address` is reduced modulo 8
    pub fn write_register(&mut self, address: u16, value: u8, cartridge: Option<&mut Cartridge>) {
        match address & 0x0007 {
            // $2000 - PPUCTRL
            0 => {
                let was_enabled = self.ctrl.contains(PpuCtrl::NMI_ENABLE);
                self.ctrl = PpuCtrl::from_bits_retain(value);
                self.t = (self.t & 0x73FF) | (((value & 0x03) as u16) << 10);
                if !was_enabled
                    && self.ctrl.contains(PpuCtrl::NMI_ENABLE)
                    && self.status.contains(PpuStatus::VBLANK)
                {
                    self.nmi_pending = true;
                }
            }
            // $2001 - PPUMASK
            1 => self.mask = PpuMask::from_bits_retain(value),
            // $2002 - PPUSTATUS is read-only
            2 => {}
            // $2003 - OAMADDR
            3 => self.oam_addr = value,
            // $2004 - OAMDATA
            4 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            // $2005 - PPUSCROLL
            5 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x7FE0) | (value >> 3) as u16;
                    self.fine_x = value & 0x07;
                } else {
                    self.t = (self.t & 0x0C1F)
                        | (((value & 0x07) as u16) << 12)
                        | (((value & 0xF8) as u16) << 2);
                }
                self.write_toggle = !self.write_toggle;
            }
            // $2006 - PPUADDR
            6 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value & 0x3F) as u16) << 8);
                } else {
                    self.t = (self.t & 0x7F00) | value as u16;
                    self.v = self.t;
                }
                self.write_toggle = !self.write_toggle;
            }
            // $2007 - PPUDATA
            _ => {
                self.write_memory(self.v, value, cartridge);
                self.increment_vram_addr();
            }
        }
    }

    fn increment_vram_addr(&mut self) {
        let step = if self.ctrl.contains(PpuCtrl::VRAM_INCREMENT_32) {
            32
        } else {
            1
        };
        self.v = self.v.wrapping_add(step) & 0x7FFF;
    }

    /// Read the PPU address space ($0000-$3FFF, mirrored above)
    pub fn read_memory(&self, address: u16, cartridge: Option<&Cartridge>) -> u8 {
        let address = address & 0x3FFF;
        match address {
            // $0000-$1FFF - Pattern tables (cartridge)
            0x0000..=0x1FFF => cartridge.map_or(0, |cart| cart.ppu_read(address)),
            // $2000-$3EFF - Nametables
            0x2000..=0x3EFF => {
                let mirroring = cartridge.map(Cartridge::mirroring);
                self.nametables[nametable_index(address, mirroring)]
            }
            // $3F00-$3FFF - Palette
            _ => self.palette[palette_index(address)],
        }
    }

    /// Write the PPU address space ($0000-$3FFF, mirrored above)
    pub fn write_memory(&mut self, address: u16, value: u8, cartridge: Option<&mut Cartridge>) {
        let address = address & 0x3FFF;
        match address {
            0x0000..=0x1FFF => {
                if let Some(cart) = cartridge {
                    cart.ppu_write(address, value);
                }
            }
            0x2000..=0x3EFF => {
                let mirroring = cartridge.map(|cart| cart.mirroring());
                self.nametables[nametable_index(address, mirroring)] = value;
            }
            _ => self.palette[palette_index(address)] = value,
        }
    }

    /// Copy a 256-byte page into OAM starting at the current OAM address
    pub fn write_oam_dma(&mut self, page: &[u8; OAM_SIZE]) {
        debug!(oam_addr = self.oam_addr, "OAM DMA");
        for &byte in page {
            self.oam[self.oam_addr as usize] = byte;
            self.oam_addr = self.oam_addr.wrapping_add(1);
        }
    }

    /// Consume a pending NMI request
    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi_pending)
    }

    pub fn nmi_pending(&self) -> bool {
        self.nmi_pending
    }

    pub fn is_frame_complete(&self) -> bool {
        self.frame_complete
    }

    pub fn clear_frame_complete(&mut self) {
        self.frame_complete = false;
    }

    /// Framebuffer of palette indices, row-major
    pub fn frame_buffer(&self) -> &[u8; FRAME_SIZE] {
        &self.frame_buffer
    }

    pub fn scanline(&self) -> u16 {
        self.scanline
    }

    pub fn cycle(&self) -> u16 {
        self.cycle
    }

    pub fn ctrl(&self) -> PpuCtrl {
        self.ctrl
    }

    pub fn mask(&self) -> PpuMask {
        self.mask
    }

    pub fn status(&self) -> PpuStatus {
        self.status
    }

    pub fn oam_addr(&self) -> u8 {
        self.oam_addr
    }

    pub fn oam(&self) -> &[u8; OAM_SIZE] {
        &self.oam
    }

    /// Current VRAM address (`v`)
    pub fn vram_addr(&self) -> u16 {
        self.v
    }

    /// Temporary VRAM address (`t`)
    pub fn temp_addr(&self) -> u16 {
        self.t
    }

    pub fn fine_x(&self) -> u8 {
        self.fine_x
    }

    pub fn write_toggle(&self) -> bool {
        self.write_toggle
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

fn nametable_index(address: u16, mirroring: Option<Mirroring>) -> usize {
    let offset = (address - 0x2000) & 0x0FFF;
    let index = match mirroring {
        Some(Mirroring::Horizontal) => ((offset >> 1) & 0x0400) | (offset & 0x03FF),
        Some(Mirroring::Vertical) => offset & 0x07FF,
        Some(Mirroring::FourScreen) | None => offset,
    };
    index as usize
}

// $3F10/$3F14/$3F18/$3F1C alias the background entries
fn palette_index(address: u16) -> usize {
    let index = address & 0x001F;
    if index & 0x0013 == 0x0010 {
        (index & !0x0010) as usize
    } else {
        index as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_to(ppu: &mut Ppu, scanline: u16, cycle: u16) {
        while ppu.scanline() != scanline || ppu.cycle() != cycle {
            ppu.step();
        }
    }

    #[test]
    fn test_ppu_reset() {
        let mut ppu = Ppu::new();
        ppu.write_register(0x2000, 0x80, None);
        ppu.step();
        ppu.reset();

        assert_eq!(ppu.scanline(), 0);
        assert_eq!(ppu.cycle(), 0);
        assert_eq!(ppu.ctrl(), PpuCtrl::empty());
        assert!(!ppu.is_frame_complete());
    }

    #[test]
    fn test_scanline_wraps_after_341_cycles() {
        let mut ppu = Ppu::new();
        for _ in 0..341 {
            ppu.step();
        }
        assert_eq!(ppu.scanline(), 1);
        assert_eq!(ppu.cycle(), 0);
    }

    #[test]
    fn test_vblank_sets_and_requests_nmi() {
        let mut ppu = Ppu::new();
        ppu.write_register(0x2000, PpuCtrl::NMI_ENABLE.bits(), None);
        run_to(&mut ppu, VBLANK_SCANLINE, 0);

        assert!(ppu.status().contains(PpuStatus::VBLANK));
        assert!(ppu.is_frame_complete());
        assert!(ppu.take_nmi());
        assert!(!ppu.take_nmi());
    }

    #[test]
    fn test_vblank_without_nmi_enable() {
        let mut ppu = Ppu::new();
        run_to(&mut ppu, VBLANK_SCANLINE, 0);
        assert!(ppu.status().contains(PpuStatus::VBLANK));
        assert!(!ppu.nmi_pending());
    }

    #[test]
    fn test_pre_render_exit_clears_vblank() {
        let mut ppu = Ppu::new();
        run_to(&mut ppu, PRE_RENDER_SCANLINE, LAST_CYCLE);
        assert!(ppu.status().contains(PpuStatus::VBLANK));

        ppu.step();
        assert_eq!(ppu.scanline(), 0);
        assert!(!ppu.status().contains(PpuStatus::VBLANK));
    }

    #[test]
    fn test_enabling_nmi_during_vblank() {
        let mut ppu = Ppu::new();
        run_to(&mut ppu, VBLANK_SCANLINE, 5);
        assert!(!ppu.nmi_pending());

        ppu.write_register(0x2000, 0x80, None);
        assert!(ppu.nmi_pending());
    }

    #[test]
    fn test_status_read_clears_vblank_and_toggle() {
        let mut ppu = Ppu::new();
        run_to(&mut ppu, VBLANK_SCANLINE, 0);
        ppu.write_register(0x2005, 0x10, None);
        assert!(ppu.write_toggle());

        let value = ppu.read_register(0x2002, None);
        assert_eq!(value & 0x80, 0x80);
        assert!(!ppu.status().contains(PpuStatus::VBLANK));
        assert!(!ppu.write_toggle());
        assert_eq!(ppu.read_register(0x2002, None) & 0x80, 0);
    }

    #[test]
    fn test_status_read_restarts_address_pair() {
        let mut ppu = Ppu::new();
        ppu.write_register(0x2006, 0x12, None);
        ppu.read_register(0x2002, None);

        ppu.write_register(0x2006, 0x21, None);
        ppu.write_register(0x2006, 0x08, None);
        assert_eq!(ppu.vram_addr(), 0x2108);
        assert!(!ppu.write_toggle());
    }

    #[test]
    fn test_step_reports_vblank_start_once_per_frame() {
        let mut ppu = Ppu::new();
        let cycles = (LAST_CYCLE as usize + 1) * SCANLINES_PER_FRAME as usize * 2;
        let starts = (0..cycles).filter(|_| ppu.step()).count();
        assert_eq!(starts, 2);
        assert!(ppu.is_frame_complete());
    }

    #[test]
    fn test_reset_clears_read_buffer() {
        let mut ppu = Ppu::new();
        ppu.write_memory(0x2000, 0x55, None);
        ppu.write_register(0x2006, 0x20, None);
        ppu.write_register(0x2006, 0x00, None);
        ppu.read_register(0x2007, None);

        ppu.reset();
        ppu.write_register(0x2006, 0x20, None);
        ppu.write_register(0x2006, 0x00, None);
        assert_eq!(ppu.read_register(0x2007, None), 0x00);
        assert_eq!(ppu.read_register(0x2007, None), 0x55);
    }

    #[test]
    fn test_ctrl_write_sets_nametable_bits_of_t() {
        let mut ppu = Ppu::new();
        ppu.write_register(0x2000, 0x03, None);
        assert_eq!(ppu.temp_addr(), 0x0C00);
    }

    #[test]
    fn test_scroll_writes() {
        let mut ppu = Ppu::new();
        ppu.write_register(0x2005, 0x7D, None);
        assert_eq!(ppu.temp_addr(), 0x000F);
        assert_eq!(ppu.fine_x(), 0x05);

        ppu.write_register(0x2005, 0x5E, None);
        assert_eq!(ppu.temp_addr(), 0x616F);
        assert!(!ppu.write_toggle());
    }

    #[test]
    fn test_addr_writes_copy_t_to_v() {
        let mut ppu = Ppu::new();
        ppu.write_register(0x2006, 0xFF, None);
        assert_eq!(ppu.temp_addr(), 0x3F00);
        assert_eq!(ppu.vram_addr(), 0x0000);

        ppu.write_register(0x2006, 0x10, None);
        assert_eq!(ppu.vram_addr(), 0x3F10);
    }

    #[test]
    fn test_data_read_is_buffered() {
        let mut ppu = Ppu::new();
        ppu.write_memory(0x2000, 0xAA, None);
        ppu.write_memory(0x2001, 0xBB, None);
        ppu.write_register(0x2006, 0x20, None);
        ppu.write_register(0x2006, 0x00, None);

        assert_eq!(ppu.read_register(0x2007, None), 0x00);
        assert_eq!(ppu.read_register(0x2007, None), 0xAA);
        assert_eq!(ppu.read_register(0x2007, None), 0xBB);
    }

    #[test]
    fn test_data_write_increments_by_32() {
        let mut ppu = Ppu::new();
        ppu.write_register(0x2000, PpuCtrl::VRAM_INCREMENT_32.bits(), None);
        ppu.write_register(0x2006, 0x20, None);
        ppu.write_register(0x2006, 0x00, None);
        ppu.write_register(0x2007, 0x11, None);
        ppu.write_register(0x2007, 0x22, None);

        assert_eq!(ppu.vram_addr(), 0x2040);
        assert_eq!(ppu.read_memory(0x2000, None), 0x11);
        assert_eq!(ppu.read_memory(0x2020, None), 0x22);
    }

    #[test]
    fn test_oam_data() {
        let mut ppu = Ppu::new();
        ppu.write_register(0x2003, 0x10, None);
        ppu.write_register(0x2004, 0x42, None);
        assert_eq!(ppu.oam_addr(), 0x11);

        ppu.write_register(0x2003, 0x10, None);
        assert_eq!(ppu.read_register(0x2004, None), 0x42);
        assert_eq!(ppu.oam_addr(), 0x10);
    }

    #[test]
    fn test_oam_dma_wraps_from_oam_addr() {
        let mut ppu = Ppu::new();
        let mut page = [0u8; OAM_SIZE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = i as u8;
        }
        ppu.write_register(0x2003, 0x04, None);
        ppu.write_oam_dma(&page);

        assert_eq!(ppu.oam()[4], 0);
        assert_eq!(ppu.oam()[3], 0xFF);
        assert_eq!(ppu.oam_addr(), 0x04);
    }

    #[test]
    fn test_palette_mirrors() {
        let mut ppu = Ppu::new();
        ppu.write_memory(0x3F10, 0x21, None);
        assert_eq!(ppu.read_memory(0x3F00, None), 0x21);
        ppu.write_memory(0x3F24, 0x05, None);
        assert_eq!(ppu.read_memory(0x3F04, None), 0x05);
        ppu.write_memory(0x3F11, 0x30, None);
        assert_ne!(ppu.read_memory(0x3F01, None), 0x30);
    }

    #[test]
    fn test_nametable_mirroring_modes() {
        assert_eq!(nametable_index(0x2400, Some(Mirroring::Horizontal)), 0x000);
        assert_eq!(nametable_index(0x2800, Some(Mirroring::Horizontal)), 0x400);
        assert_eq!(nametable_index(0x2C05, Some(Mirroring::Horizontal)), 0x405);
        assert_eq!(nametable_index(0x2800, Some(Mirroring::Vertical)), 0x000);
        assert_eq!(nametable_index(0x2C05, Some(Mirroring::Vertical)), 0x405);
        assert_eq!(nametable_index(0x2C05, Some(Mirroring::FourScreen)), 0xC05);
        assert_eq!(nametable_index(0x3C05, None), 0xC05);
    }

    #[test]
    fn test_checkerboard_pattern() {
        let mut ppu = Ppu::new();
        run_to(&mut ppu, VBLANK_SCANLINE, 0);
        let frame = ppu.frame_buffer();

        assert_eq!(frame[0], 0);
        assert_eq!(frame[32], 1);
        assert_eq!(frame[32 * SCREEN_WIDTH + 32], 2);
        assert_eq!(frame[96], 3);
        assert_eq!(frame[128], 0);
        assert_eq!(frame[(SCREEN_HEIGHT - 1) * SCREEN_WIDTH + SCREEN_WIDTH - 1], 2);
    }
}
