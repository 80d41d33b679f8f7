//! Cartridge loading and the fixed (NROM) memory mapping
//!
//! Parses an iNES container and exposes the cartridge's two faces:
//! the CPU side ($6000-$FFFF: program RAM and program ROM) and the
//! PPU side ($0000-$1FFF: pattern tables in CHR ROM or CHR RAM).

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, trace, warn};

/// iNES header size
pub const HEADER_SIZE: usize = 16;
/// Trainer block size
pub const TRAINER_SIZE: usize = 512;
/// PRG ROM bank size (16KB)
pub const PRG_BANK_SIZE: usize = 16 * 1024;
/// CHR bank size (8KB)
pub const CHR_BANK_SIZE: usize = 8 * 1024;
/// Program RAM size, always present
pub const PRG_RAM_SIZE: usize = 8 * 1024;

const MAGIC: [u8; 4] = *b"NES\x1A";
const TRAINER_OFFSET: usize = 0x1000;

/// Nametable mirroring declared by the cartridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mirroring {
    /// $2000=$2400 and $2800=$2C00
    #[default]
    Horizontal,
    /// $2000=$2800 and $2400=$2C00
    Vertical,
    /// Four independent nametables
    FourScreen,
}

/// Errors produced while loading a cartridge
#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("failed to read ROM file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("header too short: expected 16 bytes, got {actual}")]
    HeaderTooShort { actual: usize },
    #[error("invalid iNES signature")]
    InvalidSignature,
    #[error("{section} truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        section: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// iNES header structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InesHeader {
    /// PRG ROM size in 16KB units
    pub prg_rom_banks: u8,
    /// CHR ROM size in 8KB units (0 means CHR RAM)
    pub chr_rom_banks: u8,
    /// Flags 6
    pub flags_6: u8,
    /// Flags 7
    pub flags_7: u8,
    /// PRG RAM size in 8KB units
    pub prg_ram_banks: u8,
}

impl InesHeader {
    /// Parse an iNES header from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, CartridgeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CartridgeError::HeaderTooShort {
                actual: bytes.len(),
            });
        }
        if bytes[..4] != MAGIC {
            return Err(CartridgeError::InvalidSignature);
        }

        Ok(Self {
            prg_rom_banks: bytes[4],
            chr_rom_banks: bytes[5],
            flags_6: bytes[6],
            flags_7: bytes[7],
            prg_ram_banks: bytes[8],
        })
    }

    /// Mapper number from the high nibbles of flags 6 and 7
    pub fn mapper_number(&self) -> u8 {
        (self.flags_6 >> 4) | (self.flags_7 & 0xF0)
    }

    /// Check if a 512-byte trainer precedes PRG ROM
    pub fn has_trainer(&self) -> bool {
        self.flags_6 & 0x04 != 0
    }

    /// Nametable arrangement; the four-screen bit overrides bit 0
    pub fn mirroring(&self) -> Mirroring {
        if self.flags_6 & 0x08 != 0 {
            Mirroring::FourScreen
        } else if self.flags_6 & 0x01 != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        }
    }

    /// PRG ROM length in bytes
    pub fn prg_rom_len(&self) -> usize {
        self.prg_rom_banks as usize * PRG_BANK_SIZE
    }

    /// CHR ROM length in bytes
    pub fn chr_rom_len(&self) -> usize {
        self.chr_rom_banks as usize * CHR_BANK_SIZE
    }
}

/// A loaded cartridge
#[derive(Debug, Clone)]
pub struct Cartridge {
    header: InesHeader,
    prg_rom: Vec<u8>,
    /// CHR ROM, or 8KB of CHR RAM when the header declares none
    chr: Vec<u8>,
    chr_is_ram: bool,
    prg_ram: Vec<u8>,
}

impl Cartridge {
    /// Read and parse an iNES file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CartridgeError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| CartridgeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_rom(&bytes)
    }

    /// Create a new cartridge from iNES ROM data
    pub fn from_rom(rom_data: &[u8]) -> Result<Self, CartridgeError> {
        let header = InesHeader::parse(rom_data)?;
        let mut offset = HEADER_SIZE;

        let mut prg_ram = vec![0; PRG_RAM_SIZE];
        if header.has_trainer() {
            let trainer = section(rom_data, offset, TRAINER_SIZE, "trainer")?;
            prg_ram[TRAINER_OFFSET..TRAINER_OFFSET + TRAINER_SIZE].copy_from_slice(trainer);
            offset += TRAINER_SIZE;
        }

        let prg_rom = section(rom_data, offset, header.prg_rom_len(), "PRG ROM")?.to_vec();
        offset += prg_rom.len();

        let chr_is_ram = header.chr_rom_banks == 0;
        let chr = if chr_is_ram {
            vec![0; CHR_BANK_SIZE]
        } else {
            section(rom_data, offset, header.chr_rom_len(), "CHR ROM")?.to_vec()
        };

        let mapper = header.mapper_number();
        if mapper != 0 {
            warn!(mapper, "unsupported mapper, using fixed NROM mapping");
        }
        info!(
            prg_banks = header.prg_rom_banks,
            chr_banks = header.chr_rom_banks,
            mapper,
            mirroring = ?header.mirroring(),
            "cartridge loaded"
        );

        Ok(Self {
            header,
            prg_rom,
            chr,
            chr_is_ram,
            prg_ram,
        })
    }

    /// Get the iNES header
    pub fn header(&self) -> &InesHeader {
        &self.header
    }

    pub fn mapper(&self) -> u8 {
        self.header.mapper_number()
    }

    pub fn mirroring(&self) -> Mirroring {
        self.header.mirroring()
    }

    /// Get PRG ROM data
    pub fn prg_rom(&self) -> &[u8] {
        &self.prg_rom
    }

    /// Pattern memory (CHR ROM or CHR RAM)
    pub fn chr(&self) -> &[u8] {
        &self.chr
    }

    pub fn has_chr_ram(&self) -> bool {
        self.chr_is_ram
    }

    /// CPU-side read ($6000-$FFFF)
    pub fn cpu_read(&self, address: u16) -> u8 {
        match address {
            // $6000-$7FFF - PRG RAM
            0x6000..=0x7FFF => self.prg_ram[(address - 0x6000) as usize],
            // $8000-$FFFF - PRG ROM, a single 16KB bank appears twice
            0x8000..=0xFFFF => {
                if self.prg_rom.is_empty() {
                    return 0;
                }
                let mut offset = (address - 0x8000) as usize;
                if self.header.prg_rom_banks == 1 {
                    offset &= 0x3FFF;
                }
                self.prg_rom[offset % self.prg_rom.len()]
            }
            _ => 0,
        }
    }

    /// CPU-side write; ROM writes are dropped
    pub fn cpu_write(&mut self, address: u16, value: u8) {
        match address {
            0x6000..=0x7FFF => self.prg_ram[(address - 0x6000) as usize] = value,
            0x8000..=0xFFFF => trace!(address, value, "ignored write to PRG ROM"),
            _ => {}
        }
    }

    /// PPU-side read ($0000-$1FFF)
    pub fn ppu_read(&self, address: u16) -> u8 {
        if address < 0x2000 {
            self.chr[address as usize % self.chr.len()]
        } else {
            0
        }
    }

    /// PPU-side write, honored only for CHR RAM
    pub fn ppu_write(&mut self, address: u16, value: u8) {
        if address < 0x2000 && self.chr_is_ram {
            let len = self.chr.len();
            self.chr[address as usize % len] = value;
        }
    }
}

fn section<'a>(
    data: &'a [u8],
    offset: usize,
    len: usize,
    name: &'static str,
) -> Result<&'a [u8], CartridgeError> {
    data.get(offset..offset + len)
        .ok_or(CartridgeError::Truncated {
            section: name,
            expected: len,
            actual: data.len().saturating_sub(offset),
        })
}
