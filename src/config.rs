//! Chip geometry, timing budgets and bus settings.

use thiserror::Error;

use crate::define::CommandTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

/// Geometry, addressing and timing of one flash chip.
///
/// Timing values are worst case budgets in milliseconds. A block erase budget
/// of `0` means the chip has no erase command of that granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashConfig {
    /// Total size in bytes.
    pub size: u32,
    /// Page program size in bytes, a power of two.
    pub page_size: u32,
    /// Number of address bytes in a command.
    pub addr_size: u8,
    /// Dummy bytes sent after the address of a read command.
    pub addr_dummy_size: u8,
    pub addr_endian: Endianness,
    pub page_program_ms: u32,
    pub block_erase_4_ms: u32,
    pub block_erase_8_ms: u32,
    pub block_erase_16_ms: u32,
    pub block_erase_32_ms: u32,
    pub block_erase_64_ms: u32,
    pub chip_erase_ms: u32,
}

impl FlashConfig {
    /// Winbond W25Q64, 8 MiB, single line data.
    pub const W25Q64: FlashConfig = FlashConfig {
        size: 8 * 1024 * 1024,
        page_size: 256,
        addr_size: 3,
        addr_dummy_size: 0,
        addr_endian: Endianness::Big,
        page_program_ms: 3,      // typical 0.8 ms
        block_erase_4_ms: 300,   // typical 45 ms
        block_erase_8_ms: 0,
        block_erase_16_ms: 0,
        block_erase_32_ms: 800,  // typical 120 ms
        block_erase_64_ms: 1000, // typical 150 ms
        chip_erase_ms: 6000,     // typical 2 s
    };

    /// Checks the configuration against the command set it will be used with.
    pub fn validate(&self, commands: &CommandTable) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::ZeroSize);
        }
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if self.page_size > self.size {
            return Err(ConfigError::PageLargerThanChip {
                page_size: self.page_size,
                size: self.size,
            });
        }
        if !(1..=4).contains(&self.addr_size) {
            return Err(ConfigError::AddressSize(self.addr_size));
        }
        // the last byte must still be addressable
        if self.addr_size < 4 && u64::from(self.size) > 1u64 << (8 * u32::from(self.addr_size)) {
            return Err(ConfigError::AddressSize(self.addr_size));
        }
        if self.addr_dummy_size > 4 {
            return Err(ConfigError::DummySize(self.addr_dummy_size));
        }
        if self.page_program_ms == 0 {
            return Err(ConfigError::MissingTiming("page_program_ms"));
        }
        if !commands.is_complete() {
            return Err(ConfigError::IncompleteCommands);
        }
        if self.erase_blocks(commands).next().is_none() && self.chip_erase(commands).is_none() {
            return Err(ConfigError::NoErase);
        }
        Ok(())
    }

    /// Supported block erases as `(block size, opcode, budget ms)`, largest
    /// first.
    pub(crate) fn erase_blocks(
        &self,
        commands: &CommandTable,
    ) -> impl Iterator<Item = (u32, u8, u32)> + use<> {
        let table = [
            (64 * 1024, commands.block_erase_64, self.block_erase_64_ms),
            (32 * 1024, commands.block_erase_32, self.block_erase_32_ms),
            (16 * 1024, commands.block_erase_16, self.block_erase_16_ms),
            (8 * 1024, commands.block_erase_8, self.block_erase_8_ms),
            (4 * 1024, commands.block_erase_4, self.block_erase_4_ms),
        ];
        table
            .into_iter()
            .filter(|&(_, opcode, ms)| opcode != 0 && ms != 0)
    }

    /// Chip erase as `(opcode, budget ms)`, if supported.
    pub(crate) fn chip_erase(&self, commands: &CommandTable) -> Option<(u8, u32)> {
        (commands.chip_erase != 0 && self.chip_erase_ms != 0)
            .then_some((commands.chip_erase, self.chip_erase_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("flash size is zero")]
    ZeroSize,
    #[error("page size {0} is not a power of two")]
    PageSize(u32),
    #[error("page size {page_size} exceeds flash size {size}")]
    PageLargerThanChip { page_size: u32, size: u32 },
    #[error("unsupported address size of {0} bytes")]
    AddressSize(u8),
    #[error("unsupported number of {0} dummy bytes")]
    DummySize(u8),
    #[error("missing timing value {0}")]
    MissingTiming(&'static str),
    #[error("command table lacks a required opcode")]
    IncompleteCommands,
    #[error("no erase granularity is supported")]
    NoErase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

/// Clock polarity and phase, numbered as SPI modes 0..=3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiMode {
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

/// Level of the chip-select line while the chip is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsPolarity {
    ActiveLow,
    ActiveHigh,
}

/// Bus settings applied once before the chip is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    pub clock_hz: u32,
    pub bit_order: BitOrder,
    pub mode: SpiMode,
    pub cs_polarity: CsPolarity,
}

impl Default for BusConfig {
    /// 31.25 MHz, MSB first, mode 0, active low chip-select.
    fn default() -> Self {
        BusConfig {
            clock_hz: 31_250_000,
            bit_order: BitOrder::MsbFirst,
            mode: SpiMode::Mode0,
            cs_polarity: CsPolarity::ActiveLow,
        }
    }
}
