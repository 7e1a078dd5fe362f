//! Opcodes and status register bits of 25-series serial flash chips.

pub(crate) mod write_cmd {
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const WRITE_DISABLE: u8 = 0x04;
    pub const PAGE_PROGRAM: u8 = 0x02;
}

pub(crate) mod read_cmd {
    pub const STATUS_1: u8 = 0x05;
    pub const DATA: u8 = 0x03;
}

pub(crate) mod erase_cmd {
    pub const SECTOR_4K: u8 = 0x20;
    pub const BLOCK_32K: u8 = 0x52;
    pub const BLOCK_64K: u8 = 0xD8;
    pub const CHIP: u8 = 0xC7; // C7h|60h
}

pub(crate) mod status {
    pub const BUSY: u8 = 0b0000_0001;
    pub const WEL: u8 = 0b0000_0010;
}

/// Opcodes the driver sends to the chip.
///
/// An erase opcode of `0` marks the granularity as absent from the command set,
/// independent of whether [`FlashConfig`](crate::config::FlashConfig) gives it a
/// timing budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTable {
    pub write_enable: u8,
    pub write_disable: u8,
    pub read_status: u8,
    pub page_program: u8,
    pub read_data: u8,
    pub block_erase_4: u8,
    pub block_erase_8: u8,
    pub block_erase_16: u8,
    pub block_erase_32: u8,
    pub block_erase_64: u8,
    pub chip_erase: u8,
}

impl CommandTable {
    /// The command set shared by Winbond, Macronix, GigaDevice and most other
    /// 25-series parts.
    pub const STANDARD: CommandTable = CommandTable {
        write_enable: write_cmd::WRITE_ENABLE,
        write_disable: write_cmd::WRITE_DISABLE,
        read_status: read_cmd::STATUS_1,
        page_program: write_cmd::PAGE_PROGRAM,
        read_data: read_cmd::DATA,
        block_erase_4: erase_cmd::SECTOR_4K,
        block_erase_8: 0,
        block_erase_16: 0,
        block_erase_32: erase_cmd::BLOCK_32K,
        block_erase_64: erase_cmd::BLOCK_64K,
        chip_erase: erase_cmd::CHIP,
    };

    /// True when every opcode needed for read, program and status is set.
    pub fn is_complete(&self) -> bool {
        [
            self.write_enable,
            self.read_status,
            self.page_program,
            self.read_data,
        ]
        .iter()
        .all(|&op| op != 0)
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::STANDARD
    }
}
