use log::{debug, error, info};
use thiserror::Error;

use crate::FlashOperations;
use crate::config::{Endianness, FlashConfig};
use crate::define::{CommandTable, status};
use crate::serial_interface::SerialInterface;

/// Status polls after a program or erase budget has elapsed, one millisecond
/// apart, before the chip is reported busy.
const BUSY_POLLS: u32 = 100;

/// Opcode, up to four address bytes and up to four dummy bytes.
pub(crate) const HEADER_MAX: usize = 1 + 4 + 4;

#[derive(Debug, Error)]
pub enum FlashError<E> {
    #[error("transport failure: {0:?}")]
    Transport(E),
    #[error("chip stayed busy")]
    Busy,
    #[error("write enable latch did not set")]
    WriteEnable,
    #[error("{len} bytes at {address:#010x} cross a page boundary")]
    PageOverflow { address: u32, len: usize },
    #[error("{len} bytes at {address:#010x} are not aligned to a supported erase block")]
    Unaligned { address: u32, len: u32 },
    #[error("{len} bytes at {address:#010x} are outside of the chip")]
    OutOfRange { address: u32, len: usize },
}

/// Command level driver for a 25-series serial flash chip.
///
/// Every method runs to completion: program and erase wait for the chip's
/// budget from [`FlashConfig`] and then poll the status register until the
/// chip is idle again.
pub struct Flash<'a, I>
where
    I: SerialInterface,
{
    interface: &'a mut I,
    config: FlashConfig,
    commands: CommandTable,
}

impl<'a, I> Flash<'a, I>
where
    I: SerialInterface,
{
    pub fn new(interface: &'a mut I, config: FlashConfig, commands: CommandTable) -> Self {
        Flash {
            interface,
            config,
            commands,
        }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Runs `operation` with the chip selected. Chip-select is released even
    /// when the operation fails.
    fn selected<F>(&mut self, operation: F) -> Result<(), FlashError<I::Error>>
    where
        F: FnOnce(&mut I) -> Result<(), I::Error>,
    {
        self.interface.select(true).map_err(FlashError::Transport)?;
        let result = operation(&mut *self.interface);
        let released = self.interface.select(false);
        result.and(released).map_err(FlashError::Transport)
    }

    /// Best effort; the status poll that follows decides whether the chip is
    /// done.
    fn wait(&mut self, ms: u32) {
        if let Err(err) = self.interface.wait(ms) {
            error!("wait of {} ms failed: {:?}", ms, err);
        }
    }

    fn wait_ready(&mut self, budget_ms: u32) -> Result<(), FlashError<I::Error>> {
        self.wait(budget_ms);
        for _ in 0..BUSY_POLLS {
            if self.read_status()? & status::BUSY == 0 {
                return Ok(());
            }
            self.wait(1);
        }
        error!(
            "flash still busy {} ms after a {} ms budget",
            BUSY_POLLS, budget_ms
        );
        Err(FlashError::Busy)
    }

    fn write_enable(&mut self, enable: bool) -> Result<(), FlashError<I::Error>> {
        let cmd = if enable {
            [self.commands.write_enable]
        } else {
            [self.commands.write_disable]
        };
        self.selected(|i| i.exchange(&cmd, &mut []))?;

        let sr = self.read_status()?;
        let latched = sr & status::WEL != 0;
        if latched != enable {
            error!(
                "write {} failed, status {:02X}",
                if enable { "enable" } else { "disable" },
                sr
            );
            return Err(FlashError::WriteEnable);
        }
        Ok(())
    }

    /// Sets the write enable latch, runs `operation` with the chip selected
    /// and waits up to `budget_ms` for the chip to finish.
    fn write_operation<F>(&mut self, budget_ms: u32, operation: F) -> Result<(), FlashError<I::Error>>
    where
        F: FnOnce(&mut I) -> Result<(), I::Error>,
    {
        self.write_enable(true)?;
        if let Err(err) = self.selected(operation) {
            // the latch stays set when the command never reached the chip
            if self.commands.write_disable != 0 && self.write_enable(false).is_err() {
                error!("failed to clear write enable latch");
            }
            return Err(err);
        }
        self.wait_ready(budget_ms)
    }

    /// Opcode followed by the address, and the dummy bytes when `dummy` is set.
    fn header(&self, opcode: u8, address: u32, dummy: bool) -> ([u8; HEADER_MAX], usize) {
        let mut buff = [0u8; HEADER_MAX];
        buff[0] = opcode;
        let len = usize::from(self.config.addr_size);
        for i in 0..len {
            let shift = match self.config.addr_endian {
                Endianness::Big => (len - (i + 1)) * 8,
                Endianness::Little => i * 8,
            };
            buff[1 + i] = (address >> shift) as u8;
        }
        let dummy_len = if dummy {
            usize::from(self.config.addr_dummy_size)
        } else {
            0
        };
        (buff, 1 + len + dummy_len)
    }

    fn check_range(&self, address: u32, len: usize) -> Result<(), FlashError<I::Error>> {
        let end = u64::from(address) + len as u64;
        if end > u64::from(self.config.size) {
            error!("{} bytes at {:#010x} are outside of the chip", len, address);
            return Err(FlashError::OutOfRange { address, len });
        }
        Ok(())
    }

    /// Picks the largest supported erase block starting at `address` that
    /// does not reach past `address + len`.
    fn erase_step(&self, address: u32, len: u32) -> Option<(u32, u8, u32)> {
        self.config
            .erase_blocks(&self.commands)
            .find(|&(block, _, _)| address % block == 0 && len >= block)
    }
}

impl<I> FlashOperations for Flash<'_, I>
where
    I: SerialInterface,
{
    type Error = FlashError<I::Error>;

    fn read_data(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), Self::Error> {
        self.check_range(address, buffer.len())?;
        if buffer.is_empty() {
            return Ok(());
        }
        let (header, len) = self.header(self.commands.read_data, address, true);
        self.selected(|i| i.exchange(&header[..len], buffer))
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        self.check_range(address, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let offset_in_page = (address & (self.config.page_size - 1)) as usize;
        if offset_in_page + data.len() > self.config.page_size as usize {
            error!(
                "page program of {} bytes at {:#010x} crosses a page boundary",
                data.len(),
                address
            );
            return Err(FlashError::PageOverflow {
                address,
                len: data.len(),
            });
        }

        let (header, len) = self.header(self.commands.page_program, address, false);
        let budget = self.config.page_program_ms;
        self.write_operation(budget, |i| {
            i.exchange(&header[..len], &mut [])?;
            i.exchange(data, &mut [])
        })
    }

    fn erase(&mut self, address: u32, size: u32) -> Result<(), Self::Error> {
        self.check_range(address, size as usize)?;
        if size == 0 {
            return Ok(());
        }

        if address == 0 && size == self.config.size {
            if let Some((opcode, budget)) = self.config.chip_erase(&self.commands) {
                info!("chip erase, up to {} ms", budget);
                return self.write_operation(budget, |i| i.exchange(&[opcode], &mut []));
            }
        }

        // reject the whole span before the first block is gone
        let (mut addr, mut left) = (address, size);
        while left > 0 {
            let Some((block, _, _)) = self.erase_step(addr, left) else {
                error!(
                    "erase of {} bytes at {:#010x} is not block aligned at {:#010x}",
                    size, address, addr
                );
                return Err(FlashError::Unaligned {
                    address: addr,
                    len: left,
                });
            };
            addr += block;
            left -= block;
        }

        let (mut addr, mut left) = (address, size);
        while let Some((block, opcode, budget)) = self.erase_step(addr, left) {
            debug!("erase {} KiB block at {:#010x}", block / 1024, addr);
            let (header, len) = self.header(opcode, addr, false);
            self.write_operation(budget, |i| i.exchange(&header[..len], &mut []))?;
            addr += block;
            left -= block;
        }
        Ok(())
    }

    fn read_status(&mut self) -> Result<u8, Self::Error> {
        let cmd = [self.commands.read_status];
        let mut sr = [0u8];
        self.selected(|i| i.exchange(&cmd, &mut sr))?;
        Ok(sr[0])
    }
}
