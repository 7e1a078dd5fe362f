//! In-memory serial flash chip.
//!
//! [`SimFlash`] decodes the standard command set from the frames it receives
//! through [`SerialInterface`], keeps the array contents with NOR semantics
//! (program only clears bits, erase sets them) and records every program and
//! erase so tests can check what reached the chip.

use alloc::vec;
use alloc::vec::Vec;

use thiserror::Error;

use crate::config::{BusConfig, Endianness, FlashConfig};
use crate::define::{erase_cmd, read_cmd, status, write_cmd};
use crate::serial_interface::{DEFAULT_FRAME, SerialInterface};

/// An operation that changed the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Program { address: u32, len: usize },
    Erase { address: u32, len: u32 },
    ChipErase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("injected fault")]
    Injected,
    #[error("exchange while the chip is not selected")]
    NotSelected,
    #[error("frame of {0} bytes exceeds the transfer buffer")]
    FrameOverflow(usize),
}

pub struct SimFlash {
    memory: Vec<u8>,
    page_size: usize,
    addr_size: usize,
    addr_dummy_size: usize,
    addr_endian: Endianness,
    frame_capacity: usize,

    selected: bool,
    frame: Vec<u8>,
    wel: bool,
    busy_polls: u32,
    busy_after_write: u32,

    ops: Vec<Op>,
    waits: Vec<u32>,
    configured: Vec<BusConfig>,
    exchanges: usize,
    programs: usize,

    fail_program_at: Option<usize>,
    fail_waits: bool,
    fail_configure: bool,
}

impl SimFlash {
    /// Erased chip with the geometry and addressing of `config`.
    pub fn new(config: &FlashConfig) -> Self {
        SimFlash {
            memory: vec![0xFF; config.size as usize],
            page_size: config.page_size as usize,
            addr_size: usize::from(config.addr_size),
            addr_dummy_size: usize::from(config.addr_dummy_size),
            addr_endian: config.addr_endian,
            frame_capacity: DEFAULT_FRAME,
            selected: false,
            frame: Vec::new(),
            wel: false,
            busy_polls: 0,
            busy_after_write: 0,
            ops: Vec::new(),
            waits: Vec::new(),
            configured: Vec::new(),
            exchanges: 0,
            programs: 0,
            fail_program_at: None,
            fail_waits: false,
            fail_configure: false,
        }
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Overwrites the array at `address`, bypassing the command set.
    pub fn load(&mut self, address: usize, data: &[u8]) {
        self.memory[address..address + data.len()].copy_from_slice(data);
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// `(address, len)` of every page program, in order.
    pub fn program_ops(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.ops.iter().filter_map(|op| match *op {
            Op::Program { address, len } => Some((address, len)),
            _ => None,
        })
    }

    pub fn waits(&self) -> &[u32] {
        &self.waits
    }

    pub fn configured(&self) -> &[BusConfig] {
        &self.configured
    }

    /// Number of exchanges since creation.
    pub fn exchanges(&self) -> usize {
        self.exchanges
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn write_enabled(&self) -> bool {
        self.wel
    }

    /// Largest exchange the chip accepts, [`DEFAULT_FRAME`] unless set.
    pub fn set_frame_capacity(&mut self, capacity: usize) {
        self.frame_capacity = capacity;
    }

    /// Status reads that report BUSY after each program or erase.
    pub fn set_busy_after_write(&mut self, polls: u32) {
        self.busy_after_write = polls;
    }

    /// Fails the `n`th page program (counting from zero) when chip-select is
    /// released; the page is left untouched.
    pub fn fail_program_at(&mut self, n: usize) {
        self.fail_program_at = Some(n);
    }

    pub fn fail_waits(&mut self, fail: bool) {
        self.fail_waits = fail;
    }

    pub fn fail_configure(&mut self, fail: bool) {
        self.fail_configure = fail;
    }

    fn status(&mut self) -> u8 {
        let mut sr = 0;
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            sr |= status::BUSY;
        }
        if self.wel {
            sr |= status::WEL;
        }
        sr
    }

    fn address(&self) -> usize {
        let bytes = &self.frame[1..1 + self.addr_size];
        let address = bytes.iter().enumerate().fold(0usize, |acc, (i, &b)| match self.addr_endian {
            Endianness::Big => (acc << 8) | usize::from(b),
            Endianness::Little => acc | (usize::from(b) << (8 * i)),
        });
        address % self.memory.len()
    }

    fn respond(&mut self, rx: &mut [u8]) {
        match self.frame[0] {
            read_cmd::STATUS_1 => {
                for byte in rx.iter_mut() {
                    *byte = self.status();
                }
            }
            read_cmd::DATA if self.frame.len() >= 1 + self.addr_size + self.addr_dummy_size => {
                let start = self.address();
                for (i, byte) in rx.iter_mut().enumerate() {
                    *byte = self.memory[(start + i) % self.memory.len()];
                }
            }
            _ => rx.fill(0xFF),
        }
    }

    fn execute(&mut self) -> Result<(), SimError> {
        let Some(&opcode) = self.frame.first() else {
            return Ok(());
        };
        match opcode {
            write_cmd::WRITE_ENABLE => self.wel = true,
            write_cmd::WRITE_DISABLE => self.wel = false,
            write_cmd::PAGE_PROGRAM if self.wel && self.frame.len() > self.addr_size => {
                let index = self.programs;
                self.programs += 1;
                if self.fail_program_at == Some(index) {
                    return Err(SimError::Injected);
                }
                let address = self.address();
                let page_base = address - address % self.page_size;
                let data = self.frame[1 + self.addr_size..].to_vec();
                // the chip wraps around within the page
                for (i, byte) in data.iter().enumerate() {
                    let cell = page_base + (address % self.page_size + i) % self.page_size;
                    self.memory[cell] &= byte;
                }
                self.ops.push(Op::Program {
                    address: address as u32,
                    len: data.len(),
                });
                self.finish_write();
            }
            erase_cmd::SECTOR_4K | erase_cmd::BLOCK_32K | erase_cmd::BLOCK_64K
                if self.wel && self.frame.len() > self.addr_size =>
            {
                let len = match opcode {
                    erase_cmd::SECTOR_4K => 4 * 1024,
                    erase_cmd::BLOCK_32K => 32 * 1024,
                    _ => 64 * 1024,
                };
                let address = self.address();
                let base = address - address % len;
                let end = (base + len).min(self.memory.len());
                self.memory[base..end].fill(0xFF);
                self.ops.push(Op::Erase {
                    address: base as u32,
                    len: len as u32,
                });
                self.finish_write();
            }
            erase_cmd::CHIP if self.wel => {
                self.memory.fill(0xFF);
                self.ops.push(Op::ChipErase);
                self.finish_write();
            }
            _ => {}
        }
        Ok(())
    }

    fn finish_write(&mut self) {
        self.wel = false;
        self.busy_polls = self.busy_after_write;
    }
}

impl SerialInterface for SimFlash {
    type Error = SimError;

    fn configure(&mut self, bus: &BusConfig) -> Result<(), SimError> {
        self.configured.push(*bus);
        if self.fail_configure {
            return Err(SimError::Injected);
        }
        Ok(())
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), SimError> {
        if !self.selected {
            return Err(SimError::NotSelected);
        }
        self.exchanges += 1;
        let len = tx.len() + rx.len();
        if len > self.frame_capacity {
            return Err(SimError::FrameOverflow(len));
        }
        self.frame.extend_from_slice(tx);
        if !rx.is_empty() && !self.frame.is_empty() {
            self.respond(rx);
        }
        Ok(())
    }

    fn select(&mut self, active: bool) -> Result<(), SimError> {
        if active {
            self.frame.clear();
            self.selected = true;
            Ok(())
        } else {
            let was_selected = self.selected;
            self.selected = false;
            if was_selected {
                self.execute()
            } else {
                Ok(())
            }
        }
    }

    fn wait(&mut self, ms: u32) -> Result<(), SimError> {
        self.waits.push(ms);
        if self.fail_waits {
            return Err(SimError::Injected);
        }
        Ok(())
    }
}
