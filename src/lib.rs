#![cfg_attr(not(test), no_std)]

//! Byte addressable storage on serial (SPI) NOR flash.
//!
//! A [`DeviceHandle`](storage::DeviceHandle) validates read, write and erase
//! requests against the chip geometry and splits writes into page programs.
//! The chip protocol lives in [`Flash`](flash::Flash), which talks to the bus
//! through a [`SerialInterface`](serial_interface::SerialInterface).
//! [`StorageServer`](server::StorageServer) puts a fixed size dataport in
//! front of the device.

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

pub mod config;
pub mod define;
pub mod error;
pub mod flash;
pub mod serial_interface;
pub mod server;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod storage;

#[cfg(test)]
mod proptests;

pub use config::{BusConfig, FlashConfig};
pub use define::CommandTable;
pub use error::{Error, Status};
pub use storage::{DeviceHandle, DeviceState};

/// Chip level operations. Addresses are absolute byte addresses in the chip.
pub trait FlashOperations {
    type Error;

    fn read_data(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), Self::Error>;
    /// Programs `data` at `address`. The data must not cross a page boundary.
    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error>;
    /// Erases `[address, address + size)`; the range must be made of whole
    /// erase blocks, or be the whole chip.
    fn erase(&mut self, address: u32, size: u32) -> Result<(), Self::Error>;
    fn read_status(&mut self) -> Result<u8, Self::Error>;
}
