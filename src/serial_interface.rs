use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use log::{error, info};
use thiserror::Error;

use crate::config::{BitOrder, BusConfig, CsPolarity};
use crate::flash::HEADER_MAX;

/// The longest command header followed by a 4 KiB data frame.
pub const DEFAULT_FRAME: usize = HEADER_MAX + 4096;

/// Synchronous access to the bus the flash chip hangs off.
///
/// One transaction is bracketed by `select(true)` and `select(false)` and may
/// consist of several exchanges.
pub trait SerialInterface {
    type Error: core::fmt::Debug;

    /// Applies clock, bit order, data mode and chip-select polarity. Called
    /// once, before the chip is used.
    fn configure(&mut self, bus: &BusConfig) -> Result<(), Self::Error> {
        let _ = bus;
        Ok(())
    }

    /// Sends all of `tx`, then receives `rx.len()` bytes.
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error>;

    /// Asserts (`true`) or releases (`false`) the chip-select line.
    fn select(&mut self, active: bool) -> Result<(), Self::Error>;

    /// Blocks for at least `ms` milliseconds.
    fn wait(&mut self, ms: u32) -> Result<(), Self::Error>;
}

#[derive(Debug, Error)]
pub enum HalError<S, P> {
    #[error("SPI transfer failed: {0:?}")]
    Spi(S),
    #[error("chip-select pin failed: {0:?}")]
    Pin(P),
    #[error("frame of {len} bytes exceeds transfer buffer of {capacity} bytes")]
    FrameOverflow { len: usize, capacity: usize },
    #[error("LSB first bit order is not supported")]
    BitOrder,
}

/// [`SerialInterface`] on top of `embedded-hal` 1.0 peripherals.
///
/// The bus is full duplex, so every exchange clocks `tx.len() + rx.len()`
/// bytes through a scratch buffer of `FRAME` bytes and hands back what was
/// received after `tx`. Clock rate and SPI mode are fixed when the HAL bus is
/// constructed; `configure` only picks up the chip-select polarity.
pub struct EmbeddedHalInterface<SPI, CS, D, const FRAME: usize = DEFAULT_FRAME> {
    spi: SPI,
    cs: CS,
    delay: D,
    cs_polarity: CsPolarity,
    buffer: [u8; FRAME],
}

impl<SPI, CS, D, const FRAME: usize> EmbeddedHalInterface<SPI, CS, D, FRAME>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    D: DelayNs,
{
    pub fn new(spi: SPI, cs: CS, delay: D) -> Self {
        EmbeddedHalInterface {
            spi,
            cs,
            delay,
            cs_polarity: CsPolarity::ActiveLow,
            buffer: [0; FRAME],
        }
    }

    pub fn release(self) -> (SPI, CS, D) {
        (self.spi, self.cs, self.delay)
    }

    fn drive_cs(&mut self, level_high: bool) -> Result<(), HalError<SPI::Error, CS::Error>> {
        if level_high {
            self.cs.set_high().map_err(HalError::Pin)
        } else {
            self.cs.set_low().map_err(HalError::Pin)
        }
    }
}

impl<SPI, CS, D, const FRAME: usize> SerialInterface for EmbeddedHalInterface<SPI, CS, D, FRAME>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    D: DelayNs,
{
    type Error = HalError<SPI::Error, CS::Error>;

    fn configure(&mut self, bus: &BusConfig) -> Result<(), Self::Error> {
        if bus.bit_order == BitOrder::LsbFirst {
            error!("bus does not support LSB first transfers");
            return Err(HalError::BitOrder);
        }
        info!(
            "SPI bus: {} Hz, {:?}, chip-select {:?}",
            bus.clock_hz, bus.mode, bus.cs_polarity
        );
        self.cs_polarity = bus.cs_polarity;
        self.select(false)
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error> {
        let len = tx.len() + rx.len();
        if len > FRAME {
            error!("tx_len+rx_len {} exceeds buffer size {}", len, FRAME);
            return Err(HalError::FrameOverflow {
                len,
                capacity: FRAME,
            });
        }

        self.spi
            .transfer(&mut self.buffer[..len], tx)
            .map_err(HalError::Spi)?;
        rx.copy_from_slice(&self.buffer[tx.len()..len]);
        Ok(())
    }

    fn select(&mut self, active: bool) -> Result<(), Self::Error> {
        if !active {
            self.spi.flush().map_err(HalError::Spi)?;
        }
        let level_high = match self.cs_polarity {
            CsPolarity::ActiveLow => !active,
            CsPolarity::ActiveHigh => active,
        };
        self.drive_cs(level_high)
    }

    fn wait(&mut self, ms: u32) -> Result<(), Self::Error> {
        self.delay.delay_ms(ms);
        Ok(())
    }
}
