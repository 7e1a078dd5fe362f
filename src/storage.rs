//! Byte addressable storage on top of [`Flash`].

use log::{debug, error, info};
use thiserror::Error;

use crate::FlashOperations;
use crate::config::{BusConfig, ConfigError, FlashConfig};
use crate::define::CommandTable;
use crate::error::Error;
use crate::flash::Flash;
use crate::serial_interface::SerialInterface;

/// Value of [`DeviceHandle::state_flags`]. No health bits are defined yet.
pub const STATE_FLAGS_NONE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    Ready,
    /// Binding failed. Terminal, there is no retry.
    Failed,
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("device is already {0:?}")]
    AlreadyBound(DeviceState),
    #[error("bus configuration failed")]
    Bus,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// True when `[offset, offset + size)` lies within the device.
///
/// An empty range is valid at any offset up to and including the device
/// size.
pub fn is_valid_range(config: &FlashConfig, offset: u64, size: u64) -> bool {
    match offset.checked_add(size) {
        Some(end) => end <= u64::from(config.size),
        None => false,
    }
}

/// [`is_valid_range`] for signed offsets and sizes; negative values are
/// never valid.
pub fn is_valid_signed_range(config: &FlashConfig, offset: i64, size: i64) -> bool {
    match (u64::try_from(offset), u64::try_from(size)) {
        (Ok(offset), Ok(size)) => is_valid_range(config, offset, size),
        _ => false,
    }
}

enum Binding<'a, I>
where
    I: SerialInterface,
{
    Uninitialized,
    Ready(Flash<'a, I>),
    Failed,
}

/// The storage device of one flash chip.
///
/// Created [`uninitialized`](Self::uninitialized) and bound once with
/// [`init`](Self::init). Until the binding succeeded every operation fails
/// with [`Error::InvalidState`] without touching the bus.
pub struct DeviceHandle<'a, I>
where
    I: SerialInterface,
{
    binding: Binding<'a, I>,
}

impl<'a, I> DeviceHandle<'a, I>
where
    I: SerialInterface,
{
    pub fn uninitialized() -> Self {
        DeviceHandle {
            binding: Binding::Uninitialized,
        }
    }

    /// Configures the bus and binds the chip described by `config` and
    /// `commands` to `interface`.
    pub fn init(
        &mut self,
        interface: &'a mut I,
        bus: &BusConfig,
        config: FlashConfig,
        commands: CommandTable,
    ) -> Result<(), InitError> {
        let state = self.state();
        if state != DeviceState::Uninitialized {
            error!("device is already {:?}, refusing to bind again", state);
            return Err(InitError::AlreadyBound(state));
        }
        info!("SPI flash init");

        if let Err(err) = interface.configure(bus) {
            error!("bus configuration failed: {:?}", err);
            self.binding = Binding::Failed;
            return Err(InitError::Bus);
        }

        if let Err(err) = config.validate(&commands) {
            error!("flash init failed: {}", err);
            self.binding = Binding::Failed;
            return Err(err.into());
        }

        self.binding = Binding::Ready(Flash::new(interface, config, commands));
        info!(
            "SPI flash ready, {} bytes, {} byte pages",
            config.size, config.page_size
        );
        Ok(())
    }

    pub fn state(&self) -> DeviceState {
        match self.binding {
            Binding::Uninitialized => DeviceState::Uninitialized,
            Binding::Ready(_) => DeviceState::Ready,
            Binding::Failed => DeviceState::Failed,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.binding, Binding::Ready(_))
    }

    fn flash(&mut self, call: &str) -> Result<&mut Flash<'a, I>, Error> {
        match &mut self.binding {
            Binding::Ready(flash) => Ok(flash),
            _ => {
                error!("initialization failed, fail call {}()", call);
                Err(Error::InvalidState)
            }
        }
    }

    /// Fills `buffer` from `offset` with a single flash read.
    pub fn read(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize, Error> {
        let size = buffer.len();
        debug!(
            "SPI read: offset {} ({:#x}), size {} ({:#x})",
            offset, offset, size, size
        );

        let flash = self.flash("read")?;
        let address = checked_address(flash.config(), offset, size as u64).ok_or_else(|| {
            error!(
                "read area at offset {} with size {} out of bounds",
                offset, size
            );
            Error::OutOfBounds
        })?;

        flash.read_data(address, buffer).map_err(|err| {
            error!(
                "flash read failed, offset {} ({:#x}), size {} ({:#x}): {}",
                offset, offset, size, size, err
            );
            Error::Io { processed: 0 }
        })?;
        Ok(size)
    }

    /// Writes `data` at `offset`, one page program per page touched.
    ///
    /// On failure the pages programmed before the failing one stay written
    /// and their byte count is reported in [`Error::Io`].
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize, Error> {
        let size = data.len();
        debug!(
            "SPI write: offset {} ({:#x}), size {} ({:#x})",
            offset, offset, size, size
        );

        let flash = self.flash("write")?;
        let Some(address) = checked_address(flash.config(), offset, size as u64) else {
            error!(
                "write area at offset {} with size {} out of bounds",
                offset, size
            );
            return Err(Error::OutOfBounds);
        };

        // at most one page can be programmed at once, the data may start and
        // end in the middle of a page:
        //
        //    Data:           |-------data------|
        //    Pages:  ...|--------|--------|--------|...
        let page_size = flash.config().page_size as usize;
        let mut offset_in_page = address as usize & (page_size - 1);

        let mut written = 0;
        while written < size {
            let write_len = (page_size - offset_in_page).min(size - written);
            let chunk_address = address + written as u32;

            if let Err(err) =
                flash.program_page(chunk_address, &data[written..written + write_len])
            {
                error!(
                    "page program failed, offset {} ({:#x}), size {} ({:#x}): {}",
                    chunk_address, chunk_address, write_len, write_len, err
                );
                return Err(Error::Io { processed: written });
            }

            written += write_len;
            offset_in_page = 0;
        }

        Ok(written)
    }

    /// Erases `[offset, offset + size)`. The flash driver decides which erase
    /// commands cover the range.
    pub fn erase(&mut self, offset: i64, size: i64) -> Result<i64, Error> {
        debug!(
            "SPI erase: offset {} ({:#x}), size {} ({:#x})",
            offset, offset, size, size
        );

        let flash = self.flash("erase")?;
        let range = if is_valid_signed_range(flash.config(), offset, size) {
            u32::try_from(offset).ok().zip(u32::try_from(size).ok())
        } else {
            None
        };
        let Some((address, len)) = range else {
            error!(
                "erase area at offset {} with size {} out of bounds",
                offset, size
            );
            return Err(Error::OutOfBounds);
        };

        flash.erase(address, len).map_err(|err| {
            error!(
                "flash erase failed, offset {} ({:#x}), size {} ({:#x}): {}",
                offset, offset, size, size, err
            );
            Error::Io { processed: 0 }
        })?;
        Ok(size)
    }

    /// Total size of the device in bytes.
    pub fn size(&mut self) -> Result<u32, Error> {
        Ok(self.flash("size")?.config().size)
    }

    /// Health flags of the device, always [`STATE_FLAGS_NONE`] for now.
    pub fn state_flags(&mut self) -> Result<u32, Error> {
        self.flash("state_flags")?;
        Ok(STATE_FLAGS_NONE)
    }
}

/// Validated start address of `[offset, offset + size)`.
fn checked_address(config: &FlashConfig, offset: u64, size: u64) -> Option<u32> {
    if !is_valid_range(config, offset, size) {
        return None;
    }
    u32::try_from(offset).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Op, SimFlash};

    const MIB8: u32 = 8 * 1024 * 1024;

    fn ready(sim: &mut SimFlash) -> DeviceHandle<'_, SimFlash> {
        let mut device = DeviceHandle::uninitialized();
        device
            .init(
                sim,
                &BusConfig::default(),
                FlashConfig::W25Q64,
                CommandTable::STANDARD,
            )
            .unwrap();
        device
    }

    #[test]
    fn range_validation() {
        let config = FlashConfig::W25Q64;
        assert!(is_valid_range(&config, 0, u64::from(MIB8)));
        assert!(is_valid_range(&config, u64::from(MIB8), 0));
        assert!(!is_valid_range(&config, u64::from(MIB8), 1));
        assert!(!is_valid_range(&config, u64::from(MIB8) + 1, 0));
        assert!(!is_valid_range(&config, u64::MAX, 2));
        assert!(!is_valid_range(&config, 1, u64::MAX));
    }

    #[test]
    fn signed_range_validation() {
        let config = FlashConfig::W25Q64;
        assert!(is_valid_signed_range(&config, 4096, 4096));
        assert!(!is_valid_signed_range(&config, -1, 10));
        assert!(!is_valid_signed_range(&config, 0, -1));
        assert!(!is_valid_signed_range(&config, i64::MAX, i64::MAX));
    }

    #[test]
    fn init_binds_and_configures_bus_once() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        let mut device = ready(&mut sim);
        assert_eq!(device.state(), DeviceState::Ready);
        assert_eq!(device.size(), Ok(MIB8));
        assert_eq!(device.state_flags(), Ok(STATE_FLAGS_NONE));
        drop(device);
        assert_eq!(sim.configured(), [BusConfig::default()]);
    }

    #[test]
    fn operations_before_init_are_rejected() {
        let mut device: DeviceHandle<'_, SimFlash> = DeviceHandle::uninitialized();
        let mut buf = [0u8; 4];

        assert_eq!(device.read(0, &mut buf), Err(Error::InvalidState));
        assert_eq!(device.write(0, &buf), Err(Error::InvalidState));
        assert_eq!(device.erase(0, 4096), Err(Error::InvalidState));
        assert_eq!(device.size(), Err(Error::InvalidState));
        assert_eq!(device.state_flags(), Err(Error::InvalidState));
        assert_eq!(device.state(), DeviceState::Uninitialized);
    }

    #[test]
    fn failed_bus_configuration_is_terminal() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        sim.fail_configure(true);
        let mut device = DeviceHandle::uninitialized();
        let err = device
            .init(
                &mut sim,
                &BusConfig::default(),
                FlashConfig::W25Q64,
                CommandTable::STANDARD,
            )
            .unwrap_err();
        assert!(matches!(err, InitError::Bus));
        assert_eq!(device.state(), DeviceState::Failed);
        assert_eq!(device.size(), Err(Error::InvalidState));

        let mut other = SimFlash::new(&FlashConfig::W25Q64);
        let err = device
            .init(
                &mut other,
                &BusConfig::default(),
                FlashConfig::W25Q64,
                CommandTable::STANDARD,
            )
            .unwrap_err();
        assert!(matches!(err, InitError::AlreadyBound(DeviceState::Failed)));
        assert_eq!(device.write(0, &[1]), Err(Error::InvalidState));
        assert_eq!(device.read(0, &mut [0u8; 4]), Err(Error::InvalidState));
        assert_eq!(device.erase(0, 4096), Err(Error::InvalidState));
        drop(device);
        assert!(other.configured().is_empty());
        assert_eq!(sim.exchanges(), 0);
        assert_eq!(other.exchanges(), 0);
    }

    #[test]
    fn invalid_geometry_fails_init() {
        let config = FlashConfig {
            page_size: 0,
            ..FlashConfig::W25Q64
        };
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        let mut device = DeviceHandle::uninitialized();
        let err = device
            .init(&mut sim, &BusConfig::default(), config, CommandTable::STANDARD)
            .unwrap_err();
        assert!(matches!(err, InitError::Config(ConfigError::PageSize(0))));
        assert_eq!(device.state(), DeviceState::Failed);
        assert_eq!(device.read(0, &mut [0u8; 1]), Err(Error::InvalidState));
        assert_eq!(device.write(0, &[1]), Err(Error::InvalidState));
        assert_eq!(device.erase(0, 4096), Err(Error::InvalidState));
        drop(device);
        assert_eq!(sim.configured(), [BusConfig::default()]);
        assert_eq!(sim.exchanges(), 0);
    }

    #[test]
    fn write_straddling_a_page_boundary_is_split() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        let mut device = ready(&mut sim);
        assert_eq!(device.write(255, &[1, 2, 3]), Ok(3));
        drop(device);
        assert_eq!(
            sim.program_ops().collect::<Vec<_>>(),
            [(255, 1), (256, 2)]
        );
        assert_eq!(&sim.memory()[255..258], &[1, 2, 3]);
    }

    #[test]
    fn page_sized_write_is_one_program() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        let mut device = ready(&mut sim);
        let data = [0x5Au8; 256];
        assert_eq!(device.write(0, &data), Ok(256));
        drop(device);
        assert_eq!(sim.program_ops().collect::<Vec<_>>(), [(0, 256)]);
    }

    #[test]
    fn write_within_one_page_from_the_middle() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        let mut device = ready(&mut sim);
        assert_eq!(device.write(0x1010, &[9; 16]), Ok(16));
        drop(device);
        assert_eq!(sim.program_ops().collect::<Vec<_>>(), [(0x1010, 16)]);
    }

    #[test]
    fn empty_write_does_no_io() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        let mut device = ready(&mut sim);
        assert_eq!(device.write(MIB8.into(), &[]), Ok(0));
        assert_eq!(device.write(100, &[]), Ok(0));
        drop(device);
        assert_eq!(sim.exchanges(), 0);
    }

    #[test]
    fn failed_chunk_reports_committed_prefix() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        sim.fail_program_at(2);
        let mut device = ready(&mut sim);

        // chunks of 56, 256, 256, 256, 100 bytes
        let data = [0u8; 924];
        assert_eq!(
            device.write(200, &data),
            Err(Error::Io { processed: 56 + 256 })
        );
        drop(device);
        assert_eq!(
            sim.program_ops().collect::<Vec<_>>(),
            [(200, 56), (256, 256)]
        );
    }

    #[test]
    fn read_is_a_single_transaction() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        sim.load(1000, &[7; 600]);
        let mut device = ready(&mut sim);
        let mut buf = [0u8; 600];
        assert_eq!(device.read(1000, &mut buf), Ok(600));
        assert!(buf.iter().all(|&b| b == 7));
        drop(device);
        assert_eq!(sim.exchanges(), 1);
    }

    #[test]
    fn empty_read_at_the_end_succeeds() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        let mut device = ready(&mut sim);
        assert_eq!(device.read(MIB8.into(), &mut []), Ok(0));
    }

    #[test]
    fn out_of_bounds_requests_do_no_io() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        let mut device = ready(&mut sim);
        let mut buf = [0u8; 2];
        assert_eq!(
            device.read(u64::from(MIB8) - 1, &mut buf),
            Err(Error::OutOfBounds)
        );
        assert_eq!(device.write(u64::MAX, &buf), Err(Error::OutOfBounds));
        assert_eq!(
            device.erase(i64::from(MIB8) - 100, 200),
            Err(Error::OutOfBounds)
        );
        assert_eq!(device.erase(-4096, 4096), Err(Error::OutOfBounds));
        drop(device);
        assert_eq!(sim.exchanges(), 0);
    }

    #[test]
    fn read_larger_than_the_transport_frame_fails() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        let mut device = ready(&mut sim);
        let mut buf = [0u8; 8192];
        assert_eq!(device.read(0, &mut buf), Err(Error::Io { processed: 0 }));
        drop(device);
        assert!(!sim.is_selected());
    }

    #[test]
    fn erase_delegates_whole_span() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        sim.load(0x10000, &[0; 16]);
        let mut device = ready(&mut sim);
        assert_eq!(device.erase(0x10000, 0x10000), Ok(0x10000));
        drop(device);
        assert_eq!(
            sim.ops(),
            [Op::Erase {
                address: 0x10000,
                len: 0x10000
            }]
        );
        assert!(sim.memory()[0x10000..0x10010].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn unaligned_erase_is_an_io_failure() {
        let mut sim = SimFlash::new(&FlashConfig::W25Q64);
        let mut device = ready(&mut sim);
        assert_eq!(device.erase(100, 4096), Err(Error::Io { processed: 0 }));
    }
}
