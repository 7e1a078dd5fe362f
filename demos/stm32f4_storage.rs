//! Storage service on a W25Q64 hanging off SPI1 of an STM32F429, logging
//! over RTT.
//!
//! Only builds for ARM targets; on the host it is an empty program.

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

#[cfg(target_arch = "arm")]
mod app {
    // pick a panicking behavior
    use panic_rtt_target as _; // you can put a breakpoint on `rust_begin_unwind` to catch panics

    use cortex_m_rt::entry;
    use log::{Level, LevelFilter, Metadata, Record, error, info};
    use rtt_target::{rprintln, rtt_init_print};
    use spiflash_storage::server::{Reply, StorageServer};
    use spiflash_storage::serial_interface::EmbeddedHalInterface;
    use spiflash_storage::{BusConfig, CommandTable, DeviceHandle, FlashConfig};
    use stm32f4xx_hal::{
        gpio::Speed,
        pac,
        prelude::*,
        spi::{Mode, Phase, Polarity, Spi},
    };

    const DATAPORT_SIZE: usize = 4096;

    pub struct Logger {
        level: Level,
    }

    static LOGGER: Logger = Logger {
        level: Level::Debug,
    };

    pub fn log_init() {
        rtt_init_print!();
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    }

    impl log::Log for Logger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level
        }

        fn log(&self, record: &Record) {
            rprintln!("{} - {}", record.level(), record.args());
        }

        fn flush(&self) {}
    }

    #[entry]
    fn main() -> ! {
        log_init();
        let dp = pac::Peripherals::take().unwrap();
        let cp = cortex_m::Peripherals::take().unwrap();
        let rcc = dp.RCC.constrain();
        info!("Starting up...");
        let clocks = rcc.cfgr.use_hse(25.MHz()).sysclk(168.MHz()).freeze();

        let iog = dp.GPIOG.split();
        let iob = dp.GPIOB.split();

        let clk = iob.pb3.into_alternate::<5>().speed(Speed::VeryHigh);
        let miso = iob.pb4.into_alternate::<5>().speed(Speed::VeryHigh);
        let mosi = iob
            .pb5
            .into_alternate::<5>()
            .speed(Speed::VeryHigh)
            .internal_pull_up(true);
        let cs = iog.pg3.into_push_pull_output();

        let mode = Mode {
            polarity: Polarity::IdleLow,
            phase: Phase::CaptureOnFirstTransition,
        };
        let bus = BusConfig {
            clock_hz: 5_000_000,
            ..BusConfig::default()
        };
        let spi1 = Spi::new(dp.SPI1, (clk, miso, mosi), mode, bus.clock_hz.Hz(), &clocks);
        let delay = cp.SYST.delay(&clocks);

        let mut interface: EmbeddedHalInterface<_, _, _> =
            EmbeddedHalInterface::new(spi1, cs, delay);

        let mut device = DeviceHandle::uninitialized();
        if let Err(err) = device.init(
            &mut interface,
            &bus,
            FlashConfig::W25Q64,
            CommandTable::STANDARD,
        ) {
            error!("flash init failed: {}", err);
        }
        let mut storage: StorageServer<'_, _, DATAPORT_SIZE> = StorageServer::new(device);

        info!("erase/write/read cycle on the last sector...");
        let sector = FlashConfig::W25Q64.size as i64 - 4096;
        let erased = Reply::from(storage.erase(sector, 4096));
        info!("erase: {:?}", erased);

        for (i, byte) in storage.dataport_mut().iter_mut().enumerate() {
            *byte = i as u8;
        }
        let written = Reply::from(storage.write(sector + 10, 1000));
        info!("write: {:?}", written);

        storage.dataport_mut().fill(0);
        let read = Reply::from(storage.read(sector + 10, 1000));
        let intact = storage.dataport()[..1000]
            .iter()
            .enumerate()
            .all(|(i, &b)| b == i as u8);
        info!("read: {:?}, data intact: {}", read, intact);

        loop {
            cortex_m::asm::wfi();
        }
    }
}

#[cfg(not(target_arch = "arm"))]
fn main() {}
