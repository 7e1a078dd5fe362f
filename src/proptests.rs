use crate::config::{BusConfig, FlashConfig};
use crate::define::CommandTable;
use crate::error::Error;
use crate::sim::SimFlash;
use crate::storage::{DeviceHandle, is_valid_range};
use proptest::prelude::*;

const CHIP_SIZE: u32 = 64 * 1024;
const MAX_WRITE_LEN: usize = 2 * 1024;

fn config(page_size: u32) -> FlashConfig {
    FlashConfig {
        size: CHIP_SIZE,
        page_size,
        ..FlashConfig::W25Q64
    }
}

fn page_size_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![Just(16u32), Just(64u32), Just(256u32), Just(512u32)]
}

fn offset_strategy() -> BoxedStrategy<u32> {
    let any = 0u32..=CHIP_SIZE;
    let page_aligned = (0u32..=CHIP_SIZE / 256).prop_map(|page| page * 256);
    let near_boundary = (1u32..CHIP_SIZE / 256, 0u32..4)
        .prop_map(|(page, delta)| page * 256 - delta);
    prop_oneof![
        4 => any,
        2 => page_aligned,
        2 => near_boundary,
    ]
    .boxed()
}

/// Offset and data of a write that fits in the chip.
fn write_strategy() -> impl Strategy<Value = (u32, Vec<u8>)> {
    offset_strategy().prop_flat_map(|offset| {
        let max_len = ((CHIP_SIZE - offset) as usize).min(MAX_WRITE_LEN);
        (Just(offset), prop::collection::vec(any::<u8>(), 0..=max_len))
    })
}

fn bind<'a>(sim: &'a mut SimFlash, config: FlashConfig) -> DeviceHandle<'a, SimFlash> {
    let mut device = DeviceHandle::uninitialized();
    device
        .init(sim, &BusConfig::default(), config, CommandTable::STANDARD)
        .expect("valid configuration");
    device
}

fn pages_touched(offset: u32, len: usize, page_size: u32) -> usize {
    if len == 0 {
        return 0;
    }
    let first = offset / page_size;
    let last = (offset + len as u32 - 1) / page_size;
    (last - first + 1) as usize
}

proptest! {
    #[test]
    fn overflowing_ranges_are_rejected(offset in any::<u64>(), size in any::<u64>()) {
        prop_assume!(offset.checked_add(size).is_none());
        prop_assert!(!is_valid_range(&config(256), offset, size));
    }

    #[test]
    fn ranges_inside_the_chip_are_accepted(end in 0u64..=u64::from(CHIP_SIZE), split in any::<prop::sample::Index>()) {
        let offset = split.index(end as usize + 1) as u64;
        prop_assert!(is_valid_range(&config(256), offset, end - offset));
    }

    #[test]
    fn ranges_past_the_end_are_rejected(offset in 0u64..=u64::from(CHIP_SIZE), excess in 1u64..1024) {
        let size = u64::from(CHIP_SIZE) - offset + excess;
        prop_assert!(!is_valid_range(&config(256), offset, size));
    }

    #[test]
    fn writes_are_split_at_page_boundaries(page_size in page_size_strategy(), (offset, data) in write_strategy()) {
        let config = config(page_size);
        let mut sim = SimFlash::new(&config);
        let mut device = bind(&mut sim, config);

        prop_assert_eq!(device.write(u64::from(offset), &data), Ok(data.len()));
        drop(device);

        let programs: Vec<(u32, usize)> = sim.program_ops().collect();
        prop_assert_eq!(programs.len(), pages_touched(offset, data.len(), page_size));
        prop_assert_eq!(programs.iter().map(|&(_, len)| len).sum::<usize>(), data.len());

        let mut expected = offset;
        for (i, &(address, len)) in programs.iter().enumerate() {
            prop_assert_eq!(address, expected);
            prop_assert!(len <= page_size as usize);
            if i > 0 {
                prop_assert_eq!(address % page_size, 0);
            }
            // no chunk crosses into the next page
            prop_assert!((address % page_size) as usize + len <= page_size as usize);
            expected += len as u32;
        }

        let start = offset as usize;
        prop_assert_eq!(&sim.memory()[start..start + data.len()], &data[..]);
    }

    #[test]
    fn repeated_reads_are_identical((offset, data) in write_strategy()) {
        let config = config(256);
        let mut sim = SimFlash::new(&config);
        sim.load(offset as usize, &data);
        let mut device = bind(&mut sim, config);

        let mut first = vec![0u8; data.len()];
        let mut second = vec![0u8; data.len()];
        prop_assert_eq!(device.read(u64::from(offset), &mut first), Ok(data.len()));
        prop_assert_eq!(device.read(u64::from(offset), &mut second), Ok(data.len()));
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&first, &data);
    }

    #[test]
    fn failed_write_reports_bytes_already_programmed(
        page_size in page_size_strategy(),
        (offset, data) in write_strategy(),
        fail in any::<prop::sample::Index>(),
    ) {
        let chunks = pages_touched(offset, data.len(), page_size);
        prop_assume!(chunks > 0);
        let fail_at = fail.index(chunks);

        let config = config(page_size);
        let mut sim = SimFlash::new(&config);
        sim.fail_program_at(fail_at);
        let mut device = bind(&mut sim, config);

        let result = device.write(u64::from(offset), &data);
        drop(device);

        let committed: usize = sim.program_ops().map(|(_, len)| len).sum();
        prop_assert_eq!(sim.program_ops().count(), fail_at);
        prop_assert_eq!(result, Err(Error::Io { processed: committed }));
        prop_assert!(committed < data.len());
    }
}
